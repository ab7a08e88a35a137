use thiserror::Error;

use crate::dao::{
    models::{ActivationKind, PollState},
    storage::{ErrorClass, StorageError},
};

/// Errors returned by vote submission.
#[derive(Debug, Error)]
pub enum VoteError {
    /// No activation or player is attached.
    #[error("no activation or player attached")]
    NotAttached,
    /// This client already holds a confirmed or optimistic vote.
    #[error("player already voted")]
    AlreadyVoted,
    /// A previous submission is still in flight.
    #[error("a vote submission is already in progress")]
    InFlight,
    /// Votes are only accepted while the poll is open.
    #[error("poll is not open (state: {0:?})")]
    PollNotOpen(PollState),
    /// The option id does not resolve to any option of the activation.
    #[error("unknown option `{0}`")]
    InvalidOption(String),
    /// The remote store already holds a vote for this player.
    #[error("vote already recorded remotely")]
    Duplicate,
    /// The store was unreachable and the vote could not be queued either.
    #[error("vote could not be sent or saved locally")]
    Unsent(#[source] StorageError),
    /// Any other store-reported failure.
    #[error("remote store rejected the vote")]
    Remote(#[source] StorageError),
}

impl VoteError {
    /// Short actionable message for the participant.
    pub fn user_message(&self) -> &'static str {
        match self {
            VoteError::NotAttached => "No poll is active right now.",
            VoteError::AlreadyVoted | VoteError::Duplicate => "You already voted.",
            VoteError::InFlight => "Your vote is being sent.",
            VoteError::PollNotOpen(PollState::Closed) => "Voting has closed.",
            VoteError::PollNotOpen(_) => "Voting has not opened yet.",
            VoteError::InvalidOption(_) => "That option is not available.",
            VoteError::Unsent(_) => "Connection issue. Please try again.",
            VoteError::Remote(_) => "Your vote could not be recorded.",
        }
    }
}

impl From<StorageError> for VoteError {
    fn from(err: StorageError) -> Self {
        match err.class() {
            ErrorClass::Duplicate => VoteError::Duplicate,
            ErrorClass::Network => VoteError::Unsent(err),
            ErrorClass::Application => VoteError::Remote(err),
        }
    }
}

/// Errors returned by answer submission.
#[derive(Debug, Error)]
pub enum AnswerError {
    /// No answerable activation is attached.
    #[error("no activation or player attached")]
    NotAttached,
    /// The activation kind does not take answers.
    #[error("activation of kind {0:?} does not take answers")]
    NotAnswerable(ActivationKind),
    /// The submitted answer is blank.
    #[error("answer is empty")]
    EmptyAnswer,
    /// The selected option does not exist.
    #[error("unknown option `{0}`")]
    InvalidOption(String),
    /// This player already answered, locally or remotely.
    #[error("player already answered")]
    AlreadyAnswered,
    /// The store could not be reached.
    #[error("remote store unreachable")]
    Network(#[source] StorageError),
    /// Any other store-reported failure.
    #[error("remote store rejected the answer")]
    Remote(#[source] StorageError),
}

impl AnswerError {
    /// Short actionable message for the participant.
    pub fn user_message(&self) -> &'static str {
        match self {
            AnswerError::NotAttached => "No question is active right now.",
            AnswerError::NotAnswerable(_) => "This activation does not take answers.",
            AnswerError::EmptyAnswer => "Please enter an answer.",
            AnswerError::InvalidOption(_) => "That option is not available.",
            AnswerError::AlreadyAnswered => "You already answered.",
            AnswerError::Network(_) => "Connection issue. Please try again.",
            AnswerError::Remote(_) => "Your answer could not be recorded.",
        }
    }
}

impl From<StorageError> for AnswerError {
    fn from(err: StorageError) -> Self {
        match err.class() {
            ErrorClass::Duplicate => AnswerError::AlreadyAnswered,
            ErrorClass::Network => AnswerError::Network(err),
            ErrorClass::Application => AnswerError::Remote(err),
        }
    }
}

/// Errors raised while attaching a session to an activation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Activation or player id was blank.
    #[error("missing activation or player id")]
    MissingIds,
    /// The activation does not exist remotely.
    #[error("activation `{0}` not found")]
    NotFound(String),
    /// Loading the activation failed.
    #[error("failed to load activation")]
    Unavailable(#[source] StorageError),
}

impl SessionError {
    /// Short actionable message for the participant.
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::MissingIds => "Join a room to take part.",
            SessionError::NotFound(_) => "This question is no longer available.",
            SessionError::Unavailable(err) if err.is_retryable() => {
                "Connection issue. Retrying shortly."
            }
            SessionError::Unavailable(_) => "Could not load the question.",
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Unavailable(err)
    }
}
