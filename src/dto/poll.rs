use indexmap::IndexMap;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    dao::models::PollState,
    state::{KeySpace, VoteTally},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Reactive snapshot of one poll as seen by this client.
pub struct PollView {
    pub activation_id: String,
    pub poll_state: PollState,
    /// Counts keyed by option id.
    pub votes: IndexMap<String, u32>,
    /// Counts keyed by option text.
    pub votes_by_text: IndexMap<String, u32>,
    pub total_votes: u32,
    /// Mapping callers should trust for per-option counts.
    pub key_space: KeySpace,
    pub has_voted: bool,
    pub selected_option_id: Option<String>,
    /// Whether the counts include a local vote not yet confirmed by a refresh.
    pub optimistic: bool,
}

impl PollView {
    /// View of an activation before its first refresh.
    pub fn empty(activation_id: impl Into<String>) -> Self {
        Self::from_tally(
            activation_id,
            PollState::Pending,
            &VoteTally::default(),
            false,
            None,
            false,
        )
    }

    /// Build a view from a tally and the derived vote flags.
    pub fn from_tally(
        activation_id: impl Into<String>,
        poll_state: PollState,
        tally: &VoteTally,
        has_voted: bool,
        selected_option_id: Option<String>,
        optimistic: bool,
    ) -> Self {
        Self {
            activation_id: activation_id.into(),
            poll_state,
            votes: tally.votes_by_id().clone(),
            votes_by_text: tally.votes_by_text().clone(),
            total_votes: tally.total_votes(),
            key_space: tally.key_space(),
            has_voted,
            selected_option_id,
            optimistic,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
/// Health of the reconciliation loop, answered on explicit status queries.
pub struct PollStatus {
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_refresh_at: Option<OffsetDateTime>,
    /// Current adaptive poll interval in milliseconds.
    pub interval_ms: u64,
    /// Set once consecutive failures pushed the loop into backoff.
    pub retries_exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Delivery state of an accepted vote.
pub enum VoteStatus {
    /// The remote store holds the vote.
    Confirmed,
    /// The store was unreachable; the vote sits in the offline queue.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Returned by a successful vote submission.
pub struct VoteReceipt {
    pub activation_id: String,
    pub option_id: String,
    pub status: VoteStatus,
}

impl VoteReceipt {
    /// Whether the vote is only held locally.
    pub fn is_unconfirmed(&self) -> bool {
        self.status == VoteStatus::Queued
    }

    /// Short message to show next to the vote.
    pub fn user_message(&self) -> &'static str {
        match self.status {
            VoteStatus::Confirmed => "Vote recorded.",
            VoteStatus::Queued => "Connection issue. Vote saved, will resend.",
        }
    }
}
