use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Table holding one row per question or poll instance.
pub const ACTIVATIONS_TABLE: &str = "activations";
/// Table holding poll votes, unique on `(activation_id, player_id)`.
pub const VOTES_TABLE: &str = "votes";
/// Table holding submitted answers, unique on `(activation_id, player_id)`.
pub const ANSWERS_TABLE: &str = "answers";
/// Table holding per-player score and aggregate stats.
pub const PLAYERS_TABLE: &str = "players";

/// Kind of an activation, deciding how it is answered and scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    MultipleChoice,
    TextAnswer,
    Poll,
    Leaderboard,
}

impl ActivationKind {
    /// Kinds for which a player submits a scored answer.
    pub fn is_answerable(self) -> bool {
        matches!(self, ActivationKind::MultipleChoice | ActivationKind::TextAnswer)
    }
}

/// Lifecycle of a poll activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    #[default]
    Pending,
    Voting,
    Closed,
}

/// A selectable option of an activation. Legacy rows carry no `id`; their text is the join key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

impl OptionEntity {
    /// Build an option with an identifier.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            text: text.into(),
            media_url: None,
        }
    }

    /// Build a legacy option keyed only by its text.
    pub fn legacy(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            media_url: None,
        }
    }
}

/// Resolve an option by id first, falling back to its text.
///
/// The text fallback returns the first option with matching text since texts are not unique.
pub fn resolve_option<'a>(
    options: &'a [OptionEntity],
    id: Option<&str>,
    text: Option<&str>,
) -> Option<&'a OptionEntity> {
    if let Some(id) = id {
        if let Some(found) = options.iter().find(|o| o.id.as_deref() == Some(id)) {
            return Some(found);
        }
    }
    let text = text?;
    options.iter().find(|o| o.text == text)
}

/// One question or poll instance as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationEntity {
    pub id: String,
    pub kind: ActivationKind,
    #[serde(default)]
    pub options: Vec<OptionEntity>,
    #[serde(default)]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub exact_answer: Option<String>,
    /// Seconds allowed to answer; `None` means untimed.
    #[serde(default)]
    pub time_limit: Option<u32>,
    /// Server timestamp set once by the host when the clock starts.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timer_started_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub poll_state: Option<PollState>,
}

impl ActivationEntity {
    /// Whether the activation carries a time limit.
    pub fn is_timed(&self) -> bool {
        self.time_limit.is_some()
    }

    /// Poll state, defaulting to pending when the column is empty.
    pub fn poll_state(&self) -> PollState {
        self.poll_state.unwrap_or_default()
    }
}

/// A single poll vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEntity {
    pub activation_id: String,
    pub player_id: String,
    #[serde(default)]
    pub option_id: Option<String>,
    #[serde(default)]
    pub option_text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A submitted answer for a multiple choice or text question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEntity {
    pub activation_id: String,
    pub player_id: String,
    pub answer: String,
    pub is_correct: bool,
    pub response_time_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Score and aggregate stats kept per player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntity {
    pub id: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub correct_answers: u32,
    #[serde(default)]
    pub total_answers: u32,
    #[serde(default)]
    pub avg_response_time_ms: f64,
}

impl PlayerEntity {
    /// Fresh player row with zeroed stats.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            score: 0,
            correct_answers: 0,
            total_answers: 0,
            avg_response_time_ms: 0.0,
        }
    }
}

/// Patch written back to the player row after a reveal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStatsPatch {
    pub score: i64,
    pub correct_answers: u32,
    pub total_answers: u32,
    pub avg_response_time_ms: f64,
}
