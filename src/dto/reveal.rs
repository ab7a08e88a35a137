use serde::Serialize;

use crate::state::PendingReward;

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Fired once per activation when a reward is shown to the player.
pub struct RevealEvent {
    pub activation_id: String,
    pub player_id: String,
    pub points: u32,
    pub is_correct: bool,
    pub response_time_ms: u64,
    /// Score after the write-back, when it succeeded.
    pub total_score: Option<i64>,
    /// Whether the score write-back reached the remote store.
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Returned by a successful answer submission.
pub struct AnswerReceipt {
    pub activation_id: String,
    /// Present only when the result could be revealed immediately.
    pub reward: Option<PendingReward>,
}

impl AnswerReceipt {
    /// Whether the reward is withheld until the countdown ends.
    pub fn is_pending(&self) -> bool {
        self.reward.is_none()
    }
}
