use serde::Serialize;
use time::OffsetDateTime;

use crate::state::{TimerPhase, TimerState};

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Countdown snapshot of a timed activation.
pub struct TimerView {
    pub activation_id: String,
    pub phase: TimerPhase,
    pub is_active: bool,
    /// Whole seconds left, rounded up so the display only shows zero once expired.
    pub time_remaining_secs: u64,
    pub has_expired: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub total_time_secs: Option<u64>,
}

impl From<&TimerState> for TimerView {
    fn from(state: &TimerState) -> Self {
        let remaining = state.time_remaining();
        let whole = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        Self {
            activation_id: state.activation_id().to_string(),
            phase: state.phase(),
            is_active: state.is_active(),
            time_remaining_secs: whole,
            has_expired: state.has_expired(),
            started_at: state.started_at(),
            total_time_secs: state.total_time().map(|total| total.as_secs()),
        }
    }
}
