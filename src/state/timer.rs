//! Countdown state of a timed activation, anchored on the server-side start timestamp.

use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

use crate::dao::models::ActivationEntity;

/// Length of one local countdown tick.
pub const TICK: Duration = Duration::from_secs(1);

/// Phases of the reveal countdown for one activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerPhase {
    /// The activation has no time limit.
    NoTimer,
    /// A time limit exists but the host has not started the clock.
    WaitingToStart,
    /// The clock is running.
    Running,
    /// The window is over. Terminal for the activation.
    Expired,
}

/// Outcome of feeding an event into [`TimerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTransition {
    /// Nothing changed.
    Unchanged,
    /// The clock started and is still running.
    Started,
    /// The countdown reached its end (possibly in the same step it started).
    Expired,
}

/// Per-activation countdown.
///
/// `started_at` is set at most once and `expired` only ever goes from `false` to `true`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerState {
    activation_id: String,
    total: Option<Duration>,
    started_at: Option<OffsetDateTime>,
    remaining: Duration,
    expired: bool,
}

impl TimerState {
    /// Build the countdown for a freshly loaded activation.
    pub fn new(activation: &ActivationEntity, now: OffsetDateTime) -> Self {
        let total = activation
            .time_limit
            .map(|secs| Duration::from_secs(u64::from(secs)));
        let mut state = Self {
            activation_id: activation.id.clone(),
            total,
            started_at: None,
            remaining: total.unwrap_or_default(),
            expired: false,
        };
        state.observe_start(activation.timer_started_at, now);
        state
    }

    /// Activation this countdown belongs to.
    pub fn activation_id(&self) -> &str {
        &self.activation_id
    }

    /// Current phase.
    pub fn phase(&self) -> TimerPhase {
        match (self.total, self.started_at) {
            (None, _) => TimerPhase::NoTimer,
            _ if self.expired => TimerPhase::Expired,
            (Some(_), None) => TimerPhase::WaitingToStart,
            (Some(_), Some(_)) => TimerPhase::Running,
        }
    }

    /// Whether the countdown is ticking.
    pub fn is_active(&self) -> bool {
        self.phase() == TimerPhase::Running
    }

    /// Time left on the local countdown.
    pub fn time_remaining(&self) -> Duration {
        self.remaining
    }

    /// Whether the window is over.
    pub fn has_expired(&self) -> bool {
        self.expired
    }

    /// Server timestamp at which the host started the clock.
    pub fn started_at(&self) -> Option<OffsetDateTime> {
        self.started_at
    }

    /// Full length of the answer window.
    pub fn total_time(&self) -> Option<Duration> {
        self.total
    }

    /// Record the server start timestamp delivered by a refresh or push.
    ///
    /// Only the first non-null timestamp is kept; later values, including a null, are ignored.
    pub fn observe_start(
        &mut self,
        started_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> TimerTransition {
        if self.total.is_none() || self.started_at.is_some() {
            return TimerTransition::Unchanged;
        }
        let Some(started_at) = started_at else {
            return TimerTransition::Unchanged;
        };

        self.started_at = Some(started_at);
        self.remaining = self.server_remaining(now).unwrap_or_default();
        if self.check_server_time(now) == TimerTransition::Expired {
            TimerTransition::Expired
        } else {
            TimerTransition::Started
        }
    }

    /// Advance the local countdown by one tick.
    ///
    /// The local value never runs ahead of what the server timestamp allows, so a throttled tick
    /// catches up on the next one.
    pub fn tick(&mut self, now: OffsetDateTime) -> TimerTransition {
        if self.phase() != TimerPhase::Running {
            return TimerTransition::Unchanged;
        }
        self.remaining = self.remaining.saturating_sub(TICK);
        if let Some(server) = self.server_remaining(now) {
            self.remaining = self.remaining.min(server);
        }
        if self.remaining.is_zero() {
            self.expire()
        } else {
            TimerTransition::Unchanged
        }
    }

    /// Compare the server start timestamp with `now` and expire when the window is over.
    pub fn check_server_time(&mut self, now: OffsetDateTime) -> TimerTransition {
        if self.phase() != TimerPhase::Running {
            return TimerTransition::Unchanged;
        }
        match self.server_remaining(now) {
            Some(left) if left.is_zero() => self.expire(),
            _ => TimerTransition::Unchanged,
        }
    }

    /// Whether correctness and points may be shown and persisted right now.
    ///
    /// May move `Running` to `Expired` as a side effect of the server-time check.
    pub fn can_reveal(&mut self, now: OffsetDateTime) -> bool {
        match self.phase() {
            TimerPhase::NoTimer | TimerPhase::Expired | TimerPhase::WaitingToStart => true,
            TimerPhase::Running => {
                self.check_server_time(now) == TimerTransition::Expired || self.remaining.is_zero()
            }
        }
    }

    fn expire(&mut self) -> TimerTransition {
        if self.expired {
            return TimerTransition::Unchanged;
        }
        self.expired = true;
        self.remaining = Duration::ZERO;
        TimerTransition::Expired
    }

    /// Time left according to the server anchor. Clock skew that puts `now` before the start
    /// counts as no time elapsed.
    fn server_remaining(&self, now: OffsetDateTime) -> Option<Duration> {
        let (total, started_at) = (self.total?, self.started_at?);
        let elapsed = now - started_at;
        let elapsed = if elapsed.is_negative() {
            Duration::ZERO
        } else {
            elapsed.unsigned_abs()
        };
        Some(total.saturating_sub(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::dao::models::ActivationKind;

    const T0: OffsetDateTime = datetime!(2026-03-01 12:00:00 UTC);

    fn activation(time_limit: Option<u32>, started_at: Option<OffsetDateTime>) -> ActivationEntity {
        ActivationEntity {
            id: "q1".into(),
            kind: ActivationKind::MultipleChoice,
            options: Vec::new(),
            correct_answer: None,
            exact_answer: None,
            time_limit,
            timer_started_at: started_at,
            poll_state: None,
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn untimed_activation_always_reveals() {
        let mut timer = TimerState::new(&activation(None, None), T0);
        assert_eq!(timer.phase(), TimerPhase::NoTimer);
        assert!(timer.can_reveal(T0));
        assert_eq!(timer.observe_start(Some(T0), T0), TimerTransition::Unchanged);
    }

    #[test]
    fn waiting_then_running_then_expired_by_server_time() {
        let mut timer = TimerState::new(&activation(Some(10), None), T0);
        assert_eq!(timer.phase(), TimerPhase::WaitingToStart);
        assert!(timer.can_reveal(T0));

        assert_eq!(timer.observe_start(Some(T0), T0), TimerTransition::Started);
        assert_eq!(timer.time_remaining(), secs(10));
        assert!(!timer.can_reveal(T0 + secs(3)));

        assert!(timer.can_reveal(T0 + secs(11)));
        assert!(timer.has_expired());
        assert_eq!(timer.phase(), TimerPhase::Expired);
    }

    #[test]
    fn ticks_count_down_to_expiry_once() {
        let mut timer = TimerState::new(&activation(Some(3), Some(T0)), T0);
        assert_eq!(timer.tick(T0 + secs(1)), TimerTransition::Unchanged);
        assert_eq!(timer.tick(T0 + secs(2)), TimerTransition::Unchanged);
        assert_eq!(timer.time_remaining(), secs(1));
        assert_eq!(timer.tick(T0 + secs(3)), TimerTransition::Expired);
        assert_eq!(timer.tick(T0 + secs(4)), TimerTransition::Unchanged);
        assert_eq!(timer.check_server_time(T0 + secs(5)), TimerTransition::Unchanged);
    }

    #[test]
    fn stalled_ticks_catch_up_with_server_time() {
        let mut timer = TimerState::new(&activation(Some(10), Some(T0)), T0);
        assert_eq!(timer.tick(T0 + secs(7)), TimerTransition::Unchanged);
        assert_eq!(timer.time_remaining(), secs(3));
    }

    #[test]
    fn late_join_after_window_starts_expired() {
        let timer = TimerState::new(&activation(Some(10), Some(T0)), T0 + secs(30));
        assert!(timer.has_expired());
        assert_eq!(timer.phase(), TimerPhase::Expired);
    }

    #[test]
    fn start_timestamp_is_set_once() {
        let mut timer = TimerState::new(&activation(Some(10), Some(T0)), T0);
        assert_eq!(
            timer.observe_start(Some(T0 + secs(5)), T0 + secs(5)),
            TimerTransition::Unchanged
        );
        assert_eq!(timer.observe_start(None, T0 + secs(5)), TimerTransition::Unchanged);
        assert_eq!(timer.started_at(), Some(T0));
    }

    #[test]
    fn client_clock_behind_server_keeps_full_window() {
        let mut timer = TimerState::new(&activation(Some(10), None), T0);
        timer.observe_start(Some(T0 + secs(2)), T0);
        assert_eq!(timer.time_remaining(), secs(10));
        assert!(!timer.can_reveal(T0));
    }

    #[test]
    fn expiry_never_reverts_for_any_update_sequence() {
        let mut timer = TimerState::new(&activation(Some(5), None), T0);
        timer.observe_start(Some(T0), T0);
        assert!(timer.can_reveal(T0 + secs(6)));

        // clock jumps backwards, null start arrives, more ticks
        timer.observe_start(None, T0);
        timer.tick(T0);
        timer.check_server_time(T0);
        for _ in 0..3 {
            assert!(timer.has_expired());
            assert!(timer.can_reveal(T0));
        }
    }

    #[test]
    fn repeated_queries_without_change_are_stable() {
        let mut timer = TimerState::new(&activation(Some(10), Some(T0)), T0);
        let now = T0 + secs(4);
        let first = timer.can_reveal(now);
        for _ in 0..5 {
            assert_eq!(timer.can_reveal(now), first);
        }
    }
}
