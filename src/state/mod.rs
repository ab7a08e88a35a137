//! Pure domain state, free of I/O and tasks.

/// Adaptive polling interval.
pub mod interval;
/// Correctness, points and player stats.
pub mod scoring;
/// Two key-space vote tallies.
pub mod tally;
/// Timed-reveal countdown.
pub mod timer;

pub use self::{
    interval::AdaptiveInterval,
    scoring::PendingReward,
    tally::{KeySpace, VoteTally},
    timer::{TimerPhase, TimerState, TimerTransition},
};
