/// Durable offline vote queue.
pub mod offline_queue;
/// Poll synchronization engine.
pub mod poll_sync;
/// Background drain loop for the offline queue.
pub mod queue_supervisor;
/// Bounded retry for remote calls.
pub mod retry;
/// Timed reveal controller.
pub mod reveal;
/// Answer scoring and reveal-gated write-back.
pub mod scoring;
/// Session facade wiring the components for one activation.
pub mod session;

pub use self::{
    offline_queue::{DrainReport, OfflineVoteQueue},
    poll_sync::PollSyncEngine,
    retry::RetryPolicy,
    reveal::TimedRevealController,
    scoring::ScoringClient,
    session::LiveSession,
};
