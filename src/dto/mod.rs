//! Serializable views handed to callers.

pub mod poll;
pub mod reveal;
pub mod timer;

pub use self::{
    poll::{PollStatus, PollView, VoteReceipt, VoteStatus},
    reveal::{AnswerReceipt, RevealEvent},
    timer::TimerView,
};
