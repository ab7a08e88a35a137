//! Client-side synchronization core for live audience activations: converging poll tallies,
//! server-anchored reveal gating and durable offline vote delivery.

pub mod clock;
pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod services;
pub mod state;

pub use crate::{
    clock::{Clock, ManualClock, SharedClock, SystemClock},
    config::AppConfig,
    services::LiveSession,
};
