/// Durable local journal for the offline vote queue.
pub mod journal;
/// In-process remote store.
pub mod memory;
/// Row entities and table names.
pub mod models;
/// Remote store abstraction: row CRUD and change subscriptions.
pub mod remote_store;
/// Typed queries over a remote store.
pub mod repository;
/// HTTP remote store backend.
#[cfg(feature = "rest-store")]
pub mod rest;
/// Storage error taxonomy.
pub mod storage;
