//! Durable queue of votes that could not reach the remote store.

use std::{collections::HashSet, sync::Arc};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        journal::{PendingVote, VoteJournal},
        models::VoteEntity,
        repository::ActivationRepository,
        storage::{ErrorClass, StorageResult},
    },
    services::retry::RetryPolicy,
};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries inserted remotely.
    pub delivered: usize,
    /// Entries the store already held; resolved without a new row.
    pub duplicates: usize,
    /// Entries kept because the store was unreachable.
    pub network_failures: usize,
    /// Entries kept because the store rejected them for another reason.
    pub rejected: usize,
    /// Entries left in the journal after the pass, including ones appended meanwhile.
    pub remaining: usize,
}

impl DrainReport {
    /// Entries removed from the journal by this pass.
    pub fn resolved(&self) -> usize {
        self.delivered + self.duplicates
    }
}

/// Offline vote queue over a [`VoteJournal`].
///
/// Appends and the final journal rewrite of a drain are serialized, so a vote queued while a drain
/// is replaying is never lost by that drain's rewrite.
pub struct OfflineVoteQueue {
    journal: Arc<dyn VoteJournal>,
    repository: ActivationRepository,
    retry: RetryPolicy,
    write_gate: Mutex<()>,
    drain_gate: Mutex<()>,
    queued: Notify,
}

impl OfflineVoteQueue {
    pub fn new(
        journal: Arc<dyn VoteJournal>,
        repository: ActivationRepository,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            journal,
            repository,
            retry,
            write_gate: Mutex::new(()),
            drain_gate: Mutex::new(()),
            queued: Notify::new(),
        }
    }

    /// Persist a vote for later delivery. Durable once this returns `Ok`.
    pub async fn enqueue(&self, vote: VoteEntity) -> StorageResult<Uuid> {
        let entry = PendingVote::new(vote);
        let entry_id = entry.entry_id;
        {
            let _guard = self.write_gate.lock().await;
            self.journal.append(entry.clone()).await?;
        }
        info!(
            %entry_id,
            activation_id = %entry.vote.activation_id,
            player_id = %entry.vote.player_id,
            "vote queued for later delivery"
        );
        self.queued.notify_one();
        Ok(entry_id)
    }

    /// Entries currently waiting in the journal.
    pub async fn pending(&self) -> StorageResult<Vec<PendingVote>> {
        self.journal.read_all().await
    }

    /// Resolves when a vote has been queued since the last call.
    pub async fn wait_for_entries(&self) {
        self.queued.notified().await;
    }

    /// Replay every journaled vote once.
    ///
    /// Entries are handled independently: a delivered or duplicate entry is removed, any other
    /// failure keeps it for the next pass. Concurrent drains are serialized.
    pub async fn drain(&self) -> StorageResult<DrainReport> {
        let _drain = self.drain_gate.lock().await;
        let entries = self.journal.read_all().await?;
        let mut report = DrainReport::default();
        if entries.is_empty() {
            return Ok(report);
        }

        let mut resolved = HashSet::new();
        for entry in &entries {
            let vote = &entry.vote;
            let outcome = self
                .retry
                .run("replay_vote", || self.repository.insert_vote(vote))
                .await;
            match outcome {
                Ok(()) => {
                    debug!(entry_id = %entry.entry_id, activation_id = %vote.activation_id, "queued vote delivered");
                    report.delivered += 1;
                    resolved.insert(entry.entry_id);
                }
                Err(err) => match err.class() {
                    ErrorClass::Duplicate => {
                        debug!(entry_id = %entry.entry_id, activation_id = %vote.activation_id, "queued vote already recorded");
                        report.duplicates += 1;
                        resolved.insert(entry.entry_id);
                    }
                    ErrorClass::Network => {
                        report.network_failures += 1;
                    }
                    ErrorClass::Application => {
                        warn!(entry_id = %entry.entry_id, error = %err, "queued vote rejected; keeping entry");
                        report.rejected += 1;
                    }
                },
            }
        }

        report.remaining = if resolved.is_empty() {
            self.journal.read_all().await?.len()
        } else {
            let _write = self.write_gate.lock().await;
            let mut current = self.journal.read_all().await?;
            current.retain(|entry| !resolved.contains(&entry.entry_id));
            let remaining = current.len();
            self.journal.replace_all(current).await?;
            remaining
        };

        info!(
            delivered = report.delivered,
            duplicates = report.duplicates,
            network_failures = report.network_failures,
            rejected = report.rejected,
            remaining = report.remaining,
            "offline queue drained"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::{
        config::RetryConfig,
        dao::{
            journal::MemoryJournal,
            memory::MemoryStore,
            models::VOTES_TABLE,
            remote_store::Filter,
        },
    };

    fn vote(player: &str) -> VoteEntity {
        VoteEntity {
            activation_id: "poll-1".into(),
            player_id: player.into(),
            option_id: Some("a".into()),
            option_text: "A".into(),
            created_at: datetime!(2026-03-01 12:00:00 UTC),
        }
    }

    fn queue(store: &MemoryStore) -> OfflineVoteQueue {
        let retry = RetryPolicy::new(&RetryConfig {
            attempts: 1,
            ..RetryConfig::default()
        });
        OfflineVoteQueue::new(
            Arc::new(MemoryJournal::new()),
            ActivationRepository::new(Arc::new(store.clone())),
            retry,
        )
    }

    #[tokio::test]
    async fn drain_delivers_and_clears() {
        let store = MemoryStore::new();
        let queue = queue(&store);
        queue.enqueue(vote("p1")).await.unwrap();

        let report = queue.drain().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(store.rows(VOTES_TABLE).len(), 1);
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_counts_as_resolved() {
        let store = MemoryStore::new();
        let queue = queue(&store);
        ActivationRepository::new(Arc::new(store.clone()))
            .insert_vote(&vote("p1"))
            .await
            .unwrap();
        queue.enqueue(vote("p1")).await.unwrap();

        let report = queue.drain().await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(store.rows(VOTES_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn offline_drain_keeps_everything() {
        let store = MemoryStore::new();
        let queue = queue(&store);
        queue.enqueue(vote("p1")).await.unwrap();
        queue.enqueue(vote("p2")).await.unwrap();
        store.set_offline(true);

        let report = queue.drain().await.unwrap();

        assert_eq!(report.network_failures, 2);
        assert_eq!(report.remaining, 2);
    }

    #[tokio::test]
    async fn one_rejected_entry_does_not_block_the_rest() {
        let store = MemoryStore::new();
        store.reject_inserts(VOTES_TABLE, Filter::eq("player_id", "p1"), "42501");
        let queue = queue(&store);
        queue.enqueue(vote("p1")).await.unwrap();
        queue.enqueue(vote("p2")).await.unwrap();

        let report = queue.drain().await.unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.delivered, 1);
        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].vote.player_id, "p1");
    }
}
