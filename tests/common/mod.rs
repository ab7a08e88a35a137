#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use live_activation_sync::{
    AppConfig, LiveSession, ManualClock, SharedClock,
    config::RetryConfig,
    dao::{
        journal::{MemoryJournal, VoteJournal},
        memory::MemoryStore,
        models::{
            ACTIVATIONS_TABLE, ActivationEntity, ActivationKind, OptionEntity, PLAYERS_TABLE,
            PlayerEntity, PollState, VOTES_TABLE, VoteEntity,
        },
        remote_store::{Filter, RemoteStore, decode_row, encode_row},
        repository::ActivationRepository,
    },
    services::{OfflineVoteQueue, PollSyncEngine, RetryPolicy},
};
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339, macros::datetime};
use tokio::{sync::watch, time::timeout};

pub const T0: OffsetDateTime = datetime!(2026-03-01 12:00:00 UTC);

/// Shared store, frozen clock and fast retry settings.
pub struct Fixture {
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub config: AppConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.retry = RetryConfig {
            attempts: 2,
            base_delay: Duration::from_millis(10),
            call_timeout: Duration::from_secs(1),
        };
        Self {
            store: MemoryStore::new(),
            clock: ManualClock::new(T0),
            config,
        }
    }

    pub fn shared_clock(&self) -> SharedClock {
        Arc::new(self.clock.clone())
    }

    pub fn repository(&self) -> ActivationRepository {
        ActivationRepository::new(Arc::new(self.store.clone()))
    }

    pub fn queue(&self, journal: Arc<dyn VoteJournal>) -> Arc<OfflineVoteQueue> {
        Arc::new(OfflineVoteQueue::new(
            journal,
            self.repository(),
            RetryPolicy::new(&self.config.retry),
        ))
    }

    /// Poll engine with its own in-memory offline queue.
    pub fn engine(&self) -> (PollSyncEngine, Arc<OfflineVoteQueue>) {
        let queue = self.queue(Arc::new(MemoryJournal::new()));
        let engine = PollSyncEngine::new(
            self.repository(),
            queue.clone(),
            RetryPolicy::new(&self.config.retry),
            self.config.poll.clone(),
            self.shared_clock(),
        );
        (engine, queue)
    }

    pub fn session(&self) -> LiveSession {
        LiveSession::new(
            Arc::new(self.store.clone()),
            Arc::new(MemoryJournal::new()),
            &self.config,
            self.shared_clock(),
        )
    }

    pub async fn seed(&self, activation: &ActivationEntity) {
        let row = encode_row(ACTIVATIONS_TABLE, activation).unwrap();
        self.store.insert(ACTIVATIONS_TABLE, row).await.unwrap();
    }

    pub async fn set_poll_state(&self, activation_id: &str, state: PollState) {
        self.patch_activation(activation_id, json!({ "poll_state": state }))
            .await;
    }

    /// Host starts the clock at `at`.
    pub async fn start_timer(&self, activation_id: &str, at: OffsetDateTime) {
        let stamp = at.format(&Rfc3339).unwrap();
        self.patch_activation(activation_id, json!({ "timer_started_at": stamp }))
            .await;
    }

    pub async fn patch_activation(&self, activation_id: &str, patch: serde_json::Value) {
        self.store
            .update(
                ACTIVATIONS_TABLE,
                vec![Filter::eq("id", activation_id)],
                patch.as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
    }

    /// Vote cast by another participant.
    pub async fn add_vote(&self, activation_id: &str, player_id: &str, option: &OptionEntity) {
        self.repository()
            .insert_vote(&VoteEntity {
                activation_id: activation_id.into(),
                player_id: player_id.into(),
                option_id: option.id.clone(),
                option_text: option.text.clone(),
                created_at: T0,
            })
            .await
            .unwrap();
    }

    pub fn vote_rows(&self, activation_id: &str) -> usize {
        self.store
            .rows(VOTES_TABLE)
            .into_iter()
            .filter(|row| row["activation_id"] == json!(activation_id))
            .count()
    }

    pub fn player(&self, player_id: &str) -> Option<PlayerEntity> {
        self.store
            .rows(PLAYERS_TABLE)
            .into_iter()
            .map(|row| decode_row::<PlayerEntity>(PLAYERS_TABLE, row).unwrap())
            .find(|player| player.id == player_id)
    }
}

pub fn options() -> Vec<OptionEntity> {
    vec![OptionEntity::new("opt-a", "A"), OptionEntity::new("opt-b", "B")]
}

pub fn poll(id: &str, state: PollState) -> ActivationEntity {
    ActivationEntity {
        id: id.into(),
        kind: ActivationKind::Poll,
        options: options(),
        correct_answer: None,
        exact_answer: None,
        time_limit: None,
        timer_started_at: None,
        poll_state: Some(state),
    }
}

pub fn question(id: &str, time_limit: Option<u32>) -> ActivationEntity {
    ActivationEntity {
        id: id.into(),
        kind: ActivationKind::MultipleChoice,
        options: options(),
        correct_answer: Some("opt-a".into()),
        exact_answer: None,
        time_limit,
        timer_started_at: None,
        poll_state: None,
    }
}

/// Wait until the watched value satisfies `pred`, failing after two virtual minutes.
pub async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    timeout(Duration::from_secs(120), async {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("condition not reached in time")
}
