//! Answer submission and reveal-gated score write-back.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use time::OffsetDateTime;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    clock::SharedClock,
    config::ScoringConfig,
    dao::{
        models::{ActivationEntity, ActivationKind, AnswerEntity, PlayerEntity, resolve_option},
        repository::ActivationRepository,
        storage::{StorageError, StorageResult},
    },
    dto::{AnswerReceipt, RevealEvent},
    error::AnswerError,
    services::{retry::RetryPolicy, reveal::TimedRevealController},
    state::{PendingReward, scoring},
};

const REVEAL_CHANNEL_CAPACITY: usize = 16;

/// Scores answers and reveals each player's reward exactly once per activation.
pub struct ScoringClient {
    shared: Arc<ScoringShared>,
}

struct ScoringShared {
    repository: ActivationRepository,
    retry: RetryPolicy,
    config: ScoringConfig,
    clock: SharedClock,
    reveal: Arc<TimedRevealController>,
    epoch: AtomicU64,
    slot: Mutex<Option<AnswerSlot>>,
    events: broadcast::Sender<RevealEvent>,
}

struct AnswerSlot {
    epoch: u64,
    activation: ActivationEntity,
    player_id: String,
    displayed_at: OffsetDateTime,
    answered: bool,
    submitting: bool,
    pending: Option<PendingReward>,
    revealed: bool,
    watcher: Option<JoinHandle<()>>,
}

impl ScoringClient {
    pub fn new(
        repository: ActivationRepository,
        retry: RetryPolicy,
        config: ScoringConfig,
        clock: SharedClock,
        reveal: Arc<TimedRevealController>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(REVEAL_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(ScoringShared {
                repository,
                retry,
                config,
                clock,
                reveal,
                epoch: AtomicU64::new(0),
                slot: Mutex::new(None),
                events,
            }),
        }
    }

    /// Start scoring `activation` for `player_id`. The response clock starts now.
    ///
    /// The reveal controller must already be attached to the same activation.
    pub fn attach(&self, activation: &ActivationEntity, player_id: &str) {
        self.detach();
        let shared = &self.shared;
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *shared.lock() = Some(AnswerSlot {
            epoch,
            activation: activation.clone(),
            player_id: player_id.to_string(),
            displayed_at: shared.clock.now(),
            answered: false,
            submitting: false,
            pending: None,
            revealed: false,
            watcher: None,
        });

        let watcher = tokio::spawn(reveal_on_expiry(
            shared.clone(),
            epoch,
            activation.id.clone(),
        ));
        match shared.lock().as_mut().filter(|slot| slot.epoch == epoch) {
            Some(slot) => slot.watcher = Some(watcher),
            None => watcher.abort(),
        }
        debug!(activation_id = %activation.id, player_id, "scoring attached");
    }

    /// Forget the activation. A reward still withheld is persisted and revealed for the
    /// activation it belongs to.
    pub fn detach(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let Some(mut slot) = self.shared.lock().take() else {
            return;
        };
        if let Some(watcher) = slot.watcher.take() {
            watcher.abort();
        }
        let Some(reward) = slot.pending.take() else {
            return;
        };
        let activation_id = slot.activation.id;
        match Handle::try_current() {
            Ok(handle) => {
                debug!(%activation_id, "revealing withheld reward of superseded activation");
                let shared = self.shared.clone();
                handle.spawn(async move {
                    shared.announce(activation_id, slot.player_id, reward).await;
                });
            }
            Err(_) => warn!(
                %activation_id,
                points = reward.points,
                "no runtime left to reveal a withheld reward"
            ),
        }
    }

    /// Submit an answer: option id or text for multiple choice, free text otherwise.
    ///
    /// The answer row is stored at once. The reward is revealed right away when the countdown
    /// allows it, otherwise it is withheld until expiry.
    pub async fn submit_answer(&self, answer: &str) -> Result<AnswerReceipt, AnswerError> {
        let shared = &self.shared;
        let now = shared.clock.now();
        let (epoch, row, reward) = {
            let mut guard = shared.lock();
            let slot = guard.as_mut().ok_or(AnswerError::NotAttached)?;
            let activation = &slot.activation;
            if !activation.kind.is_answerable() {
                return Err(AnswerError::NotAnswerable(activation.kind));
            }
            if slot.answered || slot.submitting {
                return Err(AnswerError::AlreadyAnswered);
            }
            let answer = answer.trim();
            if answer.is_empty() {
                return Err(AnswerError::EmptyAnswer);
            }
            if activation.kind == ActivationKind::MultipleChoice
                && resolve_option(&activation.options, Some(answer), Some(answer)).is_none()
            {
                return Err(AnswerError::InvalidOption(answer.to_string()));
            }

            let elapsed = now - slot.displayed_at;
            let response_time = if elapsed.is_negative() {
                Duration::ZERO
            } else {
                elapsed.unsigned_abs()
            };
            let reward = scoring::evaluate(activation, answer, response_time, &shared.config);
            let row = AnswerEntity {
                activation_id: activation.id.clone(),
                player_id: slot.player_id.clone(),
                answer: answer.to_string(),
                is_correct: reward.is_correct,
                response_time_ms: reward.response_time_ms,
                created_at: now,
            };
            slot.submitting = true;
            (slot.epoch, row, reward)
        };
        let in_flight = Submitting {
            shared: shared.as_ref(),
            epoch,
            settled: false,
        };

        let inserted = shared
            .retry
            .run("insert_answer", || shared.repository.insert_answer(&row))
            .await;

        in_flight.settle();
        let stashed = shared.with_current(epoch, |slot| {
            slot.submitting = false;
            match &inserted {
                Ok(()) => {
                    slot.answered = true;
                    slot.pending = Some(reward);
                    true
                }
                Err(err) if err.is_duplicate() => {
                    slot.answered = true;
                    false
                }
                Err(_) => false,
            }
        });
        if let Err(err) = inserted {
            if !err.is_duplicate() {
                warn!(activation_id = %row.activation_id, error = %err, "answer not stored");
            }
            return Err(AnswerError::from(err));
        }
        if stashed != Some(true) {
            return Err(AnswerError::NotAttached);
        }

        info!(
            activation_id = %row.activation_id,
            correct = reward.is_correct,
            points = reward.points,
            "answer stored"
        );

        let revealed = if shared.reveal.can_reveal() {
            shared.consume_pending(epoch).await
        } else {
            debug!(activation_id = %row.activation_id, "reward withheld until the window closes");
            None
        };
        Ok(AnswerReceipt {
            activation_id: row.activation_id,
            reward: revealed,
        })
    }

    /// Reward waiting for reveal, if any.
    pub fn pending_reward(&self) -> Option<PendingReward> {
        self.shared.lock().as_ref().and_then(|slot| slot.pending)
    }

    /// Whether this player answered the current activation.
    pub fn has_answered(&self) -> bool {
        self.shared.lock().as_ref().is_some_and(|slot| slot.answered)
    }

    /// Receiver of reveal events, one per activation at most.
    pub fn subscribe(&self) -> broadcast::Receiver<RevealEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for ScoringClient {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Clears the in-flight flag when an answer submission is dropped before the insert settles.
struct Submitting<'a> {
    shared: &'a ScoringShared,
    epoch: u64,
    settled: bool,
}

impl Submitting<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Submitting<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.shared
                .with_current(self.epoch, |slot| slot.submitting = false);
        }
    }
}

impl ScoringShared {
    fn lock(&self) -> MutexGuard<'_, Option<AnswerSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_current<R>(&self, epoch: u64, f: impl FnOnce(&mut AnswerSlot) -> R) -> Option<R> {
        let mut guard = self.lock();
        guard.as_mut().filter(|slot| slot.epoch == epoch).map(f)
    }

    /// Take the pending reward, persist it and announce it. Only the first caller gets it.
    ///
    /// The write-back runs on its own task so a cancelled caller cannot lose a taken reward.
    async fn consume_pending(self: &Arc<Self>, epoch: u64) -> Option<PendingReward> {
        let (activation_id, player_id, reward) = self.with_current(epoch, |slot| {
            if slot.revealed {
                return None;
            }
            let reward = slot.pending.take()?;
            slot.revealed = true;
            Some((slot.activation.id.clone(), slot.player_id.clone(), reward))
        })??;

        let shared = self.clone();
        let announced =
            tokio::spawn(async move { shared.announce(activation_id, player_id, reward).await });
        if let Err(err) = announced.await {
            warn!(error = %err, "reveal task failed");
        }
        Some(reward)
    }

    async fn announce(&self, activation_id: String, player_id: String, reward: PendingReward) {
        let persisted = self.persist(&player_id, &reward).await;
        let (persisted, total_score) = match persisted {
            Ok(score) => (true, Some(score)),
            Err(err) => {
                warn!(
                    %activation_id,
                    %player_id,
                    points = reward.points,
                    error = %err,
                    "score write-back failed; showing reward anyway"
                );
                (false, None)
            }
        };

        info!(%activation_id, points = reward.points, persisted, "reward revealed");
        let _ = self.events.send(RevealEvent {
            activation_id,
            player_id,
            points: reward.points,
            is_correct: reward.is_correct,
            response_time_ms: reward.response_time_ms,
            total_score,
            persisted,
        });
    }

    /// Read-modify-write of the player's score and stats. Returns the new score.
    ///
    /// Not compare-and-swap: two devices of one player writing at once can lose an update.
    async fn persist(&self, player_id: &str, reward: &PendingReward) -> StorageResult<i64> {
        let player = match self
            .retry
            .run("find_player", || self.repository.find_player(player_id))
            .await?
        {
            Some(player) => player,
            None => self.create_player(player_id).await?,
        };
        let patch = scoring::apply_reward(&player, reward);
        self.retry
            .run("update_player_stats", || {
                self.repository.update_player_stats(player_id, &patch)
            })
            .await?;
        Ok(patch.score)
    }

    async fn create_player(&self, player_id: &str) -> StorageResult<PlayerEntity> {
        let player = PlayerEntity::new(player_id);
        match self
            .retry
            .run("insert_player", || self.repository.insert_player(&player))
            .await
        {
            Ok(()) => Ok(player),
            Err(err) if err.is_duplicate() => self
                .retry
                .run("find_player", || self.repository.find_player(player_id))
                .await?
                .ok_or_else(|| StorageError::application("not_found", "player row vanished")),
            Err(err) => Err(err),
        }
    }
}

/// Reveal a withheld reward as soon as the countdown of `activation_id` expires.
async fn reveal_on_expiry(shared: Arc<ScoringShared>, epoch: u64, activation_id: String) {
    let mut views = shared.reveal.subscribe();
    loop {
        let expired = views
            .borrow_and_update()
            .as_ref()
            .is_some_and(|view| view.activation_id == activation_id && view.has_expired);
        if expired {
            shared.consume_pending(epoch).await;
        }
        if views.changed().await.is_err() {
            return;
        }
    }
}
