//! Timed reveal: a per-activation countdown anchored on the server start timestamp.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use futures::StreamExt;
use time::OffsetDateTime;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    clock::SharedClock,
    config::PollConfig,
    dao::{
        models::ActivationEntity, remote_store::RowChange, repository::ActivationRepository,
    },
    dto::TimerView,
    services::retry::RetryPolicy,
    state::{TimerPhase, TimerState, TimerTransition, timer::TICK},
};

/// Decides when a timed activation's results may be revealed, and keeps the countdown running.
pub struct TimedRevealController {
    shared: Arc<RevealShared>,
}

struct RevealShared {
    repository: ActivationRepository,
    retry: RetryPolicy,
    config: PollConfig,
    clock: SharedClock,
    epoch: AtomicU64,
    slot: Mutex<Option<TimerSlot>>,
    view: watch::Sender<Option<TimerView>>,
}

struct TimerSlot {
    epoch: u64,
    timer: TimerState,
    ticker: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn abort_tasks(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl TimedRevealController {
    pub fn new(
        repository: ActivationRepository,
        retry: RetryPolicy,
        config: PollConfig,
        clock: SharedClock,
    ) -> Self {
        let (view, _rx) = watch::channel(None);
        Self {
            shared: Arc::new(RevealShared {
                repository,
                retry,
                config,
                clock,
                epoch: AtomicU64::new(0),
                slot: Mutex::new(None),
                view,
            }),
        }
    }

    /// Start tracking `activation`, dropping any previous countdown.
    pub fn attach(&self, activation: &ActivationEntity) {
        self.detach();
        let shared = &self.shared;
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = TimerState::new(activation, shared.clock.now());
        let phase = timer.phase();
        info!(activation_id = %activation.id, ?phase, "reveal controller attached");

        {
            let mut guard = shared.lock();
            let slot = guard.insert(TimerSlot {
                epoch,
                timer,
                ticker: None,
                watcher: None,
            });
            shared.publish(slot);
        }

        match phase {
            TimerPhase::WaitingToStart => {
                let watcher = tokio::spawn(watch_for_start(
                    shared.clone(),
                    epoch,
                    activation.id.clone(),
                ));
                shared.with_current(epoch, |slot| slot.watcher = Some(watcher));
            }
            TimerPhase::Running => shared.start_ticking(epoch),
            TimerPhase::NoTimer | TimerPhase::Expired => {}
        }
    }

    /// Stop the countdown and forget the activation. Safe to call repeatedly.
    pub fn detach(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = self.shared.lock().take();
        if let Some(mut slot) = previous {
            slot.abort_tasks();
            debug!(activation_id = %slot.timer.activation_id(), "reveal controller detached");
        }
        self.shared.view.send_replace(None);
    }

    /// Feed a start timestamp delivered by some other refresh of the activation row.
    pub fn observe_start(&self, started_at: Option<OffsetDateTime>) {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.shared.observe_start(epoch, started_at);
    }

    /// Whether correctness and points may be revealed now. `true` when nothing is attached.
    ///
    /// Re-derives expiry from the server timestamp, so a stalled local tick cannot hold results
    /// back.
    pub fn can_reveal(&self) -> bool {
        let now = self.shared.clock.now();
        let mut guard = self.shared.lock();
        let Some(slot) = guard.as_mut() else {
            return true;
        };
        let was_expired = slot.timer.has_expired();
        let allowed = slot.timer.can_reveal(now);
        if !was_expired && slot.timer.has_expired() {
            self.shared.on_expired(slot, "server time");
        }
        allowed
    }

    /// Current countdown, `None` when detached.
    pub fn view(&self) -> Option<TimerView> {
        self.shared.view.borrow().clone()
    }

    /// Receiver notified on every countdown change, including expiry.
    pub fn subscribe(&self) -> watch::Receiver<Option<TimerView>> {
        self.shared.view.subscribe()
    }
}

impl Drop for TimedRevealController {
    fn drop(&mut self) {
        self.detach();
    }
}

impl RevealShared {
    fn lock(&self) -> MutexGuard<'_, Option<TimerSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_current<R>(&self, epoch: u64, f: impl FnOnce(&mut TimerSlot) -> R) -> Option<R> {
        let mut guard = self.lock();
        guard.as_mut().filter(|slot| slot.epoch == epoch).map(f)
    }

    fn publish(&self, slot: &TimerSlot) {
        let view = TimerView::from(&slot.timer);
        self.view.send_if_modified(|current| {
            if current.as_ref() == Some(&view) {
                false
            } else {
                *current = Some(view);
                true
            }
        });
    }

    fn on_expired(&self, slot: &mut TimerSlot, via: &'static str) {
        slot.abort_tasks();
        info!(activation_id = %slot.timer.activation_id(), via, "answer window expired");
        self.publish(slot);
    }

    /// Returns `true` while the activation still waits for its start timestamp.
    fn observe_start(self: &Arc<Self>, epoch: u64, started_at: Option<OffsetDateTime>) -> bool {
        let now = self.clock.now();
        let outcome = self.with_current(epoch, |slot| {
            let transition = slot.timer.observe_start(started_at, now);
            match transition {
                TimerTransition::Started => {
                    info!(
                        activation_id = %slot.timer.activation_id(),
                        remaining_ms = slot.timer.time_remaining().as_millis() as u64,
                        "countdown started"
                    );
                    if let Some(watcher) = slot.watcher.take() {
                        watcher.abort();
                    }
                    self.publish(slot);
                }
                TimerTransition::Expired => self.on_expired(slot, "late start"),
                TimerTransition::Unchanged => {}
            }
            (transition, slot.timer.phase() == TimerPhase::WaitingToStart)
        });
        match outcome {
            Some((TimerTransition::Started, _)) => {
                self.start_ticking(epoch);
                false
            }
            Some((_, waiting)) => waiting,
            None => false,
        }
    }

    fn start_ticking(self: &Arc<Self>, epoch: u64) {
        let handle = tokio::spawn(tick_loop(self.clone(), epoch));
        let adopted = self.with_current(epoch, |slot| {
            if let Some(previous) = slot.ticker.replace(handle) {
                previous.abort();
            }
        });
        if adopted.is_none() {
            debug!("countdown superseded before it started");
        }
    }
}

/// One-second countdown. Exits on expiry or once the activation is superseded.
async fn tick_loop(shared: Arc<RevealShared>, epoch: u64) {
    let mut ticker = interval_at(Instant::now() + TICK, TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let now = shared.clock.now();
        let running = shared.with_current(epoch, |slot| {
            match slot.timer.tick(now) {
                TimerTransition::Expired => {
                    slot.ticker = None;
                    shared.on_expired(slot, "tick");
                    false
                }
                _ => {
                    shared.publish(slot);
                    slot.timer.is_active()
                }
            }
        });
        if running != Some(true) {
            return;
        }
    }
}

/// Wait for the host to start the clock: listen for row updates, and re-read the row on the
/// base poll interval in case a notification is lost.
async fn watch_for_start(shared: Arc<RevealShared>, epoch: u64, activation_id: String) {
    let mut changes = match shared.repository.subscribe_activation(&activation_id).await {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!(%activation_id, error = %err, "timer subscription failed; polling only");
            None
        }
    };

    loop {
        let notified = match changes.as_mut() {
            Some(stream) => tokio::select! {
                change = stream.next() => Some(change),
                _ = sleep(shared.config.base_interval) => None,
            },
            None => {
                sleep(shared.config.base_interval).await;
                None
            }
        };

        let started_at = match notified {
            Some(Some(change)) => started_at_of(&change),
            Some(None) => {
                debug!(%activation_id, "timer change feed closed");
                changes = None;
                continue;
            }
            None => None,
        };

        let started_at = match started_at {
            Some(started_at) => Some(started_at),
            None => match shared
                .retry
                .run("find_activation", || shared.repository.find_activation(&activation_id))
                .await
            {
                Ok(Some(activation)) => activation.timer_started_at,
                Ok(None) => None,
                Err(err) => {
                    debug!(%activation_id, error = %err, "timer refresh failed");
                    None
                }
            },
        };

        if !shared.observe_start(epoch, started_at) {
            return;
        }
    }
}

fn started_at_of(change: &RowChange) -> Option<OffsetDateTime> {
    let row = change.new.as_ref()?;
    let value = row.get("timer_started_at")?.as_str()?;
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339).ok()
}
