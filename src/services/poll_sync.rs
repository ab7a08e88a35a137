//! Poll synchronization: adaptive full refreshes as ground truth, change notifications as hints.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    clock::SharedClock,
    config::PollConfig,
    dao::{
        models::{ACTIVATIONS_TABLE, OptionEntity, PollState, VOTES_TABLE, VoteEntity, resolve_option},
        remote_store::{ChangeStream, RowChange},
        repository::ActivationRepository,
        storage::{ErrorClass, StorageError},
    },
    dto::{PollStatus, PollView, VoteReceipt, VoteStatus},
    error::VoteError,
    services::{offline_queue::OfflineVoteQueue, retry::RetryPolicy},
    state::{AdaptiveInterval, VoteTally},
};

/// Keeps one activation's tally, poll state and vote flags converged with the remote store.
///
/// Every state change goes through a full refresh that recomputes the tally from the whole vote
/// set. Change notifications only cut the wait before the next refresh.
pub struct PollSyncEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    repository: ActivationRepository,
    queue: Arc<OfflineVoteQueue>,
    retry: RetryPolicy,
    config: PollConfig,
    clock: SharedClock,
    epoch: AtomicU64,
    attachment: Mutex<Option<Attachment>>,
    view: watch::Sender<PollView>,
}

/// Local vote shown on top of the last confirmed snapshot until a refresh accounts for it.
struct Overlay {
    option_id: Option<String>,
    option_text: String,
    /// Refreshes numbered above this one started after the vote was stored.
    after_refresh: u64,
    /// Whether the store acknowledged the vote (as opposed to queuing it offline).
    confirmed: bool,
}

struct Attachment {
    epoch: u64,
    activation_id: String,
    player_id: String,
    options: Vec<OptionEntity>,
    poll_state: PollState,
    confirmed: VoteTally,
    overlay: Option<Overlay>,
    has_voted: bool,
    /// The confirmed snapshot already contains this player's vote.
    vote_in_snapshot: bool,
    selected_option_id: Option<String>,
    submitting: bool,
    interval: AdaptiveInterval,
    status: PollStatus,
    refreshes_started: u64,
    last_applied: u64,
    wake: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl Attachment {
    fn view(&self) -> PollView {
        let optimistic = self.overlay.is_some();
        let tally = match &self.overlay {
            Some(overlay) => self.confirmed.with_vote(
                &self.options,
                overlay.option_id.as_deref(),
                &overlay.option_text,
            ),
            None => self.confirmed.clone(),
        };
        PollView::from_tally(
            self.activation_id.clone(),
            self.poll_state,
            &tally,
            self.has_voted,
            self.selected_option_id.clone(),
            optimistic,
        )
    }

    fn wake_now(&mut self) {
        self.interval.reset();
        self.wake.notify_one();
    }
}

struct Snapshot {
    poll_state: PollState,
    options: Vec<OptionEntity>,
    votes: Vec<VoteEntity>,
}

impl PollSyncEngine {
    pub fn new(
        repository: ActivationRepository,
        queue: Arc<OfflineVoteQueue>,
        retry: RetryPolicy,
        config: PollConfig,
        clock: SharedClock,
    ) -> Self {
        let (view, _rx) = watch::channel(PollView::empty(""));
        Self {
            shared: Arc::new(EngineShared {
                repository,
                queue,
                retry,
                config,
                clock,
                epoch: AtomicU64::new(0),
                attachment: Mutex::new(None),
                view,
            }),
        }
    }

    /// Reset all vote state and start reconciling `activation_id`.
    ///
    /// A blank activation id is ignored. Must be called from within a tokio runtime.
    pub fn attach(&self, activation_id: &str, options: Vec<OptionEntity>, player_id: &str) {
        if activation_id.trim().is_empty() {
            debug!("ignoring poll attach without activation id");
            return;
        }
        self.detach();

        let shared = &self.shared;
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let wake = Arc::new(Notify::new());
        let mut attachment = Attachment {
            epoch,
            activation_id: activation_id.to_string(),
            player_id: player_id.to_string(),
            confirmed: VoteTally::empty(&options),
            options,
            poll_state: PollState::Pending,
            overlay: None,
            has_voted: false,
            vote_in_snapshot: false,
            selected_option_id: None,
            submitting: false,
            interval: AdaptiveInterval::new(&shared.config),
            status: PollStatus::default(),
            refreshes_started: 0,
            last_applied: 0,
            wake: wake.clone(),
            tasks: Vec::new(),
        };
        attachment.status.interval_ms = millis(attachment.interval.current());
        shared.view.send_replace(attachment.view());
        *shared.lock() = Some(attachment);

        let tasks = [
            tokio::spawn(reconcile_loop(shared.clone(), epoch, wake)),
            tokio::spawn(watch_changes(
                shared.clone(),
                epoch,
                activation_id.to_string(),
            )),
        ];
        shared.adopt_tasks(epoch, tasks);
        info!(activation_id, player_id, "poll engine attached");
    }

    /// Stop refreshing and drop subscriptions. Safe to call repeatedly.
    pub fn detach(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = self.shared.lock().take();
        if let Some(attachment) = previous {
            for task in &attachment.tasks {
                task.abort();
            }
            info!(activation_id = %attachment.activation_id, "poll engine detached");
        }
    }

    /// Current view.
    pub fn view(&self) -> PollView {
        self.shared.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    pub fn subscribe(&self) -> watch::Receiver<PollView> {
        self.shared.view.subscribe()
    }

    /// Health of the reconciliation loop, `None` when detached.
    pub fn status(&self) -> Option<PollStatus> {
        self.shared.lock().as_ref().map(|a| a.status.clone())
    }

    /// Ask for an immediate full refresh.
    pub fn refresh_now(&self) {
        if let Some(attachment) = self.shared.lock().as_mut() {
            attachment.wake_now();
        }
    }

    /// Vote for an option, given by id or, for legacy options, by text.
    ///
    /// A network failure queues the vote offline and still reports it as accepted, flagged as
    /// [`VoteStatus::Queued`].
    pub async fn submit_vote(&self, option_id: &str) -> Result<VoteReceipt, VoteError> {
        let shared = &self.shared;
        let (epoch, vote) = {
            let mut guard = shared.lock();
            let attachment = guard.as_mut().ok_or(VoteError::NotAttached)?;
            if attachment.player_id.trim().is_empty() {
                return Err(VoteError::NotAttached);
            }
            if attachment.has_voted {
                return Err(VoteError::AlreadyVoted);
            }
            if attachment.submitting {
                return Err(VoteError::InFlight);
            }
            if attachment.poll_state != PollState::Voting {
                return Err(VoteError::PollNotOpen(attachment.poll_state));
            }
            let option = resolve_option(&attachment.options, Some(option_id), Some(option_id))
                .ok_or_else(|| VoteError::InvalidOption(option_id.to_string()))?;
            let vote = VoteEntity {
                activation_id: attachment.activation_id.clone(),
                player_id: attachment.player_id.clone(),
                option_id: option.id.clone(),
                option_text: option.text.clone(),
                created_at: shared.clock.now(),
            };
            attachment.submitting = true;
            (attachment.epoch, vote)
        };
        let in_flight = InFlight {
            shared: shared.as_ref(),
            epoch,
            settled: false,
        };

        let inserted = shared
            .retry
            .run("insert_vote", || shared.repository.insert_vote(&vote))
            .await;

        let status = match inserted {
            Ok(()) => VoteStatus::Confirmed,
            Err(err) if err.class() == ErrorClass::Network => {
                match shared.queue.enqueue(vote.clone()).await {
                    Ok(_) => VoteStatus::Queued,
                    Err(journal_err) => {
                        warn!(
                            activation_id = %vote.activation_id,
                            error = %journal_err,
                            "vote could neither be sent nor queued"
                        );
                        in_flight.settle();
                        shared.finish_failed_submit(epoch, false);
                        return Err(VoteError::Unsent(err));
                    }
                }
            }
            Err(err) => {
                let duplicate = err.is_duplicate();
                if !duplicate {
                    warn!(activation_id = %vote.activation_id, error = %err, "vote rejected");
                }
                in_flight.settle();
                shared.finish_failed_submit(epoch, duplicate);
                return Err(VoteError::from(err));
            }
        };

        in_flight.settle();
        shared.apply_local_vote(epoch, &vote, status == VoteStatus::Confirmed);
        info!(
            activation_id = %vote.activation_id,
            option = %vote.option_text,
            ?status,
            "vote accepted"
        );
        Ok(VoteReceipt {
            activation_id: vote.activation_id,
            option_id: vote.option_id.unwrap_or(vote.option_text),
            status,
        })
    }
}

impl Drop for PollSyncEngine {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Clears the in-flight flag when a vote submission is dropped before it settles.
struct InFlight<'a> {
    shared: &'a EngineShared,
    epoch: u64,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.shared.with_current(self.epoch, |attachment| {
            attachment.submitting = false;
        });
        debug!(epoch = self.epoch, "vote submission abandoned");
    }
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, Option<Attachment>> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the attachment if it still belongs to `epoch`.
    fn with_current<R>(&self, epoch: u64, f: impl FnOnce(&mut Attachment) -> R) -> Option<R> {
        let mut guard = self.lock();
        guard.as_mut().filter(|a| a.epoch == epoch).map(f)
    }

    fn publish(&self, attachment: &Attachment) {
        let view = attachment.view();
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn apply_local_vote(&self, epoch: u64, vote: &VoteEntity, confirmed: bool) {
        let applied = self.with_current(epoch, |attachment| {
            attachment.submitting = false;
            attachment.has_voted = true;
            attachment.selected_option_id =
                Some(vote.option_id.clone().unwrap_or_else(|| vote.option_text.clone()));
            if !attachment.vote_in_snapshot {
                attachment.overlay = Some(Overlay {
                    option_id: vote.option_id.clone(),
                    option_text: vote.option_text.clone(),
                    after_refresh: attachment.refreshes_started,
                    confirmed,
                });
            }
            self.publish(attachment);
            attachment.wake.clone()
        });

        if let Some(wake) = applied {
            let delay = self.config.post_vote_refresh_delay;
            let handle = tokio::spawn(async move {
                sleep(delay).await;
                wake.notify_one();
            });
            self.adopt_tasks(epoch, [handle]);
        }
    }

    /// Tie tasks to the attachment of `epoch`, aborting them if it is already gone.
    fn adopt_tasks(&self, epoch: u64, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        let mut guard = self.lock();
        match guard.as_mut().filter(|a| a.epoch == epoch) {
            Some(attachment) => attachment.tasks.extend(handles),
            None => handles.into_iter().for_each(|handle| handle.abort()),
        }
    }

    fn finish_failed_submit(&self, epoch: u64, refresh: bool) {
        self.with_current(epoch, |attachment| {
            attachment.submitting = false;
            if refresh {
                attachment.wake_now();
            }
        });
    }

    /// One full refresh: fetch state and votes, recompute, publish.
    async fn refresh(&self, epoch: u64) {
        let Some((activation_id, seq)) = self.with_current(epoch, |attachment| {
            attachment.refreshes_started += 1;
            (attachment.activation_id.clone(), attachment.refreshes_started)
        }) else {
            return;
        };

        let fetched = self.fetch(&activation_id).await;
        let now = self.clock.now();

        self.with_current(epoch, |attachment| {
            if seq <= attachment.last_applied {
                debug!(%activation_id, seq, "discarding superseded refresh");
                return;
            }
            match fetched {
                Ok(snapshot) => {
                    attachment.last_applied = seq;
                    self.apply_snapshot(attachment, snapshot, seq);
                    attachment.status.consecutive_errors = 0;
                    attachment.status.last_error = None;
                    attachment.status.last_refresh_at = Some(now);
                    attachment.status.retries_exhausted = false;
                }
                Err(err) => {
                    attachment.interval.on_error();
                    let errors = attachment.interval.consecutive_errors();
                    attachment.status.consecutive_errors = errors;
                    attachment.status.last_error = Some(err.to_string());
                    attachment.status.retries_exhausted =
                        errors >= self.config.errors_before_backoff;
                    warn!(
                        %activation_id,
                        consecutive_errors = errors,
                        next_in_ms = millis(attachment.interval.current()),
                        error = %err,
                        "poll refresh failed"
                    );
                }
            }
            attachment.status.interval_ms = millis(attachment.interval.current());
        });
    }

    async fn fetch(&self, activation_id: &str) -> Result<Snapshot, StorageError> {
        let activation = self
            .retry
            .run("find_activation", || {
                self.repository.find_activation(activation_id)
            })
            .await?
            .ok_or_else(|| {
                StorageError::application("not_found", format!("activation {activation_id} is gone"))
            })?;
        let votes = self
            .retry
            .run("list_votes", || self.repository.list_votes(activation_id))
            .await?;
        Ok(Snapshot {
            poll_state: activation.poll_state(),
            options: activation.options,
            votes,
        })
    }

    fn apply_snapshot(&self, attachment: &mut Attachment, snapshot: Snapshot, seq: u64) {
        if !snapshot.options.is_empty() {
            attachment.options = snapshot.options;
        }
        let tally = VoteTally::from_votes(&attachment.options, &snapshot.votes);

        let own_vote = snapshot
            .votes
            .iter()
            .find(|vote| vote.player_id == attachment.player_id);
        attachment.vote_in_snapshot = own_vote.is_some();
        if let Some(vote) = own_vote {
            attachment.has_voted = true;
            let selected = resolve_option(
                &attachment.options,
                vote.option_id.as_deref(),
                Some(&vote.option_text),
            )
            .and_then(|option| option.id.clone())
            .or_else(|| vote.option_id.clone())
            .unwrap_or_else(|| vote.option_text.clone());
            attachment.selected_option_id = Some(selected);
        }

        let overlay_settled = attachment.overlay.as_ref().is_some_and(|overlay| {
            own_vote.is_some() || (overlay.confirmed && seq > overlay.after_refresh)
        });
        if overlay_settled {
            attachment.overlay = None;
        }

        let previous_state = attachment.poll_state;
        attachment.poll_state = snapshot.poll_state;
        let voting = snapshot.poll_state == PollState::Voting;
        attachment
            .interval
            .on_success(tally.total_votes(), voting);
        if voting && previous_state != PollState::Voting {
            attachment.interval.reset();
        }
        if previous_state != snapshot.poll_state {
            info!(
                activation_id = %attachment.activation_id,
                from = ?previous_state,
                to = ?snapshot.poll_state,
                "poll state changed"
            );
        }

        attachment.confirmed = tally;
        self.publish(attachment);
    }

    /// React to a change notification. Returns `false` once the attachment is gone.
    fn on_change(&self, epoch: u64, change: &RowChange) -> bool {
        self.with_current(epoch, |attachment| {
            if change.table == ACTIVATIONS_TABLE {
                let next_state = change
                    .new
                    .as_ref()
                    .and_then(|row| row.get("poll_state"))
                    .filter(|value| !value.is_null())
                    .and_then(|value| serde_json::from_value::<PollState>(value.clone()).ok());
                if next_state == Some(PollState::Voting) && attachment.poll_state != PollState::Voting
                {
                    debug!(activation_id = %attachment.activation_id, "voting opened; refreshing");
                }
            } else if change.table == VOTES_TABLE {
                debug!(activation_id = %attachment.activation_id, "vote notification; refreshing");
            }
            attachment.wake_now();
        })
        .is_some()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }
}

/// Refresh, then wait for the adaptive interval or an early wake-up.
async fn reconcile_loop(shared: Arc<EngineShared>, epoch: u64, wake: Arc<Notify>) {
    loop {
        shared.refresh(epoch).await;
        let Some(delay) = shared.with_current(epoch, |a| a.interval.current()) else {
            return;
        };
        tokio::select! {
            _ = sleep(delay) => {}
            _ = wake.notified() => {}
        }
    }
}

/// Keep the vote and activation subscriptions open, resubscribing with backoff when they fail.
async fn watch_changes(shared: Arc<EngineShared>, epoch: u64, activation_id: String) {
    let mut delay = shared.config.base_interval;
    loop {
        match subscribe_both(&shared.repository, &activation_id).await {
            Ok(mut changes) => {
                debug!(%activation_id, "subscribed to poll changes");
                delay = shared.config.base_interval;
                while let Some(change) = changes.next().await {
                    if !shared.on_change(epoch, &change) {
                        return;
                    }
                }
                debug!(%activation_id, "change feed closed; resubscribing");
            }
            Err(err) => {
                warn!(%activation_id, error = %err, "poll subscription failed; relying on polling");
            }
        }
        if !shared.is_current(epoch) {
            return;
        }
        sleep(delay).await;
        delay = (delay * 2).min(shared.config.error_max_interval);
    }
}

async fn subscribe_both(
    repository: &ActivationRepository,
    activation_id: &str,
) -> Result<ChangeStream, StorageError> {
    let votes = repository.subscribe_votes(activation_id).await?;
    let activation = repository.subscribe_activation(activation_id).await?;
    Ok(futures::stream::select(votes, activation).boxed())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
