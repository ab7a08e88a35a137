//! One participant's view of the current activation, wiring poll, reveal and scoring together.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::{
    clock::SharedClock,
    config::AppConfig,
    dao::{
        journal::VoteJournal,
        models::{ActivationEntity, ActivationKind},
        remote_store::RemoteStore,
        repository::ActivationRepository,
    },
    dto::{AnswerReceipt, VoteReceipt},
    error::{AnswerError, SessionError, VoteError},
    services::{
        offline_queue::OfflineVoteQueue, poll_sync::PollSyncEngine, retry::RetryPolicy,
        reveal::TimedRevealController, scoring::ScoringClient,
    },
};

/// Facade over the sync components for one player and one activation at a time.
pub struct LiveSession {
    repository: ActivationRepository,
    retry: RetryPolicy,
    queue: Arc<OfflineVoteQueue>,
    poll: PollSyncEngine,
    reveal: Arc<TimedRevealController>,
    scoring: ScoringClient,
    current: Mutex<Option<ActivationEntity>>,
}

impl LiveSession {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        journal: Arc<dyn VoteJournal>,
        config: &AppConfig,
        clock: SharedClock,
    ) -> Self {
        let repository = ActivationRepository::new(store);
        let retry = RetryPolicy::new(&config.retry);
        let queue = Arc::new(OfflineVoteQueue::new(journal, repository.clone(), retry));
        let poll = PollSyncEngine::new(
            repository.clone(),
            queue.clone(),
            retry,
            config.poll.clone(),
            clock.clone(),
        );
        let reveal = Arc::new(TimedRevealController::new(
            repository.clone(),
            retry,
            config.poll.clone(),
            clock.clone(),
        ));
        let scoring = ScoringClient::new(
            repository.clone(),
            retry,
            config.scoring.clone(),
            clock,
            reveal.clone(),
        );
        Self {
            repository,
            retry,
            queue,
            poll,
            reveal,
            scoring,
            current: Mutex::new(None),
        }
    }

    /// Load `activation_id` and attach every component it needs, superseding the previous one.
    pub async fn attach(
        &self,
        activation_id: &str,
        player_id: &str,
    ) -> Result<ActivationEntity, SessionError> {
        if activation_id.trim().is_empty() || player_id.trim().is_empty() {
            return Err(SessionError::MissingIds);
        }
        let activation = self
            .retry
            .run("find_activation", || {
                self.repository.find_activation(activation_id)
            })
            .await?
            .ok_or_else(|| SessionError::NotFound(activation_id.to_string()))?;

        self.detach();
        self.reveal.attach(&activation);
        if activation.kind == ActivationKind::Poll {
            self.poll
                .attach(&activation.id, activation.options.clone(), player_id);
        }
        if activation.kind.is_answerable() {
            self.scoring.attach(&activation, player_id);
        }
        info!(
            activation_id = %activation.id,
            kind = ?activation.kind,
            player_id,
            "session attached"
        );
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(activation.clone());
        Ok(activation)
    }

    /// Tear down every component. Safe to call repeatedly.
    pub fn detach(&self) {
        self.scoring.detach();
        self.poll.detach();
        self.reveal.detach();
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Activation currently attached.
    pub fn activation(&self) -> Option<ActivationEntity> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Vote on the attached poll.
    pub async fn submit_vote(&self, option_id: &str) -> Result<VoteReceipt, VoteError> {
        self.poll.submit_vote(option_id).await
    }

    /// Answer the attached question.
    pub async fn submit_answer(&self, answer: &str) -> Result<AnswerReceipt, AnswerError> {
        self.scoring.submit_answer(answer).await
    }

    /// Whether results of the attached activation may be shown.
    pub fn can_reveal_results(&self) -> bool {
        self.reveal.can_reveal()
    }

    pub fn poll(&self) -> &PollSyncEngine {
        &self.poll
    }

    pub fn reveal(&self) -> &TimedRevealController {
        &self.reveal
    }

    pub fn scoring(&self) -> &ScoringClient {
        &self.scoring
    }

    /// Offline vote queue shared by every attachment.
    pub fn queue(&self) -> Arc<OfflineVoteQueue> {
        self.queue.clone()
    }
}
