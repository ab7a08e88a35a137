use std::sync::Arc;

use crate::dao::{
    models::{
        ACTIVATIONS_TABLE, ANSWERS_TABLE, ActivationEntity, AnswerEntity, PLAYERS_TABLE,
        PlayerEntity, PlayerStatsPatch, VOTES_TABLE, VoteEntity,
    },
    remote_store::{ChangeKind, ChangeStream, Filter, RemoteStore, decode_row, encode_row},
    storage::StorageResult,
};

/// Typed access to activation, vote, answer and player rows over a [`RemoteStore`].
#[derive(Clone)]
pub struct ActivationRepository {
    store: Arc<dyn RemoteStore>,
}

impl ActivationRepository {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Fetch an activation by id.
    pub async fn find_activation(&self, id: &str) -> StorageResult<Option<ActivationEntity>> {
        let rows = self
            .store
            .select(ACTIVATIONS_TABLE, vec![Filter::eq("id", id)])
            .await?;
        rows.into_iter()
            .next()
            .map(|row| decode_row(ACTIVATIONS_TABLE, row))
            .transpose()
    }

    /// Fetch the full vote set of an activation.
    pub async fn list_votes(&self, activation_id: &str) -> StorageResult<Vec<VoteEntity>> {
        let rows = self
            .store
            .select(VOTES_TABLE, vec![Filter::eq("activation_id", activation_id)])
            .await?;
        rows.into_iter()
            .map(|row| decode_row(VOTES_TABLE, row))
            .collect()
    }

    /// Insert a vote. A second vote for the same player surfaces as a uniqueness violation.
    pub async fn insert_vote(&self, vote: &VoteEntity) -> StorageResult<()> {
        let row = encode_row(VOTES_TABLE, vote)?;
        self.store.insert(VOTES_TABLE, row).await
    }

    /// Insert an answer. A second answer for the same player surfaces as a uniqueness violation.
    pub async fn insert_answer(&self, answer: &AnswerEntity) -> StorageResult<()> {
        let row = encode_row(ANSWERS_TABLE, answer)?;
        self.store.insert(ANSWERS_TABLE, row).await
    }

    /// Fetch a player row by id.
    pub async fn find_player(&self, id: &str) -> StorageResult<Option<PlayerEntity>> {
        let rows = self
            .store
            .select(PLAYERS_TABLE, vec![Filter::eq("id", id)])
            .await?;
        rows.into_iter()
            .next()
            .map(|row| decode_row(PLAYERS_TABLE, row))
            .transpose()
    }

    /// Insert a player row.
    pub async fn insert_player(&self, player: &PlayerEntity) -> StorageResult<()> {
        let row = encode_row(PLAYERS_TABLE, player)?;
        self.store.insert(PLAYERS_TABLE, row).await
    }

    /// Overwrite the score and stats columns of a player row.
    pub async fn update_player_stats(
        &self,
        player_id: &str,
        patch: &PlayerStatsPatch,
    ) -> StorageResult<()> {
        let row = encode_row(PLAYERS_TABLE, patch)?;
        self.store
            .update(PLAYERS_TABLE, vec![Filter::eq("id", player_id)], row)
            .await
    }

    /// Subscribe to vote inserts of an activation.
    pub async fn subscribe_votes(&self, activation_id: &str) -> StorageResult<ChangeStream> {
        self.store
            .subscribe(
                VOTES_TABLE,
                Filter::eq("activation_id", activation_id),
                vec![ChangeKind::Insert],
            )
            .await
    }

    /// Subscribe to updates of the activation row itself (poll state, timer start).
    pub async fn subscribe_activation(&self, activation_id: &str) -> StorageResult<ChangeStream> {
        self.store
            .subscribe(
                ACTIVATIONS_TABLE,
                Filter::eq("id", activation_id),
                vec![ChangeKind::Update],
            )
            .await
    }
}
