//! In-process remote store with uniqueness constraints, a lossy change feed and fault injection.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use futures::{StreamExt, future::BoxFuture};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::dao::{
    models::{ACTIVATIONS_TABLE, ANSWERS_TABLE, PLAYERS_TABLE, VOTES_TABLE},
    remote_store::{ChangeKind, ChangeStream, Filter, RemoteStore, Row, RowChange},
    storage::{StorageError, StorageResult},
};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Remote store kept entirely in memory.
///
/// Cloning is cheap and every clone shares the same tables, so several engines (standing in for
/// several devices) can run against one store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    tables: DashMap<String, Vec<Row>>,
    unique: DashMap<String, Vec<String>>,
    changes: broadcast::Sender<RowChange>,
    offline: AtomicBool,
    drop_notifications: AtomicBool,
    selects: DashMap<String, AtomicUsize>,
    rejections: DashMap<String, Vec<(Filter, String)>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with the uniqueness constraints of the hosted schema.
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let store = Self {
            inner: Arc::new(MemoryInner {
                tables: DashMap::new(),
                unique: DashMap::new(),
                changes,
                offline: AtomicBool::new(false),
                drop_notifications: AtomicBool::new(false),
                selects: DashMap::new(),
                rejections: DashMap::new(),
            }),
        };
        store.add_unique(ACTIVATIONS_TABLE, &["id"]);
        store.add_unique(PLAYERS_TABLE, &["id"]);
        store.add_unique(VOTES_TABLE, &["activation_id", "player_id"]);
        store.add_unique(ANSWERS_TABLE, &["activation_id", "player_id"]);
        store
    }

    /// Declare a uniqueness constraint over `columns` of `table`.
    pub fn add_unique(&self, table: &str, columns: &[&str]) {
        self.inner.unique.insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
    }

    /// Simulate loss (or recovery) of connectivity: every call fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Silently drop change notifications, as a throttled pub/sub host would.
    pub fn set_notifications_dropped(&self, dropped: bool) {
        self.inner.drop_notifications.store(dropped, Ordering::SeqCst);
    }

    /// Reject inserts into `table` whose row matches `filter` with an application error `code`.
    pub fn reject_inserts(&self, table: &str, filter: Filter, code: &str) {
        self.inner
            .rejections
            .entry(table.to_string())
            .or_default()
            .push((filter, code.to_string()));
    }

    /// Snapshot the rows of a table.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// Number of `select` calls served for a table.
    pub fn select_count(&self, table: &str) -> usize {
        self.inner
            .selects
            .get(table)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn ensure_online(&self) -> StorageResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(StorageError::offline("memory store is offline"))
        } else {
            Ok(())
        }
    }

    fn publish(&self, change: RowChange) {
        if self.inner.drop_notifications.load(Ordering::SeqCst) {
            debug!(table = %change.table, "dropping change notification");
            return;
        }
        let _ = self.inner.changes.send(change);
    }

    fn unique_key(&self, table: &str, row: &Row) -> Option<Vec<Value>> {
        self.inner.unique.get(table).map(|columns| {
            columns
                .iter()
                .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                .collect()
        })
    }

    fn insert_now(&self, table: &str, row: Row) -> StorageResult<()> {
        self.ensure_online()?;
        if let Some(rules) = self.inner.rejections.get(table) {
            if let Some((_, code)) = rules.iter().find(|(filter, _)| filter.matches(&row)) {
                return Err(StorageError::application(code.clone(), "insert rejected"));
            }
        }
        let key = self.unique_key(table, &row);
        {
            let mut rows = self.inner.tables.entry(table.to_string()).or_default();
            if let Some(key) = &key {
                let taken = rows
                    .iter()
                    .any(|existing| self.unique_key(table, existing).as_ref() == Some(key));
                if taken {
                    return Err(StorageError::UniqueViolation {
                        table: table.to_string(),
                    });
                }
            }
            rows.push(row.clone());
        }
        self.publish(RowChange {
            table: table.to_string(),
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        });
        Ok(())
    }

    fn update_now(&self, table: &str, filters: &[Filter], patch: Row) -> StorageResult<()> {
        self.ensure_online()?;
        let mut changes = Vec::new();
        if let Some(mut rows) = self.inner.tables.get_mut(table) {
            for row in rows.iter_mut() {
                if !filters.iter().all(|f| f.matches(row)) {
                    continue;
                }
                let old = row.clone();
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                changes.push(RowChange {
                    table: table.to_string(),
                    kind: ChangeKind::Update,
                    new: Some(row.clone()),
                    old: Some(old),
                });
            }
        }
        for change in changes {
            self.publish(change);
        }
        Ok(())
    }

    fn select_now(&self, table: &str, filters: &[Filter]) -> StorageResult<Vec<Row>> {
        self.ensure_online()?;
        self.inner
            .selects
            .entry(table.to_string())
            .or_default()
            .fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl RemoteStore for MemoryStore {
    fn select(&self, table: &str, filters: Vec<Filter>) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        let result = self.select_now(table, &filters);
        Box::pin(async move { result })
    }

    fn insert(&self, table: &str, row: Row) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.insert_now(table, row);
        Box::pin(async move { result })
    }

    fn update(
        &self,
        table: &str,
        filters: Vec<Filter>,
        patch: Row,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.update_now(table, &filters, patch);
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        table: &str,
        filter: Filter,
        kinds: Vec<ChangeKind>,
    ) -> BoxFuture<'static, StorageResult<ChangeStream>> {
        let store = self.clone();
        let table = table.to_string();
        Box::pin(async move {
            store.ensure_online()?;
            let receiver = store.inner.changes.subscribe();
            let stream = BroadcastStream::new(receiver).filter_map(move |item| {
                let keep = match item {
                    // Lagged receivers lose notifications, which the contract allows.
                    Err(_) => None,
                    Ok(change) => {
                        let row = change.new.as_ref().or(change.old.as_ref());
                        let relevant = change.table == table
                            && kinds.contains(&change.kind)
                            && row.is_some_and(|row| filter.matches(row));
                        relevant.then_some(change)
                    }
                };
                futures::future::ready(keep)
            });
            Ok(stream.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn second_vote_for_same_player_is_rejected() {
        let store = MemoryStore::new();
        let vote = row(json!({"activation_id": "a", "player_id": "p", "option_text": "A"}));

        store.insert(VOTES_TABLE, vote.clone()).await.unwrap();
        let err = store.insert(VOTES_TABLE, vote).await.unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(store.rows(VOTES_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn offline_store_fails_with_network_error() {
        let store = MemoryStore::new();
        store.set_offline(true);

        let err = store.select(VOTES_TABLE, vec![]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn subscription_only_sees_matching_rows() {
        let store = MemoryStore::new();
        let mut changes = store
            .subscribe(VOTES_TABLE, Filter::eq("activation_id", "a"), vec![ChangeKind::Insert])
            .await
            .unwrap();

        store
            .insert(VOTES_TABLE, row(json!({"activation_id": "b", "player_id": "p"})))
            .await
            .unwrap();
        store
            .insert(VOTES_TABLE, row(json!({"activation_id": "a", "player_id": "p"})))
            .await
            .unwrap();

        let change = changes.next().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Insert);
        assert_eq!(change.new.unwrap()["activation_id"], json!("a"));
    }

    #[tokio::test]
    async fn update_patches_matching_rows_only() {
        let store = MemoryStore::new();
        store
            .insert(PLAYERS_TABLE, row(json!({"id": "p1", "score": 1})))
            .await
            .unwrap();
        store
            .insert(PLAYERS_TABLE, row(json!({"id": "p2", "score": 1})))
            .await
            .unwrap();

        store
            .update(PLAYERS_TABLE, vec![Filter::eq("id", "p2")], row(json!({"score": 9})))
            .await
            .unwrap();

        let rows = store.rows(PLAYERS_TABLE);
        assert_eq!(rows[0]["score"], json!(1));
        assert_eq!(rows[1]["score"], json!(9));
    }
}
