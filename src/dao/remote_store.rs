//! Row-level contract of the hosted persistence and pub/sub service.

use futures::{future::BoxFuture, stream::BoxStream};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::dao::storage::{StorageError, StorageResult};

/// A single row as exchanged with the remote store.
pub type Row = Map<String, Value>;

/// Stream of change notifications produced by a subscription.
pub type ChangeStream = BoxStream<'static, RowChange>;

/// Equality filter on a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

impl Filter {
    /// Match rows whose `column` equals `value`.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether the given row satisfies this filter.
    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column) == Some(&self.value)
    }
}

/// Kind of row change carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change notification. Delivery is best effort and may be dropped silently.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

/// Abstraction over the remote store: row CRUD plus best-effort change subscriptions.
pub trait RemoteStore: Send + Sync {
    fn select(&self, table: &str, filters: Vec<Filter>) -> BoxFuture<'static, StorageResult<Vec<Row>>>;
    fn insert(&self, table: &str, row: Row) -> BoxFuture<'static, StorageResult<()>>;
    fn update(
        &self,
        table: &str,
        filters: Vec<Filter>,
        patch: Row,
    ) -> BoxFuture<'static, StorageResult<()>>;
    fn subscribe(
        &self,
        table: &str,
        filter: Filter,
        kinds: Vec<ChangeKind>,
    ) -> BoxFuture<'static, StorageResult<ChangeStream>>;
}

/// Decode a row into a typed entity.
pub fn decode_row<T: DeserializeOwned>(table: &str, row: Row) -> StorageResult<T> {
    serde_json::from_value(Value::Object(row)).map_err(|source| StorageError::Decode {
        table: table.to_string(),
        source,
    })
}

/// Encode a typed entity into a row.
pub fn encode_row<T: Serialize>(table: &str, entity: &T) -> StorageResult<Row> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(other) => Err(StorageError::application(
            "encode",
            format!("`{table}` entity encoded to non-object value {other}"),
        )),
        Err(source) => Err(StorageError::Decode {
            table: table.to_string(),
            source,
        }),
    }
}
