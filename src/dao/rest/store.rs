use std::{sync::Arc, time::Duration};

use futures::{StreamExt, future::BoxFuture};
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dao::{
    remote_store::{ChangeKind, ChangeStream, Filter, RemoteStore, Row, RowChange},
    storage::StorageResult,
};

use super::{
    config::RestConfig,
    error::{RestDaoError, RestResult},
};

/// Remote store speaking a PostgREST-style row API with a server-sent change feed.
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    base_url: Arc<str>,
    api_key: Option<Arc<str>>,
    changes_path: Arc<str>,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
}

impl RestStore {
    /// Build the HTTP client for the configured endpoint.
    pub fn connect(config: RestConfig) -> RestResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|source| RestDaoError::ClientBuilder { source })?;

        Ok(Self {
            client,
            base_url: Arc::from(config.base_url.trim_end_matches('/')),
            api_key: config.api_key.map(Arc::from),
            changes_path: Arc::from(config.changes_path.trim_matches('/')),
            request_timeout: config.request_timeout,
        })
    }

    fn request(&self, method: Method, path: &str, filters: &[Filter]) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        let query: Vec<(String, String)> = filters
            .iter()
            .map(|f| (f.column.clone(), format!("eq.{}", filter_value(&f.value))))
            .collect();
        let builder = self.client.request(method, url).query(&query);
        match &self.api_key {
            Some(key) => builder
                .header("apikey", key.as_ref())
                .bearer_auth(key.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, path: &str, builder: reqwest::RequestBuilder) -> RestResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|source| RestDaoError::RequestSend {
                path: path.to_string(),
                source,
            })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.json::<ApiErrorBody>().await.ok();
        let (code, message) = match body {
            Some(body) => (body.code, body.message.unwrap_or_default()),
            None => (None, String::new()),
        };
        Err(RestDaoError::RequestStatus {
            path: path.to_string(),
            status,
            code,
            message,
        })
    }

    async fn select_rows(&self, table: String, filters: Vec<Filter>) -> RestResult<Vec<Row>> {
        let builder = self
            .request(Method::GET, &table, &filters)
            .timeout(self.request_timeout);
        let response = self.send(&table, builder).await?;
        response
            .json::<Vec<Row>>()
            .await
            .map_err(|source| RestDaoError::DecodeResponse {
                path: table,
                source,
            })
    }

    async fn open_changes(
        &self,
        table: String,
        filter: Filter,
        kinds: Vec<ChangeKind>,
    ) -> RestResult<ChangeStream> {
        let events = kinds
            .iter()
            .map(|kind| change_kind_name(*kind))
            .collect::<Vec<_>>()
            .join(",");
        let builder = self
            .request(Method::GET, &self.changes_path, std::slice::from_ref(&filter))
            .query(&[("table", table.as_str()), ("events", events.as_str())])
            .header("accept", "text/event-stream");
        let response = self.send(&self.changes_path, builder).await?;
        debug!(%table, column = %filter.column, "change feed opened");

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = async_stream::stream! {
            let mut buffer = FrameBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!(%table, error = %err, "change feed interrupted");
                        break;
                    }
                };
                for frame in buffer.push(&chunk) {
                    if let Some(change) = parse_frame(&table, &frame) {
                        if kinds.contains(&change.kind) {
                            yield change;
                        }
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

/// Raw feed bytes waiting for the blank line that ends a frame.
#[derive(Default)]
struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    /// Append a network chunk and return every frame it completes, decoded whole.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(end) = self.pending.windows(2).position(|pair| pair == b"\n\n") {
            let frame: Vec<u8> = self.pending.drain(..end + 2).collect();
            frames.push(String::from_utf8_lossy(&frame).into_owned());
        }
        frames
    }
}

impl RemoteStore for RestStore {
    fn select(&self, table: &str, filters: Vec<Filter>) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        let store = self.clone();
        let table = table.to_string();
        Box::pin(async move { store.select_rows(table, filters).await.map_err(Into::into) })
    }

    fn insert(&self, table: &str, row: Row) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let table = table.to_string();
        Box::pin(async move {
            let builder = store
                .request(Method::POST, &table, &[])
                .timeout(store.request_timeout)
                .header("prefer", "return=minimal")
                .json(&row);
            store.send(&table, builder).await?;
            Ok(())
        })
    }

    fn update(
        &self,
        table: &str,
        filters: Vec<Filter>,
        patch: Row,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let table = table.to_string();
        Box::pin(async move {
            let builder = store
                .request(Method::PATCH, &table, &filters)
                .timeout(store.request_timeout)
                .header("prefer", "return=minimal")
                .json(&patch);
            store.send(&table, builder).await?;
            Ok(())
        })
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
            store
                .open_changes(table, filter, kinds)
                .await
                .map_err(Into::into)
        })
    }
}

fn filter_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn change_kind_name(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Insert => "INSERT",
        ChangeKind::Update => "UPDATE",
        ChangeKind::Delete => "DELETE",
    }
}

/// Parse one server-sent event frame into a row change, skipping comments and keep-alives.
fn parse_frame(table: &str, frame: &str) -> Option<RowChange> {
    let data = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        return None;
    }

    let payload = match serde_json::from_str::<ChangePayload>(&data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%table, error = %err, "ignoring malformed change notification");
            return None;
        }
    };
    let kind = match payload.kind.to_ascii_uppercase().as_str() {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };

    Some(RowChange {
        table: payload.table.unwrap_or_else(|| table.to_string()),
        kind,
        new: payload.record,
        old: payload.old_record,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_data_frame_into_row_change() {
        let frame = "event: change\ndata: {\"type\":\"INSERT\",\"record\":{\"player_id\":\"p1\"}}\n\n";

        let change = parse_frame("votes", frame).unwrap();

        assert_eq!(change.kind, ChangeKind::Insert);
        assert_eq!(change.table, "votes");
        assert_eq!(change.new.unwrap()["player_id"], json!("p1"));
    }

    #[test]
    fn characters_split_across_chunks_survive() {
        let frame = "data: {\"type\":\"INSERT\",\"record\":{\"option_text\":\"Café\"}}\n\n";
        let bytes = frame.as_bytes();
        let split = frame.find('é').unwrap() + 1;
        let mut buffer = FrameBuffer::default();

        assert!(buffer.push(&bytes[..split]).is_empty());
        let frames = buffer.push(&bytes[split..]);

        assert_eq!(frames.len(), 1);
        let change = parse_frame("votes", &frames[0]).unwrap();
        assert_eq!(change.new.unwrap()["option_text"], json!("Café"));
    }

    #[test]
    fn keep_alive_frames_are_skipped() {
        assert!(parse_frame("votes", ": keep-alive\n\n").is_none());
    }

    #[test]
    fn filter_values_are_unquoted_strings() {
        assert_eq!(filter_value(&json!("act-1")), "act-1");
        assert_eq!(filter_value(&json!(7)), "7");
    }
}
