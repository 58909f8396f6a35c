//! HTTP adapter for a hosted document store.
//!
//! Speaks a small REST surface:
//!
//! ```text
//! GET    /v1/{collection}/{id}          -> {"id", "data", "version"} | 404
//! PUT    /v1/{collection}/{id}          body {"data": {...}}
//! PATCH  /v1/{collection}/{id}          body {"fields": {...}} | 404
//! DELETE /v1/{collection}/{id}
//! POST   /v1/{collection}:query         body = wire query -> {"documents": [...]}
//! POST   /v1:commit                     preconditioned atomic batch | 409
//! WS     /v1:watch                      change feed (any frame = "something changed")
//! ```
//!
//! Round-trips use blocking `ureq` calls moved onto the blocking pool.
//!
//! Subscriptions are a polling loop per watcher (30 s interval, exponential
//! backoff to 5 min on failure — the documented degraded mode) that the
//! store's WebSocket change feed wakes early, so deliveries are
//! near-real-time whenever the feed is up. The feed itself reconnects with
//! its own 2 s..60 s backoff. Snapshot reads inside a transaction are not
//! atomic over HTTP; the version preconditions on `/v1:commit` are what
//! guarantee the committed writes saw an unchanged read set.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::store::{
    DocPath, Document, DocumentStore, FieldOp, Query, SnapshotCallback, SortDir, StoreError,
    Subscription, TxApply, TxSnapshot, TxWrite, MAX_TX_ATTEMPTS,
};
use crate::klog;

/// Polling fallback interval for subscriptions when no push arrives.
pub const POLL_INTERVAL_SECS: u64 = 30;
const MAX_POLL_BACKOFF_SECS: u64 = 300; // 5 minutes
const MAX_FEED_BACKOFF_SECS: u64 = 60;
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Map an HTTP failure onto the store error taxonomy: the store's own
/// access rules surface as `Unauthorized`, everything else as `Transient`.
fn http_error(context: String, e: ureq::Error) -> StoreError {
    match e {
        ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
            StoreError::Unauthorized(context)
        }
        e => StoreError::Transient(format!("{context}: {e}")),
    }
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    id: String,
    data: Map<String, Value>,
    version: u64,
}

impl From<WireDocument> for Document {
    fn from(wire: WireDocument) -> Self {
        Document {
            id: wire.id,
            data: wire.data,
            version: wire.version,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    documents: Vec<WireDocument>,
}

/// REST-backed [`DocumentStore`]. Cheap to clone; clones share the HTTP
/// agent and the change-feed channel.
#[derive(Clone)]
pub struct RestStore {
    base_url: String,
    agent: ureq::Agent,
    changes_tx: broadcast::Sender<()>,
}

impl RestStore {
    /// Build a store client for `base_url` (e.g. `https://store.example.com`).
    /// Call [`spawn_change_feed`](Self::spawn_change_feed) afterwards to get
    /// push-driven subscriptions; without it, watchers poll on the fallback
    /// interval only.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
            changes_tx,
        }
    }

    fn doc_url(&self, path: &DocPath) -> String {
        format!("{}/v1/{}/{}", self.base_url, path.collection, path.id)
    }

    fn query_url(&self, collection: &str) -> String {
        format!("{}/v1/{}:query", self.base_url, collection)
    }

    fn commit_url(&self) -> String {
        format!("{}/v1:commit", self.base_url)
    }

    fn watch_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/v1:watch")
    }

    /// Connect to the store's WebSocket change feed and wake every active
    /// watcher whenever any frame arrives. Reconnects forever with
    /// exponential backoff; abort the returned task to stop. Without this
    /// task subscriptions still work, on the polling interval alone.
    pub fn spawn_change_feed(&self) -> tokio::task::JoinHandle<()> {
        let ws_url = self.watch_url();
        let changes_tx = self.changes_tx.clone();
        tokio::spawn(async move {
            let mut backoff_secs = 2u64;
            loop {
                match tokio_tungstenite::connect_async(ws_url.as_str()).await {
                    Ok((ws_stream, _response)) => {
                        backoff_secs = 2; // reset on successful connect
                        klog!("store feed connected: {}", ws_url);

                        let (_write, mut read) = ws_stream.split();
                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(WsMessage::Text(_)) | Ok(WsMessage::Binary(_)) => {
                                    // Something changed — wake the pollers.
                                    let _ = changes_tx.send(());
                                }
                                Ok(WsMessage::Close(_)) => break,
                                Err(e) => {
                                    klog!("store feed error: {}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }
                        klog!("store feed disconnected, reconnecting in {}s", backoff_secs);
                    }
                    Err(e) => {
                        klog!(
                            "store feed connection failed (retry in {}s): {}",
                            backoff_secs,
                            e
                        );
                    }
                }
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_FEED_BACKOFF_SECS);
            }
        })
    }

    fn op_str(op: FieldOp) -> &'static str {
        match op {
            FieldOp::Eq => "eq",
            FieldOp::Ge => "ge",
            FieldOp::Le => "le",
        }
    }

    fn query_to_wire(query: &Query) -> Value {
        json!({
            "filters": query
                .filters
                .iter()
                .map(|f| json!({"field": f.field, "op": Self::op_str(f.op), "value": f.value}))
                .collect::<Vec<_>>(),
            "orderBy": query.order_by.as_ref().map(|(field, dir)| {
                json!({
                    "field": field,
                    "dir": match dir { SortDir::Asc => "asc", SortDir::Desc => "desc" },
                })
            }),
            "limit": query.limit,
        })
    }

    fn commit_body(snapshot: &TxSnapshot, writes: &[TxWrite]) -> Value {
        let preconditions: Vec<Value> = snapshot
            .versions()
            .into_iter()
            .map(|(path, version)| {
                json!({"collection": path.collection, "id": path.id, "version": version})
            })
            .collect();
        let writes: Vec<Value> = writes
            .iter()
            .map(|w| match w {
                TxWrite::Set { path, data } => json!({
                    "type": "set",
                    "collection": path.collection,
                    "id": path.id,
                    "data": Value::Object(data.clone()),
                }),
                TxWrite::Update { path, fields } => json!({
                    "type": "update",
                    "collection": path.collection,
                    "id": path.id,
                    "fields": Value::Object(fields.clone()),
                }),
                TxWrite::Delete { path } => json!({
                    "type": "delete",
                    "collection": path.collection,
                    "id": path.id,
                }),
            })
            .collect();
        json!({"preconditions": preconditions, "writes": writes})
    }

    async fn blocking<T, F>(op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| StoreError::Transient(format!("blocking task: {e}")))?
    }
}

#[async_trait]
impl DocumentStore for RestStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let url = self.doc_url(path);
        let agent = self.agent.clone();
        let wire = Self::blocking(move || match agent.get(&url).call() {
            Ok(resp) => resp
                .into_json::<WireDocument>()
                .map(Some)
                .map_err(|e| StoreError::Transient(format!("decode {url}: {e}"))),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(http_error(format!("GET {url}"), e)),
        })
        .await?;
        Ok(wire.map(Document::from))
    }

    async fn set(&self, path: &DocPath, data: Map<String, Value>) -> Result<(), StoreError> {
        let url = self.doc_url(path);
        let agent = self.agent.clone();
        let body = json!({"data": Value::Object(data)});
        Self::blocking(move || match agent.put(&url).send_json(body) {
            Ok(_) => Ok(()),
            Err(e) => Err(http_error(format!("PUT {url}"), e)),
        })
        .await
    }

    async fn update(&self, path: &DocPath, fields: Map<String, Value>) -> Result<(), StoreError> {
        let url = self.doc_url(path);
        let display = path.to_string();
        let agent = self.agent.clone();
        let body = json!({"fields": Value::Object(fields)});
        Self::blocking(
            move || match agent.request("PATCH", &url).send_json(body) {
                Ok(_) => Ok(()),
                Err(ureq::Error::Status(404, _)) => Err(StoreError::NotFound(display)),
                Err(e) => Err(http_error(format!("PATCH {url}"), e)),
            },
        )
        .await
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let url = self.doc_url(path);
        let agent = self.agent.clone();
        Self::blocking(move || match agent.delete(&url).call() {
            Ok(_) => Ok(()),
            // Deleting an absent document is a no-op.
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(http_error(format!("DELETE {url}"), e)),
        })
        .await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let url = self.query_url(&query.collection);
        let agent = self.agent.clone();
        let body = Self::query_to_wire(query);
        let response = Self::blocking(move || match agent.post(&url).send_json(body) {
            Ok(resp) => resp
                .into_json::<QueryResponse>()
                .map_err(|e| StoreError::Transient(format!("decode {url}: {e}"))),
            Err(e) => Err(http_error(format!("POST {url}"), e)),
        })
        .await?;
        Ok(response.documents.into_iter().map(Document::from).collect())
    }

    async fn run_transaction(
        &self,
        reads: &[DocPath],
        apply: &mut TxApply<'_>,
    ) -> Result<(), StoreError> {
        for _attempt in 0..MAX_TX_ATTEMPTS {
            let mut docs = std::collections::HashMap::new();
            for path in reads {
                docs.insert(path.clone(), self.get(path).await?);
            }
            let snapshot = TxSnapshot::new(docs);

            let writes = apply(&snapshot)?;
            if writes.is_empty() {
                return Ok(());
            }

            let url = self.commit_url();
            let agent = self.agent.clone();
            let body = Self::commit_body(&snapshot, &writes);
            let committed = Self::blocking(move || match agent.post(&url).send_json(body) {
                Ok(_) => Ok(true),
                // Version precondition failed — somebody else won the race.
                Err(ureq::Error::Status(409, _)) => Ok(false),
                Err(ureq::Error::Status(404, _)) => {
                    Err(StoreError::NotFound("commit target".into()))
                }
                Err(e) => Err(http_error(format!("POST {url}"), e)),
            })
            .await?;

            if committed {
                return Ok(());
            }
        }
        Err(StoreError::Conflict(format!(
            "gave up after {MAX_TX_ATTEMPTS} attempts"
        )))
    }

    fn subscribe(&self, query: Query, callback: SnapshotCallback) -> Subscription {
        let store = self.clone();
        let mut changes = self.changes_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut callback = callback;
            let mut last: Option<Vec<Document>> = None;
            let mut consecutive_failures = 0u32;
            loop {
                match store.query(&query).await {
                    Ok(docs) => {
                        consecutive_failures = 0;
                        // Re-deliver only when the result set actually moved;
                        // the initial snapshot always goes out.
                        if last.as_ref() != Some(&docs) {
                            last = Some(docs.clone());
                            callback(docs);
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        klog!(
                            "store watcher: poll failed for {} (attempt {}): {}",
                            query.collection,
                            consecutive_failures,
                            e
                        );
                    }
                }

                let interval_secs = if consecutive_failures == 0 {
                    POLL_INTERVAL_SECS
                } else {
                    POLL_INTERVAL_SECS
                        .saturating_mul(2u64.saturating_pow(consecutive_failures))
                        .min(MAX_POLL_BACKOFF_SECS)
                };

                // Wake on a push from the change feed OR the polling
                // interval, whichever comes first.
                tokio::select! {
                    _ = changes.recv() => {}
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                }
            }
        });

        Subscription::new(move || {
            handle.abort();
        })
    }
}
