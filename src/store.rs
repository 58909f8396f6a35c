//! Document-store abstraction.
//!
//! The platform's state lives in a hosted document database; this module
//! defines the adapter contract the rest of the crate is written against,
//! plus the document/query model shared by every adapter.  Three adapters
//! implement it: [`MemoryStore`](crate::memory_store::MemoryStore),
//! [`SqliteStore`](crate::sqlite_store::SqliteStore), and
//! [`RestStore`](crate::rest_store::RestStore).
//!
//! Access control note: nothing in this crate denies reads to an
//! unauthorized party.  The store's own security rules are the enforcement
//! point; this library issues requests assuming that check exists outside it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    /// The referenced document does not exist.
    NotFound(String),
    /// A uniqueness rule was violated (duplicate grant, duplicate pending request).
    AlreadyExists(String),
    /// An optimistic transaction kept colliding and gave up.
    Conflict(String),
    /// The store's own access rules refused the operation. Authorization
    /// is never checked in-process; this only surfaces what the store said.
    Unauthorized(String),
    /// Network or availability failure from the backing store.
    Transient(String),
    /// A document could not be encoded or decoded.
    Serde(serde_json::Error),
    /// Malformed input (e.g. a non-object document payload).
    Invalid(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
            StoreError::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            StoreError::Conflict(msg) => write!(f, "transaction conflict: {msg}"),
            StoreError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            StoreError::Transient(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
            StoreError::Invalid(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Documents and paths
// ---------------------------------------------------------------------------

/// Address of a single document: `{collection}/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as returned by an adapter: its ID, its JSON object payload,
/// and the adapter's monotonic version counter (used for optimistic
/// transaction preconditions; starts at 1 on create).
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
    pub version: u64,
}

impl Document {
    /// Deserialize the payload into a typed value. The document ID is not
    /// part of the payload; callers read it from `self.id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(StoreError::from)
    }

    /// Look up a top-level field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Serialize a value into a document payload. Fails unless the value
/// serializes to a JSON object.
pub fn to_document_data<T: Serialize>(value: &T) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Invalid(format!(
            "document payload must be a JSON object, got {other}"
        ))),
    }
}

/// Generate a fresh document ID: 20 URL-safe base64 characters from
/// 15 random bytes, the same shape the hosted store produces.
pub fn new_doc_id() -> String {
    let mut bytes = [0u8; 15];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
/// All persisted timestamps in this crate use this representation.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Comparison operator for a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Eq,
    Ge,
    Le,
}

/// A single field predicate. The pseudo-field `"id"` matches the document ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FieldOp,
    pub value: Value,
}

/// Sort direction for [`Query::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// A filtered, optionally ordered and limited collection read.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, SortDir)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FieldOp::Eq,
            value: value.into(),
        });
        self
    }

    pub fn where_ge(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FieldOp::Ge,
            value: value.into(),
        });
        self
    }

    pub fn where_le(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FieldOp::Le,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, dir: SortDir) -> Self {
        self.order_by = Some((field.into(), dir));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Whether a document satisfies every filter.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| {
            let actual: Value;
            let field_value = if f.field == "id" {
                actual = Value::String(doc.id.clone());
                Some(&actual)
            } else {
                doc.field(&f.field)
            };
            let Some(v) = field_value else {
                return false;
            };
            match f.op {
                FieldOp::Eq => v == &f.value,
                FieldOp::Ge => {
                    matches!(compare_values(v, &f.value), Some(Ordering::Greater | Ordering::Equal))
                }
                FieldOp::Le => {
                    matches!(compare_values(v, &f.value), Some(Ordering::Less | Ordering::Equal))
                }
            }
        })
    }

    /// Filter, sort, and truncate a candidate set. Shared by all adapters so
    /// query semantics cannot drift between them.
    pub fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut out: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
        if let Some((field, dir)) = &self.order_by {
            out.sort_by(|a, b| {
                let av = a.field(field);
                let bv = b.field(field);
                let ord = match (av, bv) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                }
            });
        }
        if let Some(n) = self.limit {
            out.truncate(n);
        }
        out
    }
}

/// Order two JSON scalars. Mixed or non-scalar types are incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// How many times an adapter re-runs an optimistic transaction before
/// surfacing [`StoreError::Conflict`]. Services never retry on top of this.
pub const MAX_TX_ATTEMPTS: usize = 5;

/// Consistent snapshot of the documents named in a transaction's read set.
#[derive(Debug, Default)]
pub struct TxSnapshot {
    docs: HashMap<DocPath, Option<Document>>,
}

impl TxSnapshot {
    pub fn new(docs: HashMap<DocPath, Option<Document>>) -> Self {
        Self { docs }
    }

    /// The snapshot's view of a document. `None` means the document did not
    /// exist when the snapshot was taken; a path outside the declared read
    /// set also yields `None`.
    pub fn get(&self, path: &DocPath) -> Option<&Document> {
        self.docs.get(path).and_then(|d| d.as_ref())
    }

    /// Decode the snapshot's view of a document into a typed value.
    pub fn decode<T: DeserializeOwned>(&self, path: &DocPath) -> Result<Option<T>, StoreError> {
        match self.get(path) {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    /// Version preconditions for the commit: 0 for absent documents.
    pub fn versions(&self) -> HashMap<DocPath, u64> {
        self.docs
            .iter()
            .map(|(p, d)| (p.clone(), d.as_ref().map(|d| d.version).unwrap_or(0)))
            .collect()
    }
}

/// A write produced by a transaction's apply closure.
#[derive(Debug, Clone)]
pub enum TxWrite {
    /// Create or overwrite the whole document.
    Set {
        path: DocPath,
        data: Map<String, Value>,
    },
    /// Shallow-merge fields into an existing document.
    Update {
        path: DocPath,
        fields: Map<String, Value>,
    },
    /// Remove the document.
    Delete { path: DocPath },
}

/// Closure type for [`DocumentStore::run_transaction`]: reads the snapshot,
/// returns the writes to commit. Must be side-effect free — adapters may run
/// it several times before a commit succeeds.
pub type TxApply<'a> = dyn FnMut(&TxSnapshot) -> Result<Vec<TxWrite>, StoreError> + Send + 'a;

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Callback invoked with the **full current result set** of a subscribed
/// query — once immediately after subscribing, and again after every change
/// that may affect the query. Consumers treat each invocation as the
/// authoritative current set, never as a delta.
pub type SnapshotCallback = Box<dyn FnMut(Vec<Document>) + Send + 'static>;

/// Handle for a live query registered with [`DocumentStore::subscribe`].
///
/// Call [`unsubscribe`](Subscription::unsubscribe) on teardown so the
/// listener stops firing; dropping the handle detaches it as well.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Detach the listener. Idempotent.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Watcher registry shared by the local adapters.
///
/// Callbacks are parked behind their own mutexes so an adapter can collect
/// the interested set, release its data lock, and only then deliver.
#[derive(Default)]
pub(crate) struct WatcherSet {
    watchers: std::sync::Mutex<Vec<WatcherEntry>>,
    next_id: std::sync::atomic::AtomicU64,
}

struct WatcherEntry {
    id: u64,
    query: Query,
    callback: std::sync::Arc<std::sync::Mutex<SnapshotCallback>>,
}

impl WatcherSet {
    pub(crate) fn register(
        &self,
        query: Query,
        callback: SnapshotCallback,
    ) -> (u64, std::sync::Arc<std::sync::Mutex<SnapshotCallback>>) {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let callback = std::sync::Arc::new(std::sync::Mutex::new(callback));
        self.watchers.lock().unwrap().push(WatcherEntry {
            id,
            query,
            callback: std::sync::Arc::clone(&callback),
        });
        (id, callback)
    }

    pub(crate) fn remove(&self, id: u64) {
        self.watchers.lock().unwrap().retain(|w| w.id != id);
    }

    /// Every watcher whose query targets `collection`.
    pub(crate) fn interested(
        &self,
        collection: &str,
    ) -> Vec<(Query, std::sync::Arc<std::sync::Mutex<SnapshotCallback>>)> {
        self.watchers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.query.collection == collection)
            .map(|w| (w.query.clone(), std::sync::Arc::clone(&w.callback)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

/// How services hold their store: shared, object-safe, adapter-agnostic.
pub type SharedStore = std::sync::Arc<dyn DocumentStore>;

/// Contract required from the backing document store (or an adapter in
/// front of it). All methods are suspension points: each call is a network
/// round-trip against the remote store, and transient failures propagate to
/// the caller uncaught — there is no internal retry beyond the bounded
/// optimistic-transaction loop.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document, or `None` if it does not exist.
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError>;

    /// Create or overwrite a document.
    async fn set(&self, path: &DocPath, data: Map<String, Value>) -> Result<(), StoreError>;

    /// Shallow-merge fields into an existing document.
    /// Fails with [`StoreError::NotFound`] if the document is absent.
    async fn update(&self, path: &DocPath, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Remove a document. Deleting an absent document is a no-op.
    async fn delete(&self, path: &DocPath) -> Result<(), StoreError>;

    /// Run a filtered collection read.
    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Optimistic snapshot transaction: read every path in `reads` as a
    /// consistent versioned snapshot, pass it to `apply`, and commit the
    /// returned writes atomically iff none of the read documents changed
    /// version in the meantime. On collision the adapter re-reads and
    /// re-applies up to [`MAX_TX_ATTEMPTS`] times, then surfaces
    /// [`StoreError::Conflict`].
    async fn run_transaction(
        &self,
        reads: &[DocPath],
        apply: &mut TxApply<'_>,
    ) -> Result<(), StoreError>;

    /// Register a live query. See [`SnapshotCallback`] for the delivery
    /// contract. The watcher keeps firing until the returned handle is
    /// unsubscribed or dropped.
    fn subscribe(&self, query: Query, callback: SnapshotCallback) -> Subscription;
}
