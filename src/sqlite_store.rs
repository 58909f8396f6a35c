//! SQLite-backed document store.
//!
//! Gives the sandbox (and any offline use) durable local state behind the
//! same [`DocumentStore`] contract as the hosted store. Documents live in a
//! single table as JSON text with a per-row version counter; queries load
//! the collection and evaluate filters through the shared [`Query`] logic
//! so semantics cannot drift from the other adapters.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::store::{
    now_millis, DocPath, Document, DocumentStore, Query, SnapshotCallback, StoreError,
    Subscription, TxApply, TxSnapshot, TxWrite, WatcherSet, MAX_TX_ATTEMPTS,
};

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Transient(format!("sqlite: {e}"))
    }
}

/// SQLite [`DocumentStore`]. The connection sits behind a mutex; every
/// operation is a short critical section.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    watchers: Arc<WatcherSet>,
}

impl SqliteStore {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
            watchers: Arc::new(WatcherSet::default()),
        };
        store.create_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (used by tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            watchers: Arc::new(WatcherSet::default()),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                collection  TEXT NOT NULL,
                id          TEXT NOT NULL,
                data        TEXT NOT NULL,
                version     INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE INDEX IF NOT EXISTS idx_documents_collection
                ON documents(collection);
            ",
        )?;
        Ok(())
    }

    fn parse_data(raw: &str) -> Result<Map<String, Value>, StoreError> {
        serde_json::from_str(raw).map_err(StoreError::from)
    }

    fn get_locked(conn: &Connection, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT data, version FROM documents WHERE collection = ?1 AND id = ?2",
        )?;
        let row = stmt
            .query_row(params![path.collection, path.id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        match row {
            Some((raw, version)) => Ok(Some(Document {
                id: path.id.clone(),
                data: Self::parse_data(&raw)?,
                version: version as u64,
            })),
            None => Ok(None),
        }
    }

    fn version_locked(conn: &Connection, path: &DocPath) -> Result<u64, StoreError> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM documents WHERE collection = ?1 AND id = ?2",
                params![path.collection, path.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0) as u64)
    }

    fn apply_write_locked(conn: &Connection, write: &TxWrite) -> Result<(), StoreError> {
        match write {
            TxWrite::Set { path, data } => {
                let raw = serde_json::to_string(&Value::Object(data.clone()))?;
                conn.execute(
                    "INSERT INTO documents (collection, id, data, version, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4)
                     ON CONFLICT(collection, id) DO UPDATE SET
                         data = excluded.data,
                         version = documents.version + 1,
                         updated_at = excluded.updated_at",
                    params![path.collection, path.id, raw, now_millis() as i64],
                )?;
                Ok(())
            }
            TxWrite::Update { path, fields } => {
                let existing = Self::get_locked(conn, path)?
                    .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                let mut data = existing.data;
                for (k, v) in fields {
                    data.insert(k.clone(), v.clone());
                }
                let raw = serde_json::to_string(&Value::Object(data))?;
                conn.execute(
                    "UPDATE documents
                     SET data = ?3, version = version + 1, updated_at = ?4
                     WHERE collection = ?1 AND id = ?2",
                    params![path.collection, path.id, raw, now_millis() as i64],
                )?;
                Ok(())
            }
            TxWrite::Delete { path } => {
                conn.execute(
                    "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                    params![path.collection, path.id],
                )?;
                Ok(())
            }
        }
    }

    fn collection_docs(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, data, version FROM documents WHERE collection = ?1")?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut docs = Vec::new();
        for row in rows {
            let (id, raw, version) = row?;
            docs.push(Document {
                id,
                data: Self::parse_data(&raw)?,
                version: version as u64,
            });
        }
        Ok(docs)
    }

    /// Deliver the full current result set to every watcher on `collection`.
    /// The connection lock is released before any callback runs.
    fn notify_collection(&self, collection: &str) {
        for (query, callback) in self.watchers.interested(collection) {
            let results = match self.collection_docs(&query.collection) {
                Ok(docs) => query.apply(docs),
                Err(e) => {
                    crate::klog!("sqlite watcher: query failed: {}", e);
                    continue;
                }
            };
            (callback.lock().unwrap())(results);
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::get_locked(&conn, path)
    }

    async fn set(&self, path: &DocPath, data: Map<String, Value>) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().unwrap();
            Self::apply_write_locked(
                &conn,
                &TxWrite::Set {
                    path: path.clone(),
                    data,
                },
            )?;
        }
        self.notify_collection(&path.collection);
        Ok(())
    }

    async fn update(&self, path: &DocPath, fields: Map<String, Value>) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().unwrap();
            Self::apply_write_locked(
                &conn,
                &TxWrite::Update {
                    path: path.clone(),
                    fields,
                },
            )?;
        }
        self.notify_collection(&path.collection);
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let removed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![path.collection, path.id],
            )? > 0
        };
        if removed {
            self.notify_collection(&path.collection);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        Ok(query.apply(self.collection_docs(&query.collection)?))
    }

    async fn run_transaction(
        &self,
        reads: &[DocPath],
        apply: &mut TxApply<'_>,
    ) -> Result<(), StoreError> {
        for _attempt in 0..MAX_TX_ATTEMPTS {
            let snapshot = {
                let conn = self.conn.lock().unwrap();
                let mut docs = HashMap::new();
                for path in reads {
                    docs.insert(path.clone(), Self::get_locked(&conn, path)?);
                }
                TxSnapshot::new(docs)
            };
            let expected = snapshot.versions();

            let writes = apply(&snapshot)?;

            let committed = {
                let conn = self.conn.lock().unwrap();
                let tx = conn.unchecked_transaction()?;
                let mut unchanged = true;
                for (path, version) in &expected {
                    if Self::version_locked(&tx, path)? != *version {
                        unchanged = false;
                        break;
                    }
                }
                if unchanged {
                    for write in &writes {
                        if let TxWrite::Update { path, .. } = write {
                            if Self::version_locked(&tx, path)? == 0 {
                                return Err(StoreError::NotFound(path.to_string()));
                            }
                        }
                    }
                    for write in &writes {
                        Self::apply_write_locked(&tx, write)?;
                    }
                    tx.commit()?;
                    true
                } else {
                    false
                }
            };

            if committed {
                let mut collections: Vec<String> = writes
                    .iter()
                    .map(|w| match w {
                        TxWrite::Set { path, .. }
                        | TxWrite::Update { path, .. }
                        | TxWrite::Delete { path } => path.collection.clone(),
                    })
                    .collect();
                collections.sort();
                collections.dedup();
                for collection in collections {
                    self.notify_collection(&collection);
                }
                return Ok(());
            }
        }
        Err(StoreError::Conflict(format!(
            "gave up after {MAX_TX_ATTEMPTS} attempts"
        )))
    }

    fn subscribe(&self, query: Query, callback: SnapshotCallback) -> Subscription {
        let (id, callback) = self.watchers.register(query.clone(), callback);

        let initial = self
            .collection_docs(&query.collection)
            .map(|docs| query.apply(docs))
            .unwrap_or_default();
        (callback.lock().unwrap())(initial);

        let watchers = Arc::clone(&self.watchers);
        Subscription::new(move || watchers.remove(id))
    }
}
