//! In-memory document store.
//!
//! Reference adapter used by the test suites and the sandbox: one mutex
//! over all collections, per-document version counters, and synchronous
//! watcher dispatch. Watcher callbacks run after the data lock is released,
//! so a callback may call back into the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::store::{
    DocPath, Document, DocumentStore, Query, SnapshotCallback, StoreError, Subscription,
    TxApply, TxSnapshot, TxWrite, WatcherSet, MAX_TX_ATTEMPTS,
};

#[derive(Debug, Clone)]
struct StoredDoc {
    data: Map<String, Value>,
    version: u64,
}

#[derive(Default)]
struct Inner {
    /// collection -> document id -> stored document
    data: Mutex<HashMap<String, HashMap<String, StoredDoc>>>,
    watchers: WatcherSet,
}

/// In-memory [`DocumentStore`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, path: &DocPath) -> Option<Document> {
        let data = self.inner.data.lock().unwrap();
        data.get(&path.collection)
            .and_then(|coll| coll.get(&path.id))
            .map(|stored| Document {
                id: path.id.clone(),
                data: stored.data.clone(),
                version: stored.version,
            })
    }

    fn collection_docs(&self, collection: &str) -> Vec<Document> {
        let data = self.inner.data.lock().unwrap();
        data.get(collection)
            .map(|coll| {
                coll.iter()
                    .map(|(id, stored)| Document {
                        id: id.clone(),
                        data: stored.data.clone(),
                        version: stored.version,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-run every watcher registered on `collection` and deliver the full
    /// current result set. Data and watcher locks are never held while a
    /// callback runs.
    fn notify_collection(&self, collection: &str) {
        for (query, callback) in self.inner.watchers.interested(collection) {
            let results = query.apply(self.collection_docs(&query.collection));
            (callback.lock().unwrap())(results);
        }
    }

    fn apply_write(
        data: &mut HashMap<String, HashMap<String, StoredDoc>>,
        write: &TxWrite,
    ) -> Result<(), StoreError> {
        match write {
            TxWrite::Set { path, data: fields } => {
                let coll = data.entry(path.collection.clone()).or_default();
                let version = coll.get(&path.id).map(|d| d.version).unwrap_or(0) + 1;
                coll.insert(
                    path.id.clone(),
                    StoredDoc {
                        data: fields.clone(),
                        version,
                    },
                );
                Ok(())
            }
            TxWrite::Update { path, fields } => {
                let stored = data
                    .get_mut(&path.collection)
                    .and_then(|coll| coll.get_mut(&path.id))
                    .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                for (k, v) in fields {
                    stored.data.insert(k.clone(), v.clone());
                }
                stored.version += 1;
                Ok(())
            }
            TxWrite::Delete { path } => {
                if let Some(coll) = data.get_mut(&path.collection) {
                    coll.remove(&path.id);
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        Ok(self.lookup(path))
    }

    async fn set(&self, path: &DocPath, data: Map<String, Value>) -> Result<(), StoreError> {
        {
            let mut all = self.inner.data.lock().unwrap();
            Self::apply_write(
                &mut all,
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
            let mut all = self.inner.data.lock().unwrap();
            Self::apply_write(
                &mut all,
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
            let mut all = self.inner.data.lock().unwrap();
            all.get_mut(&path.collection)
                .map(|coll| coll.remove(&path.id).is_some())
                .unwrap_or(false)
        };
        if removed {
            self.notify_collection(&path.collection);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        Ok(query.apply(self.collection_docs(&query.collection)))
    }

    async fn run_transaction(
        &self,
        reads: &[DocPath],
        apply: &mut TxApply<'_>,
    ) -> Result<(), StoreError> {
        for _attempt in 0..MAX_TX_ATTEMPTS {
            // Snapshot the whole read set under one lock acquisition so the
            // closure observes a consistent view.
            let snapshot = {
                let all = self.inner.data.lock().unwrap();
                let mut docs = HashMap::new();
                for path in reads {
                    let doc = all
                        .get(&path.collection)
                        .and_then(|coll| coll.get(&path.id))
                        .map(|stored| Document {
                            id: path.id.clone(),
                            data: stored.data.clone(),
                            version: stored.version,
                        });
                    docs.insert(path.clone(), doc);
                }
                TxSnapshot::new(docs)
            };
            let expected = snapshot.versions();

            let writes = apply(&snapshot)?;

            // Commit iff no read document changed version since the snapshot.
            let committed = {
                let mut all = self.inner.data.lock().unwrap();
                let unchanged = expected.iter().all(|(path, version)| {
                    let current = all
                        .get(&path.collection)
                        .and_then(|coll| coll.get(&path.id))
                        .map(|d| d.version)
                        .unwrap_or(0);
                    current == *version
                });
                if unchanged {
                    // Validate every merge target up front so a failure
                    // cannot leave the batch half-applied.
                    for write in &writes {
                        if let TxWrite::Update { path, .. } = write {
                            let exists = all
                                .get(&path.collection)
                                .map(|coll| coll.contains_key(&path.id))
                                .unwrap_or(false);
                            if !exists {
                                return Err(StoreError::NotFound(path.to_string()));
                            }
                        }
                    }
                    for write in &writes {
                        Self::apply_write(&mut all, write)?;
                    }
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
        let (id, callback) = self.inner.watchers.register(query.clone(), callback);

        // Initial delivery: the full current result set.
        let results = query.apply(self.collection_docs(&query.collection));
        (callback.lock().unwrap())(results);

        let inner = Arc::clone(&self.inner);
        Subscription::new(move || inner.watchers.remove(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{new_doc_id, SortDir};
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        let Value::Object(map) = value else {
            panic!("test payload must be an object")
        };
        map
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        let path = DocPath::new("users", "alice");

        assert!(store.get(&path).await.unwrap().is_none());

        store
            .set(&path, data(json!({"name": "Alice"})))
            .await
            .unwrap();
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.field("name"), Some(&json!("Alice")));
        assert_eq!(doc.version, 1);

        // Overwrite bumps the version.
        store
            .set(&path, data(json!({"name": "Alice B"})))
            .await
            .unwrap();
        assert_eq!(store.get(&path).await.unwrap().unwrap().version, 2);

        store.delete(&path).await.unwrap();
        assert!(store.get(&path).await.unwrap().is_none());
        // Deleting again is a no-op.
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_merges_and_requires_existence() {
        let store = MemoryStore::new();
        let path = DocPath::new("users", "alice");

        let missing = store.update(&path, data(json!({"name": "A"}))).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));

        store
            .set(&path, data(json!({"name": "Alice", "email": "a@x.com"})))
            .await
            .unwrap();
        store
            .update(&path, data(json!({"name": "Alicia"})))
            .await
            .unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.field("name"), Some(&json!("Alicia")));
        // Untouched fields survive the merge.
        assert_eq!(doc.field("email"), Some(&json!("a@x.com")));
    }

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let store = MemoryStore::new();
        for (id, to, created) in [("r1", "bob", 300), ("r2", "bob", 100), ("r3", "carol", 200)] {
            store
                .set(
                    &DocPath::new("connectionRequests", id),
                    data(json!({"toUserId": to, "status": "pending", "createdAt": created})),
                )
                .await
                .unwrap();
        }

        let q = Query::collection("connectionRequests")
            .where_eq("toUserId", "bob")
            .where_eq("status", "pending")
            .order_by("createdAt", SortDir::Asc);
        let docs = store.query(&q).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "r2");
        assert_eq!(docs[1].id, "r1");
    }

    #[tokio::test]
    async fn test_subscription_initial_and_change_delivery() {
        let store = MemoryStore::new();
        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

        let q = Query::collection("connectionRequests").where_eq("toUserId", "bob");
        let sink = Arc::clone(&seen);
        let sub = store.subscribe(
            q,
            Box::new(move |docs| {
                sink.lock()
                    .unwrap()
                    .push(docs.into_iter().map(|d| d.id).collect());
            }),
        );

        // Initial delivery is the (empty) full set.
        assert_eq!(seen.lock().unwrap().as_slice(), &[Vec::<String>::new()]);

        store
            .set(
                &DocPath::new("connectionRequests", "r1"),
                data(json!({"toUserId": "bob"})),
            )
            .await
            .unwrap();
        // A non-matching write in the same collection still re-delivers the set.
        store
            .set(
                &DocPath::new("connectionRequests", "r2"),
                data(json!({"toUserId": "carol"})),
            )
            .await
            .unwrap();

        {
            let log = seen.lock().unwrap();
            assert_eq!(log.len(), 3);
            assert_eq!(log[1], vec!["r1".to_string()]);
            assert_eq!(log[2], vec!["r1".to_string()]);
        }

        sub.unsubscribe();
        store
            .set(
                &DocPath::new("connectionRequests", "r3"),
                data(json!({"toUserId": "bob"})),
            )
            .await
            .unwrap();
        // No delivery after unsubscribe.
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transaction_commits_atomically() {
        let store = MemoryStore::new();
        let req = DocPath::new("connectionRequests", new_doc_id());
        let user = DocPath::new("userData", "bob");
        store
            .set(&req, data(json!({"status": "pending"})))
            .await
            .unwrap();
        store
            .set(&user, data(json!({"connections": []})))
            .await
            .unwrap();

        let reads = vec![req.clone(), user.clone()];
        store
            .run_transaction(&reads, &mut |snap: &TxSnapshot| {
                let mut status = Map::new();
                status.insert("status".into(), json!("accepted"));
                let mut conns = Map::new();
                conns.insert("connections".into(), json!([{"id": "alice"}]));
                assert!(snap.get(&reads[0]).is_some());
                Ok(vec![
                    TxWrite::Update {
                        path: reads[0].clone(),
                        fields: status,
                    },
                    TxWrite::Update {
                        path: reads[1].clone(),
                        fields: conns,
                    },
                ])
            })
            .await
            .unwrap();

        let req_doc = store.get(&req).await.unwrap().unwrap();
        assert_eq!(req_doc.field("status"), Some(&json!("accepted")));
        let user_doc = store.get(&user).await.unwrap().unwrap();
        assert_eq!(
            user_doc.field("connections"),
            Some(&json!([{"id": "alice"}]))
        );
    }

    #[tokio::test]
    async fn test_transaction_retries_on_version_change() {
        let store = MemoryStore::new();
        let path = DocPath::new("userData", "alice");
        store.set(&path, data(json!({"n": 0}))).await.unwrap();

        // First apply run races with an external write; the retry sees the
        // new version and wins.
        let interfere = store.clone();
        let mut first = true;
        let reads = vec![path.clone()];
        store
            .run_transaction(&reads, &mut |snap: &TxSnapshot| {
                if first {
                    first = false;
                    let mut all = interfere.inner.data.lock().unwrap();
                    MemoryStore::apply_write(
                        &mut all,
                        &TxWrite::Set {
                            path: path.clone(),
                            data: data(json!({"n": 100})),
                        },
                    )
                    .unwrap();
                }
                let n = snap
                    .get(&reads[0])
                    .and_then(|d| d.field("n").and_then(|v| v.as_u64()))
                    .unwrap_or(0);
                let mut fields = Map::new();
                fields.insert("n".into(), json!(n + 1));
                Ok(vec![TxWrite::Update {
                    path: reads[0].clone(),
                    fields,
                }])
            })
            .await
            .unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        // 100 (interfering write) + 1 — the first apply result (0 + 1) was discarded.
        assert_eq!(doc.field("n"), Some(&json!(101)));
    }
}
