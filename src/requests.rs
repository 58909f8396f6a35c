//! Connection requests: the pending → accepted/rejected state machine.
//!
//! A request is a directed document between two identities, carrying a
//! denormalized snapshot of both parties' display fields taken at send
//! time (it is not refreshed if a party later renames themselves). The
//! sender creates it; only the recipient transitions it; the sender may
//! cancel it while still pending. `accepted` and `rejected` are terminal.
//!
//! Accepting is the one two-document write in the protocol: in a single
//! atomic transaction the request flips to `accepted` and the *accepting*
//! user's own edge list gains the other party. The other side's edge is
//! deliberately not written here — the sender discovers the acceptance
//! through [`subscribe_accepted_sent`](ConnectionRequestService::subscribe_accepted_sent)
//! and appends its own edge via [`crate::reconcile`]. That reconciliation
//! is eventually consistent and at-least-once by design; the idempotency
//! check in the accept path is what makes replays safe.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::{
    new_doc_id, now_millis, to_document_data, DocPath, Document, Query, SharedStore, SortDir,
    StoreError, Subscription, TxWrite,
};
use crate::user_data::{user_data_path, Connection, TrustLevel, UserData};
use crate::identity::Identity;
use crate::{klog, logging};

/// Collection holding one document per request.
pub const REQUESTS_COLLECTION: &str = "connectionRequests";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RequestError {
    Store(StoreError),
    /// The request document does not exist (never did, or was cancelled).
    NotFound(String),
    /// The request is in a terminal state that forbids this operation.
    NotActionable { id: String, status: RequestStatus },
    /// Only the sender may cancel a request.
    NotSender(String),
    /// A pending request already exists between the two users (advisory
    /// pre-send check; see [`crate::client::Client::send_connection_request`]).
    AlreadyPending { from: String, to: String },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Store(e) => write!(f, "store error: {e}"),
            RequestError::NotFound(id) => write!(f, "connection request not found: {id}"),
            RequestError::NotActionable { id, status } => {
                write!(f, "connection request {id} is already {status}")
            }
            RequestError::NotSender(id) => {
                write!(f, "only the sender can cancel request {id}")
            }
            RequestError::AlreadyPending { from, to } => {
                write!(f, "a pending request already exists between {from} and {to}")
            }
        }
    }
}

impl std::error::Error for RequestError {}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        RequestError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Accepted => write!(f, "accepted"),
            RequestStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// A connection request. The ID is the document key, not part of the
/// stored payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    #[serde(skip)]
    pub id: String,
    pub from_user_id: String,
    pub from_user_name: String,
    pub from_user_email: String,
    pub from_user_picture: String,
    pub to_user_id: String,
    pub to_user_name: String,
    pub to_user_email: String,
    pub to_user_picture: String,
    pub status: RequestStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ConnectionRequest {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut request: ConnectionRequest = doc.decode()?;
        request.id = doc.id.clone();
        Ok(request)
    }

    /// The party that is not `user_id`, as (id, name, email, picture).
    pub fn other_party(&self, user_id: &str) -> (String, String, String, String) {
        if self.to_user_id == user_id {
            (
                self.from_user_id.clone(),
                self.from_user_name.clone(),
                self.from_user_email.clone(),
                self.from_user_picture.clone(),
            )
        } else {
            (
                self.to_user_id.clone(),
                self.to_user_name.clone(),
                self.to_user_email.clone(),
                self.to_user_picture.clone(),
            )
        }
    }
}

fn request_path(request_id: &str) -> DocPath {
    DocPath::new(REQUESTS_COLLECTION, request_id)
}

fn decode_all(docs: Vec<Document>) -> Result<Vec<ConnectionRequest>, StoreError> {
    docs.iter().map(ConnectionRequest::from_document).collect()
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Operations on the `connectionRequests` collection.
///
/// Failure semantics: every operation is fallible and nothing retries
/// internally — a transient store failure surfaces to the caller for a
/// manual re-attempt, which is safe because the mutating operations are
/// idempotent.
#[derive(Clone)]
pub struct ConnectionRequestService {
    store: SharedStore,
}

impl ConnectionRequestService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Create a new pending request from `from` to `to`, snapshotting both
    /// identities' display fields. Does not touch either party's edge list,
    /// and does **not** enforce uniqueness — two concurrent sends in
    /// opposite directions can both land. Callers wanting the advisory
    /// guard use [`check_existing_request`](Self::check_existing_request)
    /// first (the client facade does).
    pub async fn send_request(
        &self,
        from: &Identity,
        to: &Identity,
    ) -> Result<String, RequestError> {
        let id = new_doc_id();
        let now = now_millis();
        let request = ConnectionRequest {
            id: id.clone(),
            from_user_id: from.user_id.clone(),
            from_user_name: from.name.clone(),
            from_user_email: from.email.clone(),
            from_user_picture: from.picture_url.clone(),
            to_user_id: to.user_id.clone(),
            to_user_name: to.name.clone(),
            to_user_email: to.email.clone(),
            to_user_picture: to.picture_url.clone(),
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.store
            .set(&request_path(&id), to_document_data(&request)?)
            .await?;
        klog!(
            "requests: {} sent {} -> {}",
            logging::req_id(&id),
            logging::user_id(&from.user_id),
            logging::user_id(&to.user_id)
        );
        Ok(id)
    }

    /// Fetch a single request by ID.
    pub async fn get_request(&self, request_id: &str) -> Result<ConnectionRequest, RequestError> {
        let doc = self
            .store
            .get(&request_path(request_id))
            .await?
            .ok_or_else(|| RequestError::NotFound(request_id.to_string()))?;
        Ok(ConnectionRequest::from_document(&doc)?)
    }

    fn pending_received_query(user_id: &str) -> Query {
        // Ordered by createdAt ascending: the pending queue is FIFO.
        Query::collection(REQUESTS_COLLECTION)
            .where_eq("toUserId", user_id)
            .where_eq("status", "pending")
            .order_by("createdAt", SortDir::Asc)
    }

    /// All pending requests addressed to `user_id`, oldest first.
    pub async fn list_pending_received(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionRequest>, RequestError> {
        let docs = self.store.query(&Self::pending_received_query(user_id)).await?;
        Ok(decode_all(docs)?)
    }

    /// All pending requests sent by `user_id`, oldest first.
    pub async fn list_pending_sent(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionRequest>, RequestError> {
        let query = Query::collection(REQUESTS_COLLECTION)
            .where_eq("fromUserId", user_id)
            .where_eq("status", "pending")
            .order_by("createdAt", SortDir::Asc);
        Ok(decode_all(self.store.query(&query).await?)?)
    }

    /// Live FIFO view of the pending queue. Each callback invocation
    /// carries the full current set, never a delta.
    pub fn subscribe_pending_received(
        &self,
        user_id: &str,
        mut callback: impl FnMut(Vec<ConnectionRequest>) + Send + 'static,
    ) -> Subscription {
        self.store.subscribe(
            Self::pending_received_query(user_id),
            Box::new(move |docs| match decode_all(docs) {
                Ok(requests) => callback(requests),
                Err(e) => klog!("requests: undecodable pending snapshot: {}", e),
            }),
        )
    }

    /// All requests sent by `user_id` that the recipient has accepted.
    /// The reconcile loop replays this set on every pass.
    pub async fn list_accepted_sent(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConnectionRequest>, RequestError> {
        let query = Query::collection(REQUESTS_COLLECTION)
            .where_eq("fromUserId", user_id)
            .where_eq("status", "accepted")
            .order_by("createdAt", SortDir::Asc);
        Ok(decode_all(self.store.query(&query).await?)?)
    }

    /// Live view of requests sent by `user_id` that have been accepted —
    /// the signal the sender-side reconciliation listens for. Delivered
    /// at-least-once per transition; consumers must be idempotent.
    pub fn subscribe_accepted_sent(
        &self,
        user_id: &str,
        mut callback: impl FnMut(Vec<ConnectionRequest>) + Send + 'static,
    ) -> Subscription {
        let query = Query::collection(REQUESTS_COLLECTION)
            .where_eq("fromUserId", user_id)
            .where_eq("status", "accepted")
            .order_by("createdAt", SortDir::Asc);
        self.store.subscribe(
            query,
            Box::new(move |docs| match decode_all(docs) {
                Ok(requests) => callback(requests),
                Err(e) => klog!("requests: undecodable accepted snapshot: {}", e),
            }),
        )
    }

    /// Accept a request as `accepting_user_id`.
    ///
    /// One atomic transaction over the request document and the accepting
    /// user's own document: the status flips to `accepted` and an edge to
    /// the other party (at trust level `known`) is appended to the
    /// accepting user's connection list. If the edge already exists this is
    /// an idempotent success (the status is still forced to `accepted`),
    /// so re-invoking after a failure — or a duplicate subscription firing —
    /// is safe. A rejected request is no longer actionable.
    ///
    /// The *other* party's edge list is never written here; see the module
    /// docs for the reconciliation contract.
    pub async fn accept_request(
        &self,
        request_id: &str,
        accepting_user_id: &str,
    ) -> Result<(), RequestError> {
        let req_path = request_path(request_id);
        let user_path = user_data_path(accepting_user_id);
        let reads = [req_path.clone(), user_path.clone()];
        let mut domain_err: Option<RequestError> = None;

        let result = self
            .store
            .run_transaction(&reads, &mut |snap| {
                let Some(req_doc) = snap.get(&req_path) else {
                    domain_err = Some(RequestError::NotFound(request_id.to_string()));
                    return Err(StoreError::NotFound(request_id.to_string()));
                };
                let request = ConnectionRequest::from_document(req_doc)?;
                if request.status == RequestStatus::Rejected {
                    domain_err = Some(RequestError::NotActionable {
                        id: request_id.to_string(),
                        status: request.status,
                    });
                    return Err(StoreError::Invalid("rejected request".into()));
                }

                let (other_id, other_name, other_email, other_picture) =
                    request.other_party(accepting_user_id);
                let mut user_data = snap
                    .decode::<UserData>(&user_path)?
                    .unwrap_or_default();
                let now = now_millis();

                let mut writes = Vec::new();
                if request.status != RequestStatus::Accepted {
                    let mut fields = serde_json::Map::new();
                    fields.insert("status".into(), serde_json::json!("accepted"));
                    fields.insert("updatedAt".into(), serde_json::json!(now));
                    writes.push(TxWrite::Update {
                        path: req_path.clone(),
                        fields,
                    });
                }

                if !user_data.has_connection(&other_id) {
                    user_data.connections.push(Connection {
                        id: other_id,
                        name: other_name,
                        email: other_email,
                        picture: other_picture,
                        trust_level: TrustLevel::Known,
                        connected_at: now,
                        notes: None,
                    });
                    writes.push(TxWrite::Set {
                        path: user_path.clone(),
                        data: to_document_data(&user_data)?,
                    });
                }
                Ok(writes)
            })
            .await;

        if let Some(e) = domain_err {
            return Err(e);
        }
        result?;
        klog!(
            "requests: {} accepted by {}",
            logging::req_id(request_id),
            logging::user_id(accepting_user_id)
        );
        Ok(())
    }

    /// Reject a request. Terminal and idempotent; no edge is created on
    /// either side. Rejecting an already-accepted request is refused.
    pub async fn reject_request(&self, request_id: &str) -> Result<(), RequestError> {
        let req_path = request_path(request_id);
        let mut domain_err: Option<RequestError> = None;

        let result = self
            .store
            .run_transaction(&[req_path.clone()], &mut |snap| {
                let Some(req_doc) = snap.get(&req_path) else {
                    domain_err = Some(RequestError::NotFound(request_id.to_string()));
                    return Err(StoreError::NotFound(request_id.to_string()));
                };
                let request = ConnectionRequest::from_document(req_doc)?;
                match request.status {
                    RequestStatus::Rejected => Ok(Vec::new()),
                    RequestStatus::Accepted => {
                        domain_err = Some(RequestError::NotActionable {
                            id: request_id.to_string(),
                            status: request.status,
                        });
                        Err(StoreError::Invalid("accepted request".into()))
                    }
                    RequestStatus::Pending => {
                        let mut fields = serde_json::Map::new();
                        fields.insert("status".into(), serde_json::json!("rejected"));
                        fields.insert("updatedAt".into(), serde_json::json!(now_millis()));
                        Ok(vec![TxWrite::Update {
                            path: req_path.clone(),
                            fields,
                        }])
                    }
                }
            })
            .await;

        if let Some(e) = domain_err {
            return Err(e);
        }
        result?;
        klog!("requests: {} rejected", logging::req_id(request_id));
        Ok(())
    }

    /// Cancel a still-pending request. Sender-only; hard-deletes the
    /// document.
    pub async fn cancel_request(
        &self,
        request_id: &str,
        caller_user_id: &str,
    ) -> Result<(), RequestError> {
        let req_path = request_path(request_id);
        let mut domain_err: Option<RequestError> = None;

        let result = self
            .store
            .run_transaction(&[req_path.clone()], &mut |snap| {
                let Some(req_doc) = snap.get(&req_path) else {
                    domain_err = Some(RequestError::NotFound(request_id.to_string()));
                    return Err(StoreError::NotFound(request_id.to_string()));
                };
                let request = ConnectionRequest::from_document(req_doc)?;
                if request.from_user_id != caller_user_id {
                    domain_err = Some(RequestError::NotSender(request_id.to_string()));
                    return Err(StoreError::Invalid("not the sender".into()));
                }
                if request.status != RequestStatus::Pending {
                    domain_err = Some(RequestError::NotActionable {
                        id: request_id.to_string(),
                        status: request.status,
                    });
                    return Err(StoreError::Invalid("not pending".into()));
                }
                Ok(vec![TxWrite::Delete {
                    path: req_path.clone(),
                }])
            })
            .await;

        if let Some(e) = domain_err {
            return Err(e);
        }
        result?;
        klog!(
            "requests: {} cancelled by sender {}",
            logging::req_id(request_id),
            logging::user_id(caller_user_id)
        );
        Ok(())
    }

    /// Whether a pending request exists between the two users, in either
    /// direction. Advisory only: nothing stops a racing send between the
    /// check and the write.
    pub async fn check_existing_request(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<bool, RequestError> {
        let forward = Query::collection(REQUESTS_COLLECTION)
            .where_eq("fromUserId", user_a)
            .where_eq("toUserId", user_b)
            .where_eq("status", "pending")
            .limit(1);
        if !self.store.query(&forward).await?.is_empty() {
            return Ok(true);
        }
        let reverse = Query::collection(REQUESTS_COLLECTION)
            .where_eq("fromUserId", user_b)
            .where_eq("toUserId", user_a)
            .where_eq("status", "pending")
            .limit(1);
        Ok(!self.store.query(&reverse).await?.is_empty())
    }
}
