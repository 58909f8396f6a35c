//! The per-user document and its owner-side operations.
//!
//! Everything a user owns lives embedded in a single document at
//! `userData/{userId}`: their connection edges, their vaults (with grant
//! lists), and their calendar events and needs. Because each list is an
//! embedded array rather than a joined table, every mutation here is an
//! atomic read-modify-write transaction scoped to that one document —
//! concurrent operations on the same user must not blindly overwrite each
//! other's array rewrites.
//!
//! The connection graph is therefore not symmetric by construction: this
//! module only ever touches the *owner's* side. Edges are created by the
//! request protocol ([`crate::requests`]) and the reconciliation step
//! ([`crate::reconcile`]); deleting a connection here is one-sided and is
//! never propagated to the peer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::{
    to_document_data, DocPath, Query, SharedStore, StoreError, Subscription, TxWrite,
};

/// Collection holding one document per user.
pub const USER_DATA_COLLECTION: &str = "userData";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum UserDataError {
    Store(StoreError),
    ConnectionNotFound(String),
    EventNotFound(String),
    NeedNotFound(String),
}

impl fmt::Display for UserDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserDataError::Store(e) => write!(f, "store error: {e}"),
            UserDataError::ConnectionNotFound(id) => write!(f, "connection not found: {id}"),
            UserDataError::EventNotFound(id) => write!(f, "calendar event not found: {id}"),
            UserDataError::NeedNotFound(id) => write!(f, "need not found: {id}"),
        }
    }
}

impl std::error::Error for UserDataError {}

impl From<StoreError> for UserDataError {
    fn from(e: StoreError) -> Self {
        UserDataError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Trust tier a user assigns to one of their own connections. Purely a
/// local attribute — never negotiated with the other party. The ordering is
/// total: `Known < Trusted < Close < Core`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Known,
    Trusted,
    Close,
    Core,
}

/// An adjacency edge in the owner's connection list. `id` is the *other*
/// user's ID; display fields are a snapshot taken when the edge was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub email: String,
    pub picture: String,
    pub trust_level: TrustLevel,
    pub connected_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One access grant on a vault, naming a connection as a permitted viewer.
///
/// `expires_at` is advisory metadata: nothing ever purges expired grants,
/// and the grant state only flips on revoke. Consumers check expiry at
/// read time via [`VaultAccess::is_expired`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultAccess {
    pub connection_id: String,
    pub granted_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub can_revoke: bool,
}

impl VaultAccess {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// A named data vault. Ownership is implicit in the storage location
/// (`userData/{ownerId}`), not a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: u64,
    #[serde(default)]
    pub shared_with: Vec<VaultAccess>,
}

/// A calendar entry shared with selected connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub date: u64,
    #[serde(default)]
    pub shared_with: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_based: Option<bool>,
}

/// A broadcast "need" visible to connections at or above a trust tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Need {
    pub id: String,
    pub category: String,
    pub description: String,
    pub posted_by: String,
    pub posted_at: u64,
    pub trust_level_required: TrustLevel,
}

/// The whole per-user document. Absent fields decode as empty lists so a
/// freshly created (or legacy partial) document is always readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub vaults: Vec<Vault>,
    #[serde(default)]
    pub calendar_events: Vec<CalendarEvent>,
    #[serde(default)]
    pub needs: Vec<Need>,
}

impl UserData {
    pub fn has_connection(&self, other_id: &str) -> bool {
        self.connections.iter().any(|c| c.id == other_id)
    }

    pub fn connection(&self, other_id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == other_id)
    }

    pub fn vault(&self, vault_id: &str) -> Option<&Vault> {
        self.vaults.iter().find(|v| v.id == vault_id)
    }
}

/// Path of a user's document.
pub fn user_data_path(user_id: &str) -> DocPath {
    DocPath::new(USER_DATA_COLLECTION, user_id)
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Owner-scoped operations on the per-user document.
#[derive(Clone)]
pub struct UserDataService {
    store: SharedStore,
}

impl UserDataService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Create an empty document for the user if none exists yet. Called once
    /// after login; racing callers converge on a single empty document.
    pub async fn ensure_user_data(&self, user_id: &str) -> Result<(), UserDataError> {
        let path = user_data_path(user_id);
        self.store
            .run_transaction(&[path.clone()], &mut |snap| {
                if snap.get(&path).is_some() {
                    return Ok(Vec::new());
                }
                Ok(vec![TxWrite::Set {
                    path: path.clone(),
                    data: to_document_data(&UserData::default())?,
                }])
            })
            .await?;
        Ok(())
    }

    /// Read the user's document; an absent document reads as empty.
    pub async fn get_user_data(&self, user_id: &str) -> Result<UserData, UserDataError> {
        let doc = self.store.get(&user_data_path(user_id)).await?;
        Ok(match doc {
            Some(doc) => doc.decode()?,
            None => UserData::default(),
        })
    }

    /// Live view of the user's whole document. The callback receives the
    /// decoded document on subscribe and after every change; an absent or
    /// undecodable document is delivered as empty.
    pub fn subscribe_user_data(
        &self,
        user_id: &str,
        mut callback: impl FnMut(UserData) + Send + 'static,
    ) -> Subscription {
        let query = Query::collection(USER_DATA_COLLECTION).where_eq("id", user_id);
        self.store.subscribe(
            query,
            Box::new(move |docs| {
                let data = docs
                    .first()
                    .and_then(|d| d.decode::<UserData>().ok())
                    .unwrap_or_default();
                callback(data);
            }),
        )
    }

    /// Atomic read-modify-write on one user's document. `f` must be
    /// side-effect free; the store may run it more than once before a
    /// commit lands.
    pub(crate) async fn mutate<F>(&self, user_id: &str, mut f: F) -> Result<(), UserDataError>
    where
        F: FnMut(&mut UserData) -> Result<(), UserDataError> + Send,
    {
        let path = user_data_path(user_id);
        let mut domain_err: Option<UserDataError> = None;
        let result = self
            .store
            .run_transaction(&[path.clone()], &mut |snap| {
                let mut data = snap.decode::<UserData>(&path)?.unwrap_or_default();
                if let Err(e) = f(&mut data) {
                    domain_err = Some(e);
                    return Err(StoreError::Invalid("aborted by caller".into()));
                }
                Ok(vec![TxWrite::Set {
                    path: path.clone(),
                    data: to_document_data(&data)?,
                }])
            })
            .await;
        if let Some(e) = domain_err {
            return Err(e);
        }
        result.map_err(UserDataError::Store)
    }

    /// Change the trust tier of one of the owner's connections.
    pub async fn set_trust_level(
        &self,
        owner: &str,
        connection_id: &str,
        level: TrustLevel,
    ) -> Result<(), UserDataError> {
        self.mutate(owner, move |data| {
            let conn = data
                .connections
                .iter_mut()
                .find(|c| c.id == connection_id)
                .ok_or_else(|| UserDataError::ConnectionNotFound(connection_id.to_string()))?;
            conn.trust_level = level;
            Ok(())
        })
        .await
    }

    /// Attach or clear the owner's private notes on a connection.
    pub async fn set_connection_notes(
        &self,
        owner: &str,
        connection_id: &str,
        notes: Option<String>,
    ) -> Result<(), UserDataError> {
        self.mutate(owner, move |data| {
            let conn = data
                .connections
                .iter_mut()
                .find(|c| c.id == connection_id)
                .ok_or_else(|| UserDataError::ConnectionNotFound(connection_id.to_string()))?;
            conn.notes = notes.clone();
            Ok(())
        })
        .await
    }

    /// One-sided removal of a connection edge. The peer's edge list is left
    /// untouched — edge deletion is manual on each side by design. Returns
    /// whether an edge was removed.
    pub async fn delete_connection(
        &self,
        owner: &str,
        connection_id: &str,
    ) -> Result<bool, UserDataError> {
        let mut removed = false;
        self.mutate(owner, |data| {
            let before = data.connections.len();
            data.connections.retain(|c| c.id != connection_id);
            removed = data.connections.len() < before;
            Ok(())
        })
        .await?;
        Ok(removed)
    }

    /// Append a calendar event; the store-assigned ID is returned.
    pub async fn add_calendar_event(
        &self,
        owner: &str,
        mut event: CalendarEvent,
    ) -> Result<String, UserDataError> {
        if event.id.is_empty() {
            event.id = crate::store::new_doc_id();
        }
        let id = event.id.clone();
        self.mutate(owner, move |data| {
            data.calendar_events.push(event.clone());
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn update_calendar_event(
        &self,
        owner: &str,
        event_id: &str,
        title: Option<String>,
        date: Option<u64>,
        shared_with: Option<Vec<String>>,
    ) -> Result<(), UserDataError> {
        self.mutate(owner, move |data| {
            let event = data
                .calendar_events
                .iter_mut()
                .find(|e| e.id == event_id)
                .ok_or_else(|| UserDataError::EventNotFound(event_id.to_string()))?;
            if let Some(title) = &title {
                event.title = title.clone();
            }
            if let Some(date) = date {
                event.date = date;
            }
            if let Some(shared) = &shared_with {
                event.shared_with = shared.clone();
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_calendar_event(
        &self,
        owner: &str,
        event_id: &str,
    ) -> Result<bool, UserDataError> {
        let mut removed = false;
        self.mutate(owner, |data| {
            let before = data.calendar_events.len();
            data.calendar_events.retain(|e| e.id != event_id);
            removed = data.calendar_events.len() < before;
            Ok(())
        })
        .await?;
        Ok(removed)
    }

    /// Post a need visible to connections at or above its trust tier.
    pub async fn add_need(&self, owner: &str, mut need: Need) -> Result<String, UserDataError> {
        if need.id.is_empty() {
            need.id = crate::store::new_doc_id();
        }
        let id = need.id.clone();
        self.mutate(owner, move |data| {
            data.needs.push(need.clone());
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn update_need(
        &self,
        owner: &str,
        need_id: &str,
        description: Option<String>,
        trust_level_required: Option<TrustLevel>,
    ) -> Result<(), UserDataError> {
        self.mutate(owner, move |data| {
            let need = data
                .needs
                .iter_mut()
                .find(|n| n.id == need_id)
                .ok_or_else(|| UserDataError::NeedNotFound(need_id.to_string()))?;
            if let Some(description) = &description {
                need.description = description.clone();
            }
            if let Some(level) = trust_level_required {
                need.trust_level_required = level;
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_need(&self, owner: &str, need_id: &str) -> Result<bool, UserDataError> {
        let mut removed = false;
        self.mutate(owner, |data| {
            let before = data.needs.len();
            data.needs.retain(|n| n.id != need_id);
            removed = data.needs.len() < before;
            Ok(())
        })
        .await?;
        Ok(removed)
    }
}
