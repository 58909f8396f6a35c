//! Vault access control.
//!
//! A vault is a named unit of shared data owned by exactly one user and
//! embedded in that user's document. Its `sharedWith` list carries one
//! grant per connection; grants are unique per (vault, connection) pair
//! and only ever flip between absent and granted — `expiresAt` never
//! auto-transitions anything, it is checked at read time.
//!
//! The "shared with me" view is served from a reverse index
//! (`vaultGrantIndex/{recipientId}`) maintained in the same transaction as
//! every grant and revoke, instead of scanning every user's document. The
//! owner's `sharedWith` array stays authoritative: the view re-checks it
//! (and grant expiry) on every materialization.
//!
//! None of this is a security boundary. The store's own access rules are
//! the enforcement point; these APIs are display-time filters that assume
//! the store rejects reads which satisfy neither ownership nor grant.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::store::{
    new_doc_id, now_millis, to_document_data, DocPath, Query, SharedStore, StoreError,
    Subscription, TxWrite,
};
use crate::user_data::{user_data_path, UserData, Vault, VaultAccess};
use crate::identity::USERS_COLLECTION;
use crate::{klog, logging};

/// Reverse index: one document per grant recipient.
pub const GRANT_INDEX_COLLECTION: &str = "vaultGrantIndex";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum VaultError {
    Store(StoreError),
    VaultNotFound(String),
    /// The grantee is not one of the owner's connections.
    UnknownConnection(String),
    /// The (vault, connection) pair already has a grant.
    AlreadyGranted {
        vault_id: String,
        connection_id: String,
    },
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultError::Store(e) => write!(f, "store error: {e}"),
            VaultError::VaultNotFound(id) => write!(f, "vault not found: {id}"),
            VaultError::UnknownConnection(id) => write!(f, "unknown connection: {id}"),
            VaultError::AlreadyGranted {
                vault_id,
                connection_id,
            } => write!(f, "vault {vault_id} already shared with {connection_id}"),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<StoreError> for VaultError {
    fn from(e: StoreError) -> Self {
        VaultError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Reverse index model
// ---------------------------------------------------------------------------

/// One entry in a recipient's reverse index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRef {
    pub owner_id: String,
    pub vault_id: String,
    pub granted_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantIndex {
    #[serde(default)]
    grants: Vec<GrantRef>,
}

fn grant_index_path(user_id: &str) -> DocPath {
    DocPath::new(GRANT_INDEX_COLLECTION, user_id)
}

/// A vault materialized into another user's "shared with me" view, with
/// the owner attached for display only.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedVault {
    pub vault: Vault,
    pub owner_id: String,
    pub owner_name: String,
}

/// Options for a new grant.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantOptions {
    /// Advisory expiry; consumers check it at read time, nothing purges it.
    pub expires_at: Option<u64>,
    pub can_revoke: bool,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Owner-side vault operations plus the recipient-side visibility views.
#[derive(Clone)]
pub struct VaultAccessController {
    store: SharedStore,
}

impl VaultAccessController {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Create a vault with an empty grant list. Names need not be unique
    /// per owner.
    pub async fn create_vault(
        &self,
        owner: &str,
        name: &str,
        description: &str,
    ) -> Result<String, VaultError> {
        let vault = Vault {
            id: new_doc_id(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: now_millis(),
            shared_with: Vec::new(),
        };
        let id = vault.id.clone();
        let path = user_data_path(owner);
        self.store
            .run_transaction(&[path.clone()], &mut |snap| {
                let mut data = snap.decode::<UserData>(&path)?.unwrap_or_default();
                data.vaults.push(vault.clone());
                Ok(vec![TxWrite::Set {
                    path: path.clone(),
                    data: to_document_data(&data)?,
                }])
            })
            .await?;
        klog!(
            "vaults: {} created by {} ({:?})",
            logging::vault_id(&id),
            logging::user_id(owner),
            name
        );
        Ok(id)
    }

    /// Grant one of the owner's connections read access to a vault.
    ///
    /// The grant is appended to the vault's `sharedWith` and mirrored into
    /// the recipient's reverse index in the same atomic commit. Re-granting
    /// an existing (vault, connection) pair is refused rather than
    /// duplicated.
    pub async fn grant_access(
        &self,
        owner: &str,
        vault_id: &str,
        connection_id: &str,
        opts: GrantOptions,
    ) -> Result<(), VaultError> {
        let owner_path = user_data_path(owner);
        let index_path = grant_index_path(connection_id);
        let reads = [owner_path.clone(), index_path.clone()];
        let mut domain_err: Option<VaultError> = None;
        let owner_id = owner.to_string();

        let result = self
            .store
            .run_transaction(&reads, &mut |snap| {
                let mut data = snap.decode::<UserData>(&owner_path)?.unwrap_or_default();

                if !data.has_connection(connection_id) {
                    domain_err = Some(VaultError::UnknownConnection(connection_id.to_string()));
                    return Err(StoreError::Invalid("unknown connection".into()));
                }
                let Some(vault) = data.vaults.iter_mut().find(|v| v.id == vault_id) else {
                    domain_err = Some(VaultError::VaultNotFound(vault_id.to_string()));
                    return Err(StoreError::NotFound(vault_id.to_string()));
                };
                if vault
                    .shared_with
                    .iter()
                    .any(|a| a.connection_id == connection_id)
                {
                    domain_err = Some(VaultError::AlreadyGranted {
                        vault_id: vault_id.to_string(),
                        connection_id: connection_id.to_string(),
                    });
                    return Err(StoreError::AlreadyExists(format!(
                        "{vault_id}/{connection_id}"
                    )));
                }

                let granted_at = now_millis();
                vault.shared_with.push(VaultAccess {
                    connection_id: connection_id.to_string(),
                    granted_at,
                    expires_at: opts.expires_at,
                    can_revoke: opts.can_revoke,
                });

                let mut index = snap
                    .decode::<GrantIndex>(&index_path)?
                    .unwrap_or_default();
                index
                    .grants
                    .retain(|g| !(g.owner_id == owner_id && g.vault_id == vault_id));
                index.grants.push(GrantRef {
                    owner_id: owner_id.clone(),
                    vault_id: vault_id.to_string(),
                    granted_at,
                });

                Ok(vec![
                    TxWrite::Set {
                        path: owner_path.clone(),
                        data: to_document_data(&data)?,
                    },
                    TxWrite::Set {
                        path: index_path.clone(),
                        data: to_document_data(&index)?,
                    },
                ])
            })
            .await;

        if let Some(e) = domain_err {
            return Err(e);
        }
        result?;
        klog!(
            "vaults: {} shared with {} by {}",
            logging::vault_id(vault_id),
            logging::user_id(connection_id),
            logging::user_id(owner)
        );
        Ok(())
    }

    /// Remove a connection's grant from a vault. No-op if absent — the
    /// grant state machine is `absent -> granted -> absent`, and a later
    /// re-grant gets a fresh `grantedAt`.
    pub async fn revoke_access(
        &self,
        owner: &str,
        vault_id: &str,
        connection_id: &str,
    ) -> Result<(), VaultError> {
        let owner_path = user_data_path(owner);
        let index_path = grant_index_path(connection_id);
        let reads = [owner_path.clone(), index_path.clone()];
        let owner_id = owner.to_string();

        self.store
            .run_transaction(&reads, &mut |snap| {
                let mut data = snap.decode::<UserData>(&owner_path)?.unwrap_or_default();
                let mut changed = false;
                if let Some(vault) = data.vaults.iter_mut().find(|v| v.id == vault_id) {
                    let before = vault.shared_with.len();
                    vault
                        .shared_with
                        .retain(|a| a.connection_id != connection_id);
                    changed = vault.shared_with.len() < before;
                }

                let mut index = snap
                    .decode::<GrantIndex>(&index_path)?
                    .unwrap_or_default();
                let index_before = index.grants.len();
                index
                    .grants
                    .retain(|g| !(g.owner_id == owner_id && g.vault_id == vault_id));
                let index_changed = index.grants.len() < index_before;

                if !changed && !index_changed {
                    return Ok(Vec::new());
                }
                Ok(vec![
                    TxWrite::Set {
                        path: owner_path.clone(),
                        data: to_document_data(&data)?,
                    },
                    TxWrite::Set {
                        path: index_path.clone(),
                        data: to_document_data(&index)?,
                    },
                ])
            })
            .await?;
        klog!(
            "vaults: {} access revoked for {} by {}",
            logging::vault_id(vault_id),
            logging::user_id(connection_id),
            logging::user_id(owner)
        );
        Ok(())
    }

    /// The owner's vaults, straight from their document.
    pub async fn list_owned_vaults(&self, owner: &str) -> Result<Vec<Vault>, VaultError> {
        let doc = self.store.get(&user_data_path(owner)).await?;
        Ok(match doc {
            Some(doc) => doc.decode::<UserData>()?.vaults,
            None => Vec::new(),
        })
    }

    /// Every vault currently shared with `user_id`, with owner display
    /// fields attached.
    ///
    /// Reads the recipient's reverse index and then only the referenced
    /// owners' documents — never a scan across all users. The owner's
    /// `sharedWith` array is re-checked per vault (the index is a hint,
    /// not the authority), and grants past their `expiresAt` are filtered
    /// out here at read time.
    pub async fn list_vaults_shared_with_me(
        &self,
        user_id: &str,
    ) -> Result<Vec<SharedVault>, VaultError> {
        let index = match self.store.get(&grant_index_path(user_id)).await? {
            Some(doc) => doc.decode::<GrantIndex>()?,
            None => return Ok(Vec::new()),
        };

        let now = now_millis();
        let mut shared = Vec::new();
        for grant_ref in &index.grants {
            let Some(owner_doc) = self.store.get(&user_data_path(&grant_ref.owner_id)).await?
            else {
                continue;
            };
            let owner_data: UserData = owner_doc.decode()?;
            let Some(vault) = owner_data.vault(&grant_ref.vault_id) else {
                continue; // vault deleted since the grant
            };
            let Some(access) = vault
                .shared_with
                .iter()
                .find(|a| a.connection_id == user_id)
            else {
                continue; // revoked; index entry is stale
            };
            if access.is_expired(now) {
                continue;
            }

            let owner_name = match self
                .store
                .get(&DocPath::new(USERS_COLLECTION, &grant_ref.owner_id))
                .await?
            {
                Some(profile) => profile
                    .field("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string(),
                None => "Unknown".to_string(),
            };

            shared.push(SharedVault {
                vault: vault.clone(),
                owner_id: grant_ref.owner_id.clone(),
                owner_name,
            });
        }
        Ok(shared)
    }

    /// Live "shared with me" view. The reverse-index subscription signals a
    /// background task which re-materializes the vault list and invokes the
    /// callback with the full current set. Must be called from within a
    /// tokio runtime; unsubscribing stops both the watcher and the task.
    pub fn subscribe_vaults_shared_with_me(
        &self,
        user_id: &str,
        mut callback: impl FnMut(Vec<SharedVault>) + Send + 'static,
    ) -> Subscription {
        let notify = Arc::new(Notify::new());
        let signal = Arc::clone(&notify);
        let inner = self.store.subscribe(
            Query::collection(GRANT_INDEX_COLLECTION).where_eq("id", user_id),
            Box::new(move |_docs| signal.notify_one()),
        );

        let controller = self.clone();
        let user = user_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match controller.list_vaults_shared_with_me(&user).await {
                    Ok(vaults) => callback(vaults),
                    Err(e) => klog!(
                        "vaults: shared-with-me refresh failed for {}: {}",
                        logging::user_id(&user),
                        e
                    ),
                }
                notify.notified().await;
            }
        });

        Subscription::new(move || {
            handle.abort();
            inner.unsubscribe();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::user_data::{Connection, TrustLevel, UserDataService};

    async fn setup() -> (SharedStore, VaultAccessController) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let users = UserDataService::new(Arc::clone(&store));
        // Alice owns vaults; Bob is her connection.
        users
            .mutate("alice", |data| {
                data.connections.push(Connection {
                    id: "bob".into(),
                    name: "Bob".into(),
                    email: "bob@example.com".into(),
                    picture: String::new(),
                    trust_level: TrustLevel::Known,
                    connected_at: 1,
                    notes: None,
                });
                Ok(())
            })
            .await
            .unwrap();
        (Arc::clone(&store), VaultAccessController::new(store))
    }

    #[tokio::test]
    async fn test_grant_requires_known_connection_and_existing_vault() {
        let (_store, vaults) = setup().await;
        let vault_id = vaults
            .create_vault("alice", "Medical Records", "scans and reports")
            .await
            .unwrap();

        let stranger = vaults
            .grant_access("alice", &vault_id, "mallory", GrantOptions::default())
            .await;
        assert!(matches!(stranger, Err(VaultError::UnknownConnection(_))));

        let missing = vaults
            .grant_access("alice", "no-such-vault", "bob", GrantOptions::default())
            .await;
        assert!(matches!(missing, Err(VaultError::VaultNotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_grant_is_refused() {
        let (_store, vaults) = setup().await;
        let vault_id = vaults
            .create_vault("alice", "Keys", "")
            .await
            .unwrap();
        vaults
            .grant_access("alice", &vault_id, "bob", GrantOptions::default())
            .await
            .unwrap();
        let dup = vaults
            .grant_access("alice", &vault_id, "bob", GrantOptions::default())
            .await;
        assert!(matches!(dup, Err(VaultError::AlreadyGranted { .. })));

        let owned = vaults.list_owned_vaults("alice").await.unwrap();
        assert_eq!(owned[0].shared_with.len(), 1);
    }

    #[tokio::test]
    async fn test_reverse_index_tracks_grant_and_revoke() {
        let (store, vaults) = setup().await;
        let vault_id = vaults.create_vault("alice", "Photos", "").await.unwrap();

        vaults
            .grant_access("alice", &vault_id, "bob", GrantOptions::default())
            .await
            .unwrap();
        let index_doc = store.get(&grant_index_path("bob")).await.unwrap().unwrap();
        let index: GrantIndex = index_doc.decode().unwrap();
        assert_eq!(index.grants.len(), 1);
        assert_eq!(index.grants[0].vault_id, vault_id);

        vaults
            .revoke_access("alice", &vault_id, "bob")
            .await
            .unwrap();
        let index_doc = store.get(&grant_index_path("bob")).await.unwrap().unwrap();
        let index: GrantIndex = index_doc.decode().unwrap();
        assert!(index.grants.is_empty());
    }
}
