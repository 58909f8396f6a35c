//! Identity contract and the user profile directory.
//!
//! Authentication happens outside this crate: a provider hands over an
//! opaque verified [`Identity`] (stable user ID plus display fields), and
//! every service call takes the acting identity explicitly — there is no
//! ambient "current user".
//!
//! The profile directory (`users/{userId}`) is what makes identities
//! discoverable: it is upserted on login and queried by email prefix when a
//! user searches for someone to connect with.

use serde::{Deserialize, Serialize};

use crate::store::{
    now_millis, to_document_data, DocPath, Query, SharedStore, SortDir, StoreError,
};

/// Collection holding one profile document per known user.
pub const USERS_COLLECTION: &str = "users";

/// High code point used as the upper bound of an email prefix range scan.
const PREFIX_SENTINEL: char = '\u{f8ff}';

const DEFAULT_SEARCH_LIMIT: usize = 10;

/// A verified identity as issued by the auth provider. Immutable from this
/// crate's perspective, except that display fields may be refreshed on
/// login via [`ProfileDirectory::initialize_profile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub picture_url: String,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        picture_url: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            email: email.into(),
            picture_url: picture_url.into(),
        }
    }
}

/// A profile document in the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub picture: String,
    pub created_at: u64,
}

/// Read/write access to the `users` collection.
#[derive(Clone)]
pub struct ProfileDirectory {
    store: SharedStore,
}

impl ProfileDirectory {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Create the profile on first login, or refresh the display fields on
    /// later logins while keeping the original `createdAt`.
    pub async fn initialize_profile(&self, identity: &Identity) -> Result<(), StoreError> {
        let path = DocPath::new(USERS_COLLECTION, &identity.user_id);
        let identity = identity.clone();
        self.store
            .run_transaction(&[path.clone()], &mut |snap| {
                let created_at = match snap.decode::<UserProfile>(&path)? {
                    Some(existing) => existing.created_at,
                    None => now_millis(),
                };
                let profile = UserProfile {
                    user_id: identity.user_id.clone(),
                    email: identity.email.clone(),
                    name: identity.name.clone(),
                    picture: identity.picture_url.clone(),
                    created_at,
                };
                Ok(vec![crate::store::TxWrite::Set {
                    path: path.clone(),
                    data: to_document_data(&profile)?,
                }])
            })
            .await
    }

    /// Fetch one profile by user ID.
    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let doc = self
            .store
            .get(&DocPath::new(USERS_COLLECTION, user_id))
            .await?;
        match doc {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    /// Prefix search over profile emails, at most `limit` results (10 when
    /// `None`), ordered by email. Uses the classic range-scan trick:
    /// `prefix <= email <= prefix + U+F8FF`.
    pub async fn search_by_email(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<UserProfile>, StoreError> {
        let upper = format!("{prefix}{PREFIX_SENTINEL}");
        let query = Query::collection(USERS_COLLECTION)
            .where_ge("email", prefix)
            .where_le("email", upper)
            .order_by("email", SortDir::Asc)
            .limit(limit.unwrap_or(DEFAULT_SEARCH_LIMIT));
        let docs = self.store.query(&query).await?;
        docs.iter().map(|d| d.decode()).collect()
    }
}
