//! Integration tests for the vault access model:
//!
//! - grant uniqueness and the revoke -> re-grant reset
//! - visibility of shared vaults through the reverse index
//! - read-time expiry filtering
//! - the live shared-with-me view

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kith::identity::{Identity, ProfileDirectory};
use kith::memory_store::MemoryStore;
use kith::reconcile::reconcile_accepted;
use kith::requests::ConnectionRequestService;
use kith::store::{now_millis, SharedStore};
use kith::vaults::{GrantOptions, VaultAccessController, VaultError};

fn store() -> SharedStore {
    Arc::new(MemoryStore::new())
}

fn alice() -> Identity {
    Identity::new("alice", "Alice", "alice@example.com", "")
}

fn bob() -> Identity {
    Identity::new("bob", "Bob", "bob@example.com", "")
}

/// Run the full request/accept/reconcile protocol so both sides hold edges.
async fn connect(store: &SharedStore, from: &Identity, to: &Identity) {
    let requests = ConnectionRequestService::new(Arc::clone(store));
    let id = requests.send_request(from, to).await.unwrap();
    requests.accept_request(&id, &to.user_id).await.unwrap();
    reconcile_accepted(store, &from.user_id).await.unwrap();
}

// ---------------------------------------------------------------------------
// Grant state machine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn grant_is_unique_per_vault_and_connection() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let vaults = VaultAccessController::new(Arc::clone(&store));

    let vault_id = vaults
        .create_vault("alice", "Medical Records", "scans and reports")
        .await
        .unwrap();
    vaults
        .grant_access("alice", &vault_id, "bob", GrantOptions::default())
        .await
        .unwrap();

    // Re-granting must not create a duplicate.
    let dup = vaults
        .grant_access("alice", &vault_id, "bob", GrantOptions::default())
        .await;
    assert!(matches!(dup, Err(VaultError::AlreadyGranted { .. })));

    let owned = vaults.list_owned_vaults("alice").await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].shared_with.len(), 1);
    assert_eq!(owned[0].shared_with[0].connection_id, "bob");
}

#[tokio::test]
async fn revoke_then_regrant_resets_granted_at() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let vaults = VaultAccessController::new(Arc::clone(&store));

    let vault_id = vaults.create_vault("alice", "Keys", "").await.unwrap();
    vaults
        .grant_access("alice", &vault_id, "bob", GrantOptions::default())
        .await
        .unwrap();
    let first_granted_at = vaults.list_owned_vaults("alice").await.unwrap()[0].shared_with[0]
        .granted_at;

    vaults.revoke_access("alice", &vault_id, "bob").await.unwrap();
    assert!(vaults.list_owned_vaults("alice").await.unwrap()[0]
        .shared_with
        .is_empty());

    // The second grant carries a fresh grantedAt.
    tokio::time::sleep(Duration::from_millis(5)).await;
    vaults
        .grant_access("alice", &vault_id, "bob", GrantOptions::default())
        .await
        .unwrap();
    let shared_with = &vaults.list_owned_vaults("alice").await.unwrap()[0].shared_with;
    assert_eq!(shared_with.len(), 1);
    assert!(shared_with[0].granted_at > first_granted_at);
}

#[tokio::test]
async fn revoke_of_absent_grant_is_a_noop() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let vaults = VaultAccessController::new(Arc::clone(&store));

    let vault_id = vaults.create_vault("alice", "Empty", "").await.unwrap();
    vaults.revoke_access("alice", &vault_id, "bob").await.unwrap();
    assert!(vaults.list_owned_vaults("alice").await.unwrap()[0]
        .shared_with
        .is_empty());
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shared_with_me_tracks_grant_and_revoke() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let profiles = ProfileDirectory::new(Arc::clone(&store));
    profiles.initialize_profile(&alice()).await.unwrap();
    let vaults = VaultAccessController::new(Arc::clone(&store));

    let vault_id = vaults
        .create_vault("alice", "Photos", "holiday albums")
        .await
        .unwrap();

    // Visible iff a grant entry names the reader.
    assert!(vaults.list_vaults_shared_with_me("bob").await.unwrap().is_empty());

    vaults
        .grant_access("alice", &vault_id, "bob", GrantOptions::default())
        .await
        .unwrap();
    let shared = vaults.list_vaults_shared_with_me("bob").await.unwrap();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].vault.id, vault_id);
    assert_eq!(shared[0].vault.name, "Photos");
    assert_eq!(shared[0].owner_id, "alice");
    assert_eq!(shared[0].owner_name, "Alice");

    vaults.revoke_access("alice", &vault_id, "bob").await.unwrap();
    assert!(vaults.list_vaults_shared_with_me("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn owner_without_profile_shows_as_unknown() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let vaults = VaultAccessController::new(Arc::clone(&store));

    let vault_id = vaults.create_vault("alice", "Notes", "").await.unwrap();
    vaults
        .grant_access("alice", &vault_id, "bob", GrantOptions::default())
        .await
        .unwrap();

    let shared = vaults.list_vaults_shared_with_me("bob").await.unwrap();
    assert_eq!(shared[0].owner_name, "Unknown");
}

#[tokio::test]
async fn expired_grants_are_invisible_but_not_purged() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let vaults = VaultAccessController::new(Arc::clone(&store));

    let vault_id = vaults.create_vault("alice", "Timebox", "").await.unwrap();
    vaults
        .grant_access(
            "alice",
            &vault_id,
            "bob",
            GrantOptions {
                expires_at: Some(now_millis() - 1_000),
                can_revoke: true,
            },
        )
        .await
        .unwrap();

    // The reader's view filters the expired grant at read time...
    assert!(vaults.list_vaults_shared_with_me("bob").await.unwrap().is_empty());

    // ...but nothing purges it from the owner's record: only revoke does.
    let owned = vaults.list_owned_vaults("alice").await.unwrap();
    assert_eq!(owned[0].shared_with.len(), 1);
    assert!(owned[0].shared_with[0].is_expired(now_millis()));
}

#[tokio::test]
async fn vault_sharing_scenario() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let vaults = VaultAccessController::new(Arc::clone(&store));

    // Owner creates "Medical Records" and grants one connection, no expiry.
    let vault_id = vaults
        .create_vault("alice", "Medical Records", "scans, reports")
        .await
        .unwrap();
    vaults
        .grant_access(
            "alice",
            &vault_id,
            "bob",
            GrantOptions {
                expires_at: None,
                can_revoke: true,
            },
        )
        .await
        .unwrap();

    let owned = vaults.list_owned_vaults("alice").await.unwrap();
    assert_eq!(owned[0].shared_with.len(), 1);

    vaults.revoke_access("alice", &vault_id, "bob").await.unwrap();
    let owned = vaults.list_owned_vaults("alice").await.unwrap();
    assert_eq!(owned[0].shared_with.len(), 0);
}

#[tokio::test]
async fn duplicate_names_are_allowed_per_owner() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let vaults = VaultAccessController::new(Arc::clone(&store));

    let first = vaults.create_vault("alice", "Backup", "").await.unwrap();
    let second = vaults.create_vault("alice", "Backup", "").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(vaults.list_owned_vaults("alice").await.unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Live view
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shared_with_me_subscription_reflects_grants() {
    let store = store();
    connect(&store, &alice(), &bob()).await;
    let vaults = VaultAccessController::new(Arc::clone(&store));
    let vault_id = vaults.create_vault("alice", "Live", "").await.unwrap();

    let snapshots: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let sub = vaults.subscribe_vaults_shared_with_me("bob", move |shared| {
        sink.lock().unwrap().push(shared.len());
    });

    vaults
        .grant_access("alice", &vault_id, "bob", GrantOptions::default())
        .await
        .unwrap();

    // The view is re-materialized by a background task; wait for the
    // non-empty delivery.
    let mut delivered = false;
    for _ in 0..100 {
        if snapshots.lock().unwrap().iter().any(|n| *n == 1) {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered, "subscription never delivered the granted vault");

    sub.unsubscribe();
}
