//! Integration tests for the connection-request protocol:
//!
//! - the pending -> accepted/rejected state machine and its terminal states
//! - the one-sided, idempotent edge append on accept
//! - FIFO ordering and full-result-set delivery of the pending queue
//! - sender-only cancellation and the either-direction pending check

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kith::identity::Identity;
use kith::memory_store::MemoryStore;
use kith::requests::{ConnectionRequestService, RequestError, RequestStatus};
use kith::store::SharedStore;
use kith::user_data::{TrustLevel, UserDataService};

fn store() -> SharedStore {
    Arc::new(MemoryStore::new())
}

fn alice() -> Identity {
    Identity::new("alice", "Alice", "alice@example.com", "https://pics/alice.png")
}

fn bob() -> Identity {
    Identity::new("bob", "Bob", "bob@example.com", "https://pics/bob.png")
}

fn carol() -> Identity {
    Identity::new("carol", "Carol", "carol@example.com", "")
}

// ---------------------------------------------------------------------------
// State machine properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_edge_exists_before_accept() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));
    let users = UserDataService::new(Arc::clone(&store));

    requests.send_request(&alice(), &bob()).await.unwrap();

    // Sending creates no edge on either side.
    assert!(users.get_user_data("alice").await.unwrap().connections.is_empty());
    assert!(users.get_user_data("bob").await.unwrap().connections.is_empty());
}

#[tokio::test]
async fn accept_creates_one_sided_edge_with_snapshot_fields() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));
    let users = UserDataService::new(Arc::clone(&store));

    let id = requests.send_request(&alice(), &bob()).await.unwrap();
    requests.accept_request(&id, "bob").await.unwrap();

    // The accepting side has the edge...
    let bob_data = users.get_user_data("bob").await.unwrap();
    assert_eq!(bob_data.connections.len(), 1);
    let edge = &bob_data.connections[0];
    assert_eq!(edge.id, "alice");
    assert_eq!(edge.name, "Alice");
    assert_eq!(edge.email, "alice@example.com");
    assert_eq!(edge.picture, "https://pics/alice.png");
    assert_eq!(edge.trust_level, TrustLevel::Known);
    assert!(edge.connected_at > 0);

    // ...and the sender's list is untouched until reconciliation runs.
    assert!(users.get_user_data("alice").await.unwrap().connections.is_empty());

    let request = requests.get_request(&id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Accepted);
    assert!(request.updated_at >= request.created_at);
}

#[tokio::test]
async fn accept_is_idempotent() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));
    let users = UserDataService::new(Arc::clone(&store));

    let id = requests.send_request(&alice(), &bob()).await.unwrap();

    // A second accept neither duplicates the edge nor fails.
    requests.accept_request(&id, "bob").await.unwrap();
    requests.accept_request(&id, "bob").await.unwrap();

    let bob_data = users.get_user_data("bob").await.unwrap();
    assert_eq!(bob_data.connections.len(), 1);
    assert_eq!(
        requests.get_request(&id).await.unwrap().status,
        RequestStatus::Accepted
    );
}

#[tokio::test]
async fn reject_is_terminal_and_creates_no_edges() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));
    let users = UserDataService::new(Arc::clone(&store));

    let id = requests.send_request(&alice(), &bob()).await.unwrap();
    requests.reject_request(&id).await.unwrap();
    // Rejecting again is a no-op.
    requests.reject_request(&id).await.unwrap();

    // No edges anywhere, and accept of a rejected request fails.
    assert!(users.get_user_data("alice").await.unwrap().connections.is_empty());
    assert!(users.get_user_data("bob").await.unwrap().connections.is_empty());

    let result = requests.accept_request(&id, "bob").await;
    match result {
        Err(RequestError::NotActionable { status, .. }) => {
            assert_eq!(status, RequestStatus::Rejected);
        }
        other => panic!("expected NotActionable, got {other:?}"),
    }
    assert_eq!(
        requests.get_request(&id).await.unwrap().status,
        RequestStatus::Rejected
    );
}

#[tokio::test]
async fn reject_of_accepted_request_is_refused() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));

    let id = requests.send_request(&alice(), &bob()).await.unwrap();
    requests.accept_request(&id, "bob").await.unwrap();

    let result = requests.reject_request(&id).await;
    assert!(matches!(result, Err(RequestError::NotActionable { .. })));
}

#[tokio::test]
async fn accept_of_unknown_request_is_not_found() {
    let requests = ConnectionRequestService::new(store());
    let result = requests.accept_request("no-such-request", "bob").await;
    assert!(matches!(result, Err(RequestError::NotFound(_))));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_is_sender_only_and_pending_only() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));

    let id = requests.send_request(&alice(), &bob()).await.unwrap();

    // The recipient cannot cancel.
    let result = requests.cancel_request(&id, "bob").await;
    assert!(matches!(result, Err(RequestError::NotSender(_))));

    // The sender can, and the row is hard-deleted.
    requests.cancel_request(&id, "alice").await.unwrap();
    let result = requests.get_request(&id).await;
    assert!(matches!(result, Err(RequestError::NotFound(_))));

    // An accepted request is no longer cancellable.
    let id = requests.send_request(&alice(), &bob()).await.unwrap();
    requests.accept_request(&id, "bob").await.unwrap();
    let result = requests.cancel_request(&id, "alice").await;
    assert!(matches!(result, Err(RequestError::NotActionable { .. })));
}

// ---------------------------------------------------------------------------
// Duplicate detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn check_existing_request_covers_both_directions() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));

    assert!(!requests.check_existing_request("alice", "bob").await.unwrap());

    let id = requests.send_request(&alice(), &bob()).await.unwrap();
    assert!(requests.check_existing_request("alice", "bob").await.unwrap());
    // The reverse ordering sees the same pending request.
    assert!(requests.check_existing_request("bob", "alice").await.unwrap());

    // A terminal request no longer blocks.
    requests.reject_request(&id).await.unwrap();
    assert!(!requests.check_existing_request("alice", "bob").await.unwrap());
}

// ---------------------------------------------------------------------------
// Pending queue: ordering and live view
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_queue_is_fifo() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));

    requests.send_request(&alice(), &bob()).await.unwrap();
    // Millisecond timestamps order the queue; make sure they differ.
    tokio::time::sleep(Duration::from_millis(5)).await;
    requests.send_request(&carol(), &bob()).await.unwrap();

    let pending = requests.list_pending_received("bob").await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].from_user_id, "alice");
    assert_eq!(pending[1].from_user_id, "carol");
    assert!(pending[0].created_at < pending[1].created_at);
}

#[tokio::test]
async fn subscription_delivers_full_sets() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));

    let snapshots: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let sub = requests.subscribe_pending_received("bob", move |reqs| {
        sink.lock()
            .unwrap()
            .push(reqs.into_iter().map(|r| r.from_user_id).collect());
    });

    let id = requests.send_request(&alice(), &bob()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    requests.send_request(&carol(), &bob()).await.unwrap();
    requests.accept_request(&id, "bob").await.unwrap();

    {
        let log = snapshots.lock().unwrap();
        // Initial empty set, then each change re-delivers the whole queue.
        assert_eq!(log[0], Vec::<String>::new());
        assert_eq!(log[1], vec!["alice".to_string()]);
        assert_eq!(log[2], vec!["alice".to_string(), "carol".to_string()]);
        // Accepting removes the request from the pending view.
        assert_eq!(log.last().unwrap(), &vec!["carol".to_string()]);
    }

    sub.unsubscribe();
    requests.send_request(&alice(), &carol()).await.unwrap();
    // No deliveries after unsubscribe.
    assert_eq!(snapshots.lock().unwrap().len(), 4);
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_lifecycle_scenario() {
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));
    let users = UserDataService::new(Arc::clone(&store));

    // A sends a request to B.
    let id = requests.send_request(&alice(), &bob()).await.unwrap();

    // B's queue contains exactly one pending entry from A.
    let pending = requests.list_pending_received("bob").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].from_user_id, "alice");
    assert_eq!(pending[0].status, RequestStatus::Pending);

    // B accepts.
    requests.accept_request(&id, "bob").await.unwrap();

    // The queue is empty and B's connection list has A at trust `known`.
    assert!(requests.list_pending_received("bob").await.unwrap().is_empty());
    let bob_data = users.get_user_data("bob").await.unwrap();
    assert_eq!(bob_data.connections.len(), 1);
    assert_eq!(bob_data.connections[0].id, "alice");
    assert_eq!(bob_data.connections[0].trust_level, TrustLevel::Known);
}

#[tokio::test]
async fn concurrent_opposite_sends_both_land() {
    // Uniqueness is advisory: two pending requests in opposite directions
    // can coexist, and accepting both converges on a single edge per side.
    let store = store();
    let requests = ConnectionRequestService::new(Arc::clone(&store));
    let users = UserDataService::new(Arc::clone(&store));

    let ab = requests.send_request(&alice(), &bob()).await.unwrap();
    let ba = requests.send_request(&bob(), &alice()).await.unwrap();

    requests.accept_request(&ab, "bob").await.unwrap();
    // Bob accepting his own outgoing request's mirror is idempotent on his
    // edge list.
    requests.accept_request(&ba, "alice").await.unwrap();

    assert_eq!(users.get_user_data("bob").await.unwrap().connections.len(), 1);
    assert_eq!(users.get_user_data("alice").await.unwrap().connections.len(), 1);
}
