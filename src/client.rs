//! Client session facade.
//!
//! A [`Client`] bundles one verified identity with a store handle and the
//! services, wires the live subscriptions into a broadcast channel of
//! domain events, and owns the background reconcile loop. The acting
//! identity is explicit state passed in at construction — there is no
//! process-wide "current user" — so two clients for different users can
//! coexist in one process (the sandbox and the tests do exactly that).
//!
//! Teardown matters: subscriptions keep firing until they are dropped, so
//! callers hold the client for the session and call [`Client::shutdown`]
//! (or drop it) when the session ends.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::identity::{Identity, ProfileDirectory};
use crate::reconcile::{reconcile_accepted, reconcile_loop};
use crate::requests::{ConnectionRequest, ConnectionRequestService, RequestError};
use crate::store::{SharedStore, StoreError, Subscription};
use crate::user_data::{UserDataError, UserDataService};
use crate::vaults::{SharedVault, VaultAccessController};
use crate::{klog, logging};

/// Default capacity of the domain-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ClientError {
    Store(StoreError),
    UserData(UserDataError),
    Request(RequestError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Store(e) => write!(f, "store error: {e}"),
            ClientError::UserData(e) => write!(f, "user data error: {e}"),
            ClientError::Request(e) => write!(f, "request error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::Store(e)
    }
}

impl From<UserDataError> for ClientError {
    fn from(e: UserDataError) -> Self {
        ClientError::UserData(e)
    }
}

impl From<RequestError> for ClientError {
    fn from(e: RequestError) -> Self {
        ClientError::Request(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Capacity of the domain-event broadcast channel. Slow receivers that
    /// fall further behind than this see `Lagged` and miss events.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Domain events fanned out to session observers (a UI, the sandbox, tests).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The pending incoming queue changed; carries the full current queue.
    PendingRequestsChanged { requests: Vec<ConnectionRequest> },
    /// A request this user sent was accepted by its recipient.
    SentRequestAccepted { request: ConnectionRequest },
    /// The set of vaults shared with this user changed; full current set.
    SharedVaultsChanged { vaults: Vec<SharedVault> },
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One user's live session against the store.
pub struct Client {
    identity: Identity,
    store: SharedStore,
    profiles: ProfileDirectory,
    users: UserDataService,
    requests: ConnectionRequestService,
    vaults: VaultAccessController,
    events_tx: broadcast::Sender<ClientEvent>,
    subscriptions: Vec<Subscription>,
    reconcile_notify: Arc<Notify>,
    reconcile_task: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new(identity: Identity, store: SharedStore, config: ClientConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        Self {
            profiles: ProfileDirectory::new(Arc::clone(&store)),
            users: UserDataService::new(Arc::clone(&store)),
            requests: ConnectionRequestService::new(Arc::clone(&store)),
            vaults: VaultAccessController::new(Arc::clone(&store)),
            identity,
            store,
            events_tx,
            subscriptions: Vec::new(),
            reconcile_notify: Arc::new(Notify::new()),
            reconcile_task: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn profiles(&self) -> &ProfileDirectory {
        &self.profiles
    }

    pub fn user_data(&self) -> &UserDataService {
        &self.users
    }

    pub fn requests(&self) -> &ConnectionRequestService {
        &self.requests
    }

    pub fn vaults(&self) -> &VaultAccessController {
        &self.vaults
    }

    /// Subscribe to this session's domain events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// Bring the session up: upsert the profile and user-data documents,
    /// wire the live subscriptions, replay any acceptances that landed
    /// while this user was offline, and start the background reconcile
    /// loop. Must be called from within a tokio runtime.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        self.profiles.initialize_profile(&self.identity).await?;
        self.users.ensure_user_data(&self.identity.user_id).await?;

        // Pending incoming queue -> full-set events.
        let tx = self.events_tx.clone();
        self.subscriptions.push(self.requests.subscribe_pending_received(
            &self.identity.user_id,
            move |requests| {
                let _ = tx.send(ClientEvent::PendingRequestsChanged { requests });
            },
        ));

        // Accepted-sent set -> per-request acceptance events + a nudge for
        // the reconcile loop. The first snapshot only seeds the seen-set so
        // historic acceptances are not re-announced on every login.
        let tx = self.events_tx.clone();
        let notify = Arc::clone(&self.reconcile_notify);
        let mut seen: HashSet<String> = HashSet::new();
        let mut first = true;
        self.subscriptions.push(self.requests.subscribe_accepted_sent(
            &self.identity.user_id,
            move |requests| {
                let mut nudge = false;
                for request in requests {
                    if seen.insert(request.id.clone()) && !first {
                        nudge = true;
                        let _ = tx.send(ClientEvent::SentRequestAccepted { request });
                    }
                }
                first = false;
                if nudge {
                    notify.notify_one();
                }
            },
        ));

        // Shared-vault visibility -> full-set events.
        let tx = self.events_tx.clone();
        self.subscriptions.push(self.vaults.subscribe_vaults_shared_with_me(
            &self.identity.user_id,
            move |vaults| {
                let _ = tx.send(ClientEvent::SharedVaultsChanged { vaults });
            },
        ));

        // Offline replay: acceptances that landed while no client was
        // running get their sender-side edge now, before the loop starts.
        let appended = reconcile_accepted(&self.store, &self.identity.user_id).await?;
        if appended > 0 {
            klog!(
                "client: replayed {} acceptance(s) for {}",
                appended,
                logging::user_id(&self.identity.user_id)
            );
        }

        self.reconcile_task = Some(tokio::spawn(reconcile_loop(
            Arc::clone(&self.store),
            self.identity.user_id.clone(),
            Arc::clone(&self.reconcile_notify),
        )));

        klog!(
            "client: session started for {}",
            logging::user_id(&self.identity.user_id)
        );
        Ok(())
    }

    /// Send a connection request to another user, with the advisory
    /// duplicate check the raw service skips: if a pending request already
    /// exists in either direction this fails with
    /// [`RequestError::AlreadyPending`] instead of creating a second one.
    /// (Two genuinely concurrent sends can still both land; the accept
    /// path tolerates that.)
    pub async fn send_connection_request(&self, to: &Identity) -> Result<String, RequestError> {
        if self
            .requests
            .check_existing_request(&self.identity.user_id, &to.user_id)
            .await?
        {
            return Err(RequestError::AlreadyPending {
                from: self.identity.user_id.clone(),
                to: to.user_id.clone(),
            });
        }
        self.requests.send_request(&self.identity, to).await
    }

    /// Tear the session down: detach every subscription and stop the
    /// reconcile loop. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        for sub in self.subscriptions.drain(..) {
            sub.unsubscribe();
        }
        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
