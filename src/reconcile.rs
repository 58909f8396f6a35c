//! Sender-side edge reconciliation.
//!
//! Accepting a request writes the edge on the *accepting* user's record
//! only. The sender learns about the acceptance asynchronously — through
//! the accepted-sent subscription — and appends its own edge here, with the
//! same idempotency guard, so duplicate firings and replays are harmless.
//!
//! This is an eventually-consistent, at-least-once protocol, not a bug: if
//! the sender's client never runs (offline, closed tab) their side of the
//! edge stays missing until the next session replays the accepted set. The
//! first pass of [`reconcile_loop`] does exactly that replay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::requests::{ConnectionRequestService, RequestError};
use crate::store::SharedStore;
use crate::user_data::UserDataService;
use crate::{klog, logging};

/// How often a quiet loop re-checks the accepted set. The subscription
/// signal wakes the loop early; this interval is the fallback.
pub const RECONCILE_INTERVAL_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 300; // 5 minutes

/// One reconciliation pass: find every accepted request sent by `user_id`
/// whose edge is missing from `user_id`'s own connection list, and append
/// it. Returns how many edges were appended.
///
/// Re-uses the accept path's transaction, which is idempotent: a request
/// already reconciled is a no-op, and a concurrent pass on another device
/// cannot produce a duplicate edge.
pub async fn reconcile_accepted(
    store: &SharedStore,
    user_id: &str,
) -> Result<usize, RequestError> {
    let requests = ConnectionRequestService::new(Arc::clone(store));
    let accepted = requests.list_accepted_sent(user_id).await?;
    if accepted.is_empty() {
        return Ok(0);
    }

    let user_data = UserDataService::new(Arc::clone(store))
        .get_user_data(user_id)
        .await
        .map_err(|e| match e {
            crate::user_data::UserDataError::Store(s) => RequestError::Store(s),
            other => RequestError::Store(crate::store::StoreError::Invalid(other.to_string())),
        })?;

    let mut appended = 0;
    for request in accepted {
        let (other_id, ..) = request.other_party(user_id);
        if user_data.has_connection(&other_id) {
            continue;
        }
        // Same transaction as the recipient's accept: status is already
        // `accepted`, so only the missing edge is written.
        requests.accept_request(&request.id, user_id).await?;
        klog!(
            "reconcile: appended edge {} -> {} (request {})",
            logging::user_id(user_id),
            logging::user_id(&other_id),
            logging::req_id(&request.id)
        );
        appended += 1;
    }
    Ok(appended)
}

/// Runs the background reconciliation loop with exponential backoff on
/// failure.
///
/// `notify` is signalled by the accepted-sent subscription whenever the
/// store pushes a change, so acceptance is reconciled in near-real-time;
/// the periodic interval is the fallback when no push arrives. Runs until
/// the owning task is aborted (see `Client::shutdown`).
pub async fn reconcile_loop(store: SharedStore, user_id: String, notify: Arc<Notify>) {
    let mut consecutive_failures = 0u32;

    loop {
        // Interval with exponential backoff on failure: 30s * 2^failures,
        // capped at 5 minutes.
        let interval_secs = if consecutive_failures == 0 {
            RECONCILE_INTERVAL_SECS
        } else {
            RECONCILE_INTERVAL_SECS
                .saturating_mul(2u64.saturating_pow(consecutive_failures))
                .min(MAX_BACKOFF_SECS)
        };

        // Wake on a subscription signal OR the interval, whichever first.
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
        }

        match reconcile_accepted(&store, &user_id).await {
            Ok(appended) => {
                consecutive_failures = 0;
                if appended > 0 {
                    klog!(
                        "reconcile: {} edge(s) appended for {}",
                        appended,
                        logging::user_id(&user_id)
                    );
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                let next_retry_secs = RECONCILE_INTERVAL_SECS
                    .saturating_mul(2u64.saturating_pow(consecutive_failures))
                    .min(MAX_BACKOFF_SECS);
                klog!(
                    "reconcile: pass failed for {} (attempt {}, next retry in {}s): {}",
                    logging::user_id(&user_id),
                    consecutive_failures,
                    next_retry_secs,
                    e
                );
            }
        }
    }
}
