//! kith-sandbox: a scripted two-user walkthrough of the connection-request
//! protocol and the vault access model, run against a local store.
//!
//! No network or hosted backend required: state lives in memory by default,
//! or in a SQLite database under the data directory with `--sqlite`. Every
//! observable state change is logged, so the output reads as a trace of the
//! protocol: send -> pending queue -> accept -> one-sided edge -> sender
//! reconciliation -> vault grant -> revoke.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;

use kith::client::{Client, ClientConfig};
use kith::identity::Identity;
use kith::klog;
use kith::logging;
use kith::memory_store::MemoryStore;
use kith::reconcile::reconcile_accepted;
use kith::sqlite_store::SqliteStore;
use kith::store::SharedStore;
use kith::user_data::TrustLevel;
use kith::vaults::GrantOptions;

/// Local sandbox for the kith trust-graph and vault protocols.
///
/// Configuration can be set via CLI arguments or environment variables;
/// CLI arguments take precedence. An optional `config.toml` in the data
/// directory supplies defaults.
#[derive(Parser, Debug)]
#[command(name = "kith-sandbox", version, about)]
struct Cli {
    /// Data directory for local state and config [default: ~/.kith]
    #[arg(long, short = 'd', env = "KITH_HOME")]
    data_dir: Option<PathBuf>,

    /// Persist state in a SQLite database under the data directory
    /// instead of running purely in memory
    #[arg(long)]
    sqlite: bool,
}

/// Optional `{data_dir}/config.toml`.
#[derive(Debug, Default, Deserialize)]
struct SandboxConfig {
    /// "memory" (default) or "sqlite".
    #[serde(default)]
    store: Option<String>,
}

fn load_config(data_dir: &PathBuf) -> SandboxConfig {
    let path = data_dir.join("config.toml");
    if !path.exists() {
        return SandboxConfig::default();
    }
    match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            klog!("config: ignoring malformed {}: {}", path.display(), e);
            SandboxConfig::default()
        }),
        Err(e) => {
            klog!("config: cannot read {}: {}", path.display(), e);
            SandboxConfig::default()
        }
    }
}

fn build_store(cli: &Cli, data_dir: &PathBuf) -> Result<SharedStore, Box<dyn Error>> {
    let config = load_config(data_dir);
    let use_sqlite = cli.sqlite || config.store.as_deref() == Some("sqlite");
    if use_sqlite {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("kith.db");
        klog!("sandbox: using sqlite store at {}", db_path.display());
        Ok(Arc::new(SqliteStore::open(&db_path)?))
    } else {
        klog!("sandbox: using in-memory store");
        Ok(Arc::new(MemoryStore::new()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    logging::init();

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| {
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".kith"))
            .unwrap_or_else(|_| PathBuf::from(".kith"))
    });
    let store = build_store(&cli, &data_dir)?;

    let alice_id = Identity::new("alice", "Alice Hart", "alice@example.com", "");
    let bob_id = Identity::new("bob", "Bob Osei", "bob@example.com", "");

    let mut alice = Client::new(alice_id.clone(), Arc::clone(&store), ClientConfig::default());
    let mut bob = Client::new(bob_id.clone(), Arc::clone(&store), ClientConfig::default());
    alice.start().await?;
    bob.start().await?;

    // Alice finds Bob in the profile directory.
    let hits = alice.profiles().search_by_email("bob", None).await?;
    klog!("sandbox: directory search for 'bob' found {} profile(s)", hits.len());

    // Alice sends a connection request; Bob's pending queue picks it up.
    let request_id = alice.send_connection_request(&bob_id).await?;
    let pending = bob.requests().list_pending_received("bob").await?;
    klog!(
        "sandbox: {} has {} pending request(s), first from {}",
        logging::user_id("bob"),
        pending.len(),
        pending[0].from_user_name
    );

    // Bob accepts: his own edge appears immediately, Alice's does not.
    bob.requests().accept_request(&request_id, "bob").await?;
    let bob_data = bob.user_data().get_user_data("bob").await?;
    let alice_data = alice.user_data().get_user_data("alice").await?;
    klog!(
        "sandbox: after accept, bob has {} edge(s), alice has {} (reconciliation pending)",
        bob_data.connections.len(),
        alice_data.connections.len()
    );

    // Alice's reconcile pass appends her side of the edge. (The background
    // loop would do this too; the sandbox runs it inline so the trace is
    // deterministic.)
    reconcile_accepted(&store, "alice").await?;
    let alice_data = alice.user_data().get_user_data("alice").await?;
    klog!(
        "sandbox: after reconcile, alice has {} edge(s) ({} @ {:?})",
        alice_data.connections.len(),
        alice_data.connections[0].name,
        alice_data.connections[0].trust_level
    );

    // Bob promotes Alice a tier.
    bob.user_data()
        .set_trust_level("bob", "alice", TrustLevel::Trusted)
        .await?;

    // Bob shares a vault with Alice, then revokes it.
    let vault_id = bob
        .vaults()
        .create_vault("bob", "Medical Records", "scans, reports, prescriptions")
        .await?;
    bob.vaults()
        .grant_access("bob", &vault_id, "alice", GrantOptions { expires_at: None, can_revoke: true })
        .await?;
    let shared = alice.vaults().list_vaults_shared_with_me("alice").await?;
    klog!(
        "sandbox: alice can see {} shared vault(s): {:?} (owner {})",
        shared.len(),
        shared[0].vault.name,
        shared[0].owner_name
    );

    bob.vaults().revoke_access("bob", &vault_id, "alice").await?;
    let shared = alice.vaults().list_vaults_shared_with_me("alice").await?;
    klog!("sandbox: after revoke, alice sees {} shared vault(s)", shared.len());

    alice.shutdown();
    bob.shutdown();
    klog!("sandbox: done");
    Ok(())
}
