//! session-broker daemon
//!
//! Usage:
//!   session-broker [--config <path>] [--instance-id <id>]
//!
//! Builds both session managers from the config file, runs their background
//! sweeps and tears everything down on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::{error, info};

use session_broker::config::{self, BrokerConfig, ConfigStorage, StorageError, StoreBackend};
use session_broker::db::DbSessionManager;
use session_broker::session::{
    spawn_periodic, MemoryStore, MetadataStore, PeriodicTask, RedisStore, StoreError, TokenCodec,
    TokenError,
};
use session_broker::ssh::SshSessionManager;
use session_broker::state::HostKeyStoreError;

/// Expired entries in the in-process store are swept this often
const MEMORY_STORE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "session-broker")]
#[command(about = "Distributed lifecycle manager for brokered SSH and database sessions")]
struct Args {
    /// Config file (default: <config dir>/session-broker/broker.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Process identity recorded as session owner
    #[arg(long)]
    instance_id: Option<String>,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("Config error: {0}")]
    Config(#[from] StorageError),

    #[error("Token codec error: {0}")]
    Token(#[from] TokenError),

    #[error("Metadata store error: {0}")]
    Store(#[from] StoreError),

    #[error("Host key store error: {0}")]
    HostKeys(#[from] HostKeyStoreError),

    #[error("Signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    session_broker::init_logging();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<BrokerConfig, StorageError> {
    let storage = match path {
        Some(path) => ConfigStorage::with_path(path),
        None => ConfigStorage::new()?,
    };
    info!("Loading config from {:?}", storage.path());
    let config = storage.load().await?;
    config::validate(&config)?;
    Ok(config)
}

async fn run(args: Args) -> Result<(), StartupError> {
    let broker = load_config(args.config).await?;
    let instance_id = broker.resolve_instance_id(args.instance_id.as_deref());
    info!("Starting session broker as {}", instance_id);

    // validate() guarantees a secret
    let secret = broker.token.resolve_secret().unwrap_or_default();
    let codec = Arc::new(TokenCodec::new(secret, broker.token.expiration())?);

    let mut tasks: Vec<PeriodicTask> = Vec::new();
    let backend: Arc<dyn MetadataStore> = match broker.store.backend {
        StoreBackend::Redis => Arc::new(RedisStore::connect(&broker.store.redis_url).await?),
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            let purged = Arc::clone(&store);
            tasks.push(spawn_periodic(
                "memory-store-purge",
                MEMORY_STORE_PURGE_INTERVAL,
                move || {
                    let store = Arc::clone(&purged);
                    async move {
                        store.purge_expired();
                    }
                },
            ));
            store
        }
    };
    let store_timeout = broker.store.operation_timeout();

    let ssh = Arc::new(SshSessionManager::from_settings(
        &broker.ssh,
        &instance_id,
        Arc::clone(&codec),
        Arc::clone(&backend),
        store_timeout,
        None,
    )?);
    let db = Arc::new(DbSessionManager::from_settings(
        &broker.db,
        &instance_id,
        codec,
        backend,
        store_timeout,
    ));

    tasks.push(ssh.spawn_cleanup());
    tasks.push(db.spawn_cleanup());
    tasks.push(db.spawn_pool_health());

    info!("Session broker running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    for task in tasks {
        task.stop().await;
    }
    let ssh_closed = ssh.shutdown().await;
    let db_closed = db.shutdown().await;
    info!(
        "Session broker stopped ({} SSH / {} DB sessions closed)",
        ssh_closed, db_closed
    );
    Ok(())
}
