//! # palaver-server
//!
//! TCP chat server. This binary provides:
//! - **Single-session logins**: a second login for a username evicts the
//!   first connection after a terminal notice
//! - **A well-known public room** every user joins at login
//! - **Named groups** with creator-only dissolution and invitations
//! - **Direct and group messaging** with per-conversation history in SQLite
//!
//! The wire protocol is length-prefixed bincode envelopes; see
//! `palaver-shared` for the types.

mod config;
mod connection;
mod directory;
mod dispatcher;
mod error;
mod net;
mod registry;
mod router;
mod stores;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use palaver_store::Database;

use crate::config::ServerConfig;
use crate::directory::GroupDirectory;
use crate::dispatcher::Dispatcher;
use crate::registry::SessionRegistry;
use crate::router::MessageRouter;
use crate::stores::{CredentialStore, HistoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palaver_server=debug")),
        )
        .init();

    info!("Starting palaver server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let db = Arc::new(match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::open_default()?,
    });
    if let Some(path) = db.path() {
        info!(path = %path.display(), "Database ready");
    }

    let registry = Arc::new(SessionRegistry::new());
    let directory = Arc::new(GroupDirectory::load(Arc::clone(&db))?);
    let router = Arc::new(MessageRouter::new(
        Arc::clone(&registry),
        Arc::clone(&directory),
        Arc::clone(&db) as Arc<dyn HistoryStore>,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&directory),
        router,
        Arc::clone(&db) as Arc<dyn CredentialStore>,
        Arc::clone(&db) as Arc<dyn HistoryStore>,
        &config,
    ));

    // Periodic history retention (hourly, deletes messages past the cutoff)
    if let Some(days) = config.history_retention_days {
        let retention_db = Arc::clone(&db);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
                match retention_db.prune_messages_before(cutoff) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Pruned expired history"),
                    Err(e) => tracing::warn!(error = %e, "History pruning failed"),
                }
            }
        });
    }

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Listening for clients");

    tokio::select! {
        result = accept_loop(listener, dispatcher, config.outbound_queue) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Accept loop failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    queue_capacity: usize,
) -> anyhow::Result<()> {
    loop {
        let (stream, _peer) = listener.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(net::handle_connection(stream, dispatcher, queue_capacity));
    }
}
