//! Collaboration server for mindmap documents.
//! Serves rooms over WebSocket; documents and grants come from a store
//! directory and an access file.

use anyhow::Result;
use clap::Parser;
use collaboration::{
    serve, AccessProvider, DocumentStore, FileStore, MemoryStore, RoomConfig, RoomRegistry,
    ServerConfig, StaticAccessProvider,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaboration server for mindmap documents")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "MINDMAP_COLLAB_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Directory with one JSON file per document (in memory when unset)
    #[arg(long, env = "MINDMAP_COLLAB_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// JSON file with user tokens and document grants
    #[arg(long, env = "MINDMAP_COLLAB_ACCESS_FILE")]
    access_file: Option<PathBuf>,

    /// Commands queued per room before senders wait
    #[arg(long, env = "MINDMAP_COLLAB_MAILBOX", default_value_t = 256)]
    mailbox_capacity: usize,

    /// Save a room after this many recorded operations (0 disables)
    #[arg(long, env = "MINDMAP_COLLAB_PERSIST_EVERY", default_value_t = 50)]
    persist_every: u64,

    /// Undo steps kept per room
    #[arg(long, env = "MINDMAP_COLLAB_UNDO_LIMIT", default_value_t = 100)]
    undo_limit: usize,

    /// Keep history entries without document snapshots
    #[arg(long, env = "MINDMAP_COLLAB_NO_SNAPSHOTS")]
    no_snapshots: bool,

    /// Tracing filter directives
    #[arg(
        long,
        env = "RUST_LOG",
        default_value = "collab_server=info,collaboration=info"
    )]
    log_filter: String,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        ServerConfig {
            bind_addr: cli.bind,
            room: RoomConfig {
                mailbox_capacity: cli.mailbox_capacity,
                persist_every: cli.persist_every,
                snapshot_history: !cli.no_snapshots,
                undo_limit: cli.undo_limit,
            },
            store_dir: cli.store_dir,
            access_file: cli.access_file,
            log_filter: cli.log_filter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from(Cli::parse());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .init();

    let store: Arc<dyn DocumentStore> = match &config.store_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            info!("Storing documents in {}", dir.display());
            Arc::new(FileStore::new(dir))
        }
        None => {
            warn!("No store directory configured; documents live in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let access: Arc<dyn AccessProvider> = match &config.access_file {
        Some(path) => {
            info!("Loading access grants from {}", path.display());
            Arc::new(StaticAccessProvider::load(path).await?)
        }
        None => {
            warn!("No access file configured; only public documents can be joined");
            Arc::new(StaticAccessProvider::new())
        }
    };

    let registry = RoomRegistry::new(access, store, config.room.clone());
    let listener = TcpListener::bind(config.bind_addr).await?;

    let result = tokio::select! {
        result = serve(listener, registry.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    // Rooms save their documents before the runtime drops them.
    registry.shutdown().await;
    result?;
    Ok(())
}
