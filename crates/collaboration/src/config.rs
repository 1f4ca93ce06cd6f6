use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use mindmap::DEFAULT_HISTORY_LIMIT;

/// Per-room actor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    /// Bound of the room command mailbox.
    pub mailbox_capacity: usize,
    /// Save the document after this many applied operations. Zero disables
    /// periodic saves.
    pub persist_every: u64,
    /// Attach a full document snapshot to every history entry.
    pub snapshot_history: bool,
    /// Depth of the shared undo stack.
    pub undo_limit: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            persist_every: 50,
            snapshot_history: true,
            undo_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub room: RoomConfig,
    /// Directory for JSON document files. `None` keeps documents in memory.
    pub store_dir: Option<PathBuf>,
    pub access_file: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            room: RoomConfig::default(),
            store_dir: None,
            access_file: None,
            log_filter: "collab_server=info,collaboration=info".to_string(),
        }
    }
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: Some(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(5);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.is_some_and(|max| attempt >= max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// `ws://` or `wss://` endpoint of the collaboration server.
    pub url: String,
    /// Opaque token handed to the access provider.
    pub token: Option<String>,
    pub backoff: BackoffPolicy,
    /// Time to wait for undo/redo/restore/history replies.
    pub request_timeout: Duration,
    /// Interval between keep-alive pings while connected.
    pub heartbeat: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            backoff: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}
