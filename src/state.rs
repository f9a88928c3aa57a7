//! Shared application state.
//!
//! Holds the configuration, the registry of live bridge sessions and the
//! WebSocket connection counters used by the connection limit middleware.
//! Sessions never share anything through here beyond bookkeeping.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::core::session::SessionState;
use crate::handlers::relay::BridgeSessionConfig;

/// Why a connection slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

/// Bookkeeping for one live bridge session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub state: SessionState,
    pub peer: Option<SocketAddr>,
    pub created_at: Instant,
}

impl SessionRecord {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Live bridge sessions keyed by session id.
///
/// Entries are added when a caller is accepted and removed when its session
/// reaches Closed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, peer: Option<SocketAddr>) {
        self.sessions.insert(
            id.to_string(),
            SessionRecord {
                id: id.to_string(),
                state: SessionState::Idle,
                peer,
                created_at: Instant::now(),
            },
        );
    }

    pub fn set_state(&self, id: &str, state: SessionState) {
        if let Some(mut record) = self.sessions.get_mut(id) {
            record.state = state;
        }
    }

    pub fn remove(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.remove(id).map(|(_, record)| record)
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.get(id).map(|record| record.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions currently in `state`.
    pub fn count_in(&self, state: SessionState) -> usize {
        self.sessions
            .iter()
            .filter(|record| record.state == state)
            .count()
    }
}

/// Application state shared by every handler.
pub struct AppState {
    pub config: ServerConfig,
    pub sessions: Arc<SessionRegistry>,

    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, usize>,
    // Serializes acquire so the global check and increment are one step
    acquire_lock: Mutex<()>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Arc::new(SessionRegistry::new()),
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
            acquire_lock: Mutex::new(()),
        })
    }

    /// Settings every new bridge session starts with.
    pub fn bridge_config(&self) -> BridgeSessionConfig {
        BridgeSessionConfig {
            connect_timeout: self.config.connect_timeout(),
            session_defaults: self.config.session_defaults.clone(),
        }
    }

    /// Reserve a WebSocket slot for `ip`.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let _guard = self.acquire_lock.lock();

        if let Some(max) = self.config.max_websocket_connections
            && self.ws_connections.load(Ordering::Acquire) >= max
        {
            return Err(ConnectionLimitError::GlobalLimitReached);
        }

        let mut per_ip = self.ip_connections.entry(ip).or_insert(0);
        if *per_ip >= self.config.max_connections_per_ip as usize {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }
        *per_ip += 1;
        drop(per_ip);

        self.ws_connections.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Give back a slot taken by `try_acquire_connection`.
    pub fn release_connection(&self, ip: IpAddr) {
        let _guard = self.acquire_lock.lock();

        let now_empty = match self.ip_connections.get_mut(&ip) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => {
                tracing::warn!(ip = %ip, "Released a connection that was never acquired");
                return;
            }
        };
        if now_empty {
            self.ip_connections.remove(&ip);
        }

        let _ = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Acquire)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.ip_connections.get(ip).map(|count| *count).unwrap_or(0)
    }
}
