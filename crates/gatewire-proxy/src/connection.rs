//! Connection utilities
//!
//! TCP keepalive setup and the registry of live client sessions.

use parking_lot::RwLock;
use socket2::SockRef;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Configure TCP keepalive and TCP_NODELAY on a socket
pub fn configure_tcp_keepalive(stream: &tokio::net::TcpStream, keepalive_secs: u64) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let socket = SockRef::from(stream);

    if let Err(e) = socket.set_keepalive(true) {
        warn!("Failed to enable TCP keepalive: {}", e);
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to configure TCP keepalive timing: {}", e);
    } else {
        debug!("TCP keepalive configured: {}s", keepalive_secs);
    }
}

/// One live client session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub worker: usize,
    /// Set once the backend connection is established
    pub backend: Option<String>,
    pub started: Instant,
}

/// Live sessions across all workers.
///
/// Sessions themselves are owned by their worker thread; this only holds
/// descriptive copies for reporting.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: SocketAddr, worker: usize) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.write().insert(
            id,
            SessionInfo {
                id,
                peer,
                worker,
                backend: None,
                started: Instant::now(),
            },
        );
        id
    }

    pub fn set_backend(&self, id: &Uuid, backend: &str) {
        if let Some(info) = self.sessions.write().get_mut(id) {
            info.backend = Some(backend.to_string());
        }
    }

    pub fn unregister(&self, id: &Uuid) -> Option<SessionInfo> {
        self.sessions.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Sessions per worker, indexed by worker number
    pub fn per_worker(&self, workers: usize) -> Vec<usize> {
        let mut counts = vec![0; workers];
        for info in self.sessions.read().values() {
            if let Some(count) = counts.get_mut(info.worker) {
                *count += 1;
            }
        }
        counts
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.started);
        sessions
    }
}
