//! Registry of live connection workers.
//!
//! The listener registers each accepted connection and hands the returned
//! [`ConnectionGuard`] to the worker. Dropping the guard removes the entry,
//! so every entry is removed exactly once however the worker ends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Identifier of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw numeric identifier.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Metadata for a tracked connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote peer address.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub accepted_at: Instant,
}

struct Entry {
    info: ConnectionInfo,
    abort: Option<AbortHandle>,
}

struct Registry {
    entries: HashMap<ConnectionId, Entry>,
    accepting: bool,
}

struct Inner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    drained: Notify,
}

/// Concurrency-safe set of active connection workers.
#[derive(Clone)]
pub struct ActiveConnections {
    inner: Arc<Inner>,
}

impl Default for ActiveConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActiveConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnections")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl ActiveConnections {
    /// Create an empty registry that accepts registrations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    entries: HashMap::new(),
                    accepting: true,
                }),
                next_id: AtomicU64::new(1),
                drained: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection from `peer`.
    ///
    /// Returns `None` once [`close_for_new`](Self::close_for_new) has been
    /// called.
    #[must_use]
    pub fn register(&self, peer: SocketAddr) -> Option<ConnectionGuard> {
        let mut registry = self.lock();
        if !registry.accepting {
            return None;
        }
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        registry.entries.insert(
            id,
            Entry {
                info: ConnectionInfo {
                    peer,
                    accepted_at: Instant::now(),
                },
                abort: None,
            },
        );
        Some(ConnectionGuard {
            id,
            connections: self.clone(),
        })
    }

    /// Record the abort handle of the task serving `id`.
    ///
    /// Does nothing if the connection already finished.
    pub fn attach(&self, id: ConnectionId, handle: AbortHandle) {
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            entry.abort = Some(handle);
        }
    }

    fn remove(&self, id: ConnectionId) {
        let now_empty = {
            let mut registry = self.lock();
            registry.entries.remove(&id).is_some() && registry.entries.is_empty()
        };
        if now_empty {
            self.inner.drained.notify_waiters();
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no connection is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Whether `id` is still registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Identifiers of live connections in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Metadata of a live connection.
    #[must_use]
    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.lock().entries.get(&id).map(|e| e.info.clone())
    }

    /// Refuse further registrations.
    pub fn close_for_new(&self) {
        self.lock().accepting = false;
    }

    /// Wait until no connection is live or `timeout` elapses.
    ///
    /// Returns whether the registry drained.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }

    /// Abort every live worker task.
    ///
    /// Entries leave the registry as the aborted tasks drop their guards.
    /// Returns the number of tasks signalled.
    pub fn abort_all(&self) -> usize {
        let handles: Vec<AbortHandle> = self
            .lock()
            .entries
            .values_mut()
            .filter_map(|e| e.abort.take())
            .collect();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }
}

/// Keeps a connection registered for as long as it lives.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    connections: ActiveConnections,
}

impl ConnectionGuard {
    /// Identifier of the guarded connection.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.remove(self.id);
    }
}
