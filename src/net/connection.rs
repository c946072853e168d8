//! Connection identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track live connection tasks so shutdown can wait for or abort them
//! - Publish the live count for `ProxyHandle::active_connections`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live connection tasks, keyed by id.
///
/// Only touched when a connection starts or finishes.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    tasks: Mutex<HashMap<ConnectionId, Option<AbortHandle>>>,
    count: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                tasks: Mutex::new(HashMap::new()),
                count,
            }),
        }
    }

    /// Record a new connection. It stays registered until the guard drops.
    pub fn register(&self, id: ConnectionId) -> ConnectionGuard {
        let mut tasks = self.inner.lock();
        tasks.insert(id, None);
        self.inner.publish(tasks.len());
        ConnectionGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Remember how to abort the task serving `id`.
    pub fn attach_abort(&self, id: ConnectionId, handle: AbortHandle) {
        let mut tasks = self.inner.lock();
        if let Some(slot) = tasks.get_mut(&id) {
            *slot = Some(handle);
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> usize {
        *self.inner.count.borrow()
    }

    /// Wait until no connection is registered. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.count.subscribe();
        let idle = tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0))
            .await
            .is_ok();
        idle
    }

    /// Abort every registered task. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        // abort() only schedules cancellation, so holding the lock here is fine.
        let tasks = self.inner.lock();
        let mut aborted = 0;
        for handle in tasks.values().flatten() {
            handle.abort();
            aborted += 1;
        }
        aborted
    }

    fn deregister(&self, id: ConnectionId) {
        let mut tasks = self.inner.lock();
        tasks.remove(&id);
        self.inner.publish(tasks.len());
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Option<AbortHandle>>> {
        // The map stays consistent even if a holder panicked.
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, count: usize) {
        self.count.send_replace(count);
        metrics::set_active_connections(count);
    }
}

/// Guard that tracks a connection's lifetime.
/// Deregisters the connection when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: ConnectionRegistry,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
