//! Local Session Registry
//!
//! Thread-safe map of live handles using DashMap for concurrent access.
//! A handle is only ever handed out after passing a liveness probe; dead
//! handles are evicted and closed on the spot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::handle::LocalHandle;
use super::key::SessionKey;

/// Registry counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub live: usize,
    pub inserted: u64,
    pub evicted_dead: u64,
}

/// Per-process map from [`SessionKey`] to live handle
pub struct LocalRegistry<H: LocalHandle> {
    handles: DashMap<SessionKey, Arc<H>>,
    probe_timeout: Duration,
    inserted: AtomicU64,
    evicted_dead: AtomicU64,
}

impl<H: LocalHandle> LocalRegistry<H> {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            handles: DashMap::new(),
            probe_timeout,
            inserted: AtomicU64::new(0),
            evicted_dead: AtomicU64::new(0),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Register a handle, returning the one it displaced (not closed)
    pub fn insert(&self, key: SessionKey, handle: Arc<H>) -> Option<Arc<H>> {
        self.inserted.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(key, handle)
    }

    /// Live handle for `key`; a dead one is evicted and closed instead
    pub async fn get(&self, key: &SessionKey) -> Option<Arc<H>> {
        // Clone out so no shard lock is held across the probe
        let handle = self.handles.get(key).map(|h| Arc::clone(h.value()))?;

        if handle.is_alive(self.probe_timeout).await {
            return Some(handle);
        }

        debug!("Local handle for {} failed liveness probe", key);
        if self.remove_if_same(key, &handle) {
            self.evicted_dead.fetch_add(1, Ordering::Relaxed);
            info!("Evicted dead local session {}", key);
        }
        handle.close().await;
        None
    }

    /// Handle for `key` without probing
    pub fn peek(&self, key: &SessionKey) -> Option<Arc<H>> {
        self.handles.get(key).map(|h| Arc::clone(h.value()))
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<H>> {
        self.handles.remove(key).map(|(_, h)| h)
    }

    /// Remove `key` only while it still maps to `handle`
    pub fn remove_if_same(&self, key: &SessionKey, handle: &Arc<H>) -> bool {
        self.handles
            .remove_if(key, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    /// Point-in-time copy of every entry
    pub fn snapshot(&self) -> Vec<(SessionKey, Arc<H>)> {
        self.handles
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    pub fn has_user(&self, user_id: Uuid) -> bool {
        self.handles.iter().any(|e| e.key().user_id == user_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live: self.handles.len(),
            inserted: self.inserted.load(Ordering::Relaxed),
            evicted_dead: self.evicted_dead.load(Ordering::Relaxed),
        }
    }
}
