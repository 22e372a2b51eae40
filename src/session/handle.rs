//! Local connection handles
//!
//! A handle owns exactly one live native connection and never leaves the
//! process that created it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

/// Identity, creation / last-access timestamps and a one-shot close latch
#[derive(Debug)]
pub struct Activity {
    /// Distinguishes this connection from later ones opened for the same key
    session_id: Uuid,
    created_at: i64,
    last_accessed: AtomicI64,
    closed: AtomicBool,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    pub fn new() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            session_id: Uuid::new_v4(),
            created_at: now,
            last_accessed: AtomicI64::new(now),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Unix ms
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Unix ms
    pub fn last_accessed(&self) -> i64 {
        self.last_accessed.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_accessed
            .fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
    }

    /// Time since the last access
    pub fn idle_for(&self) -> Duration {
        let idle_ms = Utc::now().timestamp_millis() - self.last_accessed();
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the close latch. Only the first caller gets `true`.
    pub fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A process-local live connection (shell or database)
#[async_trait]
pub trait LocalHandle: Send + Sync + 'static {
    fn activity(&self) -> &Activity;

    /// Bounded liveness probe. A closed handle is never alive.
    async fn is_alive(&self, timeout: Duration) -> bool;

    /// Tear down the native connection. Invoked at most once, through [`LocalHandle::close`].
    async fn shutdown(&self);

    /// Idempotent close
    async fn close(&self) {
        if self.activity().mark_closed() {
            self.shutdown().await;
        }
    }
}
