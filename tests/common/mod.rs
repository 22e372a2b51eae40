#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use uuid::Uuid;

use session_broker::config::{HostKeyPolicy, PoolConfig};
use session_broker::db::{ConnectionPool, DbConnector, DbError, DbLink, DbSessionManager, DbTarget};
use session_broker::session::{
    LifecycleCore, MemoryStore, MetadataStore, SessionKind, SessionStore, StoreError, TokenCodec,
};
use session_broker::ssh::{
    ExecOutput, HostKey, HostKeyGate, HostTrustStore, ShellTransport, SshConnector, SshError,
    SshSessionManager, SshTarget,
};

pub const SECRET: &[u8] = b"integration-secret-0123456789abcdef";
pub const STORE_TIMEOUT: Duration = Duration::from_secs(1);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub fn codec() -> Arc<TokenCodec> {
    Arc::new(TokenCodec::new(SECRET, Duration::from_secs(600)).unwrap())
}

pub fn host_key(material: &[u8]) -> HostKey {
    HostKey::new("ssh-ed25519", BASE64.encode(material))
}

pub fn target(host: &str) -> SshTarget {
    SshTarget::with_password(host, 22, "deploy", "hunter2")
}

// ═══════════════════════════════════════════════════════════════════════════
// SSH fakes
// ═══════════════════════════════════════════════════════════════════════════

/// Counters shared by every transport a connector hands out
#[derive(Default)]
pub struct ShellProbe {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub dead: AtomicBool,
}

struct FakeShell {
    probe: Arc<ShellProbe>,
    closed: AtomicBool,
}

#[async_trait]
impl ShellTransport for FakeShell {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn probe(&self, _timeout: Duration) -> bool {
        self.is_connected() && !self.probe.dead.load(Ordering::SeqCst)
    }

    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, SshError> {
        Ok(ExecOutput {
            stdout: format!("ran {}", command),
            stderr: String::new(),
            exit_status: Some(0),
        })
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.probe.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Presents a fixed host key to the gate, then "connects"
pub struct FakeSshConnector {
    gate: HostKeyGate,
    presented: Mutex<HostKey>,
    pub probe: Arc<ShellProbe>,
}

impl FakeSshConnector {
    pub fn present(&self, key: HostKey) {
        *self.presented.lock() = key;
    }
}

#[async_trait]
impl SshConnector for FakeSshConnector {
    async fn connect(
        &self,
        user_id: Uuid,
        target: &SshTarget,
    ) -> Result<Box<dyn ShellTransport>, SshError> {
        let key = self.presented.lock().clone();
        self.gate.admit(user_id, &target.host, target.port, &key).await?;
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeShell {
            probe: Arc::clone(&self.probe),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct SshFixture {
    pub manager: Arc<SshSessionManager>,
    pub connector: Arc<FakeSshConnector>,
    pub trust: Arc<HostTrustStore>,
}

pub fn ssh_fixture(
    instance_id: &str,
    backend: Arc<dyn MetadataStore>,
    policy: HostKeyPolicy,
    idle_timeout: Duration,
) -> SshFixture {
    let trust = Arc::new(HostTrustStore::in_memory());
    let connector = Arc::new(FakeSshConnector {
        gate: HostKeyGate::new(Arc::clone(&trust), policy, None),
        presented: Mutex::new(host_key(b"server-key-a")),
        probe: Arc::new(ShellProbe::default()),
    });
    let store = SessionStore::new(backend, SessionKind::Ssh, STORE_TIMEOUT);
    let core = LifecycleCore::new(instance_id, idle_timeout, PROBE_TIMEOUT, codec(), store);
    let manager = Arc::new(SshSessionManager::new(
        core,
        connector.clone(),
        Arc::clone(&trust),
    ));
    SshFixture {
        manager,
        connector,
        trust,
    }
}

/// Auto-accepting fixture on a fresh in-memory store
pub fn simple_ssh(idle_timeout: Duration) -> (SshFixture, Arc<MemoryStore>) {
    let backend = Arc::new(MemoryStore::new());
    let fixture = ssh_fixture(
        "node-a",
        backend.clone(),
        HostKeyPolicy::AutoAccept,
        idle_timeout,
    );
    (fixture, backend)
}

// ═══════════════════════════════════════════════════════════════════════════
// DB fakes
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct DbProbe {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    /// Physical connections open right now
    pub open_now: AtomicUsize,
    pub peak_open: AtomicUsize,
    pub refuse: AtomicBool,
}

struct FakeLink {
    probe: Arc<DbProbe>,
    closed: bool,
}

#[async_trait]
impl DbLink for FakeLink {
    async fn ping(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    async fn execute(&mut self, _sql: &str) -> Result<u64, DbError> {
        Ok(1)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.probe.closed.fetch_add(1, Ordering::SeqCst);
            self.probe.open_now.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeDbConnector {
    pub probe: Arc<DbProbe>,
    /// Simulated handshake latency, widens acquire races
    pub latency: Duration,
}

#[async_trait]
impl DbConnector for FakeDbConnector {
    async fn connect(&self, _target: &DbTarget) -> Result<Box<dyn DbLink>, DbError> {
        tokio::time::sleep(self.latency).await;
        if self.probe.refuse.load(Ordering::SeqCst) {
            return Err(DbError::AuthenticationFailed("password rejected".into()));
        }
        self.probe.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.probe.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(FakeLink {
            probe: Arc::clone(&self.probe),
            closed: false,
        }))
    }
}

pub struct DbFixture {
    pub manager: Arc<DbSessionManager>,
    pub probe: Arc<DbProbe>,
}

pub fn db_fixture(
    backend: Arc<dyn MetadataStore>,
    max_connections: usize,
    idle_timeout: Duration,
    latency: Duration,
) -> DbFixture {
    let probe = Arc::new(DbProbe::default());
    let connector = Arc::new(FakeDbConnector {
        probe: Arc::clone(&probe),
        latency,
    });
    let pool_config = PoolConfig {
        max_connections_per_session: max_connections,
        ..Default::default()
    };
    let pool = Arc::new(ConnectionPool::new(connector, pool_config));
    let store = SessionStore::new(backend, SessionKind::Db, STORE_TIMEOUT);
    let core = LifecycleCore::new("node-a", idle_timeout, PROBE_TIMEOUT, codec(), store);
    DbFixture {
        manager: Arc::new(DbSessionManager::new(core, pool)),
        probe,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Store fakes
// ═══════════════════════════════════════════════════════════════════════════

/// Store whose writes can be switched off, or failed one at a time
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub writes_fail: AtomicBool,
    /// Fail only the n-th `set` (1-based); 0 disables
    pub fail_set_number: AtomicUsize,
    sets: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_set(&self, n: usize) {
        self.fail_set_number.store(n, Ordering::SeqCst);
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let n = self.sets.fetch_add(1, Ordering::SeqCst) + 1;
        if self.writes_fail.load(Ordering::SeqCst)
            || n == self.fail_set_number.load(Ordering::SeqCst)
        {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }
}
