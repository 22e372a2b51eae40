mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use common::*;
use session_broker::config::HostKeyPolicy;
use session_broker::session::{MemoryStore, SessionError, SessionKey, SessionStore, SessionKind};
use session_broker::ssh::HostKeyStatus;

const IDLE: Duration = Duration::from_secs(600);

#[tokio::test]
async fn init_token_decodes_to_requested_key() {
    let (fx, _) = simple_ssh(IDLE);
    let user = Uuid::new_v4();
    let server = Uuid::new_v4();

    let grant = fx.manager.init(user, server, target("build-01")).await.unwrap();
    let expected = SessionKey::ssh(user, server);

    assert_eq!(grant.key(), expected);
    assert_eq!(fx.manager.core().codec().validate(&grant.token), Some(expected));
    assert!(grant.expires_in_ms > 0);
}

#[tokio::test]
async fn local_session_present_until_release() {
    let (fx, backend) = simple_ssh(IDLE);
    let key = SessionKey::ssh(Uuid::new_v4(), Uuid::new_v4());

    let grant = fx
        .manager
        .init(key.user_id, key.resource_id, target("build-01"))
        .await
        .unwrap();
    let session = fx.manager.local_session(&key).await.expect("live handle");
    let out = session.exec("uptime", Duration::from_secs(1)).await.unwrap();
    assert_eq!(out.stdout, "ran uptime");

    fx.manager.release(&grant.token).await.unwrap();
    assert!(fx.manager.local_session(&key).await.is_none());
    assert_eq!(fx.connector.probe.disconnects.load(Ordering::SeqCst), 1);
    assert!(backend.is_empty());

    // Idempotent
    fx.manager.release(&grant.token).await.unwrap();
}

#[tokio::test]
async fn old_token_is_dead_after_rotation() {
    let (fx, _) = simple_ssh(IDLE);
    let grant = fx
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("build-01"))
        .await
        .unwrap();

    let rotated = fx.manager.keepalive(&grant.token).await.unwrap().unwrap();
    assert_ne!(rotated.token, grant.token);
    assert!(fx.manager.keepalive(&grant.token).await.unwrap().is_none());
    assert!(fx.manager.keepalive(&rotated.token).await.unwrap().is_some());
}

#[tokio::test]
async fn externally_reaped_session_purges_token_mapping() {
    let (fx, backend) = simple_ssh(IDLE);
    let grant = fx
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("build-01"))
        .await
        .unwrap();
    let key = grant.key();

    // Another process reaps the record
    let store = SessionStore::new(backend.clone(), SessionKind::Ssh, STORE_TIMEOUT);
    assert!(store.delete_metadata(&key).await.unwrap());
    assert!(store.token_key(&grant.token).await.unwrap().is_some());

    assert!(fx.manager.keepalive(&grant.token).await.unwrap().is_none());
    assert!(store.token_key(&grant.token).await.unwrap().is_none());
    assert!(backend.keys_with_prefix("session:ssh:token:").is_empty());
}

#[tokio::test]
async fn idle_sweep_reclaims_both_tiers() {
    let (fx, _) = simple_ssh(Duration::from_millis(100));
    let grant = fx
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("build-01"))
        .await
        .unwrap();
    let key = grant.key();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let report = fx.manager.cleanup().await;

    assert_eq!(report.evicted_idle, 1);
    assert!(fx.manager.core().registry().peek(&key).is_none());
    assert!(fx.manager.session_metadata(&key).await.unwrap().is_none());
    assert_eq!(fx.connector.probe.disconnects.load(Ordering::SeqCst), 1);

    // A second pass has nothing left to close
    assert_eq!(fx.manager.cleanup().await.examined, 0);
    assert_eq!(fx.connector.probe.disconnects.load(Ordering::SeqCst), 1);
    assert!(fx.manager.keepalive(&grant.token).await.unwrap().is_none());
}

#[tokio::test]
async fn dead_connection_is_swept() {
    let (fx, backend) = simple_ssh(IDLE);
    let grant = fx
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("build-01"))
        .await
        .unwrap();

    fx.connector.probe.dead.store(true, Ordering::SeqCst);
    let report = fx.manager.cleanup().await;

    assert_eq!(report.evicted_dead, 1);
    assert!(fx.manager.local_session(&grant.key()).await.is_none());
    assert!(backend.is_empty());
}

#[tokio::test]
async fn host_trust_check_states() {
    let trust = session_broker::ssh::HostTrustStore::in_memory();
    let user = Uuid::new_v4();
    let key_a = host_key(b"server-key-a");

    assert!(matches!(
        trust.check(user, "build-01", 22, &key_a),
        HostKeyStatus::NotIncluded { .. }
    ));
    trust.add(user, "build-01", 22, &key_a);
    assert_eq!(trust.check(user, "build-01", 22, &key_a), HostKeyStatus::Ok);
    assert!(matches!(
        trust.check(user, "build-01", 22, &host_key(b"server-key-b")),
        HostKeyStatus::Changed { .. }
    ));
}

#[tokio::test]
async fn changed_host_key_blocks_init_under_strict_policy() {
    let backend = Arc::new(MemoryStore::new());
    let fx = ssh_fixture("node-a", backend.clone(), HostKeyPolicy::Strict, IDLE);
    let user = Uuid::new_v4();
    let server = Uuid::new_v4();
    fx.trust.add(user, "build-01", 22, &host_key(b"server-key-a"));

    fx.connector.present(host_key(b"server-key-a"));
    let grant = fx.manager.init(user, server, target("build-01")).await.unwrap();
    fx.manager.release(&grant.token).await.unwrap();

    fx.connector.present(host_key(b"mitm-key"));
    let err = fx
        .manager
        .init(user, server, target("build-01"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::HostTrustViolation(_)));
    assert!(!err.retryable());
    assert!(fx
        .manager
        .local_session(&SessionKey::ssh(user, server))
        .await
        .is_none());
    assert!(backend.is_empty());
    assert_eq!(fx.connector.probe.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_host_rejected_by_strict_accepted_by_auto() {
    let user = Uuid::new_v4();

    let strict = ssh_fixture(
        "node-a",
        Arc::new(MemoryStore::new()),
        HostKeyPolicy::Strict,
        IDLE,
    );
    let err = strict
        .manager
        .init(user, Uuid::new_v4(), target("new-host"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::HostTrustViolation(_)));

    let (auto, _) = simple_ssh(IDLE);
    auto.manager
        .init(user, Uuid::new_v4(), target("new-host"))
        .await
        .unwrap();
    assert_eq!(auto.trust.list_for_host(user, "new-host", 22).len(), 1);
}

#[tokio::test]
async fn rotate_then_release_scenario() {
    let (fx, _) = simple_ssh(IDLE);
    let t1 = fx
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("h"))
        .await
        .unwrap()
        .token;

    let t2 = fx.manager.keepalive(&t1).await.unwrap().unwrap().token;
    assert_ne!(t1, t2);

    fx.manager.release(&t2).await.unwrap();
    assert!(fx.manager.keepalive(&t2).await.unwrap().is_none());
    assert!(fx.manager.keepalive(&t1).await.unwrap().is_none());
}

#[tokio::test]
async fn keepalive_on_other_process_takes_ownership() {
    let backend = Arc::new(MemoryStore::new());
    let a = ssh_fixture("node-a", backend.clone(), HostKeyPolicy::AutoAccept, IDLE);
    let b = ssh_fixture("node-b", backend.clone(), HostKeyPolicy::AutoAccept, IDLE);

    let grant = a
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("h"))
        .await
        .unwrap();
    let key = grant.key();

    let rotated = b.manager.keepalive(&grant.token).await.unwrap().unwrap();
    let record = a.manager.session_metadata(&key).await.unwrap().unwrap();
    assert_eq!(record.owning_process_id, "node-b");
    assert_eq!(record.active_token, rotated.token);

    // The connection itself stays where it was opened
    assert!(a.manager.local_session(&key).await.is_some());
    assert!(b.manager.local_session(&key).await.is_none());

    // Release through either process tears down the record
    b.manager.release(&rotated.token).await.unwrap();
    assert!(a.manager.session_metadata(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn store_outage_rolls_back_init() {
    let backend = Arc::new(FlakyStore::default());
    let fx = ssh_fixture("node-a", backend.clone(), HostKeyPolicy::AutoAccept, IDLE);
    backend.writes_fail.store(true, Ordering::SeqCst);

    let user = Uuid::new_v4();
    let server = Uuid::new_v4();
    let err = fx.manager.init(user, server, target("h")).await.unwrap_err();

    assert!(matches!(err, SessionError::StoreUnavailable(_)));
    assert_eq!(fx.connector.probe.connects.load(Ordering::SeqCst), 1);
    assert_eq!(fx.connector.probe.disconnects.load(Ordering::SeqCst), 1);
    assert!(fx
        .manager
        .local_session(&SessionKey::ssh(user, server))
        .await
        .is_none());
    assert!(!fx.manager.has_any_session_for_user(user));
}

#[tokio::test]
async fn garbage_tokens_are_harmless() {
    let (fx, _) = simple_ssh(IDLE);
    assert!(fx.manager.keepalive("not-a-token").await.unwrap().is_none());
    fx.manager.release("garbage.token.sig").await.unwrap();
}

#[tokio::test]
async fn releasing_rotated_out_token_leaves_session_running() {
    let (fx, _) = simple_ssh(IDLE);
    let grant = fx
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("h"))
        .await
        .unwrap();
    let rotated = fx.manager.keepalive(&grant.token).await.unwrap().unwrap();

    fx.manager.release(&grant.token).await.unwrap();

    assert_eq!(fx.connector.probe.disconnects.load(Ordering::SeqCst), 0);
    assert!(fx.manager.local_session(&grant.key()).await.is_some());
    assert!(fx.manager.keepalive(&rotated.token).await.unwrap().is_some());
}

#[tokio::test]
async fn keepalive_during_store_outage_fails_safe() {
    let backend = Arc::new(FlakyStore::default());
    let fx = ssh_fixture("node-a", backend.clone(), HostKeyPolicy::AutoAccept, IDLE);
    let grant = fx
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("h"))
        .await
        .unwrap();

    backend.writes_fail.store(true, Ordering::SeqCst);
    let err = fx.manager.keepalive(&grant.token).await.unwrap_err();
    assert!(matches!(err, SessionError::StoreUnavailable(_)));
    assert!(err.retryable());

    backend.writes_fail.store(false, Ordering::SeqCst);
    assert!(fx.manager.keepalive(&grant.token).await.unwrap().is_some());
}

#[tokio::test]
async fn keepalive_interrupted_mid_rotation_keeps_old_token() {
    let backend = Arc::new(FlakyStore::default());
    let fx = ssh_fixture("node-a", backend.clone(), HostKeyPolicy::AutoAccept, IDLE);
    let grant = fx
        .manager
        .init(Uuid::new_v4(), Uuid::new_v4(), target("h"))
        .await
        .unwrap();
    let key = grant.key();

    // Rotation writes the new mapping, then the record
    for step in 1..=2 {
        backend.fail_set(backend.sets() + step);
        let err = fx.manager.keepalive(&grant.token).await.unwrap_err();
        assert!(matches!(err, SessionError::StoreUnavailable(_)));

        let record = fx.manager.session_metadata(&key).await.unwrap().unwrap();
        assert_eq!(record.active_token, grant.token);
        assert_eq!(
            backend.inner.keys_with_prefix("session:ssh:token:").len(),
            1
        );
    }

    backend.fail_set(0);
    let rotated = fx.manager.keepalive(&grant.token).await.unwrap().unwrap();
    assert!(fx.manager.local_session(&key).await.is_some());
    assert!(fx.manager.keepalive(&rotated.token).await.unwrap().is_some());
    assert_eq!(
        backend.inner.keys_with_prefix("session:ssh:token:").len(),
        1
    );
}

#[tokio::test]
async fn sweeping_superseded_connection_spares_newer_session() {
    let backend = Arc::new(MemoryStore::new());
    let a = ssh_fixture("node-a", backend.clone(), HostKeyPolicy::AutoAccept, IDLE);
    let b = ssh_fixture("node-b", backend.clone(), HostKeyPolicy::AutoAccept, IDLE);
    let user = Uuid::new_v4();
    let server = Uuid::new_v4();

    a.manager.init(user, server, target("h")).await.unwrap();
    let newer = b.manager.init(user, server, target("h")).await.unwrap();

    a.connector.probe.dead.store(true, Ordering::SeqCst);
    let report = a.manager.cleanup().await;
    assert_eq!(report.evicted_dead, 1);

    assert!(b.manager.local_session(&newer.key()).await.is_some());
    assert!(b.manager.keepalive(&newer.token).await.unwrap().is_some());
}

#[tokio::test]
async fn superseded_connection_is_not_kept_alive_by_newer_session() {
    let backend = Arc::new(MemoryStore::new());
    let a = ssh_fixture(
        "node-a",
        backend.clone(),
        HostKeyPolicy::AutoAccept,
        Duration::from_millis(100),
    );
    let b = ssh_fixture("node-b", backend.clone(), HostKeyPolicy::AutoAccept, IDLE);
    let user = Uuid::new_v4();
    let server = Uuid::new_v4();

    a.manager.init(user, server, target("h")).await.unwrap();
    let newer = b.manager.init(user, server, target("h")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(b.manager.update_access_time(&newer.key()).await.unwrap());

    let report = a.manager.cleanup().await;
    assert_eq!(report.evicted_idle, 1);
    assert_eq!(a.connector.probe.disconnects.load(Ordering::SeqCst), 1);

    let record = b.manager.session_metadata(&newer.key()).await.unwrap().unwrap();
    assert_eq!(record.active_token, newer.token);
}
