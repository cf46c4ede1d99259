use std::sync::atomic::Ordering;

use super::support::*;
use crate::core::bus::BotEvent;
use crate::core::error::BotError;
use crate::core::store::types::BotStatus;
use crate::core::worker::{BotConfig, ConfigPatch};

#[tokio::test]
async fn start_from_session_registers_and_runs_the_worker() {
    let h = harness(MockGateway::never());
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();

    h.manager
        .start_from_session("10001", "sess-1", BotConfig::default())
        .await
        .unwrap();

    wait_for("worker started", async || {
        h.factory.built() == 1
            && h.factory.last().started_with.lock().unwrap().as_deref() == Some("sess-1")
    })
    .await;
    wait_for("view reports running", async || {
        let views = h.manager.list_accounts().await.unwrap();
        views.iter().any(|v| v.uin == "10001" && v.status == BotStatus::Running)
    })
    .await;
    assert_eq!(h.manager.active_bots().await, vec!["10001".to_string()]);
}

#[tokio::test]
async fn starting_again_replaces_the_previous_worker() {
    let h = harness(MockGateway::never());
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();

    h.manager
        .start_from_session("10001", "sess-1", BotConfig::default())
        .await
        .unwrap();
    wait_for("first worker up", async || h.factory.built() == 1).await;
    let first = h.factory.last();

    h.manager
        .start_from_session("10001", "sess-2", BotConfig::default())
        .await
        .unwrap();

    wait_for("old worker destroyed", async || {
        first.destroyed.load(Ordering::Relaxed)
    })
    .await;
    wait_for("replacement started", async || {
        h.factory.built() == 2
            && h.factory.last().started_with.lock().unwrap().as_deref() == Some("sess-2")
    })
    .await;
    assert_eq!(h.manager.active_bots().await.len(), 1);
}

#[tokio::test]
async fn stop_is_durable_and_idempotent() {
    let h = harness(MockGateway::never());
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    h.manager
        .start_from_session("10001", "sess-1", BotConfig::default())
        .await
        .unwrap();
    wait_for("worker running", async || {
        h.store.get("10001").await.unwrap().unwrap().status == BotStatus::Running
    })
    .await;

    h.manager.stop("10001").await.unwrap();
    assert_eq!(
        h.store.get("10001").await.unwrap().unwrap().status,
        BotStatus::Stopped
    );
    // The handle stays registered for its last snapshot.
    assert_eq!(h.manager.active_bots().await, vec!["10001".to_string()]);

    h.manager.stop("10001").await.expect("second stop is a no-op");

    let err = h.manager.stop("99999").await.expect_err("unknown uin");
    assert!(matches!(err, BotError::NotFound(_)));
}

#[tokio::test]
async fn stop_is_visible_before_worker_teardown_completes() {
    let h = harness(MockGateway::never());
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    h.manager
        .start_from_session("10001", "sess-1", BotConfig::default())
        .await
        .unwrap();
    wait_for("worker running", async || {
        h.store.get("10001").await.unwrap().unwrap().status == BotStatus::Running
    })
    .await;

    // This worker never finishes tearing down; its snapshot keeps claiming
    // running.
    h.factory.last().ignore_stop.store(true, Ordering::Relaxed);
    h.manager.stop("10001").await.unwrap();

    let views = h.manager.list_accounts().await.unwrap();
    assert_eq!(views[0].status, BotStatus::Stopped);
}

#[tokio::test]
async fn restart_reuses_the_stored_credential() {
    let h = harness(MockGateway::never());
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    h.store.save_token("10001", "sess-9").await.unwrap();

    h.manager.restart("10001").await.unwrap();

    wait_for("worker started from stored token", async || {
        h.factory.built() == 1
            && h.factory.last().started_with.lock().unwrap().as_deref() == Some("sess-9")
    })
    .await;
}

#[tokio::test]
async fn restart_requires_record_and_credential() {
    let h = harness(MockGateway::never());

    let err = h.manager.restart("99999").await.expect_err("no record");
    assert!(matches!(err, BotError::NotFound(_)));

    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    let err = h.manager.restart("10001").await.expect_err("no token");
    assert!(matches!(err, BotError::NoCredential(_)));
}

#[tokio::test]
async fn remove_tears_down_worker_and_record() {
    let h = harness(MockGateway::never());
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    h.manager
        .start_from_session("10001", "sess-1", BotConfig::default())
        .await
        .unwrap();
    wait_for("worker up", async || h.factory.built() == 1).await;
    let worker = h.factory.last();

    h.manager.remove("10001").await.unwrap();

    assert!(worker.destroyed.load(Ordering::Relaxed));
    assert!(h.store.get("10001").await.unwrap().is_none());
    assert!(h.manager.active_bots().await.is_empty());

    let err = h.manager.remove("10001").await.expect_err("already gone");
    assert!(matches!(err, BotError::NotFound(_)));
}

#[tokio::test]
async fn update_config_persists_and_reaches_the_live_worker() {
    let h = harness(MockGateway::never());
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    h.manager
        .start_from_session("10001", "sess-1", BotConfig::default())
        .await
        .unwrap();
    wait_for("worker up", async || h.factory.built() == 1).await;

    let patch = ConfigPatch {
        farm_interval_ms: Some(5_000),
        preferred_seed_id: Some(31),
        auto_start: Some(true),
        ..Default::default()
    };
    h.manager.update_config("10001", &patch).await.unwrap();

    let record = h.store.get("10001").await.unwrap().unwrap();
    assert_eq!(record.farm_interval_ms, 5_000);
    assert_eq!(record.preferred_seed_id, 31);
    assert!(record.auto_start);

    let worker = h.factory.last();
    let config = worker.config.lock().unwrap().clone();
    assert_eq!(config.farm_interval_ms, 5_000);
    assert_eq!(config.preferred_seed_id, 31);

    let err = h
        .manager
        .update_config("99999", &patch)
        .await
        .expect_err("unknown uin");
    assert!(matches!(err, BotError::NotFound(_)));
}

#[tokio::test]
async fn auto_recover_starts_only_recoverable_accounts() {
    let h = harness(MockGateway::never());
    let flag_on = ConfigPatch {
        auto_start: Some(true),
        ..Default::default()
    };

    // Flagged with a credential: recovered.
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    h.store.apply_patch("10001", &flag_on).await.unwrap();
    h.store.save_token("10001", "sess-1").await.unwrap();

    // Flagged but no credential: skipped.
    h.store.create("20002", "qq", 10_000, 10_000).await.unwrap();
    h.store.apply_patch("20002", &flag_on).await.unwrap();

    // Credential but not flagged: skipped.
    h.store.create("30003", "qq", 10_000, 10_000).await.unwrap();
    h.store.save_token("30003", "sess-3").await.unwrap();

    let started = h.manager.auto_recover().await.unwrap();
    assert_eq!(started, 1);

    wait_for("recovered worker started", async || {
        h.factory.built() == 1
            && h.factory.last().started_with.lock().unwrap().as_deref() == Some("sess-1")
    })
    .await;
    assert_eq!(h.manager.active_bots().await, vec!["10001".to_string()]);
}

#[tokio::test]
async fn failed_worker_start_surfaces_as_error_status() {
    let h = harness(MockGateway::never());
    h.factory.fail_start.store(true, Ordering::Relaxed);
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    let mut events = h.manager.subscribe_account("10001");

    h.manager
        .start_from_session("10001", "sess-1", BotConfig::default())
        .await
        .expect("start itself succeeds; the failure is asynchronous");

    wait_for("durable error status", async || {
        h.store.get("10001").await.unwrap().unwrap().status == BotStatus::Error
    })
    .await;
    wait_for("botError event names the start failure", async || {
        matches!(
            events.try_recv(),
            Ok(BotEvent::BotError { ref error, .. })
                if error.contains("failed to start") && error.contains("login rejected")
        )
    })
    .await;
}

#[tokio::test]
async fn shutdown_destroys_every_worker() {
    let h = harness(MockGateway::never());
    for uin in ["10001", "20002"] {
        h.store.create(uin, "qq", 10_000, 10_000).await.unwrap();
        h.manager
            .start_from_session(uin, "sess", BotConfig::default())
            .await
            .unwrap();
    }
    wait_for("both workers up", async || h.factory.built() == 2).await;

    h.manager.shutdown().await;

    assert!(h.manager.active_bots().await.is_empty());
    assert!(h.factory.last().destroyed.load(Ordering::Relaxed));
}

#[tokio::test]
async fn stale_running_row_is_reported_stopped() {
    let h = harness(MockGateway::never());
    h.store.create("10001", "qq", 10_000, 10_000).await.unwrap();
    h.store
        .update_status("10001", BotStatus::Running)
        .await
        .unwrap();

    let views = h.manager.list_accounts().await.unwrap();
    assert_eq!(views[0].status, BotStatus::Stopped);

    // The correction is read-side only; the row is untouched.
    assert_eq!(
        h.store.get("10001").await.unwrap().unwrap().status,
        BotStatus::Running
    );

    let view = h.manager.get_account("10001").await.unwrap().unwrap();
    assert_eq!(view.status, BotStatus::Stopped);
}
