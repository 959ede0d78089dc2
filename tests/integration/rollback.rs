//! Health monitoring and rollback through the orchestrator.

use crate::common::Supervisor;
use corekeep::SupervisorError;
use corekeep::orchestrator::LifecycleState;
use corekeep::upgrade::InstallReporter;
use std::time::{Duration, Instant};

/// Install `tags` in order, each promoted, so the last one is current and
/// last-known-good.
async fn install_all(sup: &Supervisor, tags: &[&str]) {
    for tag in tags {
        sup.publish(tag);
        sup.orchestrator.install(tag, true, InstallReporter::new()).await.unwrap();
    }
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_monitor_rolls_back_after_threshold() {
    let sup = Supervisor::with_config(|c| c.health.failure_threshold = 2);
    install_all(&sup, &["v1.0.0"]).await;

    // v1.1.0 passes its dry run but is never marked known good.
    sup.publish("v1.1.0");
    sup.orchestrator.install("v1.1.0", false, InstallReporter::new()).await.unwrap();
    sup.store().set_current("v1.1.0").unwrap();

    let mut states = sup.orchestrator.subscribe();
    sup.health.set_healthy(false);
    sup.orchestrator.start().await;

    wait_for("rollback", || sup.store().current().unwrap().as_deref() == Some("v1.0.0")).await;
    sup.health.set_healthy(true);
    wait_for("restart", || sup.process.starts().len() == 2).await;

    let started = sup.process.started_executables();
    assert_eq!(started[0], sup.store().executable_path("v1.1.0"));
    assert_eq!(started[1], sup.store().executable_path("v1.0.0"));
    assert_eq!(sup.state.snapshot().consecutive_failures, 0);

    let mut saw_rollback = false;
    while let Ok(state) = states.try_recv() {
        if let LifecycleState::RollingBack {
            from,
            to,
        } = state
        {
            assert_eq!((from.as_str(), to.as_str()), ("v1.1.0", "v1.0.0"));
            saw_rollback = true;
        }
    }
    assert!(saw_rollback);
    sup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_monitor_counts_crashed_process_as_failure() {
    let sup = Supervisor::with_config(|c| c.health.failure_threshold = 5);
    install_all(&sup, &["v1.0.0"]).await;
    sup.orchestrator.start().await;

    sup.process.crash();
    wait_for("failure count", || sup.state.snapshot().consecutive_failures >= 1).await;
    sup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_healthy_probe_resets_failures() {
    let sup = Supervisor::new();
    install_all(&sup, &["v1.0.0"]).await;
    sup.state.record_health_failure().unwrap();
    sup.state.record_health_failure().unwrap();

    sup.orchestrator.start().await;
    wait_for("reset", || sup.state.snapshot().consecutive_failures == 0).await;
    assert!(sup.health.probe_count() >= 1);
    assert!(sup.health.probed_ports().iter().all(|p| *p == sup.root.config.port || *p >= 40_000));
    sup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_single_failed_probe_recovers_without_rollback() {
    let sup = Supervisor::with_config(|c| c.health.failure_threshold = 2);
    install_all(&sup, &["v1.0.0"]).await;
    sup.publish("v1.1.0");
    sup.orchestrator.install("v1.1.0", false, InstallReporter::new()).await.unwrap();
    sup.store().set_current("v1.1.0").unwrap();

    let before = sup.health.probe_count();
    sup.health.script(&[false, true]);
    sup.orchestrator.start().await;

    wait_for("recovery", || {
        sup.health.probe_count() >= before + 2 && sup.state.snapshot().consecutive_failures == 0
    })
    .await;
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.1.0"));
    assert_eq!(sup.process.starts().len(), 1);
    sup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_no_rollback_when_current_is_known_good() {
    let sup = Supervisor::with_config(|c| c.health.failure_threshold = 1);
    install_all(&sup, &["v1.0.0", "v1.1.0"]).await;
    sup.orchestrator.start().await;
    sup.state.record_health_failure().unwrap();

    assert!(!sup.orchestrator.rollback_if_needed().await.unwrap());

    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.1.0"));
    assert_eq!(sup.state.snapshot().consecutive_failures, 0);
    assert_eq!(sup.process.starts().len(), 1);
    sup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_no_rollback_below_threshold() {
    let sup = Supervisor::with_config(|c| c.health.failure_threshold = 3);
    install_all(&sup, &["v1.0.0"]).await;
    sup.publish("v1.1.0");
    sup.orchestrator.install("v1.1.0", false, InstallReporter::new()).await.unwrap();
    sup.store().set_current("v1.1.0").unwrap();
    sup.state.record_health_failure().unwrap();
    sup.state.record_health_failure().unwrap();

    assert!(!sup.orchestrator.rollback_if_needed().await.unwrap());
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.1.0"));
    assert_eq!(sup.state.snapshot().consecutive_failures, 2);
}

#[tokio::test]
async fn test_rollback_deferred_while_install_holds_lock() {
    let sup = Supervisor::with_config(|c| c.health.failure_threshold = 1);
    install_all(&sup, &["v1.0.0"]).await;
    sup.publish("v1.1.0");
    sup.orchestrator.install("v1.1.0", false, InstallReporter::new()).await.unwrap();
    sup.store().set_current("v1.1.0").unwrap();
    sup.state.record_health_failure().unwrap();

    let guard = sup.orchestrator.coordinator().lock().try_acquire().await.unwrap();
    assert!(!sup.orchestrator.rollback_if_needed().await.unwrap());
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.1.0"));
    drop(guard);

    assert!(sup.orchestrator.rollback_if_needed().await.unwrap());
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.0.0"));
}

#[tokio::test]
async fn test_force_rollback_when_stopped_does_not_start() {
    let sup = Supervisor::new();
    install_all(&sup, &["v1.0.0"]).await;
    sup.publish("v1.1.0");
    sup.orchestrator.install("v1.1.0", false, InstallReporter::new()).await.unwrap();
    sup.store().set_current("v1.1.0").unwrap();

    assert!(sup.orchestrator.force_rollback().await.unwrap());

    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.0.0"));
    assert!(sup.process.starts().is_empty());
    assert!(matches!(sup.orchestrator.lifecycle(), LifecycleState::Idle));
}

#[tokio::test]
async fn test_force_rollback_requires_known_good() {
    let sup = Supervisor::new();
    sup.publish("v1.0.0");
    sup.orchestrator.install("v1.0.0", false, InstallReporter::new()).await.unwrap();
    sup.store().set_current("v1.0.0").unwrap();

    let err = sup.orchestrator.force_rollback().await.unwrap_err();
    assert!(matches!(err, SupervisorError::RollbackFailed { .. }));
}

#[tokio::test]
async fn test_rollback_fails_when_known_good_cannot_start() {
    let sup = Supervisor::with_config(|c| c.health.failure_threshold = 1);
    install_all(&sup, &["v1.0.0"]).await;
    sup.publish("v1.1.0");
    sup.orchestrator.install("v1.1.0", false, InstallReporter::new()).await.unwrap();
    sup.store().set_current("v1.1.0").unwrap();
    sup.orchestrator.start().await;
    sup.state.record_health_failure().unwrap();

    sup.process.fail_next_start(SupervisorError::StartFailed {
        reason: "exited with status 1".to_string(),
    });
    let err = sup.orchestrator.rollback_if_needed().await.unwrap_err();

    assert!(matches!(err, SupervisorError::RollbackFailed { .. }));
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.0.0"));
    assert!(sup.orchestrator.lifecycle().is_error());
}

#[tokio::test]
async fn test_stop_cancels_monitor() {
    let sup = Supervisor::with_config(|c| c.health.failure_threshold = 1);
    install_all(&sup, &["v1.0.0"]).await;
    sup.orchestrator.start().await;
    assert!(sup.orchestrator.is_monitoring());

    sup.orchestrator.stop().await;
    assert!(!sup.orchestrator.is_monitoring());

    let probes = sup.health.probe_count();
    sup.health.set_healthy(false);
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(sup.health.probe_count(), probes);
    assert_eq!(sup.state.snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn test_use_version_switches_and_restarts() {
    let sup = Supervisor::new();
    install_all(&sup, &["v1.0.0", "v1.1.0"]).await;
    sup.orchestrator.start().await;

    let state = sup.orchestrator.use_version("v1.0.0").await.unwrap();

    assert!(matches!(&state, LifecycleState::Running { version, .. } if version == "v1.0.0"));
    assert_eq!(sup.state.snapshot().last_known_good.as_deref(), Some("v1.1.0"));
    assert_eq!(sup.process.stop_count(), 1);
    sup.orchestrator.stop().await;
}
