//! Install pipeline end to end: release fixture on disk, fake process and health.

use crate::common::{Supervisor, linux_host};
use corekeep::SupervisorError;
use corekeep::orchestrator::LifecycleState;
use corekeep::test_utils::fixtures::binary_for;
use corekeep::test_utils::{ReleaseFixture, native_binary, sha256_hex};
use corekeep::upgrade::{InstallPhase, InstallReporter};
use corekeep::utils::{Arch, HostPlatform, OsToken};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::Path;
use std::time::Duration;
use tar::{Builder, EntryType, Header};

/// Replace the fixture archive with a tar built by `fill` and re-publish its digest.
fn rewrite_archive(
    fixture: ReleaseFixture,
    fill: impl FnOnce(&mut Builder<GzEncoder<std::fs::File>>),
) -> ReleaseFixture {
    let file = std::fs::File::create(&fixture.archive).unwrap();
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    fill(&mut builder);
    builder.into_inner().unwrap().finish().unwrap();

    let sha256 = sha256_hex(&std::fs::read(&fixture.archive).unwrap());
    fixture.with_digest(Some(format!("sha256:{sha256}")))
}

fn append_raw(builder: &mut Builder<GzEncoder<std::fs::File>>, name: &str, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    header.set_entry_type(EntryType::Regular);
    header.set_cksum();
    builder.append(&header, data).unwrap();
}

fn assert_not_installed(sup: &Supervisor, version: &str) {
    assert!(!sup.store().is_installed(version));
    assert!(!sup.store().version_dir(version).exists());
}

fn leftover_downloads(root: &Path) -> usize {
    std::fs::read_dir(root.join("downloads")).map(Iterator::count).unwrap_or(0)
}

#[tokio::test]
async fn test_install_then_start_runs_new_version() {
    let sup = Supervisor::new();
    let fixture = sup.publish("v1.2.3");
    let mut states = sup.orchestrator.subscribe();

    let outcome = sup.orchestrator.install("v1.2.3", true, InstallReporter::new()).await.unwrap();
    assert_eq!(outcome.version, "v1.2.3");
    assert_eq!(outcome.sha256, fixture.sha256);
    assert_eq!(outcome.architecture, Arch::Amd64);
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.2.3"));
    assert_eq!(sup.state.snapshot().last_known_good.as_deref(), Some("v1.2.3"));

    let dry_runs = sup.dry_run.starts();
    assert_eq!(dry_runs.len(), 1);
    assert!(dry_runs[0].dry_run);
    assert_ne!(dry_runs[0].port, sup.root.config.port);
    assert!(sup.process.starts().is_empty(), "install alone must not start the main instance");

    let state = sup.orchestrator.start().await;
    match &state {
        LifecycleState::Running {
            version,
            pid,
            port,
            started_at,
        } => {
            let main = &sup.process.starts()[0];
            assert_eq!(version, "v1.2.3");
            assert_eq!((*pid, *port, *started_at), (main.pid, main.port, main.started_at));
        }
        other => panic!("unexpected state: {other:?}"),
    }
    let started = sup.process.started_executables();
    assert_eq!(started, vec![sup.store().executable_path("v1.2.3")]);
    sup.orchestrator.stop().await;

    let mut published = Vec::new();
    while let Ok(state) = states.try_recv() {
        published.push(state);
    }

    let phases: Vec<InstallPhase> = published
        .iter()
        .filter_map(|s| match s {
            LifecycleState::Installing {
                phase,
                ..
            } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            InstallPhase::Resolving,
            InstallPhase::Downloading,
            InstallPhase::Verifying,
            InstallPhase::Extracting,
            InstallPhase::Validating,
            InstallPhase::Signing,
            InstallPhase::Promoting,
        ]
    );
    let testing = published.iter().find_map(|s| match s {
        LifecycleState::Testing {
            version,
            pid,
            port,
        } => Some((version.clone(), *pid, *port)),
        _ => None,
    });
    assert_eq!(testing, Some(("v1.2.3".to_string(), dry_runs[0].pid, dry_runs[0].port)));

    let mut names: Vec<_> = published.iter().map(LifecycleState::name).collect();
    names.dedup();
    assert_eq!(
        names,
        vec![
            "idle",
            "installing",
            "testing",
            "installing",
            "idle",
            "starting",
            "running",
            "stopping",
            "idle"
        ]
    );
}

#[tokio::test]
async fn test_install_while_running_restarts_onto_new_version() {
    let sup = Supervisor::new();
    sup.publish("v1.0.0");
    sup.orchestrator.install("v1.0.0", true, InstallReporter::new()).await.unwrap();
    sup.orchestrator.start().await;

    sup.publish("v1.1.0");
    sup.orchestrator.install("v1.1.0", true, InstallReporter::new()).await.unwrap();

    assert!(matches!(
        sup.orchestrator.lifecycle(),
        LifecycleState::Running { ref version, .. } if version == "v1.1.0"
    ));
    assert_eq!(sup.process.starts().len(), 2);
    assert_eq!(sup.process.stop_count(), 1);
    sup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_inactive_install_does_not_touch_running_instance() {
    let sup = Supervisor::new();
    sup.publish("v1.0.0");
    sup.orchestrator.install("v1.0.0", true, InstallReporter::new()).await.unwrap();
    sup.orchestrator.start().await;

    sup.publish("v1.1.0");
    let outcome = sup.orchestrator.install("v1.1.0", false, InstallReporter::new()).await.unwrap();

    assert!(!outcome.activated);
    assert!(sup.store().is_installed("v1.1.0"));
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.0.0"));
    assert_eq!(sup.process.starts().len(), 1);
    assert_eq!(sup.dry_run.starts().len(), 1);
    assert!(sup.orchestrator.lifecycle().is_running());
    sup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_failed_dry_run_keeps_serving_current_version() {
    let sup = Supervisor::new();
    sup.publish("v1.0.0");
    sup.orchestrator.install("v1.0.0", true, InstallReporter::new()).await.unwrap();
    sup.orchestrator.start().await;

    sup.publish("v1.1.0");
    sup.health.set_healthy(false);
    let err = sup.orchestrator.install("v1.1.0", true, InstallReporter::new()).await.unwrap_err();
    sup.health.set_healthy(true);

    assert!(matches!(err, SupervisorError::PromotionFailed { .. }));
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v1.0.0"));
    assert_not_installed(&sup, "v1.1.0");
    assert!(matches!(
        sup.orchestrator.lifecycle(),
        LifecycleState::Running { ref version, .. } if version == "v1.0.0"
    ));
    assert_eq!(sup.process.starts().len(), 1);
    assert_eq!(sup.process.stop_count(), 0);
    sup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_checksum_from_manifest() {
    let sup = Supervisor::new();
    let fixture = sup.fixture("v1.3.0", &native_binary(&linux_host())).with_checksum_manifest();
    sup.releases.push(fixture.release.clone());

    let outcome = sup.orchestrator.install("v1.3.0", true, InstallReporter::new()).await.unwrap();

    assert_eq!(outcome.sha256, fixture.sha256);
    assert!(sup.store().is_installed("v1.3.0"));
}

#[tokio::test]
async fn test_missing_checksum_is_rejected() {
    let sup = Supervisor::new();
    let fixture = sup.fixture("v1.4.0", &native_binary(&linux_host())).with_digest(None);
    sup.releases.push(fixture.release);

    let err = sup.orchestrator.install("v1.4.0", true, InstallReporter::new()).await.unwrap_err();

    assert!(matches!(err, SupervisorError::ChecksumMissing { .. }));
    assert_not_installed(&sup, "v1.4.0");
    assert_eq!(leftover_downloads(&sup.root.config.root_dir), 0);
    assert!(sup.orchestrator.lifecycle().is_error());
}

#[tokio::test]
async fn test_path_traversal_archive_is_rejected() {
    let sup = Supervisor::new();
    let binary = native_binary(&linux_host());
    let fixture = rewrite_archive(sup.fixture("v2.0.0", &binary), |builder| {
        append_raw(builder, "../../escaped", b"payload");
        append_raw(builder, "cli-proxy-api", &binary);
    });
    sup.releases.push(fixture.release);

    let err = sup.orchestrator.install("v2.0.0", true, InstallReporter::new()).await.unwrap_err();

    assert!(matches!(err, SupervisorError::PathTraversal { .. }));
    assert_not_installed(&sup, "v2.0.0");
    assert!(!sup.root.config.root_dir.join("escaped").exists());
    assert!(!sup.root.path().join("escaped").exists());
    assert!(sup.dry_run.starts().is_empty());
}

#[tokio::test]
async fn test_symlink_escape_archive_is_rejected() {
    let sup = Supervisor::new();
    let fixture = rewrite_archive(sup.fixture("v2.1.0", &native_binary(&linux_host())), |builder| {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, "cli-proxy-api", "../../../../etc/passwd").unwrap();
    });
    sup.releases.push(fixture.release);

    let err = sup.orchestrator.install("v2.1.0", true, InstallReporter::new()).await.unwrap_err();

    assert!(matches!(err, SupervisorError::SymlinkEscape { .. }));
    assert_not_installed(&sup, "v2.1.0");
}

#[tokio::test]
async fn test_wrong_architecture_release_is_rejected() {
    let sup = Supervisor::new();
    let fixture = sup.fixture("v3.0.0", &binary_for(OsToken::Linux, Arch::Arm64));
    sup.releases.push(fixture.release);

    let err = sup.orchestrator.install("v3.0.0", true, InstallReporter::new()).await.unwrap_err();

    match err {
        SupervisorError::ArchitectureMismatch {
            host,
            supported,
        } => {
            assert_eq!(host, Arch::Amd64.to_string());
            assert_eq!(supported, vec!["arm64".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_not_installed(&sup, "v3.0.0");
    let attempt = sup.state.snapshot().last_attempt.unwrap();
    assert_eq!(attempt.error_code.unwrap().as_str(), "ARCHITECTURE_MISMATCH");
}

#[tokio::test]
async fn test_release_without_host_asset() {
    let sup = Supervisor::new();
    let darwin = HostPlatform {
        os: OsToken::Darwin,
        arch: Arch::Arm64,
        emulation: None,
    };
    let fixture = ReleaseFixture::build(
        &sup.root.artifacts(),
        "v3.1.0",
        &darwin,
        &sup.root.config.release,
        &native_binary(&darwin),
    );
    sup.releases.push(fixture.release);

    let err = sup.orchestrator.install("v3.1.0", true, InstallReporter::new()).await.unwrap_err();

    assert!(matches!(err, SupervisorError::NoCompatibleAsset { .. }));
    assert_not_installed(&sup, "v3.1.0");
}

#[tokio::test]
async fn test_unknown_tag() {
    let sup = Supervisor::new();
    sup.publish("v1.0.0");

    let err = sup.orchestrator.install("v9.9.9", true, InstallReporter::new()).await.unwrap_err();

    assert!(matches!(err, SupervisorError::ReleaseNotFound { ref tag } if tag == "v9.9.9"));
}

#[tokio::test]
async fn test_concurrent_install_is_busy() {
    let sup = Supervisor::new();
    sup.publish("v1.0.0");
    sup.publish("v1.1.0");
    sup.dry_run.set_start_delay(Duration::from_millis(300));

    let (first, second) = tokio::join!(
        sup.orchestrator.install("v1.0.0", true, InstallReporter::new()),
        sup.orchestrator.install("v1.1.0", true, InstallReporter::new()),
    );

    let (ok, busy) = match (first, second) {
        (Ok(outcome), Err(e)) | (Err(e), Ok(outcome)) => (outcome, e),
        (a, b) => panic!("expected exactly one install to win: {a:?} / {b:?}"),
    };
    assert!(matches!(busy, SupervisorError::UpgradeInProgress));
    assert_eq!(sup.store().current().unwrap().as_deref(), Some(ok.version.as_str()));
    assert_eq!(sup.dry_run.starts().len(), 1);

    // The lock is released once the winner finishes.
    let other = if ok.version == "v1.0.0" { "v1.1.0" } else { "v1.0.0" };
    sup.orchestrator.install(other, true, InstallReporter::new()).await.unwrap();
}

#[tokio::test]
async fn test_install_from_archive_file() {
    let sup = Supervisor::new();
    let fixture = sup.fixture("v4.0.0", &native_binary(&linux_host()));

    let outcome = sup
        .orchestrator
        .install_from_file(&fixture.archive, "v4.0.0-local", true, InstallReporter::new())
        .await
        .unwrap();

    assert!(outcome.activated);
    assert_eq!(sup.store().current().unwrap().as_deref(), Some("v4.0.0-local"));
    assert_eq!(
        std::fs::read(sup.store().executable_path("v4.0.0-local")).unwrap(),
        native_binary(&linux_host())
    );
}
