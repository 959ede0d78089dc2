//! Port ownership against real listeners.

use corekeep::SupervisorError;
use corekeep::process::port::{allocate_ephemeral_port, ensure_port_available, is_port_free};
use std::net::TcpListener;
use tempfile::TempDir;

#[tokio::test]
async fn test_free_port_is_available() {
    let temp = TempDir::new().unwrap();
    let port = allocate_ephemeral_port("127.0.0.1").unwrap();

    assert!(is_port_free("127.0.0.1", port));
    ensure_port_available("127.0.0.1", port, &temp.path().join("versions")).await.unwrap();
}

#[tokio::test]
async fn test_foreign_listener_is_reported_and_left_alone() {
    let temp = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let err = ensure_port_available("127.0.0.1", port, &temp.path().join("versions"))
        .await
        .unwrap_err();

    match err {
        SupervisorError::PortInUse {
            port: reported,
            pid,
            process,
        } => {
            assert_eq!(reported, port);
            assert!(!process.is_empty());
            if let Some(pid) = pid {
                assert_eq!(pid, std::process::id());
            }
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!is_port_free("127.0.0.1", port), "foreign listener must survive");
    drop(listener);
}

#[cfg(unix)]
mod supervisor {
    use corekeep::SupervisorError;
    use corekeep::process::{ProcessControl, ProcessSupervisor};
    use std::net::TcpListener;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_refuses_occupied_port() {
        let temp = TempDir::new().unwrap();
        let versions = temp.path().join("versions");
        let exe_dir = versions.join("v1.0.0");
        std::fs::create_dir_all(&exe_dir).unwrap();
        let exe = exe_dir.join("core");
        std::fs::write(&exe, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let config = temp.path().join("config.yaml");
        std::fs::write(&config, "port: 1\n").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let supervisor = ProcessSupervisor::new(
            "127.0.0.1",
            &versions,
            temp.path().join("logs/core.log"),
            temp.path().join("tmp"),
        )
        .with_confirm_window(Duration::from_millis(200));

        let err = supervisor.start(&exe, &config, port).await.unwrap_err();

        assert!(matches!(err, SupervisorError::PortInUse { .. }));
        assert!(!supervisor.is_running().await);
        assert!(supervisor.current().await.is_none());

        drop(listener);
        let info = supervisor.start(&exe, &config, port).await.unwrap();
        assert_eq!(info.port, port);
        assert!(supervisor.is_running().await);
        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running().await);

        let log = std::fs::read_to_string(supervisor.log_path()).unwrap();
        assert!(log.contains("starting"));
    }
}
