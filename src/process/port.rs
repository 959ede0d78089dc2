//! Listening port management.
//!
//! Before a launch the target port must be free. When it is held, the owner is
//! identified (`lsof` + `ps` on Unix) and classified: an instance whose command line
//! points into our own `versions/` directory is an orphan from a previous run and
//! is terminated; anything else is foreign and is never signalled.

use crate::constants::{PORT_RECLAIM_POLL, PORT_RECLAIM_TIMEOUT};
use crate::core::{Result, SupervisorError};
use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A process listening on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: u32,
    /// Full command line as reported by `ps`
    pub command: String,
}

impl PortOwner {
    /// Short description for error messages, e.g. `nginx (pid 42)`.
    #[must_use]
    pub fn describe(&self) -> String {
        let program = self.command.split_whitespace().next().unwrap_or("unknown");
        let name = Path::new(program)
            .file_name()
            .map_or_else(|| program.to_string(), |n| n.to_string_lossy().into_owned());
        format!("{name} (pid {})", self.pid)
    }

    /// True if the process runs a binary from our versions directory.
    #[must_use]
    pub fn is_ours(&self, versions_dir: &Path) -> bool {
        let marker = versions_dir.to_string_lossy();
        !marker.is_empty() && self.command.contains(marker.as_ref())
    }
}

/// True if `host:port` can be bound right now.
#[must_use]
pub fn is_port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Ask the OS for a currently unused port on `host`.
pub fn allocate_ephemeral_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0)).map_err(|e| SupervisorError::StartFailed {
        reason: format!("no free port on {host}: {e}"),
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| SupervisorError::StartFailed {
            reason: format!("cannot read allocated port: {e}"),
        })?
        .port();
    Ok(port)
}

/// Identify the process listening on `port`.
#[cfg(unix)]
pub async fn find_owner(port: u16) -> Option<PortOwner> {
    let lsof = which::which("lsof").ok()?;
    let output = tokio::process::Command::new(lsof)
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .output()
        .await
        .ok()?;
    let pid: u32 = String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.trim().parse().ok())?;

    let command = tokio::process::Command::new("ps")
        .args(["-o", "command=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    debug!("Port {} is held by pid {}: {}", port, pid, command);
    Some(PortOwner {
        pid,
        command,
    })
}

/// Identify the process listening on `port`.
#[cfg(not(unix))]
pub async fn find_owner(_port: u16) -> Option<PortOwner> {
    None
}

/// True while a process with `pid` exists.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    signal::kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Send a signal to `pid`, ignoring processes that already exited.
#[cfg(unix)]
pub fn send_signal(pid: u32, force: bool) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| SupervisorError::Other {
        message: format!("invalid pid {pid}"),
    })?;
    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Other {
            message: format!("failed to send {sig} to pid {pid}: {e}"),
        }),
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, _force: bool) -> Result<()> {
    Err(SupervisorError::Other {
        message: format!("cannot signal pid {pid} on this platform"),
    })
}

async fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    loop {
        if done() {
            return true;
        }
        if started.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(PORT_RECLAIM_POLL).await;
    }
}

/// Terminate an orphaned instance: SIGTERM, wait, then SIGKILL.
pub async fn terminate_orphan(pid: u32) -> Result<()> {
    info!("Terminating orphaned core instance (pid {})", pid);
    send_signal(pid, false)?;
    if wait_until(PORT_RECLAIM_TIMEOUT, || !pid_alive(pid)).await {
        return Ok(());
    }

    warn!("Orphaned instance {} ignored SIGTERM, sending SIGKILL", pid);
    send_signal(pid, true)?;
    if wait_until(PORT_RECLAIM_TIMEOUT, || !pid_alive(pid)).await {
        Ok(())
    } else {
        Err(SupervisorError::Other {
            message: format!("orphaned instance {pid} did not exit"),
        })
    }
}

/// Make `host:port` available for a new instance.
///
/// # Errors
///
/// Returns [`SupervisorError::PortInUse`] if the port belongs to a process outside
/// `versions_dir` (which is left untouched) or stays busy after reclaiming it.
pub async fn ensure_port_available(host: &str, port: u16, versions_dir: &Path) -> Result<()> {
    if is_port_free(host, port) {
        return Ok(());
    }

    let owner = find_owner(port).await;
    match owner {
        Some(owner) if owner.is_ours(versions_dir) => {
            terminate_orphan(owner.pid).await?;
            let host = host.to_string();
            if wait_until(PORT_RECLAIM_TIMEOUT, || is_port_free(&host, port)).await {
                info!("Reclaimed port {}", port);
                Ok(())
            } else {
                Err(SupervisorError::PortInUse {
                    port,
                    pid: None,
                    process: "a process that took over after the orphan exited".to_string(),
                })
            }
        }
        Some(owner) => Err(SupervisorError::PortInUse {
            port,
            pid: Some(owner.pid),
            process: owner.describe(),
        }),
        None => Err(SupervisorError::PortInUse {
            port,
            pid: None,
            process: "an unidentified process".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_owner() {
        let owner = PortOwner {
            pid: 42,
            command: "/usr/sbin/nginx -g daemon off;".to_string(),
        };
        assert_eq!(owner.describe(), "nginx (pid 42)");
    }

    #[test]
    fn test_is_ours() {
        let versions = Path::new("/home/me/.corekeep/versions");
        let ours = PortOwner {
            pid: 1,
            command: "/home/me/.corekeep/versions/v1.0.0/core -config /home/me/.corekeep/config.yaml"
                .to_string(),
        };
        let foreign = PortOwner {
            pid: 2,
            command: "/usr/bin/python3 -m http.server 8317".to_string(),
        };
        assert!(ours.is_ours(versions));
        assert!(!foreign.is_ours(versions));
    }

    #[test]
    fn test_port_free_and_busy() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free("127.0.0.1", port));
        drop(listener);
        assert!(is_port_free("127.0.0.1", port));
    }

    #[test]
    fn test_allocate_ephemeral_port() {
        let port = allocate_ephemeral_port("127.0.0.1").unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_foreign_owner_is_not_signalled() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = ensure_port_available("127.0.0.1", port, Path::new("/nonexistent/versions"))
            .await
            .unwrap_err();

        match err {
            SupervisorError::PortInUse {
                port: reported,
                ..
            } => assert_eq!(reported, port),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(listener.local_addr().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_pid_alive_self() {
        assert!(pid_alive(std::process::id()));
    }
}
