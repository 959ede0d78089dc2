//! Liveness probing of a running core instance.
//!
//! The probe answers "is something serving HTTP on this port", not "is the core
//! happy": every response from 200 through 499 counts as alive. Only connection
//! failures, timeouts and 5xx responses count against the instance.

use crate::config::HealthSettings;
use crate::constants::{HEALTH_RETRY_DELAY, USER_AGENT};
use crate::core::{Result, SupervisorError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Health probe seam used by the upgrade coordinator and the orchestrator.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `host:port` up to `retries` times; false once every attempt failed.
    async fn is_healthy(&self, host: &str, port: u16, retries: u32) -> bool;
}

/// HTTP health probe against the core's management endpoint.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
    path: String,
    retry_delay: Duration,
}

impl HealthChecker {
    pub fn new(settings: &HealthSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .user_agent(USER_AGENT)
            .no_proxy()
            .build()
            .map_err(|e| SupervisorError::network("create health client", e))?;
        let path = if settings.path.starts_with('/') {
            settings.path.clone()
        } else {
            format!("/{}", settings.path)
        };
        Ok(Self {
            client,
            path,
            retry_delay: HEALTH_RETRY_DELAY,
        })
    }

    /// Override the pause between attempts.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// URL probed for `host:port`.
    #[must_use]
    pub fn url(&self, host: &str, port: u16) -> String {
        format!("http://{host}:{port}{}", self.path)
    }

    async fn probe_once(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!("Health probe {} answered {}", url, status);
                (200..500).contains(&status)
            }
            Err(e) => {
                debug!("Health probe {} failed: {}", url, e);
                false
            }
        }
    }
}

#[async_trait]
impl HealthProbe for HealthChecker {
    async fn is_healthy(&self, host: &str, port: u16, retries: u32) -> bool {
        let url = self.url(host, port);
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            if self.probe_once(&url).await {
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `status` to every connection.
    async fn serve(status: u16) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn checker() -> HealthChecker {
        HealthChecker::new(&HealthSettings::default())
            .unwrap()
            .with_retry_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_success_and_client_errors_are_alive() {
        let checker = checker();
        for status in [200, 204, 401, 404] {
            let port = serve(status).await;
            assert!(checker.is_healthy("127.0.0.1", port, 1).await, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_server_error_is_unhealthy() {
        let port = serve(503).await;
        assert!(!checker().is_healthy("127.0.0.1", port, 2).await);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unhealthy() {
        let port = crate::process::port::allocate_ephemeral_port("127.0.0.1").unwrap();
        assert!(!checker().is_healthy("127.0.0.1", port, 3).await);
    }

    #[test]
    fn test_url_normalizes_path() {
        let settings = HealthSettings {
            path: "status".to_string(),
            ..HealthSettings::default()
        };
        let checker = HealthChecker::new(&settings).unwrap();
        assert_eq!(checker.url("127.0.0.1", 8317), "http://127.0.0.1:8317/status");
    }
}
