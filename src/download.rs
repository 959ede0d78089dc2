//! Artifact downloads.
//!
//! Artifacts are streamed into a uniquely named `.part` file in the downloads
//! directory and renamed to their final name only after the whole body was written
//! and synced. Any failure removes the partial file, so the final path either holds
//! a complete artifact or does not exist.
//!
//! `file://` URLs are accepted and read from the local filesystem, which lets
//! mirrors on shared storage and test fixtures use the same code path.

use crate::constants::{
    DOWNLOAD_CONNECT_TIMEOUT, DOWNLOAD_READ_TIMEOUT, PROGRESS_REPORT_BYTES,
    PROGRESS_REPORT_INTERVAL, USER_AGENT,
};
use crate::core::{Result, SupervisorError};
use crate::utils::fs::{ensure_dir, remove_file};
use crate::utils::retry::retry_transient;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Progress callback receiving `(bytes_received, total_bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Rate limiter for progress callbacks.
///
/// A report is emitted once at least [`PROGRESS_REPORT_BYTES`] arrived or
/// [`PROGRESS_REPORT_INTERVAL`] elapsed since the previous one.
struct ProgressThrottle<'a> {
    callback: Option<&'a ProgressFn>,
    total: Option<u64>,
    last_bytes: u64,
    last_at: Instant,
}

impl<'a> ProgressThrottle<'a> {
    fn new(callback: Option<&'a ProgressFn>, total: Option<u64>) -> Self {
        if let Some(cb) = callback {
            cb(0, total);
        }
        Self {
            callback,
            total,
            last_bytes: 0,
            last_at: Instant::now(),
        }
    }

    fn advance(&mut self, received: u64) {
        let Some(cb) = self.callback else {
            return;
        };
        if received - self.last_bytes >= PROGRESS_REPORT_BYTES
            || self.last_at.elapsed() >= PROGRESS_REPORT_INTERVAL
        {
            cb(received, self.total);
            self.last_bytes = received;
            self.last_at = Instant::now();
        }
    }

    fn finish(&self, received: u64) {
        if let Some(cb) = self.callback
            && received != self.last_bytes
        {
            cb(received, self.total);
        }
    }
}

/// Streams artifacts into the downloads directory.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    downloads_dir: PathBuf,
}

impl Downloader {
    /// Create a downloader writing into `downloads_dir`.
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SupervisorError::network("build HTTP client", e))?;
        Ok(Self {
            client,
            downloads_dir: downloads_dir.into(),
        })
    }

    #[must_use]
    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Download `url` to `<downloads_dir>/<file_name>`.
    ///
    /// Returns the final path. An existing file with the same name is replaced.
    pub async fn download(
        &self,
        url: &str,
        file_name: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        ensure_dir(&self.downloads_dir)?;
        let final_path = self.downloads_dir.join(file_name);
        let part_path = self
            .downloads_dir
            .join(format!(".{file_name}.{}.part", uuid::Uuid::new_v4().simple()));

        info!("Downloading {} to {}", url, final_path.display());
        let result = self.stream_to(url, &part_path, progress).await;

        match result {
            Ok(bytes) => {
                tokio::fs::rename(&part_path, &final_path).await.map_err(|e| {
                    let _ = std::fs::remove_file(&part_path);
                    SupervisorError::fs("rename download to", &final_path, &e)
                })?;
                debug!("Downloaded {} bytes to {}", bytes, final_path.display());
                Ok(final_path)
            }
            Err(e) => {
                if let Err(cleanup) = remove_file(&part_path) {
                    warn!("Failed to remove partial download: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// Fetch a small text document such as a checksum manifest.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let parsed = parse_url(url)?;
        if parsed.scheme() == "file" {
            let path = local_path(&parsed, url)?;
            return tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| download_failed(url, format!("{}: {e}", path.display())));
        }

        retry_transient("fetch text", move || async move {
            let response = self.client.get(url).send().await.map_err(|e| {
                SupervisorError::network(&format!("GET {url}"), e)
            })?;
            let status = response.status();
            if status.is_server_error() {
                return Err(SupervisorError::network(&format!("GET {url}"), status));
            }
            if !status.is_success() {
                return Err(download_failed(url, format!("HTTP {status}")));
            }
            response.text().await.map_err(|e| download_failed(url, e))
        })
        .await
    }

    async fn stream_to(
        &self,
        url: &str,
        part_path: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<u64> {
        let parsed = parse_url(url)?;
        let mut file = tokio::fs::File::create(part_path)
            .await
            .map_err(|e| SupervisorError::fs("create", part_path, &e))?;

        let received = if parsed.scheme() == "file" {
            self.copy_local(&parsed, url, &mut file, progress).await?
        } else {
            self.copy_remote(url, &mut file, progress).await?
        };

        file.flush().await.map_err(|e| SupervisorError::fs("flush", part_path, &e))?;
        file.sync_all().await.map_err(|e| SupervisorError::fs("sync", part_path, &e))?;
        Ok(received)
    }

    async fn copy_remote(
        &self,
        url: &str,
        file: &mut tokio::fs::File,
        progress: Option<&ProgressFn>,
    ) -> Result<u64> {
        let mut response = retry_transient("download", move || async move {
            let response = self.client.get(url).send().await.map_err(|e| {
                SupervisorError::network(&format!("GET {url}"), e)
            })?;
            let status = response.status();
            if status.is_server_error() {
                return Err(SupervisorError::network(&format!("GET {url}"), status));
            }
            if !status.is_success() {
                return Err(download_failed(url, format!("HTTP {status}")));
            }
            Ok(response)
        })
        .await?;

        let total = response.content_length();
        let mut throttle = ProgressThrottle::new(progress, total);
        let mut received = 0u64;

        loop {
            let chunk = tokio::time::timeout(DOWNLOAD_READ_TIMEOUT, response.chunk())
                .await
                .map_err(|_| download_failed(url, "timed out waiting for data"))?
                .map_err(|e| download_failed(url, e))?;
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk).await.map_err(|e| download_failed(url, e))?;
            received += chunk.len() as u64;
            throttle.advance(received);
        }

        if let Some(expected) = total
            && expected != received
        {
            return Err(download_failed(
                url,
                format!("received {received} bytes, expected {expected}"),
            ));
        }

        throttle.finish(received);
        Ok(received)
    }

    async fn copy_local(
        &self,
        parsed: &Url,
        url: &str,
        file: &mut tokio::fs::File,
        progress: Option<&ProgressFn>,
    ) -> Result<u64> {
        let path = local_path(parsed, url)?;
        let mut source = tokio::fs::File::open(&path)
            .await
            .map_err(|e| download_failed(url, format!("{}: {e}", path.display())))?;
        let total = source.metadata().await.ok().map(|m| m.len());
        let mut throttle = ProgressThrottle::new(progress, total);
        let mut buffer = vec![0u8; 64 * 1024];
        let mut received = 0u64;

        loop {
            let read = source.read(&mut buffer).await.map_err(|e| download_failed(url, e))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).await.map_err(|e| download_failed(url, e))?;
            received += read as u64;
            throttle.advance(received);
        }

        throttle.finish(received);
        Ok(received)
    }
}

fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| download_failed(url, e))?;
    match parsed.scheme() {
        "http" | "https" | "file" => Ok(parsed),
        other => Err(download_failed(url, format!("unsupported scheme '{other}'"))),
    }
}

fn local_path(parsed: &Url, url: &str) -> Result<PathBuf> {
    parsed.to_file_path().map_err(|()| download_failed(url, "invalid file URL"))
}

fn download_failed(url: &str, reason: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::DownloadFailed {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}
