//! Progress indicators for the CLI
//!
//! Thin wrapper over `indicatif` used to render download progress and install
//! phases. Progress output is suppressed when:
//! - stderr is not a terminal (handled by `indicatif`)
//! - `COREKEEP_NO_PROGRESS` is set
//! - the caller asks for a hidden bar (`--no-progress`)
//!
//! # Examples
//!
//! ```rust,no_run
//! use corekeep::utils::progress::ProgressBar;
//!
//! let bar = ProgressBar::new_download(false);
//! bar.set_message("core_1.2.3_linux_amd64.tar.gz");
//! bar.update(512, Some(1024));
//! bar.finish_with_message("downloaded");
//! ```

use indicatif::{ProgressBar as IndicatifBar, ProgressStyle as IndicatifStyle};
use std::time::Duration;

fn is_progress_disabled() -> bool {
    std::env::var_os("COREKEEP_NO_PROGRESS").is_some()
}

/// A cloneable progress bar handle.
#[derive(Clone, Debug)]
pub struct ProgressBar {
    inner: IndicatifBar,
}

impl ProgressBar {
    /// Byte-oriented bar for artifact downloads. The length is set on the first update.
    #[must_use]
    pub fn new_download(hidden: bool) -> Self {
        if hidden || is_progress_disabled() {
            return Self::hidden();
        }
        let bar = IndicatifBar::new(0);
        bar.set_style(download_style());
        Self {
            inner: bar,
        }
    }

    /// Spinner for work of unknown length (install phases, dry runs).
    #[must_use]
    pub fn new_spinner(hidden: bool) -> Self {
        if hidden || is_progress_disabled() {
            return Self::hidden();
        }
        let bar = IndicatifBar::new_spinner();
        bar.set_style(spinner_style());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            inner: bar,
        }
    }

    /// A bar that never draws.
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            inner: IndicatifBar::hidden(),
        }
    }

    pub fn set_message(&self, msg: impl Into<String>) {
        self.inner.set_message(msg.into());
    }

    /// Report `received` bytes out of an optional `total`.
    pub fn update(&self, received: u64, total: Option<u64>) {
        if let Some(total) = total
            && self.inner.length() != Some(total)
        {
            self.inner.set_length(total);
        }
        self.inner.set_position(received);
    }

    pub fn finish_with_message(&self, msg: impl Into<String>) {
        self.inner.finish_with_message(msg.into());
    }

    pub fn finish_and_clear(&self) {
        self.inner.finish_and_clear();
    }

    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.inner.is_hidden()
    }
}

fn download_style() -> IndicatifStyle {
    IndicatifStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| IndicatifStyle::default_bar())
        .progress_chars("=>-")
}

fn spinner_style() -> IndicatifStyle {
    IndicatifStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| IndicatifStyle::default_spinner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_bar_accepts_updates() {
        let bar = ProgressBar::new_download(true);
        assert!(bar.is_hidden());
        bar.set_message("artifact");
        bar.update(10, Some(100));
        bar.update(100, Some(100));
        bar.finish_and_clear();
    }

    #[test]
    fn test_hidden_spinner() {
        let spinner = ProgressBar::new_spinner(true);
        assert!(spinner.is_hidden());
        spinner.finish_with_message("done");
    }
}
