//! `releases` command: list upstream releases through the release cache.

use super::common::CommandContext;
use crate::release::{AssetSelector, CachePolicy, ReleaseCache, ReleaseProvider, ReleaseSource};
use crate::utils::platform::HostPlatform;
use anyhow::Result;
use clap::Args;
use colored::Colorize;

#[derive(Args)]
pub struct ReleasesCommand {
    /// Revalidate the cache with the release API
    #[arg(long, conflicts_with = "offline")]
    refresh: bool,

    /// Only use the cache, never the network
    #[arg(long)]
    offline: bool,

    /// Include prereleases
    #[arg(long)]
    prerelease: bool,

    /// Number of releases to show
    #[arg(short = 'n', long, default_value_t = 10)]
    limit: usize,
}

impl ReleasesCommand {
    const fn policy(&self) -> CachePolicy {
        if self.refresh {
            CachePolicy::Revalidate
        } else if self.offline {
            CachePolicy::ReturnCacheElseFail
        } else {
            CachePolicy::ReturnCacheIfFresh
        }
    }

    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let config = &ctx.config;
        let host = HostPlatform::detect()?;
        let source = ReleaseSource::new(
            &config.release,
            ReleaseCache::new(config.layout().cache_file()),
        )?;
        let releases = source.fetch_releases(self.policy()).await?;
        let selector = AssetSelector::new(host.clone());

        let shown: Vec<_> =
            releases.iter().filter(|r| self.prerelease || !r.prerelease).take(self.limit).collect();
        if shown.is_empty() {
            println!("No releases found for {}.", config.release.repo);
            return Ok(());
        }

        println!("{} ({})", "Releases".bold(), config.release.repo);
        for release in shown {
            let date = release
                .published_at
                .map(|at| at.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "unknown date".to_string());
            let availability = if release.assets.is_empty() {
                "assets not listed".dimmed().to_string()
            } else if selector.select(release).is_ok() {
                format!("{}_{}", host.os, host.arch).green().to_string()
            } else {
                "no build for this host".yellow().to_string()
            };
            let pre = if release.prerelease { " (prerelease)".yellow().to_string() } else { String::new() };
            println!("  {}{}  {}  {}", release.tag_name.bold(), pre, date.dimmed(), availability);
        }
        Ok(())
    }
}
