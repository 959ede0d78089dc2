//! Release discovery from the public web pages.
//!
//! Used when the API is unreachable or rate limited. Three documents are read:
//!
//! - `/<repo>/releases/latest` answers with a redirect to `/releases/tag/<tag>`;
//!   redirects are not followed so the tag can be read from `Location`.
//! - `/<repo>/releases.atom` lists recent releases; tags come from entry titles.
//! - `/<repo>/releases/expanded_assets/<tag>` is an HTML fragment listing the
//!   assets of one release with their download links, digests and sizes.
//!
//! The pages are not a stable interface, so everything here is pattern matching
//! that tolerates missing pieces: an asset without a digest or size is still
//! returned.

use super::{Asset, Release};
use crate::constants::{API_REQUEST_TIMEOUT, USER_AGENT};
use crate::core::{Result, SupervisorError};
use crate::utils::retry::retry_transient;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::LOCATION;
use tracing::debug;

/// Scrapes release information from the web pages of a repository.
#[derive(Debug, Clone)]
pub struct WebReleaseScraper {
    client: reqwest::Client,
    web_base: String,
    repo: String,
}

impl WebReleaseScraper {
    pub fn new(web_base: &str, repo: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(API_REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SupervisorError::network("build HTTP client", e))?;
        Ok(Self {
            client,
            web_base: web_base.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.web_base, self.repo, path)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        retry_transient("web release lookup", move || async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| SupervisorError::network(&format!("GET {url}"), e))?;
            if response.status().is_server_error() || response.status() == StatusCode::TOO_MANY_REQUESTS
            {
                return Err(SupervisorError::network(&format!("GET {url}"), response.status()));
            }
            Ok(response)
        })
        .await
    }

    async fn get_text(&self, url: &str, tag: Option<&str>) -> Result<String> {
        let response = self.get(url).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SupervisorError::ReleaseNotFound {
                tag: tag.unwrap_or("latest").to_string(),
            });
        }
        if !status.is_success() {
            return Err(SupervisorError::network(&format!("GET {url}"), status));
        }
        response.text().await.map_err(|e| SupervisorError::network(&format!("read {url}"), e))
    }

    /// Tag of the latest release, read from the redirect target.
    pub async fn latest_tag(&self) -> Result<String> {
        let url = self.url("releases/latest");
        let response = self.get(&url).await?;
        if !response.status().is_redirection() {
            return Err(SupervisorError::parse(
                "latest release redirect",
                format!("expected a redirect, got HTTP {}", response.status()),
            ));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        tag_from_location(location).ok_or_else(|| {
            SupervisorError::parse("latest release redirect", format!("no tag in '{location}'"))
        })
    }

    /// Releases listed in the Atom feed, without assets.
    pub async fn feed_releases(&self) -> Result<Vec<Release>> {
        let body = self.get_text(&self.url("releases.atom"), None).await?;
        let releases = parse_feed(&body)?;
        debug!("Release feed listed {} releases", releases.len());
        Ok(releases)
    }

    /// Assets of `tag` from its expanded assets fragment.
    pub async fn assets(&self, tag: &str) -> Result<Vec<Asset>> {
        let url = self.url(&format!("releases/expanded_assets/{tag}"));
        let body = self.get_text(&url, Some(tag)).await?;
        parse_expanded_assets(&body, &self.web_base)
    }

    /// Resolve `tag` (or `latest`) into a release with its assets.
    pub async fn release(&self, tag: &str) -> Result<Release> {
        let tag = if tag == "latest" {
            self.latest_tag().await?
        } else {
            tag.to_string()
        };
        let assets = self.assets(&tag).await?;
        if assets.is_empty() {
            return Err(SupervisorError::ReleaseNotFound {
                tag,
            });
        }
        Ok(Release {
            tag_name: tag,
            name: None,
            published_at: None,
            prerelease: false,
            draft: false,
            assets,
        })
    }

    /// The feed's releases, with assets filled in for the latest one.
    pub async fn releases(&self) -> Result<Vec<Release>> {
        let mut releases = self.feed_releases().await?;
        let latest = match self.latest_tag().await {
            Ok(tag) => tag,
            Err(e) => {
                debug!("Latest redirect unavailable, using newest feed entry: {}", e);
                match releases.first() {
                    Some(first) => first.tag_name.clone(),
                    None => return Ok(releases),
                }
            }
        };

        let assets = self.assets(&latest).await?;
        match releases.iter_mut().find(|r| r.tag_name == latest) {
            Some(release) => release.assets = assets,
            None => releases.insert(
                0,
                Release {
                    tag_name: latest,
                    name: None,
                    published_at: None,
                    prerelease: false,
                    draft: false,
                    assets,
                },
            ),
        }
        Ok(releases)
    }
}

fn pattern(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| SupervisorError::Other {
        message: format!("invalid pattern {re}: {e}"),
    })
}

/// Extract the tag from a `.../releases/tag/<tag>` URL.
#[must_use]
pub fn tag_from_location(location: &str) -> Option<String> {
    let (_, tag) = location.split_once("/releases/tag/")?;
    let tag = tag.split(['?', '#', '/']).next()?.trim();
    (!tag.is_empty()).then(|| tag.to_string())
}

/// Parse the entries of a releases Atom feed.
pub fn parse_feed(body: &str) -> Result<Vec<Release>> {
    let title_re = pattern(r"(?s)<title[^>]*>(.*?)</title>")?;
    let version_re = pattern(r"v?\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.\-]+)?")?;
    let link_re = pattern(r#"/releases/tag/([^"'<>\s]+)"#)?;
    let updated_re = pattern(r"<updated>([^<]+)</updated>")?;

    let mut releases = Vec::new();
    for entry in body.split("<entry>").skip(1) {
        let entry = entry.split("</entry>").next().unwrap_or(entry);
        let title = title_re.captures(entry).map(|c| c[1].trim().to_string());

        let tag = title
            .as_deref()
            .and_then(|t| version_re.find(t).map(|m| m.as_str().to_string()))
            .or_else(|| link_re.captures(entry).map(|c| c[1].to_string()));
        let Some(tag) = tag else {
            continue;
        };
        if releases.iter().any(|r: &Release| r.tag_name == tag) {
            continue;
        }

        let published_at = updated_re
            .captures(entry)
            .and_then(|c| DateTime::parse_from_rfc3339(c[1].trim()).ok())
            .map(|d| d.with_timezone(&Utc));
        releases.push(Release {
            tag_name: tag,
            name: title,
            published_at,
            prerelease: false,
            draft: false,
            assets: Vec::new(),
        });
    }

    if releases.is_empty() && !body.contains("<feed") {
        return Err(SupervisorError::parse("release feed", "not an Atom document"));
    }
    Ok(releases)
}

/// Parse an expanded assets HTML fragment.
///
/// Each asset is a list item holding its download link and, when published, a
/// `sha256:` digest and a human readable size.
pub fn parse_expanded_assets(body: &str, web_base: &str) -> Result<Vec<Asset>> {
    let href_re = pattern(r#"href="([^"]*/releases/download/[^"]+)""#)?;
    let digest_re = pattern(r"sha256:([0-9a-fA-F]{64})")?;
    let size_re = pattern(r"(?i)>\s*(\d+(?:\.\d+)?)\s*(bytes|[KMG]B)\s*<")?;

    let mut assets: Vec<Asset> = Vec::new();
    for item in body.split("<li").skip(1) {
        let Some(href) = href_re.captures(item).map(|c| c[1].to_string()) else {
            continue;
        };
        let Some(name) = href.rsplit('/').next().filter(|n| !n.is_empty()) else {
            continue;
        };
        if assets.iter().any(|a| a.name == name) {
            continue;
        }

        let download_url = if href.starts_with("http") {
            href.clone()
        } else {
            format!("{}{}", web_base.trim_end_matches('/'), href)
        };
        let digest = digest_re.captures(item).map(|c| format!("sha256:{}", c[1].to_lowercase()));
        let size = size_re
            .captures(item)
            .and_then(|c| parse_size(&c[1], &c[2]))
            .unwrap_or(0);

        assets.push(Asset {
            name: name.to_string(),
            download_url,
            size,
            digest,
        });
    }
    Ok(assets)
}

/// Convert a size such as `12.3 MB` to bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "BYTES" => 1.0,
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}
