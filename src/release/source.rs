//! Release API client.
//!
//! [`ReleaseSource`] lists releases from the structured API and keeps the on-disk
//! [`ReleaseCache`] current. Revalidation sends the stored `ETag` as
//! `If-None-Match`; a `304 Not Modified` answer only refreshes the cache's fetch
//! time. Rate limits are recognised from `429`, or `403` with
//! `x-ratelimit-remaining: 0`, and carry the reset time when the server sends one.
//!
//! When the API fails with a network, rate-limit or parse error and web fallback is
//! enabled, the public release pages are scraped instead (see [`super::web`]).

use super::cache::{CachedReleases, ReleaseCache};
use super::web::WebReleaseScraper;
use super::{CachePolicy, Release, ReleaseProvider, sort_newest_first};
use crate::config::ReleaseSettings;
use crate::constants::{API_REQUEST_TIMEOUT, USER_AGENT};
use crate::core::{Result, SupervisorError};
use crate::utils::retry::retry_transient;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, HeaderMap, HeaderValue, IF_NONE_MATCH};
use tracing::{debug, info, warn};

const RELEASES_PER_PAGE: u32 = 30;

/// Result of a conditional list request.
enum ListResponse {
    NotModified,
    Modified {
        releases: Vec<Release>,
        etag: Option<String>,
    },
}

/// [`ReleaseProvider`] backed by the release API, the on-disk cache and,
/// optionally, the web pages.
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    client: reqwest::Client,
    api_base: String,
    repo: String,
    token: Option<String>,
    ttl_secs: u64,
    cache: ReleaseCache,
    web: Option<WebReleaseScraper>,
}

impl ReleaseSource {
    pub fn new(settings: &ReleaseSettings, cache: ReleaseCache) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static("2022-11-28"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(API_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SupervisorError::network("build HTTP client", e))?;

        let web = if settings.web_fallback {
            Some(WebReleaseScraper::new(&settings.web_base, &settings.repo)?)
        } else {
            None
        };

        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            repo: settings.repo.clone(),
            token: settings.github_token.clone().filter(|t| !t.is_empty()),
            ttl_secs: settings.cache_ttl_secs,
            cache,
            web,
        })
    }

    #[must_use]
    pub const fn cache(&self) -> &ReleaseCache {
        &self.cache
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn list(&self, etag: Option<&str>) -> Result<ListResponse> {
        let url = format!(
            "{}/repos/{}/releases?per_page={RELEASES_PER_PAGE}",
            self.api_base, self.repo
        );
        let url = url.as_str();
        retry_transient("list releases", move || async move {
            let mut request = self.request(url);
            if let Some(etag) = etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            let response = request
                .send()
                .await
                .map_err(|e| SupervisorError::network("list releases", e))?;

            if response.status() == StatusCode::NOT_MODIFIED {
                debug!("Release list not modified");
                return Ok(ListResponse::NotModified);
            }
            let response = check_status(response, None)?;
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .text()
                .await
                .map_err(|e| SupervisorError::network("read release list", e))?;
            let releases: Vec<Release> = serde_json::from_str(&body)
                .map_err(|e| SupervisorError::parse("release list", e))?;
            Ok(ListResponse::Modified {
                releases,
                etag,
            })
        })
        .await
    }

    async fn by_tag(&self, tag: &str) -> Result<Release> {
        let url = format!("{}/repos/{}/releases/tags/{tag}", self.api_base, self.repo);
        let url = url.as_str();
        retry_transient("fetch release", move || async move {
            let response = self
                .request(url)
                .send()
                .await
                .map_err(|e| SupervisorError::network("fetch release", e))?;
            let response = check_status(response, Some(tag))?;
            let body = response
                .text()
                .await
                .map_err(|e| SupervisorError::network("read release", e))?;
            serde_json::from_str(&body).map_err(|e| SupervisorError::parse("release", e))
        })
        .await
    }

    /// Refresh the list from the API, falling back to the web pages and, if
    /// `stale_ok`, to whatever is cached.
    async fn refresh(
        &self,
        cached: Option<CachedReleases>,
        use_validator: bool,
        stale_ok: bool,
    ) -> Result<Vec<Release>> {
        let etag = cached.as_ref().filter(|_| use_validator).and_then(|c| c.etag.clone());

        let api_error = match self.list(etag.as_deref()).await {
            Ok(ListResponse::NotModified) => {
                if let Some(cached) = cached {
                    return Ok(visible(self.cache.touch(cached, self.ttl_secs)?.releases));
                }
                // Unsolicited 304; only a validator-free request can fix that.
                match self.list(None).await {
                    Ok(ListResponse::Modified {
                        releases,
                        etag,
                    }) => return self.store(releases, etag),
                    Ok(ListResponse::NotModified) => SupervisorError::parse(
                        "release list",
                        "server answered 304 to an unconditional request",
                    ),
                    Err(e) => e,
                }
            }
            Ok(ListResponse::Modified {
                releases,
                etag,
            }) => return self.store(releases, etag),
            Err(e) => e,
        };

        if let Some(web) = self.web.as_ref().filter(|_| allows_fallback(&api_error)) {
            warn!("Release API unavailable ({}), reading release pages", api_error);
            match web.releases().await {
                Ok(scraped) if !scraped.is_empty() => {
                    let merged = self.cache.merge_scraped(scraped, self.ttl_secs)?;
                    return Ok(visible(merged.releases));
                }
                Ok(_) => warn!("Release pages listed no releases"),
                Err(e) => warn!("Release pages unavailable: {}", e),
            }
        }

        match cached {
            Some(cached) if stale_ok => {
                warn!("Using stale release cache from {}", cached.fetched_at);
                Ok(visible(cached.releases))
            }
            _ => Err(api_error),
        }
    }

    fn store(&self, releases: Vec<Release>, etag: Option<String>) -> Result<Vec<Release>> {
        let mut releases = releases;
        sort_newest_first(&mut releases);
        info!("Fetched {} releases", releases.len());
        self.cache.store(&CachedReleases::new(releases.clone(), etag, self.ttl_secs))?;
        Ok(visible(releases))
    }

    fn load_cache(&self) -> Option<CachedReleases> {
        match self.cache.load() {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring release cache: {}", e);
                None
            }
        }
    }

    async fn latest(&self) -> Result<Release> {
        let releases = self.fetch_releases(CachePolicy::ReturnCacheIfFresh).await?;
        let Some(latest) = releases.into_iter().find(|r| !r.prerelease) else {
            return Err(SupervisorError::ReleaseNotFound {
                tag: "latest".to_string(),
            });
        };
        if !latest.assets.is_empty() {
            return Ok(latest);
        }
        match &self.web {
            Some(web) => web.release(&latest.tag_name).await,
            None => self.by_tag(&latest.tag_name).await,
        }
    }
}

#[async_trait]
impl ReleaseProvider for ReleaseSource {
    async fn fetch_releases(&self, policy: CachePolicy) -> Result<Vec<Release>> {
        debug!("Fetching releases ({:?})", policy);
        match policy {
            CachePolicy::ReturnCacheElseFail => {
                self.cache.load()?.map(|c| visible(c.releases)).ok_or(SupervisorError::CacheMissing)
            }
            CachePolicy::ReturnCacheIfFresh => {
                let cached = self.load_cache();
                if let Some(cached) = cached.as_ref().filter(|c| c.is_fresh(Utc::now())) {
                    debug!("Release cache is fresh");
                    return Ok(visible(cached.releases.clone()));
                }
                self.refresh(cached, true, true).await
            }
            CachePolicy::Revalidate => self.refresh(self.load_cache(), true, false).await,
            CachePolicy::Reload => self.refresh(self.load_cache(), false, false).await,
        }
    }

    async fn fetch_release(&self, tag: &str) -> Result<Release> {
        if tag == "latest" {
            return self.latest().await;
        }

        if let Some(cached) = self
            .load_cache()
            .and_then(|c| c.releases.into_iter().find(|r| r.tag_name == tag && !r.assets.is_empty()))
        {
            debug!("Release {} found in cache", tag);
            return Ok(cached);
        }

        match self.by_tag(tag).await {
            Ok(release) => Ok(release),
            Err(e) => match self.web.as_ref().filter(|_| allows_fallback(&e)) {
                Some(web) => {
                    warn!("Release API unavailable ({}), reading release page of {}", e, tag);
                    web.release(tag).await
                }
                None => Err(e),
            },
        }
    }
}

/// Drop drafts; they are never installable.
fn visible(releases: Vec<Release>) -> Vec<Release> {
    releases.into_iter().filter(|r| !r.draft).collect()
}

fn allows_fallback(error: &SupervisorError) -> bool {
    matches!(
        error,
        SupervisorError::Network { .. }
            | SupervisorError::RateLimited { .. }
            | SupervisorError::Parse { .. }
    )
}

/// Map API status codes onto the error taxonomy.
fn check_status(response: reqwest::Response, tag: Option<&str>) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers();
    let remaining_zero = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && remaining_zero)
    {
        let reset_at = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        return Err(SupervisorError::RateLimited {
            reset_at,
        });
    }

    if status == StatusCode::NOT_FOUND {
        return match tag {
            Some(tag) => Err(SupervisorError::ReleaseNotFound {
                tag: tag.to_string(),
            }),
            None => Err(SupervisorError::Config {
                message: "release repository not found; check [release].repo".to_string(),
            }),
        };
    }

    Err(SupervisorError::network("release API", format!("HTTP {status}")))
}
