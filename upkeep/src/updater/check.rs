use crate::updater::{cache::Cache, epoch_milli, versions};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};

/// There is only ever one current version, so the last check result is the only thing worth caching.
const LAST_CHECK_CACHE_KEY: &str = "upkeep:update_check:last";

pub const REASON_NOT_CONFIGURED: &str = "not configured";
pub const REASON_UP_TO_DATE: &str = "up to date";

/// Describes an available update, or why there is none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub current_version: String,
    pub latest_version: Option<String>,
    pub available: bool,
    pub download_url: String,

    /// Hex encoded SHA-256 of the update archive.
    pub checksum: String,

    pub release_date: String,
    pub is_security_update: bool,
    pub minimum_runtime_version: String,
    pub changelog: Vec<String>,
    pub patch_notes: String,

    /// Size of the update archive in bytes, if the feed reports it.
    pub file_size: Option<u64>,

    /// Why no update is available; a transport error, "not configured" or "up to date".
    pub reason: Option<String>,

    /// Time of the check in epoch milliseconds.
    pub checked_at: u64,
}

impl UpdateInfo {
    pub fn unavailable(current_version: &str, reason: &str) -> Self {
        UpdateInfo {
            current_version: current_version.into(),
            available: false,
            reason: Some(reason.into()),
            checked_at: epoch_milli(),
            ..Default::default()
        }
    }
}

/// The update feed's response body. Everything but the availability flag is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FeedResponse {
    update_available: bool,
    latest_version: Option<String>,
    release_date: Option<String>,
    download_url: Option<String>,
    changelog: Vec<String>,
    patch_notes: Option<String>,
    is_security_update: bool,
    minimum_runtime_version: Option<String>,
    file_size: Option<u64>,
    checksum: Option<String>,
}

impl FeedResponse {
    fn into_update_info(self, current_version: &str) -> UpdateInfo {
        let mut info = UpdateInfo {
            current_version: current_version.into(),
            latest_version: self.latest_version.clone(),
            available: self.update_available,
            download_url: self.download_url.unwrap_or_default(),
            checksum: self.checksum.unwrap_or_default(),
            release_date: self.release_date.unwrap_or_default(),
            is_security_update: self.is_security_update,
            minimum_runtime_version: self.minimum_runtime_version.unwrap_or_default(),
            changelog: self.changelog,
            patch_notes: self.patch_notes.unwrap_or_default(),
            file_size: self.file_size,
            reason: None,
            checked_at: epoch_milli(),
        };

        // Never offer a version we are already at or past, whatever the feed claims.
        let newer = self
            .latest_version
            .as_deref()
            .is_some_and(|latest| versions::is_newer(latest, current_version));

        if !info.available || !newer {
            info.available = false;
            info.reason = Some(REASON_UP_TO_DATE.into());
        }

        info
    }
}

/// Queries the remote update feed. Checks never fail; problems are reported through `UpdateInfo::reason`.
#[derive(Debug, Clone)]
pub struct UpdateChecker {
    client: reqwest::Client,

    /// None when no feed is configured.
    url: Option<String>,

    app_key: String,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl UpdateChecker {
    pub fn new(
        url: &str,
        app_key: &str,
        timeout: Duration,
        cache: Arc<dyn Cache>,
        ttl: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let url = if url.trim().is_empty() {
            None
        } else {
            Some(url.trim().to_string())
        };

        Ok(Self {
            client,
            url,
            app_key: app_key.into(),
            cache,
            ttl,
        })
    }

    /// Returns the last successful check result if it is still within its TTL.
    pub fn last_result(&self) -> Option<UpdateInfo> {
        let raw = self.cache.get(LAST_CHECK_CACHE_KEY)?;
        serde_json::from_slice(&raw).ok()
    }

    /// Drops the cached result, for example after the current version changed.
    pub fn invalidate(&self) {
        self.cache.forget(LAST_CHECK_CACHE_KEY);
    }

    /// Checks the feed for a version newer than `current_version`. A cached result is returned when it is still
    /// fresh and was computed for the same current version, unless `force` is set.
    #[instrument(skip(self), fields(origin = "updater::check"))]
    pub async fn check(&self, current_version: &str, force: bool) -> UpdateInfo {
        let Some(url) = &self.url else {
            debug!("Skipping update check; no update feed configured");
            return UpdateInfo::unavailable(current_version, REASON_NOT_CONFIGURED);
        };

        if !force {
            if let Some(cached) = self.last_result() {
                if cached.current_version == current_version {
                    debug!("Returning cached update check result");
                    return cached;
                }
            }
        }

        let info = match self.query_feed(url, current_version).await {
            Ok(info) => info,
            Err(reason) => {
                warn!(url = %url, reason = %reason, "Update check failed");
                return UpdateInfo::unavailable(current_version, &reason);
            }
        };

        match serde_json::to_vec(&info) {
            Ok(raw) => self.cache.put(LAST_CHECK_CACHE_KEY, raw, self.ttl),
            Err(e) => warn!(error = %e, "Could not cache update check result"),
        }

        info
    }

    async fn query_feed(&self, url: &str, current_version: &str) -> Result<UpdateInfo, String> {
        let response = self
            .client
            .get(url)
            .query(&[
                ("current_version", current_version),
                ("app_key", self.app_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("update feed timed out; {e}")
                } else {
                    format!("could not reach update feed; {e}")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("update feed responded with status {}", status.as_u16()));
        }

        let feed: FeedResponse = response
            .json()
            .await
            .map_err(|e| format!("could not decode update feed response; {e}"))?;

        Ok(feed.into_update_info(current_version))
    }
}
