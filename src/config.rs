//! Mirror configuration stored in ~/.deskmirror/config.json.
//!
//! Every field has a serde default so a partial (or missing) file yields a
//! usable config. The access token may also come from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Environment variable that overrides `accessToken`.
pub const ACCESS_TOKEN_ENV: &str = "DESKMIRROR_ACCESS_TOKEN";

/// Admin identities whose notes and replies get flagged on materialized threads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerConfig {
    /// Matched exactly against a part author's admin id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_a_admin_id: Option<String>,
    /// Matched exactly against a part author's email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_b_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_incremental_max_pages")]
    pub incremental_max_pages: usize,
    #[serde(default = "default_max_cache_age_hours")]
    pub max_cache_age_hours: u32,
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: u32,
    #[serde(default = "default_refresh_timeout_minutes")]
    pub refresh_timeout_minutes: u32,
    #[serde(default = "default_request_max_attempts")]
    pub request_max_attempts: u32,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_thread_batch_size")]
    pub thread_batch_size: usize,
    #[serde(default = "default_thread_batch_delay_ms")]
    pub thread_batch_delay_ms: u64,
    #[serde(default = "default_poll_interval_minutes")]
    pub poll_interval_minutes: u32,
    /// Replace existing records on incremental refresh instead of keeping
    /// the cached version.
    #[serde(default)]
    pub incremental_upsert: bool,
    #[serde(default)]
    pub reviewers: ReviewerConfig,
}

fn default_api_base_url() -> String {
    "https://api.intercom.io".to_string()
}

fn default_api_version() -> String {
    "2.11".to_string()
}

fn default_data_dir() -> PathBuf {
    state_dir().join("cache")
}

fn default_page_size() -> u32 {
    150
}

fn default_incremental_max_pages() -> usize {
    5
}

fn default_max_cache_age_hours() -> u32 {
    24
}

fn default_stale_after_minutes() -> u32 {
    60
}

fn default_refresh_timeout_minutes() -> u32 {
    10
}

fn default_request_max_attempts() -> u32 {
    1
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_burst() -> u32 {
    10
}

fn default_thread_batch_size() -> usize {
    10
}

fn default_thread_batch_delay_ms() -> u64 {
    1_000
}

fn default_poll_interval_minutes() -> u32 {
    15
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            access_token: None,
            api_version: default_api_version(),
            data_dir: default_data_dir(),
            page_size: default_page_size(),
            incremental_max_pages: default_incremental_max_pages(),
            max_cache_age_hours: default_max_cache_age_hours(),
            stale_after_minutes: default_stale_after_minutes(),
            refresh_timeout_minutes: default_refresh_timeout_minutes(),
            request_max_attempts: default_request_max_attempts(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            thread_batch_size: default_thread_batch_size(),
            thread_batch_delay_ms: default_thread_batch_delay_ms(),
            poll_interval_minutes: default_poll_interval_minutes(),
            incremental_upsert: false,
            reviewers: ReviewerConfig::default(),
        }
    }
}

impl MirrorConfig {
    pub fn max_cache_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_cache_age_hours as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_after_minutes as i64)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_minutes as u64 * 60)
    }

    pub fn thread_batch_delay(&self) -> Duration {
        Duration::from_millis(self.thread_batch_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes as u64 * 60)
    }

    /// Reject values that would stall pagination, batching or rate limiting.
    pub fn validate(&self) -> SyncResult<()> {
        if self.page_size == 0 {
            return Err(SyncError::Configuration("pageSize must be at least 1".into()));
        }
        if self.thread_batch_size == 0 {
            return Err(SyncError::Configuration(
                "threadBatchSize must be at least 1".into(),
            ));
        }
        if self.requests_per_second == 0 {
            return Err(SyncError::Configuration(
                "requestsPerSecond must be at least 1".into(),
            ));
        }
        if url::Url::parse(&self.api_base_url).is_err() {
            return Err(SyncError::Configuration(format!(
                "apiBaseUrl is not a valid URL: {}",
                self.api_base_url
            )));
        }
        Ok(())
    }

    /// Access token, or a configuration error when none is set.
    pub fn require_access_token(&self) -> SyncResult<&str> {
        self.access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                SyncError::Configuration(format!(
                    "No access token configured (set accessToken or {})",
                    ACCESS_TOKEN_ENV
                ))
            })
    }
}

/// Get the state directory (~/.deskmirror)
pub fn state_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".deskmirror")
}

/// Get the canonical config file path (~/.deskmirror/config.json)
pub fn config_path() -> PathBuf {
    state_dir().join("config.json")
}

/// Load config from `path`, falling back to defaults when the file is absent.
///
/// `DESKMIRROR_ACCESS_TOKEN` wins over the file's `accessToken`.
pub fn load_config(path: &Path) -> SyncResult<MirrorConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Configuration(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str::<MirrorConfig>(&content)
            .map_err(|e| SyncError::Configuration(format!("{}: {}", path.display(), e)))?
    } else {
        log::debug!("No config at {}, using defaults", path.display());
        MirrorConfig::default()
    };

    if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
        if !token.trim().is_empty() {
            config.access_token = Some(token);
        }
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "accessToken": "tok", "pageSize": 50 }"#;
        let config: MirrorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.access_token.as_deref(), Some("tok"));
        assert_eq!(config.page_size, 50);
        assert_eq!(config.api_version, "2.11");
        assert_eq!(config.max_cache_age_hours, 24);
        assert_eq!(config.stale_after_minutes, 60);
        assert!(!config.incremental_upsert);
        assert!(config.reviewers.reviewer_a_admin_id.is_none());
    }

    #[test]
    fn test_reviewers_parse() {
        let json = r#"{
            "reviewers": { "reviewerAAdminId": "991", "reviewerBEmail": "lead@acme.com" }
        }"#;
        let config: MirrorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.reviewers.reviewer_a_admin_id.as_deref(), Some("991"));
        assert_eq!(
            config.reviewers.reviewer_b_email.as_deref(),
            Some("lead@acme.com")
        );
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = MirrorConfig {
            thread_batch_size: 0,
            ..MirrorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_token_is_configuration_error() {
        let config = MirrorConfig::default();
        assert!(config.require_access_token().is_err());
    }

    #[test]
    fn test_load_config_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.page_size, 150);
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "threadBatchSize": 4, "incrementalUpsert": true }"#).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.thread_batch_size, 4);
        assert!(config.incremental_upsert);
    }
}
