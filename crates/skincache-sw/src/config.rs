//! Worker configuration.
//!
//! Every field has a default matching the deployed Skin Explorer build, so an
//! empty JSON object (or no file at all) yields a working worker.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::classify::LogicalPartition;
use crate::WorkerError;

/// Default partition name prefix.
pub const DEFAULT_CACHE_PREFIX: &str = "skin-explorer";

/// Default worker version.
pub const DEFAULT_VERSION: &str = "1.0.0";

/// Freshness window for API responses.
pub const DEFAULT_API_FRESH_SECS: u64 = 5 * 60;

/// Configuration for one worker version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix for partition names; empty yields `<logical>-v<version>`.
    pub cache_prefix: String,

    /// Worker version; part of every partition name.
    pub version: String,

    /// Origin the app is served from.
    pub origin: String,

    /// App-shell paths pre-warmed into the static partition on install.
    pub static_assets: Vec<String>,

    /// API endpoints pre-warmed into the dynamic partition on install.
    pub bootstrap_endpoints: Vec<String>,

    /// Same-origin path suffixes that classify as static.
    pub static_extensions: Vec<String>,

    /// Same-origin path prefixes that classify as static.
    pub static_path_prefixes: Vec<String>,

    /// Hostnames whose requests are API data.
    pub api_hosts: Vec<String>,

    /// Path suffixes that classify as images.
    pub image_extensions: Vec<String>,

    /// Path substrings that classify as images.
    pub image_path_markers: Vec<String>,

    /// How long a dynamic entry counts as fresh.
    pub api_fresh_secs: u64,

    /// Endpoint revalidated by the background refresh.
    pub refresh_endpoint: String,

    /// Request activation as soon as install succeeds.
    pub skip_waiting_on_install: bool,

    /// Per-fetch timeout; none means the fetcher's own limits apply.
    pub fetch_timeout_secs: Option<u64>,

    /// Period of the background refresh driver; none disables it.
    pub refresh_interval_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            version: DEFAULT_VERSION.to_string(),
            origin: "http://localhost:5173/".to_string(),
            static_assets: strings(&[
                "/",
                "/index.html",
                "/favicon.png",
                "/icons/epic.png",
                "/icons/legendary.png",
                "/icons/mythic.png",
                "/icons/ultimate.png",
                "/icons/exalted.png",
                "/icons/transcendent.png",
            ]),
            bootstrap_endpoints: strings(&[
                "https://ddragon.leagueoflegends.com/api/versions.json",
                "https://raw.communitydragon.org/latest/plugins/rcp-be-lol-game-data/global/default/v1/skinlines.json",
                "https://raw.communitydragon.org/pbe/plugins/rcp-be-lol-game-data/global/default/v1/skinlines.json",
            ]),
            static_extensions: strings(&[".html", ".js", ".css", ".png", ".ico"]),
            static_path_prefixes: strings(&["/icons/"]),
            api_hosts: strings(&["ddragon.leagueoflegends.com", "raw.communitydragon.org"]),
            image_extensions: strings(&[".jpg", ".jpeg", ".png", ".webp"]),
            image_path_markers: strings(&[
                "/champion/splash/",
                "/champion-splashes/",
                "/champion-chroma-images/",
                "/champion-icons/",
            ]),
            api_fresh_secs: DEFAULT_API_FRESH_SECS,
            refresh_endpoint: "https://ddragon.leagueoflegends.com/api/versions.json".to_string(),
            skip_waiting_on_install: true,
            fetch_timeout_secs: None,
            refresh_interval_secs: None,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl WorkerConfig {
    /// Load a configuration file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| WorkerError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), version = %config.version, "Loaded worker config");
        Ok(config)
    }

    /// Same configuration with another version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Versioned partition names for this configuration.
    pub fn partition_names(&self) -> PartitionNames {
        PartitionNames {
            static_assets: self.partition_name(LogicalPartition::Static),
            dynamic: self.partition_name(LogicalPartition::Dynamic),
            images: self.partition_name(LogicalPartition::Images),
        }
    }

    /// Name of one logical partition, e.g. `skin-explorer-images-v1.0.0`.
    pub fn partition_name(&self, partition: LogicalPartition) -> String {
        if self.cache_prefix.is_empty() {
            format!("{}-v{}", partition.as_str(), self.version)
        } else {
            format!("{}-{}-v{}", self.cache_prefix, partition.as_str(), self.version)
        }
    }

    /// Freshness window for the dynamic partition.
    pub fn api_freshness(&self) -> Duration {
        Duration::from_secs(self.api_fresh_secs)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_secs.map(Duration::from_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// The app origin as a URL.
    pub fn origin_url(&self) -> Result<Url, WorkerError> {
        parse_url(&self.origin, "origin")
    }

    /// Static manifest resolved against the origin.
    pub fn static_asset_urls(&self) -> Result<Vec<Url>, WorkerError> {
        let origin = self.origin_url()?;
        self.static_assets
            .iter()
            .map(|path| {
                origin
                    .join(path)
                    .map_err(|e| WorkerError::Config(format!("static asset {path}: {e}")))
            })
            .collect()
    }

    pub fn bootstrap_urls(&self) -> Result<Vec<Url>, WorkerError> {
        self.bootstrap_endpoints
            .iter()
            .map(|endpoint| parse_url(endpoint, "bootstrap endpoint"))
            .collect()
    }

    pub fn refresh_url(&self) -> Result<Url, WorkerError> {
        parse_url(&self.refresh_endpoint, "refresh endpoint")
    }
}

fn parse_url(raw: &str, what: &str) -> Result<Url, WorkerError> {
    Url::parse(raw).map_err(|e| WorkerError::Config(format!("{what} {raw}: {e}")))
}

/// The three versioned partition names of one worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
    pub static_assets: String,
    pub dynamic: String,
    pub images: String,
}

impl PartitionNames {
    pub fn get(&self, partition: LogicalPartition) -> &str {
        match partition {
            LogicalPartition::Static => &self.static_assets,
            LogicalPartition::Dynamic => &self.dynamic,
            LogicalPartition::Images => &self.images,
        }
    }

    /// All names; the set that survives activation.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.static_assets.clone(),
            self.dynamic.clone(),
            self.images.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_partition_names() {
        let names = WorkerConfig::default().partition_names();
        assert_eq!(names.static_assets, "skin-explorer-static-v1.0.0");
        assert_eq!(names.dynamic, "skin-explorer-dynamic-v1.0.0");
        assert_eq!(names.images, "skin-explorer-images-v1.0.0");
    }

    #[test]
    fn test_empty_prefix() {
        let config = WorkerConfig {
            cache_prefix: String::new(),
            version: "2".to_string(),
            ..Default::default()
        };
        assert_eq!(config.partition_name(LogicalPartition::Images), "images-v2");
    }

    #[test]
    fn test_static_urls_resolve_against_origin() {
        let config = WorkerConfig::default();
        let urls = config.static_asset_urls().unwrap();
        assert_eq!(urls.len(), 9);
        assert_eq!(urls[0].as_str(), "http://localhost:5173/");
        assert_eq!(urls[3].as_str(), "http://localhost:5173/icons/epic.png");
    }

    #[test]
    fn test_durations() {
        let config = WorkerConfig {
            refresh_interval_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(config.api_freshness(), Duration::from_secs(300));
        assert_eq!(config.fetch_timeout(), None);
        assert_eq!(config.refresh_interval(), None);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"version": "2.0.0", "skip_waiting_on_install": false}}"#).unwrap();

        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.version, "2.0.0");
        assert!(!config.skip_waiting_on_install);
        assert_eq!(config.cache_prefix, DEFAULT_CACHE_PREFIX);
        assert_eq!(config.api_hosts.len(), 2);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            WorkerConfig::load(file.path()),
            Err(WorkerError::Config(_))
        ));
    }
}
