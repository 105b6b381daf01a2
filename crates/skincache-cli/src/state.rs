//! On-disk registration state shared between runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const STATE_FILE: &str = "registration.json";

/// Which worker version was in control when the last run exited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationState {
    pub active_version: Option<String>,
}

impl RegistrationState {
    pub fn path(cache_dir: &Path) -> PathBuf {
        cache_dir.join(STATE_FILE)
    }

    /// Load the state, treating a missing or unreadable file as a fresh
    /// registration.
    pub async fn load(cache_dir: &Path) -> Self {
        let path = Self::path(cache_dir);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No registration state");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt registration state");
                Self::default()
            }
        }
    }

    pub async fn save(&self, cache_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(cache_dir)
            .await
            .with_context(|| format!("creating {}", cache_dir.display()))?;
        let path = Self::path(cache_dir);
        let raw = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, raw)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
