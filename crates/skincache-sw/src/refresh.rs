//! Background refresh of the version manifest.
//!
//! Runs outside any page fetch, on a `background-sync` event. Failures are
//! logged and otherwise ignored.

use skincache_net::{Request, Url};
use tracing::{debug, info};

use crate::policy::PolicyEngine;

/// Sync tag that triggers a refresh.
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

/// Re-fetches one endpoint into the dynamic partition.
#[derive(Clone)]
pub struct BackgroundRefresh {
    engine: PolicyEngine,
    endpoint: Url,
}

impl BackgroundRefresh {
    pub fn new(engine: PolicyEngine, endpoint: Url) -> Self {
        Self { engine, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Whether a sync event with `tag` should trigger a refresh.
    pub fn handles(tag: &str) -> bool {
        tag == BACKGROUND_SYNC_TAG
    }

    /// Refresh once. Returns whether the stored entry was replaced.
    pub async fn run_once(&self) -> bool {
        debug!(url = %self.endpoint, "Background refresh");
        let updated = self
            .engine
            .refresh_dynamic(Request::get(self.endpoint.clone()))
            .await;
        if updated {
            info!(url = %self.endpoint, "Background refresh stored new data");
        }
        updated
    }
}
