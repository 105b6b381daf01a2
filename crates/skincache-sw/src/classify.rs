//! Request classification.
//!
//! Maps a request URL to exactly one class, partition and policy. Rules are
//! evaluated in order and the first match wins:
//!
//! 1. **static**: same origin, root document, listed extensions or `/icons/`
//! 2. **api**: any request to an API host
//! 3. **image**: image extensions or splash/icon path markers, any origin
//! 4. **other**: everything else
//!
//! Classification is pure and never consults the store.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use skincache_net::{Request, UrlPattern};
use url::{Origin, Url};

use crate::config::WorkerConfig;

/// A logical partition; its stored name carries the worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalPartition {
    Static,
    Dynamic,
    Images,
}

impl LogicalPartition {
    pub const ALL: [LogicalPartition; 3] = [Self::Static, Self::Dynamic, Self::Images];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Images => "images",
        }
    }
}

/// Request class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Static,
    Api,
    Image,
    Other,
}

impl RequestClass {
    /// Partition this class is stored in, if any.
    pub fn partition(&self) -> Option<LogicalPartition> {
        match self {
            Self::Static => Some(LogicalPartition::Static),
            Self::Api => Some(LogicalPartition::Dynamic),
            Self::Image => Some(LogicalPartition::Images),
            Self::Other => None,
        }
    }
}

/// Caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Serve a stored entry, else fetch and store.
    CacheFirst,
    /// Serve a stored entry at once and always revalidate in the background.
    StaleWhileRevalidate { fresh_for: Duration },
    /// Fetch, else fall back to any stored entry.
    NetworkFirst,
}

/// Result of classifying one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: RequestClass,
    pub partition: Option<LogicalPartition>,
    pub policy: Policy,
}

/// One classification rule.
#[derive(Debug, Clone)]
struct ClassRule {
    class: RequestClass,
    same_origin: bool,
    patterns: Vec<UrlPattern>,
}

impl ClassRule {
    fn matches(&self, url: &Url, origin: &Origin) -> bool {
        if self.same_origin && url.origin() != *origin {
            return false;
        }
        self.patterns.iter().any(|pattern| pattern.matches(url))
    }
}

/// Ordered rule set built from a [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Origin,
    rules: Vec<ClassRule>,
    api_fresh_for: Duration,
}

impl Classifier {
    /// Build the classifier for `origin`.
    pub fn new(origin: &Url, config: &WorkerConfig) -> Self {
        let mut static_patterns = vec![UrlPattern::path("/")];
        static_patterns.extend(config.static_extensions.iter().map(|e| UrlPattern::path_suffix(e)));
        static_patterns.extend(
            config
                .static_path_prefixes
                .iter()
                .map(|p| UrlPattern::path_prefix(p)),
        );

        let api_patterns = config.api_hosts.iter().map(|h| UrlPattern::host(h)).collect();

        let mut image_patterns: Vec<UrlPattern> = config
            .image_extensions
            .iter()
            .map(|e| UrlPattern::path_suffix(e))
            .collect();
        image_patterns.extend(
            config
                .image_path_markers
                .iter()
                .map(|m| UrlPattern::path_contains(m)),
        );

        let rules = vec![
            ClassRule {
                class: RequestClass::Static,
                same_origin: true,
                patterns: static_patterns,
            },
            ClassRule {
                class: RequestClass::Api,
                same_origin: false,
                patterns: api_patterns,
            },
            ClassRule {
                class: RequestClass::Image,
                same_origin: false,
                patterns: image_patterns,
            },
        ];

        Self {
            origin: origin.origin(),
            rules,
            api_fresh_for: config.api_freshness(),
        }
    }

    /// Classify a request by its URL.
    pub fn classify(&self, request: &Request) -> Classification {
        self.classify_url(&request.url)
    }

    pub fn classify_url(&self, url: &Url) -> Classification {
        let class = self
            .rules
            .iter()
            .find(|rule| rule.matches(url, &self.origin))
            .map(|rule| rule.class)
            .unwrap_or(RequestClass::Other);

        let policy = match class {
            RequestClass::Static | RequestClass::Image => Policy::CacheFirst,
            RequestClass::Api => Policy::StaleWhileRevalidate {
                fresh_for: self.api_fresh_for,
            },
            RequestClass::Other => Policy::NetworkFirst,
        };

        Classification {
            class,
            partition: class.partition(),
            policy,
        }
    }
}
