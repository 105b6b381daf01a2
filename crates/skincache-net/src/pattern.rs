//! URL patterns for matching intercepted requests.

use crate::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Hostname equals the pattern.
    Host,
    /// Path equals the pattern.
    PathExact,
    /// Path starts with the pattern.
    PathPrefix,
    /// Path ends with the pattern (file extensions).
    PathSuffix,
    /// Path contains the pattern.
    PathContains,
}

/// A pattern over one component of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Match a hostname exactly (hostnames are compared lowercase).
    pub fn host(host: &str) -> Self {
        Self {
            pattern_type: PatternType::Host,
            pattern: host.to_ascii_lowercase(),
        }
    }

    /// Match a path exactly.
    pub fn path(path: &str) -> Self {
        Self {
            pattern_type: PatternType::PathExact,
            pattern: path.to_string(),
        }
    }

    /// Match a path prefix.
    pub fn path_prefix(prefix: &str) -> Self {
        Self {
            pattern_type: PatternType::PathPrefix,
            pattern: prefix.to_string(),
        }
    }

    /// Match a path suffix, e.g. `.png`.
    pub fn path_suffix(suffix: &str) -> Self {
        Self {
            pattern_type: PatternType::PathSuffix,
            pattern: suffix.to_string(),
        }
    }

    /// Match a substring of the path.
    pub fn path_contains(substring: &str) -> Self {
        Self {
            pattern_type: PatternType::PathContains,
            pattern: substring.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let path = url.path();
        match self.pattern_type {
            PatternType::Host => url
                .host_str()
                .is_some_and(|host| host.eq_ignore_ascii_case(&self.pattern)),
            PatternType::PathExact => path == self.pattern,
            PatternType::PathPrefix => path.starts_with(&self.pattern),
            PatternType::PathSuffix => path.ends_with(&self.pattern),
            PatternType::PathContains => path.contains(&self.pattern),
        }
    }
}
