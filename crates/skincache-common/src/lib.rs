//! # skincache common
//!
//! Shared error types, logging configuration and retry helpers used by the
//! skincache crates.
//!
//! ## Features
//!
//! - Timeout error and the [`Retryable`] classification used by retries
//! - Logging configuration and setup
//! - Retry and timeout utilities

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// An operation did not finish within its deadline.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Errors that know whether another attempt could succeed.
///
/// [`retry_with_backoff`] gives up at once on errors that are not retryable.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for TimedOut {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for clocks before it.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
