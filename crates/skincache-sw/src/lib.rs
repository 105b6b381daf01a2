//! # skincache worker
//!
//! Offline asset cache for the Skin Explorer front end. A single worker
//! instance intercepts every request the app makes, classifies it and serves
//! it through one of three caching policies backed by versioned partitions.
//!
//! ## Features
//!
//! - **Partitions**: `static`, `dynamic` and `images`, each named with the
//!   worker version so a version bump retires a whole category
//! - **Policies**: cache-first, stale-while-revalidate, network-first
//! - **Lifecycle**: install (pre-warm), activate (drop old partitions),
//!   skip-waiting and client claiming
//! - **Control channel**: `SKIP_WAITING`, `CLEAR_CACHE`, `GET_CACHE_STATUS`
//!   plus a `DATA_UPDATED` broadcast to every open tab
//! - **Background refresh**: out-of-band revalidation of the version manifest
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost (one per process)
//!     │
//!     ├── Registration
//!     │       ├── installing (CacheWorker)
//!     │       ├── waiting    (CacheWorker)
//!     │       ├── active     (CacheWorker)
//!     │       └── Clients
//!     │
//!     └── CacheWorker
//!             ├── Classifier ──→ Classification { partition, policy }
//!             ├── PolicyEngine ──→ PartitionStore
//!             │       └── UpdateBroadcaster (DATA_UPDATED)
//!             └── BackgroundRefresh
//! ```

use skincache_net::NetError;
use thiserror::Error;

pub mod classify;
pub mod config;
pub mod control;
pub mod host;
pub mod lifecycle;
pub mod offline;
pub mod policy;
pub mod refresh;
pub mod store;

pub use classify::{Classification, Classifier, LogicalPartition, Policy, RequestClass};
pub use config::{PartitionNames, WorkerConfig};
pub use control::{
    BroadcastMessage, CacheStatus, ClearCacheReply, ControlMessage, PartitionUsage,
    UpdateBroadcaster,
};
pub use host::{WorkerEvent, WorkerHandle, WorkerHost};
pub use lifecycle::{
    CacheWorker, Client, ClientId, Clients, MessageOutcome, Registration, WorkerContext, WorkerId,
    WorkerState,
};
pub use policy::{BackgroundTasks, PolicyEngine};
pub use refresh::{BackgroundRefresh, BACKGROUND_SYNC_TAG};
pub use store::{
    CachedEntry, PartitionHandle, PartitionStatus, PartitionStore, RequestKey, StoreEpoch,
    StoreError, StoredHeader, CACHED_AT_HEADER,
};

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Cache error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker event loop stopped")]
    Stopped,
}
