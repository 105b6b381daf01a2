//! Caching policies.
//!
//! The engine runs one of three algorithms against the [`PartitionStore`]:
//!
//! - **cache-first** for static assets and images
//! - **stale-while-revalidate** for API data
//! - **network-first** for everything else
//!
//! Store failures count as misses and network failures end in a synthetic
//! response, so [`PolicyEngine::handle`] always yields a [`Response`].
//! Revalidation runs as tracked background tasks; [`PolicyEngine::settle`]
//! waits for all of them.
//!
//! Every write-back is tagged with the store epoch seen before its fetch
//! started, so a partition deleted meanwhile stays deleted.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use skincache_common::{now_millis, with_timeout};
use skincache_net::{Fetcher, NetError, Request, Response};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::classify::{Classification, LogicalPartition, Policy};
use crate::config::PartitionNames;
use crate::control::{BroadcastMessage, UpdateBroadcaster};
use crate::offline;
use crate::store::{stamp_cached_at, PartitionStore, StoreEpoch};

// ==================== Background Tasks ====================

/// Set of fire-and-forget tasks that can still be awaited as a group.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a task onto the current runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        // Reap finished tasks so the set does not grow without bound
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Wait until every task, including ones spawned meanwhile, has finished.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.lock());
            if pending.is_empty() {
                return;
            }
            while let Some(result) = pending.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Background task failed");
                }
            }
        }
    }
}

// ==================== Policy Engine ====================

/// Executes caching policies for one worker version.
#[derive(Clone)]
pub struct PolicyEngine {
    store: PartitionStore,
    fetcher: Arc<dyn Fetcher>,
    names: PartitionNames,
    updates: UpdateBroadcaster,
    tasks: BackgroundTasks,
    fetch_timeout: Option<Duration>,
}

impl PolicyEngine {
    pub fn new(
        store: PartitionStore,
        fetcher: Arc<dyn Fetcher>,
        names: PartitionNames,
        updates: UpdateBroadcaster,
    ) -> Self {
        Self {
            store,
            fetcher,
            names,
            updates,
            tasks: BackgroundTasks::new(),
            fetch_timeout: None,
        }
    }

    /// Track background work in a shared task set.
    pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
        self.tasks = tasks;
        self
    }

    /// Bound every network fetch by `timeout`.
    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn names(&self) -> &PartitionNames {
        &self.names
    }

    /// Run the policy chosen by `classification`.
    pub async fn handle(&self, classification: Classification, request: Request) -> Response {
        match (classification.policy, classification.partition) {
            (Policy::CacheFirst, Some(partition)) => self.cache_first(partition, request).await,
            (Policy::StaleWhileRevalidate { fresh_for }, _) => {
                self.stale_while_revalidate(request, fresh_for).await
            }
            _ => self.network_first(request).await,
        }
    }

    /// Fetch through the configured fetcher and timeout.
    pub async fn network(&self, request: Request) -> Result<Response, NetError> {
        match self.fetch_timeout {
            Some(timeout) => with_timeout(timeout, || self.fetcher.fetch(request)).await?,
            None => self.fetcher.fetch(request).await,
        }
    }

    /// Serve from `partition`, else fetch and store a 2xx copy.
    pub async fn cache_first(&self, partition: LogicalPartition, request: Request) -> Response {
        let name = self.names.get(partition);

        if let Some(entry) = self.store.get(name, &request).await {
            debug!(url = %request.url, partition = name, "Cache hit");
            return entry.to_response();
        }

        let since = self.store.epoch();
        match self.network(request.clone()).await {
            Ok(response) => {
                if !response.ok() {
                    return response;
                }
                let (response, copy) = response.tee();
                let copy = match partition {
                    LogicalPartition::Images => stamp_cached_at(copy, now_millis()),
                    _ => copy,
                };
                match self.store.put_unless_deleted(name, &request, copy, since).await {
                    Ok(true) => {}
                    Ok(false) => debug!(url = %request.url, partition = name, "Partition deleted during fetch, not stored"),
                    Err(e) => warn!(url = %request.url, partition = name, error = %e, "Failed to store response"),
                }
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch failed with no cached entry");
                match partition {
                    LogicalPartition::Images => offline::placeholder_image(),
                    _ => offline::offline_text(),
                }
            }
        }
    }

    /// Serve the stored entry at once and revalidate in the background; with
    /// no entry, wait for the network.
    pub async fn stale_while_revalidate(&self, request: Request, fresh_for: Duration) -> Response {
        let cached = self.store.get(&self.names.dynamic, &request).await;

        let (tx, rx) = oneshot::channel();
        let engine = self.clone();
        let background = request.clone();
        let since = self.store.epoch();
        self.tasks.spawn(async move {
            let outcome = engine.revalidate(background, since).await;
            // The caller only listens when nothing was cached
            let _ = tx.send(outcome);
        });

        if let Some(entry) = cached {
            if entry.is_fresh(now_millis(), fresh_for) {
                debug!(url = %request.url, "Serving fresh entry");
            } else {
                debug!(url = %request.url, "Serving stale entry while revalidating");
            }
            return entry.to_response();
        }

        match rx.await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => offline::offline_json("Offline"),
            Err(_) => offline::offline_json("Service unavailable"),
        }
    }

    /// Fetch `request`, store a 2xx response in the dynamic partition and
    /// announce it. Nothing is stored or announced when the partition was
    /// deleted after `since`.
    async fn revalidate(&self, request: Request, since: StoreEpoch) -> Result<Response, NetError> {
        let response = match self.network(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Revalidation failed");
                return Err(e);
            }
        };

        if !response.ok() {
            debug!(url = %request.url, status = %response.status, "Revalidation returned error status");
            return Ok(response);
        }

        let timestamp = now_millis();
        let (response, copy) = response.tee();
        match self
            .store
            .put_unless_deleted(&self.names.dynamic, &request, stamp_cached_at(copy, timestamp), since)
            .await
        {
            Ok(true) => {
                self.updates.publish(BroadcastMessage::DataUpdated {
                    url: request.url.to_string(),
                    timestamp,
                });
            }
            Ok(false) => debug!(url = %request.url, "Dynamic partition deleted during revalidation"),
            Err(e) => warn!(url = %request.url, error = %e, "Failed to store revalidated response"),
        }
        Ok(response)
    }

    /// Network, else any stored entry, else offline text. Network results are
    /// not stored.
    pub async fn network_first(&self, request: Request) -> Response {
        match self.network(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                match self.store.match_any(&request).await {
                    Some(entry) => entry.to_response(),
                    None => offline::offline_text(),
                }
            }
        }
    }

    /// Fetch `request` and overwrite its dynamic entry on 2xx. Returns
    /// whether the entry was updated.
    pub async fn refresh_dynamic(&self, request: Request) -> bool {
        let since = self.store.epoch();
        match self.network(request.clone()).await {
            Ok(response) if response.ok() => {
                let stamped = stamp_cached_at(response, now_millis());
                match self
                    .store
                    .put_unless_deleted(&self.names.dynamic, &request, stamped, since)
                    .await
                {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!(url = %request.url, error = %e, "Failed to store refreshed response");
                        false
                    }
                }
            }
            Ok(response) => {
                warn!(url = %request.url, status = %response.status, "Refresh returned error status");
                false
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Refresh failed");
                false
            }
        }
    }

    /// Wait for every background revalidation to finish.
    pub async fn settle(&self) {
        self.tasks.settle().await;
    }
}
