//! Process-scoped worker host.
//!
//! The host owns the [`Registration`] and the resources shared by every
//! worker version. Events arrive either as direct method calls or through the
//! mpsc queue behind a [`WorkerHandle`]; the event loop handles install,
//! message and sync events one at a time and spawns fetch events so several
//! run concurrently.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use skincache_net::{Fetcher, NetError, Request, Response, Url};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::control::{BroadcastMessage, CacheStatus, ClearCacheReply, ControlMessage};
use crate::lifecycle::{CacheWorker, ClientId, MessageOutcome, Registration, WorkerContext, WorkerId};
use crate::refresh::BACKGROUND_SYNC_TAG;
use crate::store::PartitionStore;
use crate::WorkerError;

/// Events delivered to the host.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Install a new worker version.
    Install {
        config: WorkerConfig,
        reply: oneshot::Sender<Result<WorkerId, WorkerError>>,
    },
    /// Intercepted request.
    Fetch {
        request: Request,
        reply: oneshot::Sender<Result<Response, NetError>>,
    },
    /// Control message from a page; the reply is dropped when there is none.
    Message {
        data: Value,
        reply: Option<oneshot::Sender<Value>>,
    },
    /// Background sync.
    Sync {
        tag: String,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// A tab opened.
    ClientOpened {
        url: Url,
        reply: oneshot::Sender<(ClientId, broadcast::Receiver<BroadcastMessage>)>,
    },
    /// A tab closed.
    ClientClosed { id: ClientId },
}

/// Hosts the worker versions of one scope.
pub struct WorkerHost {
    context: WorkerContext,
    registration: RwLock<Registration>,
}

impl WorkerHost {
    pub fn new(scope: Url, store: PartitionStore, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            context: WorkerContext::new(store, fetcher),
            registration: RwLock::new(Registration::new(scope)),
        }
    }

    pub fn store(&self) -> &PartitionStore {
        &self.context.store
    }

    /// Subscribe to `DATA_UPDATED` notices without registering a tab.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.context.updates.subscribe()
    }

    fn build_worker(&self, config: WorkerConfig) -> Result<Arc<CacheWorker>, WorkerError> {
        Ok(Arc::new(CacheWorker::new(config, self.context.clone())?))
    }

    pub async fn active(&self) -> Option<Arc<CacheWorker>> {
        self.registration.read().await.active().cloned()
    }

    pub async fn waiting(&self) -> Option<Arc<CacheWorker>> {
        self.registration.read().await.waiting().cloned()
    }

    /// Number of open tabs.
    pub async fn client_count(&self) -> usize {
        self.registration.read().await.clients.len()
    }

    /// Install a worker version and activate it when allowed.
    pub async fn install(&self, config: WorkerConfig) -> Result<Arc<CacheWorker>, WorkerError> {
        let worker = self.build_worker(config)?;
        self.registration.write().await.begin_install(Arc::clone(&worker));

        let result = worker.on_install().await;

        let mut registration = self.registration.write().await;
        registration.finish_install(&worker, result.is_ok());
        result?;

        if registration.should_activate_waiting() {
            Self::activate_waiting(&mut registration).await?;
        } else {
            info!(worker = %worker.id, version = %worker.version(), "Installed, waiting for tabs to close");
        }
        Ok(worker)
    }

    /// Adopt a version that was activated by an earlier process.
    pub async fn resume(&self, config: WorkerConfig) -> Result<Arc<CacheWorker>, WorkerError> {
        let worker = self.build_worker(config)?;
        self.registration.write().await.adopt(Arc::clone(&worker));
        info!(worker = %worker.id, version = %worker.version(), "Resumed active worker");
        Ok(worker)
    }

    /// Activate the waiting worker, if any. Returns whether one was activated.
    pub async fn skip_waiting(&self) -> Result<bool, WorkerError> {
        let mut registration = self.registration.write().await;
        Self::activate_waiting(&mut registration).await
    }

    async fn activate_waiting(registration: &mut Registration) -> Result<bool, WorkerError> {
        let Some(worker) = registration.take_waiting() else {
            return Ok(false);
        };
        worker.on_activate().await?;
        if let Some(old) = registration.promote(worker) {
            debug!(worker = %old.id, version = %old.version(), "Replaced worker");
        }
        Ok(true)
    }

    /// Route a request through the active worker, or straight to the network
    /// when none is active.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        match self.active().await {
            Some(worker) => worker.on_fetch(request).await,
            None => {
                debug!(url = %request.url, "No active worker, passing through");
                self.context.fetcher.fetch(request).await
            }
        }
    }

    /// Deliver a page message. Returns the reply, if the message has one.
    pub async fn post_message(&self, data: &Value) -> Option<Value> {
        let message = ControlMessage::parse(data)?;

        if message == ControlMessage::SkipWaiting {
            match self.waiting().await {
                Some(worker) => {
                    worker.on_message(message).await;
                    if let Err(e) = self.skip_waiting().await {
                        warn!(error = %e, "Skip waiting failed");
                    }
                }
                None => debug!("SKIP_WAITING with no waiting worker"),
            }
            return None;
        }

        match self.active().await {
            Some(worker) => match worker.on_message(message).await {
                MessageOutcome::Reply(reply) => Some(reply),
                MessageOutcome::SkipWaiting => None,
            },
            None => {
                debug!(?message, "No active worker to answer message");
                Self::unanswered(message)
            }
        }
    }

    /// Reply a page sees when no worker controls it.
    fn unanswered(message: ControlMessage) -> Option<Value> {
        match message {
            ControlMessage::ClearCache => {
                serde_json::to_value(ClearCacheReply { success: false }).ok()
            }
            ControlMessage::GetCacheStatus => serde_json::to_value(CacheStatus::new()).ok(),
            ControlMessage::SkipWaiting => None,
        }
    }

    /// Deliver a sync event to the active worker.
    pub async fn sync(&self, tag: &str) -> bool {
        match self.active().await {
            Some(worker) => worker.on_sync(tag).await,
            None => {
                debug!(tag, "No active worker for sync");
                false
            }
        }
    }

    /// Register a tab and subscribe it to update notices.
    pub async fn open_client(&self, url: Url) -> (ClientId, broadcast::Receiver<BroadcastMessage>) {
        let mut registration = self.registration.write().await;
        let controller = registration.active().map(|w| w.id);
        let id = registration.clients.open(url, controller);
        (id, self.context.updates.subscribe())
    }

    /// Forget a tab; closing the last one lets a waiting worker activate.
    pub async fn close_client(&self, id: ClientId) -> Result<(), WorkerError> {
        let mut registration = self.registration.write().await;
        if registration.clients.close(id).is_none() {
            debug!(?id, "Unknown client closed");
            return Ok(());
        }
        if registration.clients.is_empty() && registration.waiting().is_some() {
            Self::activate_waiting(&mut registration).await?;
        }
        Ok(())
    }

    /// Wait for every worker's background work and for the store to finish
    /// writing it.
    pub async fn settle(&self) {
        self.context.tasks.settle().await;
        if let Err(e) = self.context.store.flush().await {
            warn!(error = %e, "Flushing partition store failed");
        }
    }

    /// Handle one event.
    pub async fn dispatch(self: &Arc<Self>, event: WorkerEvent) {
        match event {
            WorkerEvent::Install { config, reply } => {
                let result = self.install(config).await.map(|worker| worker.id);
                let _ = reply.send(result);
            }
            WorkerEvent::Fetch { request, reply } => {
                let host = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = reply.send(host.fetch(request).await);
                });
            }
            WorkerEvent::Message { data, reply } => {
                if let (Some(answer), Some(reply)) = (self.post_message(&data).await, reply) {
                    let _ = reply.send(answer);
                }
            }
            WorkerEvent::Sync { tag, reply } => {
                let updated = self.sync(&tag).await;
                if let Some(reply) = reply {
                    let _ = reply.send(updated);
                }
            }
            WorkerEvent::ClientOpened { url, reply } => {
                let _ = reply.send(self.open_client(url).await);
            }
            WorkerEvent::ClientClosed { id } => {
                if let Err(e) = self.close_client(id).await {
                    warn!(error = %e, "Activation after last tab closed failed");
                }
            }
        }
    }

    /// Start the event loop. It runs until every [`WorkerHandle`] is dropped.
    pub fn spawn(self: Arc<Self>) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.dispatch(event).await;
            }
            debug!("Worker event loop stopped");
        });
        (WorkerHandle { tx }, task)
    }

    /// Deliver a `background-sync` event every `period`. The first one fires
    /// one period after spawning.
    pub fn spawn_periodic_refresh(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                host.sync(BACKGROUND_SYNC_TAG).await;
            }
        })
    }
}

/// Sender side of the host's event queue.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHandle {
    fn send(&self, event: WorkerEvent) -> Result<(), WorkerError> {
        self.tx.send(event).map_err(|_| WorkerError::Stopped)
    }

    pub async fn install(&self, config: WorkerConfig) -> Result<WorkerId, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Install { config, reply })?;
        rx.await.map_err(|_| WorkerError::Stopped)?
    }

    pub async fn fetch(&self, request: Request) -> Result<Response, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Fetch { request, reply })?;
        Ok(rx.await.map_err(|_| WorkerError::Stopped)??)
    }

    /// Send a control message and wait for its reply, if it has one.
    pub async fn post_message(&self, data: Value) -> Result<Option<Value>, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Message {
            data,
            reply: Some(reply),
        })?;
        Ok(rx.await.ok())
    }

    pub async fn sync(&self, tag: impl Into<String>) -> Result<bool, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Sync {
            tag: tag.into(),
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| WorkerError::Stopped)
    }

    pub async fn open_client(
        &self,
        url: Url,
    ) -> Result<(ClientId, broadcast::Receiver<BroadcastMessage>), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::ClientOpened { url, reply })?;
        rx.await.map_err(|_| WorkerError::Stopped)
    }

    pub fn close_client(&self, id: ClientId) -> Result<(), WorkerError> {
        self.send(WorkerEvent::ClientClosed { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::WorkerState;
    use serde_json::json;
    use skincache_net::MockFetcher;

    fn scope() -> Url {
        Url::parse("http://localhost:5173/").unwrap()
    }

    fn online_fetcher() -> Arc<MockFetcher> {
        let fetcher = Arc::new(MockFetcher::new());
        for url in WorkerConfig::default().static_asset_urls().unwrap() {
            fetcher.route(url.as_str(), 200, "asset");
        }
        fetcher
    }

    fn host(fetcher: Arc<MockFetcher>) -> Arc<WorkerHost> {
        Arc::new(WorkerHost::new(scope(), PartitionStore::in_memory(), fetcher))
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_passes_through() {
        let fetcher = Arc::new(MockFetcher::offline());
        let host = host(fetcher);

        let request = Request::get(Url::parse("http://localhost:5173/index.html").unwrap());
        assert!(matches!(host.fetch(request).await, Err(NetError::Offline)));
    }

    #[tokio::test]
    async fn test_first_install_activates() {
        let host = host(online_fetcher());

        let worker = host.install(WorkerConfig::default()).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);
        assert_eq!(host.active().await.map(|w| w.id), Some(worker.id));
    }

    #[tokio::test]
    async fn test_waiting_worker_activates_when_last_tab_closes() {
        let host = host(online_fetcher());
        host.install(WorkerConfig::default()).await.unwrap();
        let (tab, _updates) = host.open_client(scope()).await;

        let config = WorkerConfig {
            skip_waiting_on_install: false,
            ..WorkerConfig::default().with_version("2.0.0")
        };
        let next = host.install(config).await.unwrap();
        assert_eq!(next.state(), WorkerState::Installed);
        assert_eq!(host.waiting().await.map(|w| w.id), Some(next.id));

        host.close_client(tab).await.unwrap();
        assert_eq!(host.active().await.map(|w| w.id), Some(next.id));
        assert!(host.waiting().await.is_none());
    }

    #[tokio::test]
    async fn test_skip_waiting_message_activates() {
        let host = host(online_fetcher());
        let first = host.install(WorkerConfig::default()).await.unwrap();
        let (_tab, _updates) = host.open_client(scope()).await;

        let config = WorkerConfig {
            skip_waiting_on_install: false,
            ..WorkerConfig::default().with_version("2.0.0")
        };
        let next = host.install(config).await.unwrap();

        assert_eq!(host.post_message(&json!({"type": "SKIP_WAITING"})).await, None);
        assert!(next.is_active());
        assert!(first.is_redundant());
        assert!(!host.store().has("skin-explorer-static-v1.0.0").await);
        assert!(host.store().has("skin-explorer-static-v2.0.0").await);
    }

    #[tokio::test]
    async fn test_messages_without_active_worker() {
        let host = host(online_fetcher());
        assert_eq!(
            host.post_message(&json!({"type": "CLEAR_CACHE"})).await,
            Some(json!({"success": false}))
        );
        assert_eq!(
            host.post_message(&json!({"type": "GET_CACHE_STATUS"})).await,
            Some(json!({}))
        );
        assert_eq!(host.post_message(&json!({"type": "UNKNOWN"})).await, None);
    }

    #[tokio::test]
    async fn test_event_loop_round_trip() {
        let fetcher = online_fetcher();
        let (handle, task) = host(fetcher.clone()).spawn();

        handle.install(WorkerConfig::default()).await.unwrap();

        let request = Request::get(Url::parse("http://localhost:5173/index.html").unwrap());
        let calls = fetcher.call_count();
        let response = handle.fetch(request).await.unwrap();
        assert_eq!(response.text().unwrap(), "asset");
        assert_eq!(fetcher.call_count(), calls);

        let status = handle
            .post_message(json!({"type": "GET_CACHE_STATUS"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status["skin-explorer-static-v1.0.0"]["count"], 9);

        assert_eq!(handle.post_message(json!({"type": "NOPE"})).await.unwrap(), None);
        assert!(!handle.sync("not-background").await.unwrap());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_settle_flushes_store_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open_dir(dir.path()).await.unwrap();
        let host = Arc::new(WorkerHost::new(scope(), store, online_fetcher()));
        host.install(WorkerConfig::default()).await.unwrap();
        host.settle().await;

        let reopened = PartitionStore::open_dir(dir.path()).await.unwrap();
        assert_eq!(reopened.enumerate().await, host.store().enumerate().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh_goes_through_active_worker() {
        let fetcher = online_fetcher();
        let versions = "https://ddragon.leagueoflegends.com/api/versions.json";
        fetcher.route(versions, 200, "[]");
        let host = host(fetcher.clone());
        host.install(WorkerConfig::default()).await.unwrap();
        let after_install = fetcher.calls_to(versions);

        let driver = host.spawn_periodic_refresh(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(150)).await;
        driver.abort();

        assert_eq!(fetcher.calls_to(versions), after_install + 2);
    }
}
