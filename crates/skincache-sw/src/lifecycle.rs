//! Worker lifecycle.
//!
//! A [`CacheWorker`] is one version of the cache worker with explicit hooks
//! for each event it handles. A [`Registration`] tracks the installing,
//! waiting and active versions plus the open tabs ([`Clients`]) they control.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skincache_net::{Fetcher, NetError, Request, Response, Url};
use tracing::{debug, error, info, warn};

use crate::classify::Classifier;
use crate::config::WorkerConfig;
use crate::control::{cache_status, ClearCacheReply, ControlMessage, UpdateBroadcaster};
use crate::policy::{BackgroundTasks, PolicyEngine};
use crate::refresh::BackgroundRefresh;
use crate::store::PartitionStore;
use crate::WorkerError;

// ==================== Types ====================

/// Unique identifier for a worker version instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, no event handled yet.
    #[default]
    Parsed,
    /// Pre-warming partitions.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Removing old partitions.
    Activating,
    /// Active and controlling tabs.
    Activated,
    /// Replaced or failed.
    Redundant,
}

/// Resources shared by every worker version in one process.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: PartitionStore,
    pub fetcher: Arc<dyn Fetcher>,
    pub updates: UpdateBroadcaster,
    pub tasks: BackgroundTasks,
}

impl WorkerContext {
    pub fn new(store: PartitionStore, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            updates: UpdateBroadcaster::new(),
            tasks: BackgroundTasks::new(),
        }
    }
}

/// What the worker did with a control message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// Send this reply to the sender.
    Reply(Value),
    /// The worker asked to be activated.
    SkipWaiting,
}

// ==================== Cache Worker ====================

/// One version of the cache worker.
pub struct CacheWorker {
    /// Unique ID.
    pub id: WorkerId,

    config: WorkerConfig,

    state: RwLock<WorkerState>,

    skip_waiting: AtomicBool,

    classifier: Classifier,

    engine: PolicyEngine,

    refresh: BackgroundRefresh,
}

impl fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheWorker")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish()
    }
}

impl CacheWorker {
    /// Create a worker for `config` in the `Parsed` state.
    pub fn new(config: WorkerConfig, context: WorkerContext) -> Result<Self, WorkerError> {
        let origin = config.origin_url()?;
        let classifier = Classifier::new(&origin, &config);
        let engine = PolicyEngine::new(
            context.store,
            context.fetcher,
            config.partition_names(),
            context.updates,
        )
        .with_tasks(context.tasks)
        .with_fetch_timeout(config.fetch_timeout());
        let refresh = BackgroundRefresh::new(engine.clone(), config.refresh_url()?);

        Ok(Self {
            id: WorkerId::new(),
            config,
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            classifier,
            engine,
            refresh,
        })
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state.read().map(|s| *s).unwrap_or(WorkerState::Redundant)
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        if let Ok(mut slot) = self.state.write() {
            let from = std::mem::replace(&mut *slot, state);
            debug!(worker = %self.id, ?from, to = ?state, "State change");
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state() == WorkerState::Redundant
    }

    /// Ask to be activated without waiting for open tabs to close.
    pub fn request_skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    // ==================== Hooks ====================

    /// Pre-warm partitions. The static manifest is all-or-nothing; bootstrap
    /// endpoints are best-effort. Fails (and turns redundant) only when the
    /// static manifest fails.
    pub async fn on_install(&self) -> Result<(), WorkerError> {
        self.set_state(WorkerState::Installing);
        info!(worker = %self.id, version = %self.config.version, "Installing");

        let (statics, bootstrapped) = tokio::join!(self.precache_static(), self.precache_bootstrap());

        match statics {
            Ok(count) => {
                info!(
                    worker = %self.id,
                    static_assets = count,
                    bootstrapped,
                    "Install complete"
                );
                self.set_state(WorkerState::Installed);
                if self.config.skip_waiting_on_install {
                    self.request_skip_waiting();
                }
                Ok(())
            }
            Err(e) => {
                error!(worker = %self.id, error = %e, "Install failed");
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache_static(&self) -> Result<usize, WorkerError> {
        let requests: Vec<Request> = self
            .config
            .static_asset_urls()?
            .into_iter()
            .map(Request::get)
            .collect();

        let results = join_all(requests.iter().map(|r| self.engine.network(r.clone()))).await;

        let mut fetched = Vec::with_capacity(requests.len());
        for (request, result) in requests.into_iter().zip(results) {
            let response = result
                .map_err(|e| WorkerError::InstallFailed(format!("{}: {e}", request.url)))?;
            if !response.ok() {
                return Err(WorkerError::InstallFailed(format!(
                    "{}: HTTP {}",
                    request.url, response.status
                )));
            }
            fetched.push((request, response));
        }

        let partition = self
            .engine
            .store()
            .open(&self.engine.names().static_assets)
            .await?;
        for (request, response) in fetched {
            partition.put(&request, response).await?;
        }
        Ok(partition.len().await)
    }

    async fn precache_bootstrap(&self) -> usize {
        let urls = match self.config.bootstrap_urls() {
            Ok(urls) => urls,
            Err(e) => {
                warn!(error = %e, "Skipping bootstrap pre-warm");
                return 0;
            }
        };

        let results = join_all(
            urls.into_iter()
                .map(|url| self.engine.refresh_dynamic(Request::get(url))),
        )
        .await;
        results.into_iter().filter(|stored| *stored).count()
    }

    /// Delete every partition outside this version's set. Returns the
    /// deleted names.
    pub async fn on_activate(&self) -> Result<Vec<String>, WorkerError> {
        self.set_state(WorkerState::Activating);

        let valid = self.engine.names().all();
        match self.engine.store().delete_entries_not_in(&valid).await {
            Ok(deleted) => {
                self.set_state(WorkerState::Activated);
                info!(worker = %self.id, version = %self.config.version, deleted = deleted.len(), "Activated");
                Ok(deleted)
            }
            Err(e) => {
                error!(worker = %self.id, error = %e, "Activation failed");
                self.set_state(WorkerState::Redundant);
                Err(e.into())
            }
        }
    }

    /// Answer an intercepted request. GETs never fail; other methods go
    /// straight to the network and may.
    pub async fn on_fetch(&self, request: Request) -> Result<Response, NetError> {
        if !request.is_get() {
            debug!(url = %request.url, method = %request.method, "Passing through");
            return self.engine.network(request).await;
        }

        let classification = self.classifier.classify(&request);
        debug!(url = %request.url, class = ?classification.class, "Intercepted");
        Ok(self.engine.handle(classification, request).await)
    }

    /// Handle a control message.
    pub async fn on_message(&self, message: ControlMessage) -> MessageOutcome {
        match message {
            ControlMessage::SkipWaiting => {
                self.request_skip_waiting();
                MessageOutcome::SkipWaiting
            }
            ControlMessage::ClearCache => {
                let success = match self.engine.store().clear().await {
                    Ok(deleted) => {
                        info!(partitions = deleted, "Cleared all partitions");
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to clear partitions");
                        false
                    }
                };
                MessageOutcome::Reply(
                    serde_json::to_value(ClearCacheReply { success }).unwrap_or_default(),
                )
            }
            ControlMessage::GetCacheStatus => {
                let status = cache_status(self.engine.store().enumerate().await);
                MessageOutcome::Reply(serde_json::to_value(status).unwrap_or_default())
            }
        }
    }

    /// Handle a sync event. Returns whether stored data changed.
    pub async fn on_sync(&self, tag: &str) -> bool {
        if !BackgroundRefresh::handles(tag) {
            debug!(tag, "Ignoring sync tag");
            return false;
        }
        self.refresh.run_once().await
    }

    /// Wait for outstanding background work.
    pub async fn settle(&self) {
        self.engine.settle().await;
    }
}

// ==================== Clients ====================

/// Identifier of an open tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An open tab.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Worker currently controlling this tab.
    pub controller: Option<WorkerId>,
}

/// Open tabs.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tab.
    pub fn open(&mut self, url: Url, controller: Option<WorkerId>) -> ClientId {
        let id = ClientId::new();
        self.clients.insert(id, Client { id, url, controller });
        id
    }

    pub fn close(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// All tabs, ordered by id.
    pub fn match_all(&self) -> Vec<&Client> {
        let mut clients: Vec<&Client> = self.clients.values().collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    /// Put every tab under `worker`. Returns how many changed controller.
    pub fn claim(&mut self, worker: WorkerId) -> usize {
        let mut changed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                changed += 1;
            }
        }
        changed
    }

    pub fn controlled_by(&self, worker: WorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }
}

// ==================== Registration ====================

/// Worker versions for one scope.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    installing: Option<Arc<CacheWorker>>,

    waiting: Option<Arc<CacheWorker>>,

    active: Option<Arc<CacheWorker>>,

    /// Open tabs.
    pub clients: Clients,
}

impl Registration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            clients: Clients::new(),
        }
    }

    pub fn installing(&self) -> Option<&Arc<CacheWorker>> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&Arc<CacheWorker>> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&Arc<CacheWorker>> {
        self.active.as_ref()
    }

    /// Track `worker` as installing, superseding any earlier install.
    pub fn begin_install(&mut self, worker: Arc<CacheWorker>) {
        if let Some(previous) = self.installing.replace(worker) {
            previous.set_state(WorkerState::Redundant);
        }
    }

    /// Move `worker` from installing to waiting if its install succeeded.
    /// A superseded install is dropped.
    pub fn finish_install(&mut self, worker: &Arc<CacheWorker>, succeeded: bool) {
        if self.installing.as_ref().map(|w| w.id) != Some(worker.id) {
            debug!(worker = %worker.id, "Install superseded");
            worker.set_state(WorkerState::Redundant);
            return;
        }
        self.installing = None;

        if succeeded {
            if let Some(previous) = self.waiting.replace(Arc::clone(worker)) {
                previous.set_state(WorkerState::Redundant);
            }
        }
    }

    /// Whether the waiting worker may take over now: it asked to, nothing is
    /// active, or no tab is open.
    pub fn should_activate_waiting(&self) -> bool {
        match &self.waiting {
            Some(waiting) => {
                waiting.skip_waiting_requested() || self.active.is_none() || self.clients.is_empty()
            }
            None => false,
        }
    }

    pub fn take_waiting(&mut self) -> Option<Arc<CacheWorker>> {
        self.waiting.take()
    }

    /// Make an activated `worker` the controller of every tab. Returns the
    /// worker it replaced, now redundant.
    pub fn promote(&mut self, worker: Arc<CacheWorker>) -> Option<Arc<CacheWorker>> {
        let claimed = self.clients.claim(worker.id);
        debug!(worker = %worker.id, claimed, "Claimed clients");

        let previous = self.active.replace(worker);
        if let Some(ref old) = previous {
            old.set_state(WorkerState::Redundant);
        }
        previous
    }

    /// Adopt an already-activated version without running its hooks.
    pub fn adopt(&mut self, worker: Arc<CacheWorker>) -> Option<Arc<CacheWorker>> {
        worker.set_state(WorkerState::Activated);
        self.promote(worker)
    }
}
