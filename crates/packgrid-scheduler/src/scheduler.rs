//! Scheduler: pending request queues and the engine fleet.
//!
//! ```text
//!  submit_deploy ─► deploys (LiveQueue) ─┐            ┌─► EngineController::add_pack
//!                                        ├─ matching ─┤
//!  submit_build  ─► builds  (LiveQueue) ─┘  one build └─► EngineController::create_bundle
//!                                            at a time
//!  wake-ups: new request, pack deleted, engine ready, rematch tick
//!
//!  engines collection ─► engine loop ─► new: create + reinit
//!                                      changed config: reinit
//!                                      deleted: destroy (exit on failure)
//! ```
//!
//! A deploy leaves the pending queue only once its controller accepted it;
//! the caller's ticket then resolves when the pack finishes deploying.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use packgrid_core::config::SchedulerSettings;
use packgrid_core::{
    BuildRequest, BundleInfo, Component, DeployRequest, EngineInfo, PackInfo, Severity,
};
use packgrid_engine::{
    ControllerContext, EngineController, EngineError, EngineStatus, EngineTelemetry, PackTicket,
};
use packgrid_state::{ChangeEvent, LiveQueue, QueueEntry, QueueEvent, Subscription};

use crate::error::{SchedulerError, SchedulerResult};
use crate::matcher::{Candidate, pick_builder, pick_engine};

/// A deploy request waiting for an engine.
#[derive(Debug, Clone, Serialize)]
pub struct PendingDeploy {
    pub request: DeployRequest,
    /// Matching passes that found no engine.
    pub misses: u32,
}

/// A build request waiting for, or running on, a builder engine.
#[derive(Debug, Clone, Serialize)]
pub struct PendingBuild {
    pub request: BuildRequest,
    pub misses: u32,
    pub in_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

/// Completion of a submitted request.
#[derive(Debug)]
pub struct RequestTicket<T> {
    id: String,
    rx: oneshot::Receiver<SchedulerResult<T>>,
}

impl<T> RequestTicket<T> {
    /// Queue entry id, usable with the `remove_*_request` calls.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> SchedulerResult<T> {
        self.rx.await.unwrap_or(Err(SchedulerError::Closed))
    }
}

type Waiters<T> = Mutex<BTreeMap<String, oneshot::Sender<SchedulerResult<T>>>>;

struct Inner {
    ctx: ControllerContext,
    settings: SchedulerSettings,
    controllers: RwLock<BTreeMap<String, EngineController>>,
    deploys: LiveQueue<PendingDeploy>,
    builds: LiveQueue<PendingBuild>,
    deploy_waiters: Waiters<PackInfo>,
    build_waiters: Waiters<BundleInfo>,
    deploy_wake: Notify,
    build_wake: Notify,
    /// Held for a whole deploy matching pass.
    matching: Mutex<()>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Owns the engine controllers and routes requests to them.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(ctx: ControllerContext) -> Self {
        let settings = ctx.config.scheduler.clone();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                ctx,
                settings,
                controllers: RwLock::new(BTreeMap::new()),
                deploys: LiveQueue::new("deploys"),
                builds: LiveQueue::new("builds"),
                deploy_waiters: Mutex::new(BTreeMap::new()),
                build_waiters: Mutex::new(BTreeMap::new()),
                deploy_wake: Notify::new(),
                build_wake: Notify::new(),
                matching: Mutex::new(()),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach to the store, bring up a controller per engine item and
    /// start the matching loops.
    pub fn start(&self) {
        let registry = &self.inner.ctx.registry;

        let (tx, rx) = mpsc::unbounded_channel();
        let engines_sub = {
            let tx = tx.clone();
            registry.engines.subscribe(move |ev: &ChangeEvent<EngineInfo>| {
                let _ = tx.send(ev.clone());
            })
        };
        // Subscribed first so nothing saved in between is missed; a
        // duplicate is harmless since an unchanged config is ignored.
        for item in registry.engines.items() {
            let _ = tx.send(ChangeEvent::Changed {
                collection: registry.engines.name().to_string(),
                item,
            });
        }

        let weak = Arc::downgrade(&self.inner);
        let packs_sub = registry.packs.subscribe(move |ev| {
            if let ChangeEvent::Deleted { id, .. } = ev {
                debug!(pack = %id, "pack removed, re-matching deploys");
                wake_deploys(&weak);
            }
        });
        self.inner.subscriptions.lock().extend([engines_sub, packs_sub]);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().engine_loop(rx)));
        tasks.push(tokio::spawn(self.clone().deploy_loop()));
        tasks.push(tokio::spawn(self.clone().build_loop()));
        if self.inner.settings.rematch_secs > 0 {
            tasks.push(tokio::spawn(self.clone().rematch_loop()));
        }
        self.inner.tasks.lock().extend(tasks);
        info!(
            engines = registry.engines.len(),
            rematch_secs = self.inner.settings.rematch_secs,
            "scheduler started"
        );
    }

    /// Stop the loops, stop every controller and release waiting callers.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.subscriptions.lock().clear();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let controllers: Vec<_> = {
            let mut map = self.inner.controllers.write();
            std::mem::take(&mut *map).into_values().collect()
        };
        for controller in controllers {
            if let Err(e) = controller.destroy().await {
                warn!(engine = %controller.id(), error = %e, "controller stop failed");
            }
        }

        // Dropped senders resolve every ticket with `Closed`.
        self.inner.deploy_waiters.lock().clear();
        self.inner.build_waiters.lock().clear();
        info!("scheduler stopped");
    }

    // ── Engines ────────────────────────────────────────────────────

    pub fn engine(&self, id: &str) -> Option<EngineController> {
        self.inner.controllers.read().get(id).cloned()
    }

    pub fn engines(&self) -> Vec<EngineController> {
        self.inner.controllers.read().values().cloned().collect()
    }

    /// Per-engine snapshot, ordered by engine id.
    pub fn telemetry(&self) -> Vec<EngineTelemetry> {
        self.inner
            .controllers
            .read()
            .values()
            .map(EngineController::telemetry)
            .collect()
    }

    fn candidates(&self) -> Vec<Candidate> {
        self.inner
            .controllers
            .read()
            .values()
            .map(Candidate::of)
            .collect()
    }

    async fn engine_loop(self, mut rx: mpsc::UnboundedReceiver<ChangeEvent<EngineInfo>>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.apply_engine_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn apply_engine_event(&self, event: ChangeEvent<EngineInfo>) {
        match event {
            ChangeEvent::Changed { item, .. } => match self.engine(&item.id) {
                None => self.add_engine(item).await,
                Some(controller) if !controller.info().same_config(&item) => {
                    info!(engine = %item.id, "engine configuration changed, re-initialising");
                    controller.reinit(item).await;
                }
                Some(_) => {}
            },
            ChangeEvent::Deleted { id, .. } => {
                let removed = self.inner.controllers.write().remove(&id);
                let Some(controller) = removed else {
                    return;
                };
                info!(engine = %id, "engine deleted, destroying controller");
                if let Err(e) = controller.destroy().await {
                    error!(engine = %id, error = %e, "engine destroy failed");
                    self.inner.ctx.notifier().critical(
                        Component::Scheduler,
                        format!("destroy of engine {id} failed: {e}"),
                    );
                    std::process::exit(1);
                }
            }
        }
    }

    async fn add_engine(&self, info: EngineInfo) {
        let controller = EngineController::new(info.clone(), self.inner.ctx.clone());
        self.inner
            .controllers
            .write()
            .insert(info.id.clone(), controller.clone());

        let mut status = controller.subscribe_status();
        let weak = Arc::downgrade(&self.inner);
        let engine = info.id.clone();
        let watcher = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow_and_update();
                debug!(%engine, status = %current, "engine status");
                match current {
                    EngineStatus::Ready => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.deploy_wake.notify_one();
                        inner.build_wake.notify_one();
                    }
                    EngineStatus::Removed => break,
                    _ => {}
                }
            }
        });
        self.inner.tasks.lock().push(watcher);

        info!(engine = %info.id, labels = ?info.effective_labels(), "engine added");
        controller.reinit(info).await;
    }

    // ── Deploys ────────────────────────────────────────────────────

    /// Queue a deploy request; the ticket resolves with the deployed pack.
    pub fn submit_deploy(&self, request: DeployRequest) -> RequestTicket<PackInfo> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut waiters = self.inner.deploy_waiters.lock();
            let id = self.inner.deploys.push(PendingDeploy { request, misses: 0 });
            waiters.insert(id.clone(), tx);
            id
        };
        debug!(request = %id, pending = self.inner.deploys.len(), "deploy request queued");
        self.inner.deploy_wake.notify_one();
        RequestTicket { id, rx }
    }

    pub async fn deploy(&self, request: DeployRequest) -> SchedulerResult<PackInfo> {
        self.submit_deploy(request).wait().await
    }

    /// Drop a pending deploy; its caller receives `Removed`.
    pub fn remove_deploy_request(&self, id: &str) -> bool {
        let _pass = self.inner.matching.lock();
        if self.inner.deploys.remove(id).is_none() {
            return false;
        }
        respond(&self.inner.deploy_waiters, id, Err(SchedulerError::Removed(id.to_string())));
        info!(request = %id, "deploy request removed");
        true
    }

    pub fn pending_deploys(&self) -> Vec<QueueEntry<PendingDeploy>> {
        self.inner.deploys.entries()
    }

    pub fn subscribe_deploys(
        &self,
        listener: impl Fn(&QueueEvent<PendingDeploy>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.deploys.subscribe(listener)
    }

    /// One pass over the pending deploys in arrival order. Returns how many
    /// were handed to an engine.
    pub fn match_deploys(&self) -> usize {
        let _pass = self.inner.matching.lock();
        let mut dispatched = 0;
        for entry in self.inner.deploys.entries() {
            // Re-read per request: the previous dispatch already reserved IPs.
            let candidates = self.candidates();
            let target = pick_engine(&candidates, &entry.item.request).map(|c| c.id.clone());
            let Some(controller) = target.and_then(|id| self.engine(&id)) else {
                self.record_miss(&entry.id, "no engine fits");
                continue;
            };

            match controller.add_pack(entry.item.request.clone()) {
                Ok(ticket) => {
                    self.inner.deploys.remove(&entry.id);
                    dispatched += 1;
                    info!(
                        request = %entry.id,
                        engine = %controller.id(),
                        pack = %ticket.pack_id(),
                        misses = entry.item.misses,
                        "deploy dispatched"
                    );
                    self.forward_deploy(entry.id, ticket);
                }
                Err(e @ (EngineError::NotReady(_) | EngineError::NoFreeIps { .. })) => {
                    self.record_miss(&entry.id, &e.to_string());
                }
                Err(e) => {
                    self.inner.deploys.remove(&entry.id);
                    self.inner.ctx.notifier().post(
                        Component::Scheduler,
                        Severity::Error,
                        format!("deploy request {} failed on {}", entry.id, controller.id()),
                        Some(json!({ "error": e.to_string(), "bundle_id": entry.item.request.bundle_id })),
                    );
                    respond(
                        &self.inner.deploy_waiters,
                        &entry.id,
                        Err(SchedulerError::Dispatch {
                            engine: controller.id().to_string(),
                            source: e,
                        }),
                    );
                }
            }
        }
        dispatched
    }

    fn record_miss(&self, id: &str, reason: &str) {
        let mut misses = 0;
        self.inner.deploys.update(id, |d| {
            d.misses += 1;
            misses = d.misses;
        });
        debug!(request = %id, misses, reason, "deploy left pending");
    }

    fn forward_deploy(&self, id: String, ticket: PackTicket) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let result = ticket.wait().await.map_err(SchedulerError::from);
            if let Some(inner) = weak.upgrade() {
                respond(&inner.deploy_waiters, &id, result);
            }
        });
    }

    async fn deploy_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = self.inner.deploy_wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            if self.inner.deploys.is_empty() {
                continue;
            }
            let dispatched = self.match_deploys();
            debug!(dispatched, pending = self.inner.deploys.len(), "deploy matching pass");
        }
    }

    async fn rematch_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut tick = tokio::time::interval(Duration::from_secs(self.inner.settings.rematch_secs));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !self.inner.deploys.is_empty() {
                        self.inner.deploy_wake.notify_one();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    // ── Builds ─────────────────────────────────────────────────────

    /// Queue a build request; the ticket resolves with the built bundle.
    pub fn submit_build(&self, request: BuildRequest) -> RequestTicket<BundleInfo> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut waiters = self.inner.build_waiters.lock();
            let id = self.inner.builds.push(PendingBuild {
                request,
                misses: 0,
                in_progress: false,
                engine: None,
            });
            waiters.insert(id.clone(), tx);
            id
        };
        debug!(request = %id, pending = self.inner.builds.len(), "build request queued");
        self.inner.build_wake.notify_one();
        RequestTicket { id, rx }
    }

    pub async fn build(&self, request: BuildRequest) -> SchedulerResult<BundleInfo> {
        self.submit_build(request).wait().await
    }

    /// Drop a build that has not started; its caller receives `Removed`.
    pub fn remove_build_request(&self, id: &str) -> bool {
        match self.inner.builds.get(id) {
            Some(entry) if entry.item.in_progress => {
                debug!(request = %id, "build already running, not removed");
                return false;
            }
            Some(_) => {}
            None => return false,
        }
        if self.inner.builds.remove(id).is_none() {
            return false;
        }
        respond(&self.inner.build_waiters, id, Err(SchedulerError::Removed(id.to_string())));
        info!(request = %id, "build request removed");
        true
    }

    pub fn pending_builds(&self) -> Vec<QueueEntry<PendingBuild>> {
        self.inner.builds.entries()
    }

    pub fn subscribe_builds(
        &self,
        listener: impl Fn(&QueueEvent<PendingBuild>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.builds.subscribe(listener)
    }

    async fn build_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let retry = Duration::from_secs(self.inner.settings.build_retry_secs);
        loop {
            let next = self
                .inner
                .builds
                .entries()
                .into_iter()
                .find(|e| !e.item.in_progress);
            let Some(entry) = next else {
                tokio::select! {
                    _ = self.inner.build_wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            };

            let target = pick_builder(&self.candidates()).map(|c| c.id.clone());
            let Some(controller) = target.and_then(|id| self.engine(&id)) else {
                let mut misses = 0;
                self.inner.builds.update(&entry.id, |b| {
                    b.misses += 1;
                    misses = b.misses;
                });
                debug!(request = %entry.id, misses, retry_secs = retry.as_secs(), "no builder engine available");
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = self.inner.build_wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            };

            let engine = controller.id().to_string();
            let claimed = self.inner.builds.update(&entry.id, |b| {
                b.in_progress = true;
                b.engine = Some(engine.clone());
            });
            if !claimed {
                continue;
            }
            info!(request = %entry.id, %engine, builder = %entry.item.request.builder_id, "build dispatched");

            let result = tokio::select! {
                result = controller.create_bundle(entry.item.request.clone()) => result,
                _ = shutdown.changed() => break,
            };
            self.inner.builds.remove(&entry.id);
            match &result {
                Ok(bundle) => info!(request = %entry.id, bundle = %bundle.id, "build finished"),
                Err(e) => warn!(request = %entry.id, %engine, error = %e, "build failed"),
            }
            respond(
                &self.inner.build_waiters,
                &entry.id,
                result.map_err(SchedulerError::from),
            );
        }
    }
}

fn wake_deploys(inner: &Weak<Inner>) {
    if let Some(inner) = inner.upgrade() {
        inner.deploy_wake.notify_one();
    }
}

fn respond<T>(waiters: &Waiters<T>, id: &str, result: SchedulerResult<T>) {
    if let Some(tx) = waiters.lock().remove(id) {
        // The caller may have dropped its ticket.
        let _ = tx.send(result);
    }
}
