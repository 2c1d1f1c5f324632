//! EngineController: owns one container engine.
//!
//! # Architecture
//!
//! ```text
//! EngineController (Clone, Arc inner)
//!   ├── info         latest EngineInfo (RwLock)
//!   ├── runtime      status, IP pool, counters, daemon client, tunnel, timers
//!   ├── queues       other / packs / containers / images / prune /
//!   │                data_collection / container_data
//!   ├── reinit queue single slot, newest re-init supersedes pending ones
//!   └── status       watch channel observed by the scheduler
//! ```
//!
//! Every long-running operation goes through one of the category queues,
//! so per-category concurrency stays bounded no matter how many callers
//! there are. Pack records are mutated through `Collection::update`, which
//! keeps concurrent reconciliation and lifecycle work from overwriting
//! each other.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use packgrid_core::config::{EngineSettings, QueueLimits};
use packgrid_core::{Component, EngineInfo, GridConfig, NotificationHub, Severity};
use packgrid_queue::{QueueStats, TaskHandle, TaskQueue};
use packgrid_state::Registry;

use crate::daemon::{DaemonConnector, EngineApi};
use crate::error::{EngineError, EngineResult};
use crate::ip_pool::IpPool;
use crate::tunnel::{PortAllocator, SshTunnel};

mod bundle;
mod container;
mod dumps;
mod lifecycle;
mod pack;
mod perf;
mod sidecar;
mod timers;
mod upgrade;

pub use dumps::classify_dumps;
pub use pack::PackTicket;
pub use perf::{PerfSample, append_sample, parse_ps_sample};
pub use timers::{TimerKind, next_delay};

/// Shared dependencies handed to every controller.
#[derive(Clone)]
pub struct ControllerContext {
    pub registry: Registry,
    pub config: Arc<GridConfig>,
    pub connector: Arc<dyn DaemonConnector>,
    pub ports: PortAllocator,
}

impl ControllerContext {
    pub fn notifier(&self) -> &NotificationHub {
        self.registry.notifier()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Uninitialized,
    Connecting,
    Ready,
    Draining,
    Stopped,
    Disabled,
    Removed,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineStatus::Uninitialized => "uninitialized",
            EngineStatus::Connecting => "connecting",
            EngineStatus::Ready => "ready",
            EngineStatus::Draining => "draining",
            EngineStatus::Stopped => "stopped",
            EngineStatus::Disabled => "disabled",
            EngineStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view for operators and the scheduler.
#[derive(Debug, Clone)]
pub struct EngineTelemetry {
    pub id: String,
    pub status: EngineStatus,
    pub free_ips: usize,
    pub capacity_limit: u32,
    pub capacity_used: u32,
    pub deploy_ops: usize,
    pub last_pong: Option<u64>,
    pub tunnel_port: Option<u16>,
    pub queues: Vec<(String, QueueStats)>,
}

pub(crate) struct Queues {
    pub other: TaskQueue,
    pub packs: TaskQueue,
    pub containers: TaskQueue,
    pub images: TaskQueue,
    pub prune: TaskQueue,
    pub data_collection: TaskQueue,
    pub container_data: TaskQueue,
}

impl Queues {
    fn new(limits: &QueueLimits) -> Self {
        Self {
            other: TaskQueue::new("other", limits.other),
            packs: TaskQueue::new("packs", limits.packs),
            containers: TaskQueue::new("containers", limits.containers),
            images: TaskQueue::new("images", limits.images),
            prune: TaskQueue::new("prune", limits.prune),
            data_collection: TaskQueue::new("data_collection", limits.data_collection),
            container_data: TaskQueue::new("container_data", limits.container_data),
        }
    }

    pub fn all(&self) -> [&TaskQueue; 7] {
        [
            &self.other,
            &self.packs,
            &self.containers,
            &self.images,
            &self.prune,
            &self.data_collection,
            &self.container_data,
        ]
    }
}

/// Mutable runtime state. Never held across an await.
pub(crate) struct Runtime {
    pub status: EngineStatus,
    pub pool: IpPool,
    pub capacity_used: u32,
    pub last_pack_idx: u64,
    pub last_container_idx: u64,
    pub gateway: Option<Ipv4Addr>,
    pub api: Option<Arc<dyn EngineApi>>,
    pub tunnel: Option<SshTunnel>,
    pub tunnel_port: Option<u16>,
    pub timers: Option<timers::TimerSet>,
    pub retry: Option<JoinHandle<()>>,
    pub init_failures: u32,
    pub reinit_generation: u64,
    pub removed: bool,
    pub last_pong: Option<u64>,
}

pub(crate) struct Inner {
    pub id: String,
    pub ctx: ControllerContext,
    pub info: RwLock<EngineInfo>,
    pub rt: Mutex<Runtime>,
    pub queues: Queues,
    pub reinit_queue: TaskQueue,
    pub deploy_ops: AtomicUsize,
    pub shared_checked: Mutex<BTreeSet<String>>,
    pub status_tx: watch::Sender<EngineStatus>,
}

#[derive(Clone)]
pub struct EngineController {
    pub(crate) inner: Arc<Inner>,
}

/// Counts one in-flight deploy-like operation until dropped.
pub(crate) struct OpGuard {
    inner: Arc<Inner>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.inner.deploy_ops.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EngineController {
    /// A stopped controller; nothing connects until [`reinit`](Self::reinit).
    pub fn new(info: EngineInfo, ctx: ControllerContext) -> Self {
        let queues = Queues::new(&ctx.config.queues);
        let (status_tx, _) = watch::channel(EngineStatus::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                id: info.id.clone(),
                info: RwLock::new(info),
                rt: Mutex::new(Runtime {
                    status: EngineStatus::Uninitialized,
                    pool: IpPool::default(),
                    capacity_used: 0,
                    last_pack_idx: 0,
                    last_container_idx: 0,
                    gateway: None,
                    api: None,
                    tunnel: None,
                    tunnel_port: None,
                    timers: None,
                    retry: None,
                    init_failures: 0,
                    reinit_generation: 0,
                    removed: false,
                    last_pong: None,
                }),
                queues,
                reinit_queue: TaskQueue::new("reinit", 1),
                deploy_ops: AtomicUsize::new(0),
                shared_checked: Mutex::new(BTreeSet::new()),
                status_tx,
                ctx,
            }),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Latest engine item handed to the controller.
    pub fn info(&self) -> EngineInfo {
        self.inner.info.read().clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.rt.lock().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == EngineStatus::Ready
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn free_ip_count(&self) -> usize {
        self.inner.rt.lock().pool.free_count()
    }

    pub fn free_ips(&self) -> Vec<Ipv4Addr> {
        self.inner.rt.lock().pool.free()
    }

    pub fn capacity_used(&self) -> u32 {
        self.inner.rt.lock().capacity_used
    }

    pub fn capacity_limit(&self) -> u32 {
        self.inner.info.read().capacity_limit()
    }

    /// Deploys, removals and upgrades currently in flight.
    pub fn deploy_ops(&self) -> usize {
        self.inner.deploy_ops.load(Ordering::SeqCst)
    }

    pub fn labels(&self) -> BTreeSet<String> {
        self.inner.info.read().effective_labels()
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.inner.rt.lock().gateway
    }

    /// Free IPs plus every IP held by this engine's packs cover the
    /// configured pool exactly once.
    pub fn ip_accounting_ok(&self) -> bool {
        let held: Vec<Ipv4Addr> = self
            .inner
            .ctx
            .registry
            .engine_packs(&self.inner.id)
            .into_iter()
            .flat_map(|p| p.ip_list)
            .collect();
        self.inner.rt.lock().pool.is_consistent_with(&held)
    }

    pub fn telemetry(&self) -> EngineTelemetry {
        let (status, free_ips, capacity_used, last_pong, tunnel_port) = {
            let rt = self.inner.rt.lock();
            (
                rt.status,
                rt.pool.free_count(),
                rt.capacity_used,
                rt.last_pong,
                rt.tunnel_port,
            )
        };
        EngineTelemetry {
            id: self.inner.id.clone(),
            status,
            free_ips,
            capacity_limit: self.capacity_limit(),
            capacity_used,
            deploy_ops: self.deploy_ops(),
            last_pong,
            tunnel_port,
            queues: self
                .inner
                .queues
                .all()
                .iter()
                .map(|q| (q.name().to_string(), q.stats()))
                .collect(),
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.ctx.registry
    }

    pub(crate) fn settings(&self) -> &EngineSettings {
        &self.inner.ctx.config.engine
    }

    pub(crate) fn config(&self) -> &GridConfig {
        &self.inner.ctx.config
    }

    pub(crate) fn queues(&self) -> &Queues {
        &self.inner.queues
    }

    pub(crate) fn api(&self) -> EngineResult<Arc<dyn EngineApi>> {
        self.inner
            .rt
            .lock()
            .api
            .clone()
            .ok_or_else(|| EngineError::NotReady(self.inner.id.clone()))
    }

    pub(crate) fn set_status(&self, status: EngineStatus) {
        let previous = {
            let mut rt = self.inner.rt.lock();
            std::mem::replace(&mut rt.status, status)
        };
        if previous != status {
            tracing::info!(engine = %self.inner.id, from = %previous, to = %status, "engine status changed");
            self.inner.status_tx.send_replace(status);
        }
    }

    pub(crate) fn begin_op(&self) -> OpGuard {
        self.inner.deploy_ops.fetch_add(1, Ordering::SeqCst);
        OpGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn report(&self, severity: Severity, message: &str, err: &dyn std::fmt::Display) {
        self.inner.ctx.notifier().post(
            Component::Engine,
            severity,
            format!("{}: {message}", self.inner.id),
            Some(json!({ "engine": self.inner.id, "error": err.to_string() })),
        );
    }

    pub(crate) fn next_container_idx(&self) -> u64 {
        let mut rt = self.inner.rt.lock();
        rt.last_container_idx += 1;
        rt.last_container_idx
    }
}

/// Wait for a queued unit and surface its own error.
pub(crate) async fn finish<T: Clone + Send + Sync + 'static>(handle: TaskHandle<T>) -> EngineResult<T> {
    handle.wait().await.map_err(EngineError::from_task)
}
