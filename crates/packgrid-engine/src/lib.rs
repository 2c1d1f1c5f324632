//! packgrid-engine: one controller per container engine.
//!
//! # Architecture
//!
//! ```text
//! EngineController
//!   ├── lifecycle   re-init slot, connect (tunnel + daemon), retry backoff
//!   ├── ip_pool     free external IPs, reserved before any await
//!   ├── pack        deploy / remove / ping, compensation on failure
//!   ├── upgrade     dry-run plan, then in-place replacement
//!   ├── bundle      builder → concrete images, optional re-tag + push
//!   ├── sidecars    support + capture per pack
//!   └── timers      state refresh, auto-delete, ping, dumps, perf, prune
//!          │
//!          ▼
//!   Arc<dyn EngineApi>  (HttpDaemon over TCP / unix / SSH tunnel, MockDaemon)
//! ```
//!
//! State lives in `packgrid_state::Registry`; every long-running step runs
//! on one of the controller's `packgrid_queue::TaskQueue`s.

pub mod constants;
pub mod container_spec;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod ip_pool;
pub mod tunnel;

pub use controller::{
    ControllerContext, EngineController, EngineStatus, EngineTelemetry, PackTicket, PerfSample,
    TimerKind, classify_dumps, next_delay, parse_ps_sample,
};
pub use daemon::{
    ContainerAction, ContainerDetails, ContainerSummary, DaemonConnector, EngineApi, HttpConnector,
    LogsOptions, MockDaemon, StaticConnector,
};
pub use error::{DaemonError, DaemonResult, EngineError, EngineResult};
pub use ip_pool::IpPool;
pub use tunnel::PortAllocator;
