//! packgrid-core: shared types for the packgrid orchestrator.
//!
//! Holds the persisted domain model (engines, builders, bundles, packs,
//! registries, shared data), the transient request types, the
//! `packgrid.toml` configuration, and the operator notification hub.

pub mod config;
pub mod notify;
pub mod types;

pub use config::GridConfig;
pub use notify::{Component, Notification, NotificationHub, Severity};
pub use types::*;
