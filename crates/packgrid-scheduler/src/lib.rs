//! packgrid-scheduler: routes deploy and build requests across the fleet.
//!
//! This crate owns one [`EngineController`](packgrid_engine::EngineController)
//! per item of the `engines` collection and two in-memory request queues.
//! It does not talk to container daemons itself; matched requests are
//! handed to the chosen controller.
//!
//! # Components
//!
//! - **`matcher`**: pure engine selection (filters, least-busy ranking)
//! - **`scheduler`**: request queues, matching loops, controller lifecycle
//! - **`error`**: request outcome errors

pub mod error;
pub mod matcher;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use matcher::{Candidate, pick_builder, pick_engine};
pub use scheduler::{PendingBuild, PendingDeploy, RequestTicket, Scheduler};
