//! packgrid-queue: bounded task queues for engine operations.
//!
//! Each engine controller owns one [`TaskQueue`] per operation category
//! (image mutation, container CRUD, pruning, data collection, ...), each
//! with its own concurrency ceiling. Categories never block each other,
//! while units inside one category start strictly in arrival order.
//!
//! ```text
//! post() ──► pending (VecDeque, FIFO) ──► running (≤ limit) ──► watch<Outcome>
//!                 │                                                │
//!                 └── find_in_queue / post_unique ◄── shared handles ┘
//! ```

pub mod error;
pub mod queue;

pub use error::{TaskError, TaskResult};
pub use queue::{QueueStats, TaskHandle, TaskInfo, TaskQueue};
