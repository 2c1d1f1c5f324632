//! packgrid-state: crash-safe persistent collections for packgrid.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├── Collection<EngineInfo>      database/engines/<id>.json
//!   ├── Collection<PackInfo>        database/packs/<id>.json
//!   ├── Collection<BundleInfo>      ...
//!   ├── Collection<BuilderInfo>
//!   ├── Collection<RegistryInfo>
//!   └── Collection<SharedDataInfo>
//!
//! Collection<T>
//!   ├── in-memory mirror (RwLock<Vec<T>>), ordered by last save
//!   ├── write pipeline (async Mutex) → shadow / write / drop shadow
//!   └── Subscribers<ChangeEvent<T>> (synchronous, write order)
//! ```
//!
//! Every handle is `Clone` + `Send` + `Sync` and can be shared across
//! async tasks. [`LiveQueue`] offers the same observer model for
//! transient, in-memory queues.

pub mod error;
pub mod live;
pub mod registry;
pub mod store;
pub mod subscribe;

pub use error::{StateError, StateResult};
pub use live::{LiveQueue, QueueEntry, QueueEvent};
pub use registry::{Registry, qualify_image};
pub use store::{ChangeEvent, Collection, DeletePolicy};
pub use subscribe::{Subscribers, Subscription};
