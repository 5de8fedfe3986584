//! On-device vector retrieval for recommendation moments and journal content.
//!
//! Two stores share the [`VectorStore`] contract:
//! - [`DurableIndex`]: sharded append-log files, every write synced before it returns.
//! - [`SnapshotStore`]: an in-memory table persisted as one atomically replaced file.
//!
//! [`IndexManager`] puts an [`Embedder`] in front of either store.

pub mod codec;
pub mod config;
pub mod distance;
pub mod error;
pub mod index;
pub mod manager;
pub mod shard;
pub mod snapshot;
pub mod store;

pub use config::{Backend, IndexConfig};
pub use error::{Result, VectorError};
pub use index::DurableIndex;
pub use manager::{Embedder, IndexManager};
pub use snapshot::SnapshotStore;
pub use store::{IndexStats, Match, VectorStore};
