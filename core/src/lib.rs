//! Ember Core - a small partitioned dataset engine
//!
//! Datasets are built lazily as a lineage graph of transformations. An
//! action hands the graph to the scheduler, which cuts it into stages at
//! shuffles and cached datasets and runs one task per partition on a
//! worker pool.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod io;
pub mod lineage;
pub mod rdd;
pub mod scheduler;
pub mod shuffle;
pub mod value;

pub use cache::{CacheStats, StorageLevel};
pub use config::{EngineConfig, EvictionPolicy};
pub use context::EmberContext;
pub use error::{EngineError, EngineResult, TaskError, TaskErrorKind};
pub use lineage::NodeId;
pub use rdd::Rdd;
pub use shuffle::ShuffleStats;
pub use value::Value;
