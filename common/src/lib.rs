//! Shared building blocks for the Ember engine.
//!
//! Storage access, block compression and bincode helpers live here so the
//! execution core stays free of direct `object_store` and codec plumbing.

pub mod compression;
pub mod error;
pub mod serialization;
pub mod storage;

pub use compression::{BlockCodec, CompressionAlgorithm, CompressionStats, decode_block};
pub use error::{CommonError, ErrorContext, Result};
pub use storage::{Storage, StorageBackend, StorageBuilder, StorageConfig, StorageStats, normalize_uri};
