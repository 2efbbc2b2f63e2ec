//! # Tessera Storage
//!
//! Where partitioned data lives:
//! - [`directory`] - Matrix layouts and the [`PartitionProvider`] consulted by the splitter
//! - [`vector`] - Physical vectors and the [`CompositeVector`] stitched from them
//! - [`config`] - TOML + environment configuration
//! - [`logging`] - `tracing` subscriber setup

pub mod config;
pub mod directory;
pub mod logging;
pub mod vector;

// Re-exports
pub use config::{ConfigError, TesseraConfig};
pub use directory::{MatrixLayout, PartitionDirectory, PartitionProvider};
pub use vector::{
    CompositeVector, ConcurrentCompositeVector, DenseVector, PhysicalVector, SortedSparseVector,
    SparseVector, StorageKind, VectorRef, VectorShape,
};
