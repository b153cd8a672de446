//! HeronDB - embedded single-file graph database with vector search
//!
//! # Architecture
//!
//! HeronDB uses a **Snapshot + Delta + WAL** architecture:
//!
//! - **Snapshot**: memory-mapped CSR format for fast reads
//! - **Delta**: in-memory overlay for committed-but-uncheckpointed changes
//! - **WAL**: dual-region write-ahead log for durability and crash recovery
//!
//! # Features
//!
//! - Zero-copy reads via mmap
//! - ACID transactions (single writer, snapshot-isolated readers)
//! - Background checkpointing that never blocks commits
//! - Columnar vector storage with IVF and IVF-PQ indices
//!
//! # Example
//!
//! ```no_run
//! use herondb::{open_single_file, OpenOptions};
//!
//! let db = open_single_file("graph.heron", OpenOptions::new())?;
//! db.begin()?;
//! let alice = db.create_node(Some("user:alice"))?;
//! let bob = db.create_node(Some("user:bob"))?;
//! let knows = db.get_or_create_etype("KNOWS")?;
//! db.add_edge(alice, knows, bob)?;
//! db.commit()?;
//! # Ok::<(), herondb::HeronError>(())
//! ```

#![deny(clippy::all)]

pub mod constants;
pub mod error;
pub mod types;
pub mod util;

// Storage layer
pub mod core;

// Vector embeddings and ANN search
pub mod vector;

// Re-export the primary API surface
pub use crate::core::single_file::{
  close_single_file, is_single_file_path, open_single_file, CheckpointHandle, CheckpointStats,
  FullEdge, IvfBuildOptions, NodeView, OpenOptions, SingleFileDB, SyncMode, VectorSearchOptions,
};
pub use error::{HeronError, Result};
pub use types::{DbStats, NodeId, PropValue};
pub use vector::ivf::{CombineMode, SearchResult};
pub use vector::types::DistanceMetric;
