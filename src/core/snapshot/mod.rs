//! CSR snapshot format: immutable, memory-mapped representation of the
//! whole graph at a generation.

pub mod reader;
pub mod sections;
pub mod writer;

use bitflags::bitflags;

bitflags! {
  /// Feature flags stored in the snapshot header.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct SnapshotFlags: u32 {
    const HAS_IN_EDGES      = 1 << 0;
    const HAS_NODE_LABELS   = 1 << 1;
    const HAS_PROPERTIES    = 1 << 2;
    const HAS_KEY_BUCKETS   = 1 << 3;
    const HAS_VECTORS       = 1 << 4;
    const HAS_VECTOR_STORES = 1 << 5;
  }
}

/// Parsed snapshot header fields.
#[derive(Debug, Clone)]
pub struct SnapshotHeader {
  pub magic: u32,
  pub version: u32,
  pub min_reader_version: u32,
  pub flags: SnapshotFlags,
  pub generation: u64,
  pub num_nodes: u64,
  pub num_edges: u64,
  pub max_node_id: u64,
  pub num_labels: u64,
  pub num_etypes: u64,
  pub num_propkeys: u64,
  pub num_strings: u64,
}
