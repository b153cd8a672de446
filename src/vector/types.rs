//! Vector store data model: manifests, fragments, row groups.

use hashbrown::HashMap;
use serde::Serialize;

use crate::constants::{DEFAULT_FRAGMENT_TARGET_SIZE, DEFAULT_ROW_GROUP_SIZE};
use crate::types::NodeId;
use crate::vector::distance::{cosine_distance, neg_dot, squared_euclidean};
use crate::vector::ivf::index::IvfIndex;
use crate::vector::ivf::pq::IvfPqIndex;

// ============================================================================
// Metric
// ============================================================================

/// Distance metric for a vector store and its indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum DistanceMetric {
  Cosine = 0,
  Euclidean = 1,
  Dot = 2,
}

impl DistanceMetric {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      0 => Some(DistanceMetric::Cosine),
      1 => Some(DistanceMetric::Euclidean),
      2 => Some(DistanceMetric::Dot),
      _ => None,
    }
  }

  /// Distance between two vectors; smaller is closer for every metric
  /// (dot distances are stored negated).
  #[inline]
  pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
    match self {
      DistanceMetric::Cosine => cosine_distance(a, b),
      DistanceMetric::Euclidean => squared_euclidean(a, b),
      DistanceMetric::Dot => neg_dot(a, b),
    }
  }

  /// Convert a distance to a similarity score (larger is better).
  #[inline]
  pub fn similarity(&self, distance: f32) -> f32 {
    match self {
      DistanceMetric::Cosine => 1.0 - distance,
      DistanceMetric::Euclidean => 1.0 / (1.0 + distance.sqrt()),
      DistanceMetric::Dot => -distance,
    }
  }
}

// ============================================================================
// Configuration
// ============================================================================

/// Per-propkey vector store configuration. Dimensions are fixed on first
/// insert; later inserts must match.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorStoreConfig {
  pub dimensions: usize,
  pub metric: DistanceMetric,
  pub row_group_size: usize,
  pub fragment_target_size: usize,
  pub normalize: bool,
}

impl VectorStoreConfig {
  pub fn new(dimensions: usize) -> Self {
    Self {
      dimensions,
      metric: DistanceMetric::Cosine,
      row_group_size: DEFAULT_ROW_GROUP_SIZE,
      fragment_target_size: DEFAULT_FRAGMENT_TARGET_SIZE,
      normalize: true,
    }
  }

  pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
    self.metric = metric;
    self.normalize = metric == DistanceMetric::Cosine;
    self
  }

  pub fn with_row_group_size(mut self, size: usize) -> Self {
    self.row_group_size = size.max(1);
    self
  }

  pub fn with_fragment_target_size(mut self, size: usize) -> Self {
    self.fragment_target_size = size.max(1);
    self
  }
}

// ============================================================================
// Row groups and fragments
// ============================================================================

/// A fixed-capacity block of contiguous vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct RowGroup {
  /// `count * dimensions` f32 values
  pub data: Vec<f32>,
  pub count: usize,
}

impl RowGroup {
  pub fn new(capacity: usize, dimensions: usize) -> Self {
    Self {
      data: Vec::with_capacity(capacity * dimensions),
      count: 0,
    }
  }
}

/// A group of row groups plus a tombstone bitmap. The last fragment of a
/// manifest may be active (accepting appends); sealed fragments are
/// immutable apart from their tombstones.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
  pub id: u32,
  pub row_groups: Vec<RowGroup>,
  /// NodeID per slot, parallel to the vector data
  pub node_ids: Vec<NodeId>,
  /// One bit per slot
  pub tombstones: Vec<u64>,
  pub total_vectors: usize,
  pub deleted_count: usize,
  pub sealed: bool,
}

impl Fragment {
  pub fn new(id: u32) -> Self {
    Self {
      id,
      row_groups: Vec::new(),
      node_ids: Vec::new(),
      tombstones: Vec::new(),
      total_vectors: 0,
      deleted_count: 0,
      sealed: false,
    }
  }

  pub fn live_count(&self) -> usize {
    self.total_vectors - self.deleted_count
  }

  pub fn deleted_ratio(&self) -> f64 {
    if self.total_vectors == 0 {
      0.0
    } else {
      self.deleted_count as f64 / self.total_vectors as f64
    }
  }

  #[inline]
  pub fn is_deleted(&self, local: usize) -> bool {
    self
      .tombstones
      .get(local / 64)
      .is_some_and(|word| word & (1 << (local % 64)) != 0)
  }

  /// Mark a slot deleted. Returns false if it already was.
  pub fn set_tombstone(&mut self, local: usize) -> bool {
    let word = local / 64;
    if word >= self.tombstones.len() {
      self.tombstones.resize(word + 1, 0);
    }
    let mask = 1 << (local % 64);
    if self.tombstones[word] & mask != 0 {
      return false;
    }
    self.tombstones[word] |= mask;
    self.deleted_count += 1;
    true
  }

  /// Borrow the vector at a slot, tombstoned or not.
  pub fn vector_at(&self, local: usize, dimensions: usize, row_group_size: usize) -> Option<&[f32]> {
    if local >= self.total_vectors {
      return None;
    }
    let group = local / row_group_size;
    let within = local % row_group_size;
    let rg = self.row_groups.get(group)?;
    if within >= rg.count {
      return None;
    }
    let start = within * dimensions;
    rg.data.get(start..start + dimensions)
  }
}

// ============================================================================
// Manifest
// ============================================================================

/// Location of a node's vector within a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorLocation {
  pub fragment: u32,
  pub local: u32,
}

/// Optional ANN index attached to a manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorIndex {
  Ivf(IvfIndex),
  IvfPq(IvfPqIndex),
}

/// Columnar vector store for one vector PropKey.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorManifest {
  pub config: VectorStoreConfig,
  pub fragments: Vec<Fragment>,
  pub locations: HashMap<NodeId, VectorLocation>,
  pub next_fragment_id: u32,
  pub index: Option<VectorIndex>,
}

impl VectorManifest {
  pub fn fragment(&self, id: u32) -> Option<&Fragment> {
    self.fragments.iter().find(|f| f.id == id)
  }

  pub fn fragment_mut(&mut self, id: u32) -> Option<&mut Fragment> {
    self.fragments.iter_mut().find(|f| f.id == id)
  }

  /// Number of live vectors.
  pub fn live_count(&self) -> usize {
    self.fragments.iter().map(|f| f.live_count()).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_metric_similarity_conversions() {
    assert!((DistanceMetric::Cosine.similarity(0.25) - 0.75).abs() < 1e-6);
    assert!((DistanceMetric::Euclidean.similarity(4.0) - (1.0 / 3.0)).abs() < 1e-6);
    assert!((DistanceMetric::Dot.similarity(-0.5) - 0.5).abs() < 1e-6);
  }

  #[test]
  fn test_fragment_tombstones() {
    let mut fragment = Fragment::new(0);
    fragment.total_vectors = 100;
    assert!(!fragment.is_deleted(70));

    assert!(fragment.set_tombstone(70));
    assert!(fragment.is_deleted(70));
    assert_eq!(fragment.deleted_count, 1);

    // Second delete of the same slot is a no-op
    assert!(!fragment.set_tombstone(70));
    assert_eq!(fragment.deleted_count, 1);
    assert_eq!(fragment.live_count(), 99);
  }
}
