//! Columnar vector store operations.
//!
//! The store appends into the single active fragment, sealing it when it
//! reaches the configured target size. Deletes only flip tombstone bits;
//! compaction rewrites heavily-deleted sealed fragments.

use crate::error::{HeronError, Result};
use crate::types::NodeId;
use crate::vector::distance::normalize_in_place;
use crate::vector::types::{
  DistanceMetric, Fragment, RowGroup, VectorLocation, VectorManifest, VectorStoreConfig,
};

/// Create an empty store for a config.
pub fn create_vector_store(config: VectorStoreConfig) -> VectorManifest {
  VectorManifest {
    config,
    fragments: Vec::new(),
    locations: hashbrown::HashMap::new(),
    next_fragment_id: 0,
    index: None,
  }
}

/// Validate a candidate vector against a store's dimensionality.
///
/// Rejected: dimension mismatch, NaN, non-finite values, all-zero vectors.
pub fn validate_vector(vector: &[f32], dimensions: usize) -> Result<()> {
  if vector.len() != dimensions {
    return Err(HeronError::VectorDimensionMismatch {
      expected: dimensions,
      got: vector.len(),
    });
  }
  let mut all_zero = true;
  for &x in vector {
    if x.is_nan() {
      return Err(HeronError::InvalidVector("vector contains NaN".to_string()));
    }
    if !x.is_finite() {
      return Err(HeronError::InvalidVector(
        "vector contains non-finite value".to_string(),
      ));
    }
    if x != 0.0 {
      all_zero = false;
    }
  }
  if all_zero {
    return Err(HeronError::InvalidVector("vector is all zeros".to_string()));
  }
  Ok(())
}

fn active_fragment(manifest: &mut VectorManifest) -> &mut Fragment {
  let needs_new = manifest
    .fragments
    .last()
    .is_none_or(|f| f.sealed);
  if needs_new {
    let id = manifest.next_fragment_id;
    manifest.next_fragment_id += 1;
    manifest.fragments.push(Fragment::new(id));
  }
  let last = manifest.fragments.len() - 1;
  &mut manifest.fragments[last]
}

/// Insert (or replace) the vector for a node.
pub fn vector_store_insert(
  manifest: &mut VectorManifest,
  node_id: NodeId,
  vector: &[f32],
) -> Result<()> {
  validate_vector(vector, manifest.config.dimensions)?;

  let mut owned = vector.to_vec();
  if manifest.config.normalize && manifest.config.metric == DistanceMetric::Cosine {
    normalize_in_place(&mut owned);
  }

  // Replacement: tombstone the old slot first.
  vector_store_delete(manifest, node_id);

  let dimensions = manifest.config.dimensions;
  let row_group_size = manifest.config.row_group_size;
  let fragment_target = manifest.config.fragment_target_size;

  let fragment = active_fragment(manifest);
  let needs_group = fragment
    .row_groups
    .last()
    .is_none_or(|rg| rg.count >= row_group_size);
  if needs_group {
    fragment.row_groups.push(RowGroup::new(row_group_size, dimensions));
  }

  let local = fragment.total_vectors as u32;
  let last_group = fragment.row_groups.len() - 1;
  let rg = &mut fragment.row_groups[last_group];
  rg.data.extend_from_slice(&owned);
  rg.count += 1;
  fragment.node_ids.push(node_id);
  fragment.total_vectors += 1;

  if fragment.total_vectors >= fragment_target {
    fragment.sealed = true;
  }
  let fragment_id = fragment.id;

  manifest.locations.insert(
    node_id,
    VectorLocation {
      fragment: fragment_id,
      local,
    },
  );

  Ok(())
}

/// Tombstone a node's vector. Returns whether one existed.
pub fn vector_store_delete(manifest: &mut VectorManifest, node_id: NodeId) -> bool {
  let Some(location) = manifest.locations.remove(&node_id) else {
    return false;
  };
  if let Some(fragment) = manifest.fragment_mut(location.fragment) {
    fragment.set_tombstone(location.local as usize);
  }
  true
}

/// Copy of a node's stored vector, or None if absent/deleted.
pub fn vector_store_get(manifest: &VectorManifest, node_id: NodeId) -> Option<Vec<f32>> {
  let location = manifest.locations.get(&node_id)?;
  let fragment = manifest.fragment(location.fragment)?;
  if fragment.is_deleted(location.local as usize) {
    return None;
  }
  fragment
    .vector_at(
      location.local as usize,
      manifest.config.dimensions,
      manifest.config.row_group_size,
    )
    .map(|v| v.to_vec())
}

pub fn vector_store_contains(manifest: &VectorManifest, node_id: NodeId) -> bool {
  manifest
    .locations
    .get(&node_id)
    .and_then(|loc| manifest.fragment(loc.fragment).map(|f| (f, loc)))
    .is_some_and(|(f, loc)| !f.is_deleted(loc.local as usize))
}

/// Live vector count.
pub fn vector_store_len(manifest: &VectorManifest) -> usize {
  manifest.live_count()
}

/// Iterate live vectors in deterministic order (fragment order, then slot
/// order). Yields `(ordinal, node_id, vector)`.
pub fn vector_store_iter<'a>(
  manifest: &'a VectorManifest,
) -> impl Iterator<Item = (u64, NodeId, &'a [f32])> + 'a {
  let dimensions = manifest.config.dimensions;
  let row_group_size = manifest.config.row_group_size;
  manifest
    .fragments
    .iter()
    .flat_map(move |fragment| {
      (0..fragment.total_vectors).filter_map(move |local| {
        if fragment.is_deleted(local) {
          return None;
        }
        let vector = fragment.vector_at(local, dimensions, row_group_size)?;
        Some((fragment.node_ids[local], vector))
      })
    })
    .enumerate()
    .map(|(ordinal, (node_id, vector))| (ordinal as u64, node_id, vector))
}

// ============================================================================
// Compaction
// ============================================================================

/// Result of a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
  pub fragments_compacted: usize,
  pub vectors_rewritten: usize,
  pub vectors_reclaimed: usize,
}

/// Rewrite sealed fragments whose deletion ratio meets `min_deleted_ratio`
/// into a fresh sealed fragment, then drop the sources.
pub fn compact_vector_store(
  manifest: &mut VectorManifest,
  min_deleted_ratio: f64,
) -> CompactionStats {
  let victims: Vec<u32> = manifest
    .fragments
    .iter()
    .filter(|f| f.sealed && f.deleted_count > 0 && f.deleted_ratio() >= min_deleted_ratio)
    .map(|f| f.id)
    .collect();

  if victims.is_empty() {
    return CompactionStats::default();
  }

  let dimensions = manifest.config.dimensions;
  let row_group_size = manifest.config.row_group_size;

  // Gather survivors in fragment order.
  let mut survivors: Vec<(NodeId, Vec<f32>)> = Vec::new();
  let mut reclaimed = 0usize;
  for fragment in &manifest.fragments {
    if !victims.contains(&fragment.id) {
      continue;
    }
    reclaimed += fragment.deleted_count;
    for local in 0..fragment.total_vectors {
      if fragment.is_deleted(local) {
        continue;
      }
      if let Some(vector) = fragment.vector_at(local, dimensions, row_group_size) {
        survivors.push((fragment.node_ids[local], vector.to_vec()));
      }
    }
  }

  // Build the replacement fragment.
  let replacement_id = manifest.next_fragment_id;
  manifest.next_fragment_id += 1;
  let mut replacement = Fragment::new(replacement_id);
  for (node_id, vector) in &survivors {
    let needs_group = replacement
      .row_groups
      .last()
      .is_none_or(|rg| rg.count >= row_group_size);
    if needs_group {
      replacement
        .row_groups
        .push(RowGroup::new(row_group_size, dimensions));
    }
    let local = replacement.total_vectors as u32;
    let last_group = replacement.row_groups.len() - 1;
    let rg = &mut replacement.row_groups[last_group];
    rg.data.extend_from_slice(vector);
    rg.count += 1;
    replacement.node_ids.push(*node_id);
    replacement.total_vectors += 1;

    manifest.locations.insert(
      *node_id,
      VectorLocation {
        fragment: replacement_id,
        local,
      },
    );
  }
  replacement.sealed = true;

  manifest.fragments.retain(|f| !victims.contains(&f.id));
  if replacement.total_vectors > 0 {
    // Keep the active fragment last so appends stay ordered.
    let active_pos = manifest.fragments.iter().position(|f| !f.sealed);
    match active_pos {
      Some(pos) => manifest.fragments.insert(pos, replacement),
      None => manifest.fragments.push(replacement),
    }
  }

  CompactionStats {
    fragments_compacted: victims.len(),
    vectors_rewritten: survivors.len(),
    vectors_reclaimed: reclaimed,
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vector::distance::is_normalized;

  fn small_config() -> VectorStoreConfig {
    VectorStoreConfig::new(4)
      .with_metric(DistanceMetric::Euclidean)
      .with_row_group_size(4)
      .with_fragment_target_size(8)
  }

  #[test]
  fn test_insert_get_delete() {
    let mut store = create_vector_store(small_config());
    vector_store_insert(&mut store, 1, &[1.0, 2.0, 3.0, 4.0]).expect("insert");

    assert!(vector_store_contains(&store, 1));
    assert_eq!(vector_store_get(&store, 1), Some(vec![1.0, 2.0, 3.0, 4.0]));
    assert_eq!(vector_store_len(&store), 1);

    assert!(vector_store_delete(&mut store, 1));
    assert!(!vector_store_contains(&store, 1));
    assert_eq!(vector_store_get(&store, 1), None);
    assert_eq!(vector_store_len(&store), 0);

    // Deleting again reports absence
    assert!(!vector_store_delete(&mut store, 1));
  }

  #[test]
  fn test_validation_errors() {
    let mut store = create_vector_store(small_config());
    assert!(matches!(
      vector_store_insert(&mut store, 1, &[1.0, 2.0]),
      Err(HeronError::VectorDimensionMismatch { .. })
    ));
    assert!(matches!(
      vector_store_insert(&mut store, 1, &[1.0, f32::NAN, 0.0, 0.0]),
      Err(HeronError::InvalidVector(_))
    ));
    assert!(matches!(
      vector_store_insert(&mut store, 1, &[1.0, f32::INFINITY, 0.0, 0.0]),
      Err(HeronError::InvalidVector(_))
    ));
    assert!(matches!(
      vector_store_insert(&mut store, 1, &[0.0, 0.0, 0.0, 0.0]),
      Err(HeronError::InvalidVector(_))
    ));
  }

  #[test]
  fn test_cosine_normalizes_on_insert() {
    let mut store = create_vector_store(VectorStoreConfig::new(2));
    vector_store_insert(&mut store, 1, &[3.0, 4.0]).expect("insert");
    let stored = vector_store_get(&store, 1).expect("get");
    assert!(is_normalized(&stored, 1e-6));
    assert!((stored[0] - 0.6).abs() < 1e-6);
  }

  #[test]
  fn test_replacement_keeps_single_live_copy() {
    let mut store = create_vector_store(small_config());
    vector_store_insert(&mut store, 1, &[1.0, 0.0, 0.0, 0.0]).expect("insert");
    vector_store_insert(&mut store, 1, &[0.0, 1.0, 0.0, 0.0]).expect("replace");

    assert_eq!(vector_store_len(&store), 1);
    assert_eq!(
      vector_store_get(&store, 1),
      Some(vec![0.0, 1.0, 0.0, 0.0])
    );
  }

  #[test]
  fn test_row_group_and_fragment_boundaries() {
    let mut store = create_vector_store(small_config());
    // fragment_target_size = 8, row_group_size = 4
    for i in 0..8u64 {
      vector_store_insert(&mut store, i + 1, &[i as f32 + 1.0, 0.0, 0.0, 0.0]).expect("insert");
    }
    assert_eq!(store.fragments.len(), 1);
    assert!(store.fragments[0].sealed);
    assert_eq!(store.fragments[0].row_groups.len(), 2);
    assert_eq!(store.fragments[0].row_groups[0].count, 4);

    // Next insert opens a new active fragment
    vector_store_insert(&mut store, 100, &[9.0, 0.0, 0.0, 0.0]).expect("insert");
    assert_eq!(store.fragments.len(), 2);
    assert!(!store.fragments[1].sealed);
    assert_eq!(vector_store_len(&store), 9);
  }

  #[test]
  fn test_iter_is_deterministic_and_skips_deleted() {
    let mut store = create_vector_store(small_config());
    for i in 1..=5u64 {
      vector_store_insert(&mut store, i, &[i as f32, 0.0, 0.0, 0.0]).expect("insert");
    }
    vector_store_delete(&mut store, 3);

    let ids: Vec<NodeId> = vector_store_iter(&store).map(|(_, id, _)| id).collect();
    assert_eq!(ids, vec![1, 2, 4, 5]);

    let ordinals: Vec<u64> = vector_store_iter(&store).map(|(ord, _, _)| ord).collect();
    assert_eq!(ordinals, vec![0, 1, 2, 3]);
  }

  #[test]
  fn test_compaction_reclaims_tombstones() {
    let mut store = create_vector_store(small_config());
    for i in 1..=8u64 {
      vector_store_insert(&mut store, i, &[i as f32, 0.0, 0.0, 0.0]).expect("insert");
    }
    assert!(store.fragments[0].sealed);

    for i in 1..=4u64 {
      vector_store_delete(&mut store, i);
    }

    let stats = compact_vector_store(&mut store, 0.25);
    assert_eq!(stats.fragments_compacted, 1);
    assert_eq!(stats.vectors_rewritten, 4);
    assert_eq!(stats.vectors_reclaimed, 4);

    assert_eq!(vector_store_len(&store), 4);
    for i in 5..=8u64 {
      assert_eq!(
        vector_store_get(&store, i),
        Some(vec![i as f32, 0.0, 0.0, 0.0])
      );
    }
    // The rewritten fragment has no tombstones
    assert!(store.fragments.iter().all(|f| f.deleted_count == 0));
  }

  #[test]
  fn test_compaction_skips_low_ratio_fragments() {
    let mut store = create_vector_store(small_config());
    for i in 1..=8u64 {
      vector_store_insert(&mut store, i, &[i as f32, 0.0, 0.0, 0.0]).expect("insert");
    }
    vector_store_delete(&mut store, 1);

    let stats = compact_vector_store(&mut store, 0.5);
    assert_eq!(stats, CompactionStats::default());
  }
}
