//! Engine-level vector operations.
//!
//! Vector edits stage with the transaction like any other mutation and are
//! applied to the per-propkey stores after the commit batch is durable.
//! Search runs over committed store state, through the attached IVF /
//! IVF-PQ index when one has been built, or by exact scan otherwise.

use hashbrown::HashMap;

use crate::error::{HeronError, Result};
use crate::types::*;
use crate::vector::ivf::index::{IvfConfig, IvfIndex, SearchOptions, SearchResult};
use crate::vector::ivf::pq::{IvfPqConfig, IvfPqIndex, PqSearchOptions};
use crate::vector::store::{
  compact_vector_store, create_vector_store, validate_vector, vector_store_contains,
  vector_store_delete, vector_store_get, vector_store_insert, vector_store_iter,
  vector_store_len, CompactionStats,
};
use crate::vector::types::{DistanceMetric, VectorIndex, VectorManifest, VectorStoreConfig};

use super::SingleFileDB;

// ============================================================================
// Options
// ============================================================================

/// Parameters for building an IVF / IVF-PQ index over a propkey's store.
#[derive(Debug, Clone)]
pub struct IvfBuildOptions {
  pub n_clusters: usize,
  pub n_probe: usize,
  /// Compress with PQ (`m` subspaces) instead of storing raw ids only
  pub pq_subspaces: Option<usize>,
  pub pq_centroids: usize,
  pub seed: Option<u64>,
}

impl IvfBuildOptions {
  pub fn new(n_clusters: usize) -> Self {
    Self {
      n_clusters,
      n_probe: (n_clusters / 10).max(1),
      pq_subspaces: None,
      pq_centroids: crate::constants::PQ_DEFAULT_CENTROIDS,
      seed: None,
    }
  }

  pub fn n_probe(mut self, n_probe: usize) -> Self {
    self.n_probe = n_probe;
    self
  }

  pub fn pq(mut self, subspaces: usize, centroids: usize) -> Self {
    self.pq_subspaces = Some(subspaces);
    self.pq_centroids = centroids;
    self
  }

  pub fn seed(mut self, seed: u64) -> Self {
    self.seed = Some(seed);
    self
  }
}

/// Engine-level search knobs.
#[derive(Default)]
pub struct VectorSearchOptions<'a> {
  pub n_probe: Option<usize>,
  pub threshold: Option<f32>,
  pub filter: Option<&'a dyn Fn(NodeId) -> bool>,
  /// PQ only: re-rank the shortlist against raw vectors
  pub rerank: bool,
}

// ============================================================================
// Vector CRUD
// ============================================================================

impl SingleFileDB {
  /// Create (or verify) the store for a vector propkey.
  pub fn ensure_vector_store(
    &self,
    prop_key_id: PropKeyId,
    dimensions: usize,
    metric: DistanceMetric,
  ) -> Result<()> {
    let mut stores = self.vector_stores.write();
    if let Some(store) = stores.get(&prop_key_id) {
      if store.config.dimensions != dimensions {
        return Err(HeronError::VectorDimensionMismatch {
          expected: store.config.dimensions,
          got: dimensions,
        });
      }
      return Ok(());
    }
    stores.insert(
      prop_key_id,
      create_vector_store(VectorStoreConfig::new(dimensions).with_metric(metric)),
    );
    Ok(())
  }

  fn store_dimensions(&self, prop_key_id: PropKeyId) -> Option<usize> {
    self
      .vector_stores
      .read()
      .get(&prop_key_id)
      .map(|s| s.config.dimensions)
  }

  /// Stage a vector for a node. The first vector stored under a propkey
  /// fixes its dimensionality.
  pub fn set_node_vector(
    &self,
    node_id: NodeId,
    prop_key_id: PropKeyId,
    vector: &[f32],
  ) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    self.require_node(node_id)?;

    let dimensions = self.store_dimensions(prop_key_id);

    // Validate against the store when it exists, otherwise against any
    // pending vector for the same propkey in this transaction.
    match dimensions {
      Some(dims) => validate_vector(vector, dims)?,
      None => {
        let tx = tx_handle.lock();
        let pending_dims = tx
          .staged
          .pending_vectors
          .iter()
          .find(|((_, pk), op)| *pk == prop_key_id && op.is_some())
          .and_then(|(_, op)| op.as_ref().map(|v| v.len()));
        validate_vector(vector, pending_dims.unwrap_or(vector.len()))?;
      }
    }

    tx_handle.lock().staged.pending_vectors.insert(
      (node_id, prop_key_id),
      Some(std::sync::Arc::new(vector.to_vec())),
    );
    Ok(())
  }

  /// Stage a vector delete. Idempotent.
  pub fn delete_node_vector(&self, node_id: NodeId, prop_key_id: PropKeyId) -> Result<()> {
    let (_, tx_handle) = self.require_write_tx()?;
    tx_handle
      .lock()
      .staged
      .pending_vectors
      .insert((node_id, prop_key_id), None);
    Ok(())
  }

  /// A node's vector, merged with any pending edit in the open
  /// transaction. Cosine stores return the normalized form.
  pub fn get_node_vector(&self, node_id: NodeId, prop_key_id: PropKeyId) -> Option<Vec<f32>> {
    if let Some(tx_handle) = self.tx_for_current_thread() {
      let tx = tx_handle.lock();
      if tx.staged.is_node_deleted(node_id) {
        return None;
      }
      if let Some(pending) = tx.staged.pending_vectors.get(&(node_id, prop_key_id)) {
        return pending.as_ref().map(|v| {
          // Pending vectors are stored raw; present them the way the
          // store will after commit.
          let stores = self.vector_stores.read();
          match stores.get(&prop_key_id) {
            Some(store)
              if store.config.normalize && store.config.metric == DistanceMetric::Cosine =>
            {
              let mut out = v.as_ref().clone();
              crate::vector::distance::normalize_in_place(&mut out);
              out
            }
            Some(_) => v.as_ref().clone(),
            None => {
              let mut out = v.as_ref().clone();
              crate::vector::distance::normalize_in_place(&mut out);
              out
            }
          }
        });
      }
    }

    if !self.node_exists(node_id) {
      return None;
    }
    let stores = self.vector_stores.read();
    vector_store_get(stores.get(&prop_key_id)?, node_id)
  }

  /// Does the node carry a vector under this propkey?
  pub fn has_node_vector(&self, node_id: NodeId, prop_key_id: PropKeyId) -> bool {
    if let Some(tx_handle) = self.tx_for_current_thread() {
      let tx = tx_handle.lock();
      if tx.staged.is_node_deleted(node_id) {
        return false;
      }
      if let Some(pending) = tx.staged.pending_vectors.get(&(node_id, prop_key_id)) {
        return pending.is_some();
      }
    }

    if !self.node_exists(node_id) {
      return false;
    }
    let stores = self.vector_stores.read();
    stores
      .get(&prop_key_id)
      .is_some_and(|store| vector_store_contains(store, node_id))
  }

  /// Live vector count for a propkey.
  pub fn vector_count(&self, prop_key_id: PropKeyId) -> usize {
    self
      .vector_stores
      .read()
      .get(&prop_key_id)
      .map_or(0, vector_store_len)
  }

  /// Apply committed vector edits to the stores (called after the WAL
  /// batch is durable).
  pub(crate) fn apply_pending_vectors(
    &self,
    pending: &HashMap<(NodeId, PropKeyId), Option<VectorRef>>,
  ) {
    if pending.is_empty() {
      return;
    }
    let mut stores = self.vector_stores.write();
    for (&(node_id, prop_key_id), operation) in pending {
      match operation {
        Some(vector) => {
          let store = stores.entry(prop_key_id).or_insert_with(|| {
            create_vector_store(VectorStoreConfig::new(vector.len()))
          });
          match vector_store_insert(store, node_id, vector.as_ref()) {
            Ok(()) => {
              // Keep an attached index current with the store.
              let inserted = vector_store_get(store, node_id);
              if let (Some(index), Some(stored)) = (store.index.as_mut(), inserted) {
                let result = match index {
                  VectorIndex::Ivf(ivf) => ivf.insert(node_id, &stored),
                  VectorIndex::IvfPq(ivfpq) => ivfpq.insert(node_id, &stored),
                };
                if let Err(e) = result {
                  log::warn!("vector index insert failed for node {node_id}: {e}");
                }
              }
            }
            Err(e) => {
              // Validated at staging time; a failure here is a logic bug,
              // but the commit is already durable so we log and continue.
              log::warn!(
                "vector apply failed for node {node_id} (propkey {prop_key_id}): {e}"
              );
            }
          }
        }
        None => {
          if let Some(store) = stores.get_mut(&prop_key_id) {
            vector_store_delete(store, node_id);
          }
        }
      }
    }
  }

  // ==========================================================================
  // Index build and search
  // ==========================================================================

  /// Train and attach an IVF (or IVF-PQ) index over a propkey's store.
  pub fn build_vector_index(
    &self,
    prop_key_id: PropKeyId,
    options: IvfBuildOptions,
  ) -> Result<()> {
    let mut stores = self.vector_stores.write();
    let store = stores
      .get_mut(&prop_key_id)
      .ok_or_else(|| HeronError::UnknownPropKey(format!("propkey id {prop_key_id}")))?;

    let dimensions = store.config.dimensions;
    let metric = store.config.metric;

    let mut training = Vec::new();
    let mut entries: Vec<(NodeId, Vec<f32>)> = Vec::new();
    for (_, node_id, vector) in vector_store_iter(store) {
      training.extend_from_slice(vector);
      entries.push((node_id, vector.to_vec()));
    }

    let index = match options.pq_subspaces {
      None => {
        let mut index = IvfIndex::new(
          IvfConfig::new(dimensions, options.n_clusters)
            .with_metric(metric)
            .with_n_probe(options.n_probe),
        );
        index.train(&training, entries.len(), options.seed)?;
        for (node_id, vector) in &entries {
          index.insert(*node_id, vector)?;
        }
        VectorIndex::Ivf(index)
      }
      Some(m) => {
        let config = IvfPqConfig::new(dimensions, options.n_clusters, m)
          .with_metric(metric)
          .with_n_probe(options.n_probe)
          .with_n_centroids(options.pq_centroids);
        let mut index = IvfPqIndex::new(&config)?;
        index.train(&training, entries.len(), options.seed)?;
        for (node_id, vector) in &entries {
          index.insert(*node_id, vector)?;
        }
        VectorIndex::IvfPq(index)
      }
    };

    store.index = Some(index);
    Ok(())
  }

  pub fn has_vector_index(&self, prop_key_id: PropKeyId) -> bool {
    self
      .vector_stores
      .read()
      .get(&prop_key_id)
      .is_some_and(|s| s.index.is_some())
  }

  /// K-nearest search over committed vectors. Uses the attached index if
  /// one exists, otherwise scans exactly.
  pub fn search_vectors(
    &self,
    prop_key_id: PropKeyId,
    query: &[f32],
    k: usize,
    options: &VectorSearchOptions<'_>,
  ) -> Result<Vec<SearchResult>> {
    let stores = self.vector_stores.read();
    let store = stores
      .get(&prop_key_id)
      .ok_or_else(|| HeronError::UnknownPropKey(format!("propkey id {prop_key_id}")))?;

    validate_vector(query, store.config.dimensions)?;

    let mut normalized;
    let query = if store.config.normalize && store.config.metric == DistanceMetric::Cosine {
      normalized = query.to_vec();
      crate::vector::distance::normalize_in_place(&mut normalized);
      &normalized[..]
    } else {
      query
    };

    let search_options = SearchOptions {
      n_probe: options.n_probe,
      threshold: options.threshold,
      filter: options.filter,
    };

    match store.index.as_ref() {
      Some(VectorIndex::Ivf(index)) => index.search(store, query, k, &search_options),
      Some(VectorIndex::IvfPq(index)) => index.search(
        store,
        query,
        k,
        &search_options,
        &PqSearchOptions {
          rerank: options.rerank,
          rerank_factor: 4,
        },
      ),
      None => Ok(flat_search(store, query, k, &search_options)),
    }
  }

  /// Compact a propkey's sealed fragments above the deletion-ratio floor.
  pub fn compact_vectors(
    &self,
    prop_key_id: PropKeyId,
    min_deleted_ratio: f64,
  ) -> Result<CompactionStats> {
    let mut stores = self.vector_stores.write();
    let store = stores
      .get_mut(&prop_key_id)
      .ok_or_else(|| HeronError::UnknownPropKey(format!("propkey id {prop_key_id}")))?;
    Ok(compact_vector_store(store, min_deleted_ratio))
  }
}

/// Exact scan fallback when no index is attached.
fn flat_search(
  store: &VectorManifest,
  query: &[f32],
  k: usize,
  options: &SearchOptions<'_>,
) -> Vec<SearchResult> {
  let metric = store.config.metric;
  let mut scored: Vec<SearchResult> = vector_store_iter(store)
    .filter(|(_, node_id, _)| options.filter.is_none_or(|f| f(*node_id)))
    .map(|(_, node_id, vector)| {
      let distance = metric.distance(query, vector);
      SearchResult {
        node_id,
        distance,
        similarity: metric.similarity(distance),
      }
    })
    .collect();

  scored.sort_by(|a, b| {
    a.distance
      .partial_cmp(&b.distance)
      .unwrap_or(std::cmp::Ordering::Equal)
  });
  if let Some(threshold) = options.threshold {
    scored.retain(|r| r.similarity >= threshold);
  }
  scored.truncate(k.max(1));
  scored
}
