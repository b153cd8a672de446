//! Flat IVF index: k-means coarse quantizer + inverted lists of node ids.
//!
//! Search probes the `n_probe` closest clusters, fetches candidate vectors
//! from the backing store, scores them exactly, and keeps a bounded
//! max-heap of the best k.

use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::error::{HeronError, Result};
use crate::types::NodeId;
use crate::vector::ivf::kmeans::{kmeans, KMeansConfig};
use crate::vector::store::{vector_store_get, vector_store_len};
use crate::vector::types::{DistanceMetric, VectorManifest};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct IvfConfig {
  pub dimensions: usize,
  pub n_clusters: usize,
  /// Clusters probed per query (clamped to `[1, n_clusters]`)
  pub n_probe: usize,
  pub metric: DistanceMetric,
  /// Seed for reproducible training
  pub seed: Option<u64>,
}

impl IvfConfig {
  pub fn new(dimensions: usize, n_clusters: usize) -> Self {
    Self {
      dimensions,
      n_clusters,
      n_probe: (n_clusters / 10).max(1),
      metric: DistanceMetric::Cosine,
      seed: None,
    }
  }

  pub fn with_n_probe(mut self, n_probe: usize) -> Self {
    self.n_probe = n_probe;
    self
  }

  pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
    self.metric = metric;
    self
  }

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = Some(seed);
    self
  }
}

// ============================================================================
// Search types
// ============================================================================

/// One search hit, scored by the index metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
  pub node_id: NodeId,
  pub distance: f32,
  pub similarity: f32,
}

/// How multi-query searches combine per-query distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineMode {
  Min,
  Max,
  Avg,
  Sum,
}

impl CombineMode {
  fn combine(&self, distances: &[f32]) -> f32 {
    match self {
      CombineMode::Min => distances.iter().copied().fold(f32::INFINITY, f32::min),
      CombineMode::Max => distances.iter().copied().fold(f32::NEG_INFINITY, f32::max),
      CombineMode::Avg => distances.iter().sum::<f32>() / distances.len() as f32,
      CombineMode::Sum => distances.iter().sum(),
    }
  }
}

/// Per-search knobs.
#[derive(Default)]
pub struct SearchOptions<'a> {
  /// Override the index `n_probe` for this query
  pub n_probe: Option<usize>,
  /// Drop results below this similarity
  pub threshold: Option<f32>,
  /// Candidate predicate applied before scoring
  pub filter: Option<&'a dyn Fn(NodeId) -> bool>,
}

/// Bounded max-heap of the best k `(distance, node_id)` pairs.
struct TopK {
  k: usize,
  heap: BinaryHeap<(OrderedFloat<f32>, NodeId)>,
}

impl TopK {
  fn new(k: usize) -> Self {
    Self {
      k,
      heap: BinaryHeap::with_capacity(k + 1),
    }
  }

  fn push(&mut self, distance: f32, node_id: NodeId) {
    if self.heap.len() < self.k {
      self.heap.push((OrderedFloat(distance), node_id));
    } else if let Some(&(worst, _)) = self.heap.peek() {
      if OrderedFloat(distance) < worst {
        self.heap.pop();
        self.heap.push((OrderedFloat(distance), node_id));
      }
    }
  }

  /// Drain ascending by distance.
  fn into_sorted(self) -> Vec<(f32, NodeId)> {
    let mut out: Vec<(f32, NodeId)> = self
      .heap
      .into_iter()
      .map(|(d, id)| (d.into_inner(), id))
      .collect();
    out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    out
  }
}

// ============================================================================
// IvfIndex
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct IvfIndex {
  pub dimensions: usize,
  pub n_clusters: usize,
  pub n_probe: usize,
  pub metric: DistanceMetric,
  /// `n_clusters * dimensions` values once trained
  pub centroids: Vec<f32>,
  /// One inverted list of node ids per cluster
  pub lists: Vec<Vec<NodeId>>,
  pub trained: bool,
}

impl IvfIndex {
  pub fn new(config: IvfConfig) -> Self {
    Self {
      dimensions: config.dimensions,
      n_clusters: config.n_clusters,
      n_probe: config.n_probe.clamp(1, config.n_clusters.max(1)),
      metric: config.metric,
      centroids: Vec::new(),
      lists: Vec::new(),
      trained: false,
    }
  }

  pub fn total_vectors(&self) -> usize {
    self.lists.iter().map(|l| l.len()).sum()
  }

  /// Train the coarse quantizer. Requires at least `n_clusters` vectors.
  pub fn train(&mut self, vectors: &[f32], n: usize, seed: Option<u64>) -> Result<()> {
    let config = match seed {
      Some(s) => KMeansConfig::new(self.n_clusters).with_seed(s),
      None => KMeansConfig::new(self.n_clusters),
    };
    let result = kmeans(vectors, n, self.dimensions, &config, self.metric_distance_fn())?;
    self.centroids = result.centroids;
    self.lists = vec![Vec::new(); self.n_clusters];
    self.trained = true;
    Ok(())
  }

  fn metric_distance_fn(&self) -> fn(&[f32], &[f32]) -> f32 {
    match self.metric {
      DistanceMetric::Cosine => crate::vector::distance::cosine_distance,
      DistanceMetric::Euclidean => crate::vector::distance::squared_euclidean,
      DistanceMetric::Dot => crate::vector::distance::neg_dot,
    }
  }

  fn check_query(&self, query: &[f32]) -> Result<()> {
    if !self.trained {
      return Err(HeronError::IndexNotTrained);
    }
    if query.len() != self.dimensions {
      return Err(HeronError::VectorDimensionMismatch {
        expected: self.dimensions,
        got: query.len(),
      });
    }
    Ok(())
  }

  /// Nearest centroid by the index metric.
  pub fn nearest_centroid(&self, vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for c in 0..self.n_clusters {
      let centroid = &self.centroids[c * self.dimensions..(c + 1) * self.dimensions];
      let dist = self.metric.distance(vector, centroid);
      if dist < best_dist {
        best_dist = dist;
        best = c;
      }
    }
    best
  }

  /// Append a vector id to its cluster's inverted list.
  pub fn insert(&mut self, node_id: NodeId, vector: &[f32]) -> Result<()> {
    self.check_query(vector)?;
    let cluster = self.nearest_centroid(vector);
    self.lists[cluster].push(node_id);
    Ok(())
  }

  /// Remove an id from whichever list holds it.
  pub fn remove(&mut self, node_id: NodeId) {
    for list in &mut self.lists {
      if let Some(pos) = list.iter().position(|&id| id == node_id) {
        list.swap_remove(pos);
        return;
      }
    }
  }

  /// Indices of the `n_probe` closest clusters to `query`, ascending by
  /// centroid distance.
  fn probe_clusters(&self, query: &[f32], n_probe: usize) -> Vec<usize> {
    let mut scored: Vec<(f32, usize)> = (0..self.n_clusters)
      .map(|c| {
        let centroid = &self.centroids[c * self.dimensions..(c + 1) * self.dimensions];
        (self.metric.distance(query, centroid), c)
      })
      .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(n_probe);
    scored.into_iter().map(|(_, c)| c).collect()
  }

  /// Single-query search over a backing store.
  pub fn search(
    &self,
    store: &VectorManifest,
    query: &[f32],
    k: usize,
    options: &SearchOptions<'_>,
  ) -> Result<Vec<SearchResult>> {
    self.check_query(query)?;

    let total = vector_store_len(store);
    if total == 0 {
      return Ok(Vec::new());
    }
    let k = k.clamp(1, total);
    let n_probe = options
      .n_probe
      .unwrap_or(self.n_probe)
      .clamp(1, self.n_clusters);

    let mut top = TopK::new(k);
    for cluster in self.probe_clusters(query, n_probe) {
      for &node_id in &self.lists[cluster] {
        if options.filter.is_some_and(|f| !f(node_id)) {
          continue;
        }
        // Tombstoned ids linger in the lists until a rebuild; the store is
        // the source of truth.
        let Some(vector) = vector_store_get(store, node_id) else {
          continue;
        };
        top.push(self.metric.distance(query, &vector), node_id);
      }
    }

    Ok(self.finish(top, options.threshold))
  }

  /// Multi-query search: per-candidate distances across all queries are
  /// combined by `mode`, then ranked.
  pub fn multi_search(
    &self,
    store: &VectorManifest,
    queries: &[Vec<f32>],
    k: usize,
    mode: CombineMode,
    options: &SearchOptions<'_>,
  ) -> Result<Vec<SearchResult>> {
    if queries.is_empty() {
      return Err(HeronError::EmptyQuerySet);
    }
    for query in queries {
      self.check_query(query)?;
    }

    let total = vector_store_len(store);
    if total == 0 {
      return Ok(Vec::new());
    }
    let k = k.clamp(1, total);
    let n_probe = options
      .n_probe
      .unwrap_or(self.n_probe)
      .clamp(1, self.n_clusters);

    // Union of probed clusters across queries
    let mut clusters: Vec<usize> = Vec::new();
    for query in queries {
      for cluster in self.probe_clusters(query, n_probe) {
        if !clusters.contains(&cluster) {
          clusters.push(cluster);
        }
      }
    }

    let mut top = TopK::new(k);
    let mut per_query = vec![0.0f32; queries.len()];
    for cluster in clusters {
      for &node_id in &self.lists[cluster] {
        if options.filter.is_some_and(|f| !f(node_id)) {
          continue;
        }
        let Some(vector) = vector_store_get(store, node_id) else {
          continue;
        };
        for (i, query) in queries.iter().enumerate() {
          per_query[i] = self.metric.distance(query, &vector);
        }
        top.push(mode.combine(&per_query), node_id);
      }
    }

    Ok(self.finish(top, options.threshold))
  }

  fn finish(&self, top: TopK, threshold: Option<f32>) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = top
      .into_sorted()
      .into_iter()
      .map(|(distance, node_id)| SearchResult {
        node_id,
        distance,
        similarity: self.metric.similarity(distance),
      })
      .collect();
    if let Some(threshold) = threshold {
      results.retain(|r| r.similarity >= threshold);
    }
    results
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vector::store::{create_vector_store, vector_store_insert, vector_store_iter};
  use crate::vector::types::VectorStoreConfig;

  fn build_store_and_index(metric: DistanceMetric) -> (VectorManifest, IvfIndex) {
    let mut store = create_vector_store(VectorStoreConfig::new(4).with_metric(metric));
    vector_store_insert(&mut store, 1, &[1.0, 0.0, 0.0, 0.0]).expect("v1");
    vector_store_insert(&mut store, 2, &[0.0, 1.0, 0.0, 0.0]).expect("v2");
    vector_store_insert(&mut store, 3, &[-1.0, 0.0, 0.0, 0.0]).expect("v3");

    let mut index = IvfIndex::new(
      IvfConfig::new(4, 2)
        .with_metric(metric)
        .with_n_probe(2)
        .with_seed(7),
    );

    let mut training = Vec::new();
    let mut entries = Vec::new();
    for (_, node_id, vector) in vector_store_iter(&store) {
      training.extend_from_slice(vector);
      entries.push((node_id, vector.to_vec()));
    }
    index.train(&training, entries.len(), Some(7)).expect("train");
    for (node_id, vector) in entries {
      index.insert(node_id, &vector).expect("insert");
    }

    (store, index)
  }

  #[test]
  fn test_untrained_rejects_operations() {
    let index = IvfIndex::new(IvfConfig::new(4, 2));
    let store = create_vector_store(VectorStoreConfig::new(4));
    assert!(matches!(
      index.search(&store, &[1.0, 0.0, 0.0, 0.0], 3, &SearchOptions::default()),
      Err(HeronError::IndexNotTrained)
    ));

    let mut index = index;
    assert!(matches!(
      index.insert(1, &[1.0, 0.0, 0.0, 0.0]),
      Err(HeronError::IndexNotTrained)
    ));
  }

  #[test]
  fn test_cosine_ranking() {
    let (store, index) = build_store_and_index(DistanceMetric::Cosine);
    let results = index
      .search(&store, &[1.0, 0.0, 0.0, 0.0], 3, &SearchOptions::default())
      .expect("search");

    assert_eq!(results.len(), 3);
    let ids: Vec<NodeId> = results.iter().map(|r| r.node_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(results[0].similarity > results[1].similarity);
    assert!(results[1].similarity > results[2].similarity);
    assert!((results[0].similarity - 1.0).abs() < 1e-5);
  }

  #[test]
  fn test_threshold_filters_results() {
    let (store, index) = build_store_and_index(DistanceMetric::Cosine);
    let results = index
      .search(
        &store,
        &[1.0, 0.0, 0.0, 0.0],
        3,
        &SearchOptions {
          threshold: Some(0.5),
          ..Default::default()
        },
      )
      .expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].node_id, 1);
  }

  #[test]
  fn test_filter_predicate() {
    let (store, index) = build_store_and_index(DistanceMetric::Cosine);
    let exclude_one = |id: NodeId| id != 1;
    let results = index
      .search(
        &store,
        &[1.0, 0.0, 0.0, 0.0],
        3,
        &SearchOptions {
          filter: Some(&exclude_one),
          ..Default::default()
        },
      )
      .expect("search");
    assert!(results.iter().all(|r| r.node_id != 1));
  }

  #[test]
  fn test_k_and_probe_clamped() {
    let (store, index) = build_store_and_index(DistanceMetric::Cosine);
    // k beyond the store size and n_probe beyond the cluster count
    let results = index
      .search(
        &store,
        &[1.0, 0.0, 0.0, 0.0],
        100,
        &SearchOptions {
          n_probe: Some(50),
          ..Default::default()
        },
      )
      .expect("search");
    assert_eq!(results.len(), 3);
  }

  #[test]
  fn test_multi_search_combines() {
    let (store, index) = build_store_and_index(DistanceMetric::Cosine);
    let queries = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];

    let results = index
      .multi_search(&store, &queries, 3, CombineMode::Min, &SearchOptions::default())
      .expect("multi");
    assert_eq!(results.len(), 3);
    // Both node 1 and node 2 have a zero-distance query under Min
    assert!(results[0].distance.abs() < 1e-5);
    assert!(results[1].distance.abs() < 1e-5);

    assert!(matches!(
      index.multi_search(&store, &[], 3, CombineMode::Avg, &SearchOptions::default()),
      Err(HeronError::EmptyQuerySet)
    ));
  }

  #[test]
  fn test_recall_grows_with_probe() {
    // 64 clustered points in 8 clusters; higher n_probe must not lower recall
    let mut store = create_vector_store(
      VectorStoreConfig::new(2).with_metric(DistanceMetric::Euclidean),
    );
    let mut training = Vec::new();
    let mut id = 1u64;
    for cx in 0..4 {
      for cy in 0..2 {
        for i in 0..8 {
          let v = [
            cx as f32 * 10.0 + (i % 3) as f32 * 0.1,
            cy as f32 * 10.0 + (i % 2) as f32 * 0.1,
          ];
          vector_store_insert(&mut store, id, &v).expect("insert");
          training.extend_from_slice(&v);
          id += 1;
        }
      }
    }

    let mut index = IvfIndex::new(
      IvfConfig::new(2, 8)
        .with_metric(DistanceMetric::Euclidean)
        .with_seed(3),
    );
    index.train(&training, 64, Some(3)).expect("train");
    for (_, node_id, vector) in vector_store_iter(&store) {
      let v = vector.to_vec();
      index.insert(node_id, &v).expect("insert");
    }

    let query = [0.05, 0.05];
    let exact: Vec<NodeId> = {
      let mut scored: Vec<(f32, NodeId)> = vector_store_iter(&store)
        .map(|(_, id, v)| (crate::vector::distance::squared_euclidean(&query, v), id))
        .collect();
      scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
      scored.into_iter().take(8).map(|(_, id)| id).collect()
    };

    let recall_at = |n_probe: usize| -> usize {
      let results = index
        .search(
          &store,
          &query,
          8,
          &SearchOptions {
            n_probe: Some(n_probe),
            ..Default::default()
          },
        )
        .expect("search");
      results
        .iter()
        .filter(|r| exact.contains(&r.node_id))
        .count()
    };

    let r1 = recall_at(1);
    let r4 = recall_at(4);
    let r8 = recall_at(8);
    assert!(r4 >= r1);
    assert!(r8 >= r4);
    assert_eq!(r8, 8);
  }
}
