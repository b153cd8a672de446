//! Product quantization and the PQ-compressed IVF index.
//!
//! A vector is split into `m` subspaces; each subspace is quantized to one
//! of up to 256 per-subspace centroids, so a full vector compresses to an
//! `m`-byte code. Queries build a distance table `T[m][K]` once and score
//! codes by Asymmetric Distance Computation: `sum(T[i][code[i]])`.

use crate::error::{HeronError, Result};
use crate::types::NodeId;
use crate::vector::distance::{dot_product, squared_euclidean};
use crate::vector::ivf::index::{SearchOptions, SearchResult};
use crate::vector::ivf::kmeans::{kmeans, KMeansConfig};
use crate::vector::store::{vector_store_get, vector_store_len};
use crate::vector::types::{DistanceMetric, VectorManifest};

// ============================================================================
// Product quantizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
  pub dimensions: usize,
  /// Number of subspaces; `dimensions % m == 0`
  pub m: usize,
  /// Centroids per subspace (<= 256, codes are u8)
  pub n_centroids: usize,
  /// Subspace width: `dimensions / m`
  pub dsub: usize,
  /// `m * n_centroids * dsub` values once trained
  pub codebooks: Vec<f32>,
  pub trained: bool,
}

impl ProductQuantizer {
  pub fn new(dimensions: usize, m: usize, n_centroids: usize) -> Result<Self> {
    if m == 0 || dimensions % m != 0 {
      return Err(HeronError::Internal(format!(
        "PQ subspace count {m} must divide dimensions {dimensions}"
      )));
    }
    if n_centroids == 0 || n_centroids > 256 {
      return Err(HeronError::Internal(format!(
        "PQ centroid count {n_centroids} must be in [1, 256]"
      )));
    }
    Ok(Self {
      dimensions,
      m,
      n_centroids,
      dsub: dimensions / m,
      codebooks: Vec::new(),
      trained: false,
    })
  }

  /// Train one k-means codebook per subspace.
  pub fn train(&mut self, vectors: &[f32], n: usize, seed: Option<u64>) -> Result<()> {
    if n < self.n_centroids {
      return Err(HeronError::NotEnoughTrainingVectors {
        n,
        k: self.n_centroids,
      });
    }

    let mut codebooks = Vec::with_capacity(self.m * self.n_centroids * self.dsub);
    let mut sub_vectors = vec![0.0f32; n * self.dsub];

    for sub in 0..self.m {
      let sub_offset = sub * self.dsub;
      for i in 0..n {
        let src = i * self.dimensions + sub_offset;
        sub_vectors[i * self.dsub..(i + 1) * self.dsub]
          .copy_from_slice(&vectors[src..src + self.dsub]);
      }

      let config = match seed {
        Some(s) => KMeansConfig::new(self.n_centroids).with_seed(s.wrapping_add(sub as u64)),
        None => KMeansConfig::new(self.n_centroids),
      };
      let result = kmeans(&sub_vectors, n, self.dsub, &config, squared_euclidean)?;
      codebooks.extend_from_slice(&result.centroids);
    }

    self.codebooks = codebooks;
    self.trained = true;
    Ok(())
  }

  fn codebook(&self, sub: usize) -> &[f32] {
    let start = sub * self.n_centroids * self.dsub;
    &self.codebooks[start..start + self.n_centroids * self.dsub]
  }

  /// Encode a vector as `m` centroid codes.
  pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
    if !self.trained {
      return Err(HeronError::IndexNotTrained);
    }
    if vector.len() != self.dimensions {
      return Err(HeronError::VectorDimensionMismatch {
        expected: self.dimensions,
        got: vector.len(),
      });
    }

    let mut code = Vec::with_capacity(self.m);
    for sub in 0..self.m {
      let sub_vec = &vector[sub * self.dsub..(sub + 1) * self.dsub];
      let codebook = self.codebook(sub);

      let mut best = 0u8;
      let mut best_dist = f32::INFINITY;
      for c in 0..self.n_centroids {
        let centroid = &codebook[c * self.dsub..(c + 1) * self.dsub];
        let dist = squared_euclidean(sub_vec, centroid);
        if dist < best_dist {
          best_dist = dist;
          best = c as u8;
        }
      }
      code.push(best);
    }
    Ok(code)
  }

  /// Reconstruct the approximate vector for a code.
  pub fn reconstruct(&self, code: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(self.dimensions);
    for (sub, &c) in code.iter().enumerate() {
      let codebook = self.codebook(sub);
      let centroid = &codebook[c as usize * self.dsub..(c as usize + 1) * self.dsub];
      out.extend_from_slice(centroid);
    }
    out
  }

  /// Build the per-query distance table `T[m][K]`.
  ///
  /// For Euclidean the entries are squared subspace distances; for
  /// dot-family metrics they are negated subspace dot products, so ADC
  /// totals remain "smaller is closer" under every metric.
  pub fn distance_table(&self, query: &[f32], metric: DistanceMetric) -> Vec<f32> {
    let mut table = vec![0.0f32; self.m * self.n_centroids];
    for sub in 0..self.m {
      let sub_query = &query[sub * self.dsub..(sub + 1) * self.dsub];
      let codebook = self.codebook(sub);
      for c in 0..self.n_centroids {
        let centroid = &codebook[c * self.dsub..(c + 1) * self.dsub];
        table[sub * self.n_centroids + c] = match metric {
          DistanceMetric::Euclidean => squared_euclidean(sub_query, centroid),
          DistanceMetric::Cosine | DistanceMetric::Dot => -dot_product(sub_query, centroid),
        };
      }
    }
    table
  }

  /// Asymmetric distance: sum the table entry selected by each code byte.
  #[inline]
  pub fn adc(&self, table: &[f32], code: &[u8]) -> f32 {
    let mut total = 0.0;
    for (sub, &c) in code.iter().enumerate() {
      total += table[sub * self.n_centroids + c as usize];
    }
    total
  }
}

// ============================================================================
// IVF-PQ
// ============================================================================

#[derive(Debug, Clone)]
pub struct IvfPqConfig {
  pub dimensions: usize,
  pub n_clusters: usize,
  pub n_probe: usize,
  /// PQ subspace count
  pub m: usize,
  /// PQ centroids per subspace
  pub n_centroids: usize,
  pub metric: DistanceMetric,
  /// Encode residuals against the coarse centroid (default) or raw vectors
  pub residual: bool,
  pub seed: Option<u64>,
}

impl IvfPqConfig {
  pub fn new(dimensions: usize, n_clusters: usize, m: usize) -> Self {
    Self {
      dimensions,
      n_clusters,
      n_probe: (n_clusters / 10).max(1),
      m,
      n_centroids: crate::constants::PQ_DEFAULT_CENTROIDS,
      metric: DistanceMetric::Cosine,
      residual: true,
      seed: None,
    }
  }

  pub fn with_n_probe(mut self, n_probe: usize) -> Self {
    self.n_probe = n_probe;
    self
  }

  pub fn with_n_centroids(mut self, n_centroids: usize) -> Self {
    self.n_centroids = n_centroids;
    self
  }

  pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
    self.metric = metric;
    self
  }

  pub fn with_residual(mut self, residual: bool) -> Self {
    self.residual = residual;
    self
  }

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = Some(seed);
    self
  }
}

/// Extra knobs for PQ search.
#[derive(Debug, Clone, Copy, Default)]
pub struct PqSearchOptions {
  /// Re-score the ADC shortlist against raw vectors from the store
  pub rerank: bool,
  /// Shortlist multiplier when re-ranking (candidates = factor * k)
  pub rerank_factor: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IvfPqIndex {
  pub dimensions: usize,
  pub n_clusters: usize,
  pub n_probe: usize,
  pub metric: DistanceMetric,
  pub residual: bool,
  /// Coarse centroids, `n_clusters * dimensions`
  pub centroids: Vec<f32>,
  pub pq: ProductQuantizer,
  /// Inverted lists of `(node_id, code)`
  pub lists: Vec<Vec<(NodeId, Vec<u8>)>>,
  pub trained: bool,
}

impl IvfPqIndex {
  pub fn new(config: &IvfPqConfig) -> Result<Self> {
    Ok(Self {
      dimensions: config.dimensions,
      n_clusters: config.n_clusters,
      n_probe: config.n_probe.clamp(1, config.n_clusters.max(1)),
      metric: config.metric,
      residual: config.residual,
      centroids: Vec::new(),
      pq: ProductQuantizer::new(config.dimensions, config.m, config.n_centroids)?,
      lists: Vec::new(),
      trained: false,
    })
  }

  pub fn total_vectors(&self) -> usize {
    self.lists.iter().map(|l| l.len()).sum()
  }

  fn coarse_distance_fn(&self) -> fn(&[f32], &[f32]) -> f32 {
    match self.metric {
      DistanceMetric::Cosine => crate::vector::distance::cosine_distance,
      DistanceMetric::Euclidean => squared_euclidean,
      DistanceMetric::Dot => crate::vector::distance::neg_dot,
    }
  }

  fn centroid(&self, cluster: usize) -> &[f32] {
    &self.centroids[cluster * self.dimensions..(cluster + 1) * self.dimensions]
  }

  fn nearest_centroid(&self, vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for c in 0..self.n_clusters {
      let dist = self.metric.distance(vector, self.centroid(c));
      if dist < best_dist {
        best_dist = dist;
        best = c;
      }
    }
    best
  }

  /// Train the coarse quantizer, then the PQ codebooks over residuals (or
  /// raw vectors in non-residual mode).
  pub fn train(&mut self, vectors: &[f32], n: usize, seed: Option<u64>) -> Result<()> {
    if n < self.n_clusters {
      return Err(HeronError::NotEnoughTrainingVectors {
        n,
        k: self.n_clusters,
      });
    }

    let config = match seed {
      Some(s) => KMeansConfig::new(self.n_clusters).with_seed(s),
      None => KMeansConfig::new(self.n_clusters),
    };
    let coarse = kmeans(vectors, n, self.dimensions, &config, self.coarse_distance_fn())?;
    self.centroids = coarse.centroids;

    let pq_training: Vec<f32> = if self.residual {
      let mut residuals = vec![0.0f32; n * self.dimensions];
      for i in 0..n {
        let vec = &vectors[i * self.dimensions..(i + 1) * self.dimensions];
        let centroid = &self.centroids[coarse.assignments[i] as usize * self.dimensions
          ..(coarse.assignments[i] as usize + 1) * self.dimensions];
        for d in 0..self.dimensions {
          residuals[i * self.dimensions + d] = vec[d] - centroid[d];
        }
      }
      residuals
    } else {
      vectors[..n * self.dimensions].to_vec()
    };

    self.pq.train(&pq_training, n, seed)?;
    self.lists = vec![Vec::new(); self.n_clusters];
    self.trained = true;
    Ok(())
  }

  fn encode_for_cluster(&self, cluster: usize, vector: &[f32]) -> Result<Vec<u8>> {
    if self.residual {
      let centroid = self.centroid(cluster);
      let residual: Vec<f32> = vector
        .iter()
        .zip(centroid.iter())
        .map(|(v, c)| v - c)
        .collect();
      self.pq.encode(&residual)
    } else {
      self.pq.encode(vector)
    }
  }

  pub fn insert(&mut self, node_id: NodeId, vector: &[f32]) -> Result<()> {
    if !self.trained {
      return Err(HeronError::IndexNotTrained);
    }
    if vector.len() != self.dimensions {
      return Err(HeronError::VectorDimensionMismatch {
        expected: self.dimensions,
        got: vector.len(),
      });
    }
    let cluster = self.nearest_centroid(vector);
    let code = self.encode_for_cluster(cluster, vector)?;
    self.lists[cluster].push((node_id, code));
    Ok(())
  }

  pub fn remove(&mut self, node_id: NodeId) {
    for list in &mut self.lists {
      if let Some(pos) = list.iter().position(|(id, _)| *id == node_id) {
        list.swap_remove(pos);
        return;
      }
    }
  }

  /// ADC base and table for one probed cluster.
  ///
  /// In residual mode, dot-family metrics decompose as
  /// `dot(q, v) = dot(q, centroid) + dot(q, residual)`, so the base carries
  /// the centroid term; for Euclidean the table is built from
  /// `q - centroid` directly.
  fn cluster_scoring(&self, cluster: usize, query: &[f32]) -> (f32, Vec<f32>) {
    if !self.residual {
      let base = match self.metric {
        DistanceMetric::Cosine => 1.0,
        _ => 0.0,
      };
      return (base, self.pq.distance_table(query, self.metric));
    }

    let centroid = self.centroid(cluster);
    match self.metric {
      DistanceMetric::Euclidean => {
        let shifted: Vec<f32> = query
          .iter()
          .zip(centroid.iter())
          .map(|(q, c)| q - c)
          .collect();
        (0.0, self.pq.distance_table(&shifted, self.metric))
      }
      DistanceMetric::Cosine => (
        1.0 - dot_product(query, centroid),
        self.pq.distance_table(query, self.metric),
      ),
      DistanceMetric::Dot => (
        -dot_product(query, centroid),
        self.pq.distance_table(query, self.metric),
      ),
    }
  }

  fn probe_clusters(&self, query: &[f32], n_probe: usize) -> Vec<usize> {
    let mut scored: Vec<(f32, usize)> = (0..self.n_clusters)
      .map(|c| (self.metric.distance(query, self.centroid(c)), c))
      .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(n_probe);
    scored.into_iter().map(|(_, c)| c).collect()
  }

  /// Search with ADC scoring; optionally re-rank the shortlist against raw
  /// vectors fetched from the store.
  pub fn search(
    &self,
    store: &VectorManifest,
    query: &[f32],
    k: usize,
    options: &SearchOptions<'_>,
    pq_options: &PqSearchOptions,
  ) -> Result<Vec<SearchResult>> {
    if !self.trained {
      return Err(HeronError::IndexNotTrained);
    }
    if query.len() != self.dimensions {
      return Err(HeronError::VectorDimensionMismatch {
        expected: self.dimensions,
        got: query.len(),
      });
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
    let shortlist_size = if pq_options.rerank {
      k * pq_options.rerank_factor.max(2)
    } else {
      k
    };

    let mut candidates: Vec<(f32, NodeId)> = Vec::new();
    for cluster in self.probe_clusters(query, n_probe) {
      let (base, table) = self.cluster_scoring(cluster, query);
      for (node_id, code) in &self.lists[cluster] {
        if options.filter.is_some_and(|f| !f(*node_id)) {
          continue;
        }
        candidates.push((base + self.pq.adc(&table, code), *node_id));
      }
    }

    candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(shortlist_size);

    if pq_options.rerank {
      let mut exact: Vec<(f32, NodeId)> = Vec::with_capacity(candidates.len());
      for (_, node_id) in candidates {
        if let Some(vector) = vector_store_get(store, node_id) {
          exact.push((self.metric.distance(query, &vector), node_id));
        }
      }
      exact.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
      exact.truncate(k);
      candidates = exact;
    }

    let mut results: Vec<SearchResult> = candidates
      .into_iter()
      .map(|(distance, node_id)| SearchResult {
        node_id,
        distance,
        similarity: self.metric.similarity(distance),
      })
      .collect();
    if let Some(threshold) = options.threshold {
      results.retain(|r| r.similarity >= threshold);
    }
    results.truncate(k);
    Ok(results)
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

  fn clustered_vectors(per_cluster: usize) -> Vec<(NodeId, Vec<f32>)> {
    let centers = [
      [10.0, 0.0, 0.0, 0.0],
      [0.0, 10.0, 0.0, 0.0],
      [0.0, 0.0, 10.0, 0.0],
      [0.0, 0.0, 0.0, 10.0],
    ];
    let mut out = Vec::new();
    let mut id = 1u64;
    for center in &centers {
      for i in 0..per_cluster {
        let jitter = (i % 5) as f32 * 0.05;
        let v = vec![
          center[0] + jitter,
          center[1] - jitter,
          center[2] + jitter * 0.5,
          center[3],
        ];
        out.push((id, v));
        id += 1;
      }
    }
    out
  }

  #[test]
  fn test_pq_dimensions_must_divide() {
    assert!(ProductQuantizer::new(10, 3, 16).is_err());
    assert!(ProductQuantizer::new(12, 3, 16).is_ok());
    assert!(ProductQuantizer::new(8, 2, 300).is_err());
  }

  #[test]
  fn test_pq_encode_reconstruct() {
    let data = clustered_vectors(8);
    let flat: Vec<f32> = data.iter().flat_map(|(_, v)| v.iter().copied()).collect();

    let mut pq = ProductQuantizer::new(4, 2, 8).expect("pq");
    pq.train(&flat, data.len(), Some(11)).expect("train");

    let (_, sample) = &data[0];
    let code = pq.encode(sample).expect("encode");
    assert_eq!(code.len(), 2);

    let approx = pq.reconstruct(&code);
    assert_eq!(approx.len(), 4);
    // Reconstruction lands near the original for well-clustered data
    assert!(squared_euclidean(sample, &approx) < 1.0);
  }

  #[test]
  fn test_adc_matches_table_lookup() {
    let data = clustered_vectors(8);
    let flat: Vec<f32> = data.iter().flat_map(|(_, v)| v.iter().copied()).collect();

    let mut pq = ProductQuantizer::new(4, 2, 4).expect("pq");
    pq.train(&flat, data.len(), Some(5)).expect("train");

    let query = [10.0, 0.0, 0.0, 0.0];
    let table = pq.distance_table(&query, DistanceMetric::Euclidean);
    let code = pq.encode(&[10.0, 0.0, 0.0, 0.0]).expect("encode");

    let adc = pq.adc(&table, &code);
    let manual: f32 = code
      .iter()
      .enumerate()
      .map(|(sub, &c)| table[sub * pq.n_centroids + c as usize])
      .sum();
    assert!((adc - manual).abs() < 1e-6);
  }

  #[test]
  fn test_untrained_pq_rejects_encode() {
    let pq = ProductQuantizer::new(4, 2, 4).expect("pq");
    assert!(matches!(
      pq.encode(&[1.0, 0.0, 0.0, 0.0]),
      Err(HeronError::IndexNotTrained)
    ));
  }

  fn build_ivfpq(residual: bool) -> (VectorManifest, IvfPqIndex) {
    let data = clustered_vectors(8);
    let mut store = create_vector_store(
      VectorStoreConfig::new(4).with_metric(DistanceMetric::Euclidean),
    );
    for (id, v) in &data {
      vector_store_insert(&mut store, *id, v).expect("insert");
    }

    let config = IvfPqConfig::new(4, 4, 2)
      .with_n_centroids(8)
      .with_metric(DistanceMetric::Euclidean)
      .with_n_probe(2)
      .with_residual(residual)
      .with_seed(17);
    let mut index = IvfPqIndex::new(&config).expect("index");

    let flat: Vec<f32> = data.iter().flat_map(|(_, v)| v.iter().copied()).collect();
    index.train(&flat, data.len(), Some(17)).expect("train");
    for (_, node_id, vector) in vector_store_iter(&store) {
      let v = vector.to_vec();
      index.insert(node_id, &v).expect("insert");
    }
    (store, index)
  }

  #[test]
  fn test_ivfpq_search_finds_cluster() {
    for residual in [true, false] {
      let (store, index) = build_ivfpq(residual);
      let results = index
        .search(
          &store,
          &[10.0, 0.0, 0.0, 0.0],
          4,
          &SearchOptions::default(),
          &PqSearchOptions::default(),
        )
        .expect("search");

      assert_eq!(results.len(), 4);
      // The first cluster holds ids 1..=8
      for r in &results {
        assert!(r.node_id <= 8, "unexpected hit {} (residual={residual})", r.node_id);
      }
    }
  }

  #[test]
  fn test_ivfpq_rerank_improves_ordering() {
    let (store, index) = build_ivfpq(true);
    let results = index
      .search(
        &store,
        &[10.0, 0.0, 0.0, 0.0],
        3,
        &SearchOptions::default(),
        &PqSearchOptions {
          rerank: true,
          rerank_factor: 4,
        },
      )
      .expect("search");

    assert_eq!(results.len(), 3);
    // Re-ranked distances are exact, so they must be non-decreasing
    for pair in results.windows(2) {
      assert!(pair[0].distance <= pair[1].distance);
    }
  }

  #[test]
  fn test_ivfpq_too_few_training_vectors() {
    let config = IvfPqConfig::new(4, 8, 2).with_n_centroids(8);
    let mut index = IvfPqIndex::new(&config).expect("index");
    let flat = vec![0.5f32; 4 * 4];
    assert!(matches!(
      index.train(&flat, 4, Some(1)),
      Err(HeronError::NotEnoughTrainingVectors { .. })
    ));
  }
}
