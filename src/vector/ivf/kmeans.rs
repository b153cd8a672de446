//! K-means clustering for index training.
//!
//! K-means++ initialization followed by Lloyd iterations. Assignment is the
//! hot loop and runs in parallel across vectors.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{HeronError, Result};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct KMeansConfig {
  /// Number of clusters (k)
  pub n_clusters: usize,
  pub max_iterations: usize,
  /// Convergence tolerance (relative inertia change)
  pub tolerance: f32,
  /// Seed for reproducible training
  pub seed: Option<u64>,
}

impl Default for KMeansConfig {
  fn default() -> Self {
    Self {
      n_clusters: 100,
      max_iterations: 25,
      tolerance: 1e-4,
      seed: None,
    }
  }
}

impl KMeansConfig {
  pub fn new(n_clusters: usize) -> Self {
    Self {
      n_clusters,
      ..Default::default()
    }
  }

  pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
    self.max_iterations = max_iterations;
    self
  }

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = Some(seed);
    self
  }
}

// ============================================================================
// Result
// ============================================================================

#[derive(Debug, Clone)]
pub struct KMeansResult {
  /// `k * dimensions` centroid values
  pub centroids: Vec<f32>,
  /// Cluster assignment per input vector
  pub assignments: Vec<u32>,
  /// Sum of distances to the assigned centroids
  pub inertia: f32,
  pub iterations: usize,
  pub converged: bool,
}

// ============================================================================
// Algorithm
// ============================================================================

/// Run k-means over `n` contiguous vectors of `dimensions` values.
///
/// Fails when fewer than `n_clusters` vectors are provided.
pub fn kmeans(
  vectors: &[f32],
  n: usize,
  dimensions: usize,
  config: &KMeansConfig,
  distance_fn: fn(&[f32], &[f32]) -> f32,
) -> Result<KMeansResult> {
  if n < config.n_clusters {
    return Err(HeronError::NotEnoughTrainingVectors {
      n,
      k: config.n_clusters,
    });
  }
  if vectors.len() != n * dimensions {
    return Err(HeronError::Internal(format!(
      "k-means input size mismatch: {} values for {n} x {dimensions}",
      vectors.len()
    )));
  }

  let k = config.n_clusters;
  let mut centroids = plus_plus_init(vectors, n, dimensions, k, distance_fn, config.seed);

  let mut assignments = vec![0u32; n];
  let mut prev_inertia = f32::INFINITY;
  let mut iterations = 0;
  let mut converged = false;

  for iter in 0..config.max_iterations {
    iterations = iter + 1;

    let inertia = assign(vectors, n, dimensions, &centroids, &mut assignments, distance_fn);

    let change = (prev_inertia - inertia).abs() / inertia.max(1.0);
    if change < config.tolerance {
      converged = true;
      break;
    }
    prev_inertia = inertia;

    update_centroids(vectors, n, dimensions, &assignments, k, &mut centroids);
  }

  let inertia = assign(vectors, n, dimensions, &centroids, &mut assignments, distance_fn);

  Ok(KMeansResult {
    centroids,
    assignments,
    inertia,
    iterations,
    converged,
  })
}

/// K-means++ seeding: the first centroid is uniform, the rest are sampled
/// weighted by squared distance to the nearest chosen centroid.
fn plus_plus_init(
  vectors: &[f32],
  n: usize,
  dimensions: usize,
  k: usize,
  distance_fn: fn(&[f32], &[f32]) -> f32,
  seed: Option<u64>,
) -> Vec<f32> {
  let mut rng: StdRng = match seed {
    Some(s) => StdRng::seed_from_u64(s),
    None => StdRng::from_entropy(),
  };

  let mut centroids = Vec::with_capacity(k * dimensions);
  let first = rng.gen_range(0..n) * dimensions;
  centroids.extend_from_slice(&vectors[first..first + dimensions]);

  let mut min_dists = vec![f32::INFINITY; n];

  for c in 1..k {
    let prev = &centroids[(c - 1) * dimensions..c * dimensions];

    let mut total = 0.0f32;
    for i in 0..n {
      let vec = &vectors[i * dimensions..(i + 1) * dimensions];
      // abs()^2 keeps dot-product distances usable as weights
      let d = distance_fn(vec, prev).abs();
      min_dists[i] = min_dists[i].min(d * d);
      total += min_dists[i];
    }

    let mut r = rng.gen::<f32>() * total;
    let mut selected = 0;
    for (i, &d) in min_dists.iter().enumerate() {
      r -= d;
      if r <= 0.0 {
        selected = i;
        break;
      }
    }

    let offset = selected * dimensions;
    centroids.extend_from_slice(&vectors[offset..offset + dimensions]);
  }

  centroids
}

/// Assign every vector to its nearest centroid; returns total inertia.
fn assign(
  vectors: &[f32],
  n: usize,
  dimensions: usize,
  centroids: &[f32],
  assignments: &mut [u32],
  distance_fn: fn(&[f32], &[f32]) -> f32,
) -> f32 {
  let k = centroids.len() / dimensions;

  let results: Vec<(u32, f32)> = (0..n)
    .into_par_iter()
    .map(|i| {
      let vec = &vectors[i * dimensions..(i + 1) * dimensions];
      let mut best = 0u32;
      let mut best_dist = f32::INFINITY;
      for c in 0..k {
        let centroid = &centroids[c * dimensions..(c + 1) * dimensions];
        let dist = distance_fn(vec, centroid);
        if dist < best_dist {
          best_dist = dist;
          best = c as u32;
        }
      }
      (best, best_dist)
    })
    .collect();

  let mut inertia = 0.0;
  for (i, (cluster, dist)) in results.into_iter().enumerate() {
    assignments[i] = cluster;
    inertia += dist;
  }
  inertia
}

fn update_centroids(
  vectors: &[f32],
  n: usize,
  dimensions: usize,
  assignments: &[u32],
  k: usize,
  centroids: &mut [f32],
) {
  let mut sums = vec![0.0f32; k * dimensions];
  let mut counts = vec![0u32; k];

  for i in 0..n {
    let cluster = assignments[i] as usize;
    let offset = cluster * dimensions;
    for d in 0..dimensions {
      sums[offset + d] += vectors[i * dimensions + d];
    }
    counts[cluster] += 1;
  }

  for c in 0..k {
    // An empty cluster keeps its previous centroid
    if counts[c] == 0 {
      continue;
    }
    let offset = c * dimensions;
    for d in 0..dimensions {
      centroids[offset + d] = sums[offset + d] / counts[c] as f32;
    }
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vector::distance::squared_euclidean;

  #[test]
  fn test_separates_two_clusters() {
    let mut vectors = Vec::new();
    for i in 0..50 {
      vectors.extend_from_slice(&[1.0 + (i % 7) as f32 * 0.01, 0.0, 0.0]);
    }
    for i in 0..50 {
      vectors.extend_from_slice(&[0.0, 1.0 + (i % 5) as f32 * 0.01, 0.0]);
    }

    let config = KMeansConfig::new(2).with_seed(42);
    let result = kmeans(&vectors, 100, 3, &config, squared_euclidean).expect("kmeans");

    assert_eq!(result.centroids.len(), 6);
    assert_eq!(result.assignments.len(), 100);
    assert_eq!(result.assignments[0], result.assignments[49]);
    assert_eq!(result.assignments[50], result.assignments[99]);
    assert_ne!(result.assignments[0], result.assignments[50]);
  }

  #[test]
  fn test_n_equal_k_uses_every_vector() {
    // Boundary: training size exactly equals cluster count
    let vectors = vec![
      0.0, 0.0, //
      10.0, 0.0, //
      0.0, 10.0, //
    ];
    let config = KMeansConfig::new(3).with_seed(1);
    let result = kmeans(&vectors, 3, 2, &config, squared_euclidean).expect("kmeans");
    assert!(result.inertia < 1e-3);

    let mut assigned: Vec<u32> = result.assignments.clone();
    assigned.sort_unstable();
    assigned.dedup();
    assert_eq!(assigned.len(), 3);
  }

  #[test]
  fn test_too_few_vectors_fails() {
    let vectors = vec![1.0, 2.0, 3.0];
    let config = KMeansConfig::new(2);
    assert!(matches!(
      kmeans(&vectors, 1, 3, &config, squared_euclidean),
      Err(HeronError::NotEnoughTrainingVectors { n: 1, k: 2 })
    ));
  }

  #[test]
  fn test_converges_on_well_separated_data() {
    let mut vectors = Vec::new();
    for _ in 0..100 {
      vectors.extend_from_slice(&[0.0, 0.0]);
    }
    for _ in 0..100 {
      vectors.extend_from_slice(&[10.0, 10.0]);
    }

    let config = KMeansConfig::new(2).with_seed(42);
    let result = kmeans(&vectors, 200, 2, &config, squared_euclidean).expect("kmeans");
    assert!(result.converged || result.iterations <= 10);
  }
}
