//! Distance primitives shared by the vector store and the ANN indices.

/// Dot product of two vectors.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
  debug_assert_eq!(a.len(), b.len());
  a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Squared Euclidean distance.
#[inline]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
  debug_assert_eq!(a.len(), b.len());
  a.iter()
    .zip(b.iter())
    .map(|(x, y)| {
      let d = x - y;
      d * d
    })
    .sum()
}

/// Cosine distance. Assumes both vectors are normalized.
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
  1.0 - dot_product(a, b)
}

/// Negated dot product, so that smaller is closer.
#[inline]
pub fn neg_dot(a: &[f32], b: &[f32]) -> f32 {
  -dot_product(a, b)
}

/// L2 norm.
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
  dot_product(v, v).sqrt()
}

/// Normalize in place. Leaves near-zero vectors untouched.
pub fn normalize_in_place(v: &mut [f32]) {
  let norm = l2_norm(v);
  if norm > 1e-10 {
    let inv = 1.0 / norm;
    for x in v.iter_mut() {
      *x *= inv;
    }
  }
}

/// Is the vector normalized within `tolerance`?
pub fn is_normalized(v: &[f32], tolerance: f32) -> bool {
  (l2_norm(v) - 1.0).abs() < tolerance
}
