//! Key hashing for the node key index.

use xxhash_rust::xxh64::xxh64;

/// 64-bit hash of a key's UTF-8 bytes.
#[inline]
pub fn xxhash64_str(key: &str) -> u64 {
  xxh64(key.as_bytes(), 0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stable_across_calls() {
    assert_eq!(xxhash64_str("user:alice"), xxhash64_str("user:alice"));
    assert_ne!(xxhash64_str("user:alice"), xxhash64_str("user:bob"));
  }
}
