//! CRC-32C checksums used by the header, WAL frames, and snapshot sections.

/// One-shot checksum of a byte slice.
#[inline]
pub fn crc32c(data: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(data);
  hasher.finalize()
}

/// Incremental checksum for multi-part inputs.
pub struct Crc32cHasher {
  inner: crc32fast::Hasher,
}

impl Crc32cHasher {
  pub fn new() -> Self {
    Self {
      inner: crc32fast::Hasher::new(),
    }
  }

  pub fn update(&mut self, data: &[u8]) {
    self.inner.update(data);
  }

  pub fn finalize(self) -> u32 {
    self.inner.finalize()
  }
}

impl Default for Crc32cHasher {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_incremental_matches_one_shot() {
    let data = b"the quick brown fox jumps over the lazy dog";
    let mut hasher = Crc32cHasher::new();
    hasher.update(&data[..10]);
    hasher.update(&data[10..]);
    assert_eq!(hasher.finalize(), crc32c(data));
  }

  #[test]
  fn test_bit_flip_changes_checksum() {
    let mut data = b"hello world".to_vec();
    let before = crc32c(&data);
    data[3] ^= 0x01;
    assert_ne!(crc32c(&data), before);
  }
}
