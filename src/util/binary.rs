//! Little-endian slice accessors used by every on-disk format.

use byteorder::{ByteOrder, LittleEndian};

#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
  LittleEndian::read_u16(&buf[offset..offset + 2])
}

#[inline]
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
  LittleEndian::read_u32(&buf[offset..offset + 4])
}

#[inline]
pub fn read_i32(buf: &[u8], offset: usize) -> i32 {
  LittleEndian::read_i32(&buf[offset..offset + 4])
}

#[inline]
pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
  LittleEndian::read_u64(&buf[offset..offset + 8])
}

#[inline]
pub fn read_f32(buf: &[u8], offset: usize) -> f32 {
  LittleEndian::read_f32(&buf[offset..offset + 4])
}

#[inline]
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
  LittleEndian::write_u16(&mut buf[offset..offset + 2], value);
}

#[inline]
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
  LittleEndian::write_u32(&mut buf[offset..offset + 4], value);
}

#[inline]
pub fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
  LittleEndian::write_i32(&mut buf[offset..offset + 4], value);
}

#[inline]
pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
  LittleEndian::write_u64(&mut buf[offset..offset + 8], value);
}

#[inline]
pub fn write_f32(buf: &mut [u8], offset: usize, value: f32) {
  LittleEndian::write_f32(&mut buf[offset..offset + 4], value);
}

/// Element accessors: `index` counts elements, not bytes.
#[inline]
pub fn read_u32_at(buf: &[u8], index: usize) -> u32 {
  read_u32(buf, index * 4)
}

#[inline]
pub fn read_i32_at(buf: &[u8], index: usize) -> i32 {
  read_i32(buf, index * 4)
}

#[inline]
pub fn read_u64_at(buf: &[u8], index: usize) -> u64 {
  read_u64(buf, index * 8)
}

/// Round `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
  (value + alignment - 1) & !(alignment - 1)
}

/// Encode a `u32` slice as packed little-endian bytes.
pub fn encode_u32_slice(values: &[u32]) -> Vec<u8> {
  let mut data = vec![0u8; values.len() * 4];
  for (i, &value) in values.iter().enumerate() {
    write_u32(&mut data, i * 4, value);
  }
  data
}

/// Encode a `u64` slice as packed little-endian bytes.
pub fn encode_u64_slice(values: &[u64]) -> Vec<u8> {
  let mut data = vec![0u8; values.len() * 8];
  for (i, &value) in values.iter().enumerate() {
    write_u64(&mut data, i * 8, value);
  }
  data
}

/// Encode an `f32` slice as packed little-endian bytes.
pub fn encode_f32_slice(values: &[f32]) -> Vec<u8> {
  let mut data = vec![0u8; values.len() * 4];
  for (i, &value) in values.iter().enumerate() {
    write_f32(&mut data, i * 4, value);
  }
  data
}

/// Decode packed little-endian bytes into `f32` values.
pub fn decode_f32_slice(buf: &[u8]) -> Vec<f32> {
  let mut out = Vec::with_capacity(buf.len() / 4);
  for chunk in buf.chunks_exact(4) {
    out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_round_trip_u32_u64() {
    let mut buf = vec![0u8; 16];
    write_u32(&mut buf, 0, 0xdeadbeef);
    write_u64(&mut buf, 8, 0x0123456789abcdef);
    assert_eq!(read_u32(&buf, 0), 0xdeadbeef);
    assert_eq!(read_u64(&buf, 8), 0x0123456789abcdef);
  }

  #[test]
  fn test_align_up() {
    assert_eq!(align_up(0, 64), 0);
    assert_eq!(align_up(1, 64), 64);
    assert_eq!(align_up(64, 64), 64);
    assert_eq!(align_up(65, 8), 72);
  }

  #[test]
  fn test_f32_slice_round_trip() {
    let values = [1.0f32, -2.5, 0.125];
    let encoded = encode_f32_slice(&values);
    assert_eq!(decode_f32_slice(&encoded), values);
  }
}
