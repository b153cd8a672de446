//! WAL record framing.
//!
//! Frame layout (8-byte aligned, little-endian):
//! `[frame_len:u32][type:u8][flags:u8][reserved:u16][txid:u64][payload_len:u32][payload][crc32c:u32][pad]`
//!
//! `frame_len` is the full aligned frame size; the CRC covers the fixed
//! header plus payload. A malformed or mismatched frame terminates any
//! forward scan at that point.

use crate::constants::{WAL_FRAME_HEADER_SIZE, WAL_RECORD_ALIGNMENT};
use crate::types::{ETypeId, LabelId, NodeId, PropKeyId, PropValue, PropValueTag, TxId};
use crate::util::binary::{align_up, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::util::crc::crc32c;

// ============================================================================
// Record types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WalRecordType {
  Begin = 1,
  Commit = 2,
  Rollback = 3,
  DefineLabel = 4,
  DefineEtype = 5,
  DefinePropkey = 6,
  CreateNode = 7,
  DeleteNode = 8,
  AddEdge = 9,
  DeleteEdge = 10,
  SetNodeProp = 11,
  DelNodeProp = 12,
  SetEdgeProp = 13,
  DelEdgeProp = 14,
  SetNodeVector = 15,
  DelNodeVector = 16,
  AddNodeLabel = 17,
  RemoveNodeLabel = 18,
}

impl WalRecordType {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      1 => Some(Self::Begin),
      2 => Some(Self::Commit),
      3 => Some(Self::Rollback),
      4 => Some(Self::DefineLabel),
      5 => Some(Self::DefineEtype),
      6 => Some(Self::DefinePropkey),
      7 => Some(Self::CreateNode),
      8 => Some(Self::DeleteNode),
      9 => Some(Self::AddEdge),
      10 => Some(Self::DeleteEdge),
      11 => Some(Self::SetNodeProp),
      12 => Some(Self::DelNodeProp),
      13 => Some(Self::SetEdgeProp),
      14 => Some(Self::DelEdgeProp),
      15 => Some(Self::SetNodeVector),
      16 => Some(Self::DelNodeVector),
      17 => Some(Self::AddNodeLabel),
      18 => Some(Self::RemoveNodeLabel),
      _ => None,
    }
  }
}

// ============================================================================
// Record
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
  pub record_type: WalRecordType,
  pub txid: TxId,
  pub payload: Vec<u8>,
}

impl WalRecord {
  pub fn new(record_type: WalRecordType, txid: TxId, payload: Vec<u8>) -> Self {
    Self {
      record_type,
      txid,
      payload,
    }
  }

  /// Size of the framed record on disk.
  pub fn framed_size(&self) -> usize {
    framed_size_for_payload(self.payload.len())
  }

  /// Encode the full frame, CRC and padding included.
  pub fn build(&self) -> Vec<u8> {
    let frame_len = self.framed_size();
    let mut buf = vec![0u8; frame_len];

    write_u32(&mut buf, 0, frame_len as u32);
    buf[4] = self.record_type as u8;
    buf[5] = 0; // flags
    write_u16(&mut buf, 6, 0); // reserved
    write_u64(&mut buf, 8, self.txid);
    write_u32(&mut buf, 16, self.payload.len() as u32);
    buf[WAL_FRAME_HEADER_SIZE..WAL_FRAME_HEADER_SIZE + self.payload.len()]
      .copy_from_slice(&self.payload);

    let crc = crc32c(&buf[..WAL_FRAME_HEADER_SIZE + self.payload.len()]);
    write_u32(&mut buf, WAL_FRAME_HEADER_SIZE + self.payload.len(), crc);
    buf
  }
}

/// Framed size for a payload of `payload_len` bytes.
pub fn framed_size_for_payload(payload_len: usize) -> usize {
  align_up(
    WAL_FRAME_HEADER_SIZE + payload_len + 4,
    WAL_RECORD_ALIGNMENT,
  )
}

// ============================================================================
// Frame decoding
// ============================================================================

/// Outcome of decoding one frame during a forward scan.
#[derive(Debug)]
pub enum FrameParse {
  /// A valid frame; `next_offset` is the offset of the following frame.
  Ok {
    record: WalRecord,
    next_offset: usize,
  },
  /// Zero frame length: the scan reached unwritten space.
  End,
  /// Structurally invalid or CRC-mismatched frame.
  Corrupt { reason: String },
}

/// Decode the frame starting at `offset` in `buf`.
pub fn decode_frame(buf: &[u8], offset: usize) -> FrameParse {
  if offset + 4 > buf.len() {
    return FrameParse::End;
  }

  let frame_len = read_u32(buf, offset) as usize;
  if frame_len == 0 {
    return FrameParse::End;
  }
  if frame_len % WAL_RECORD_ALIGNMENT != 0 || frame_len < framed_size_for_payload(0) {
    return FrameParse::Corrupt {
      reason: format!("invalid frame length {frame_len}"),
    };
  }
  if offset + frame_len > buf.len() {
    return FrameParse::Corrupt {
      reason: format!(
        "frame length {frame_len} overruns buffer ({} bytes left)",
        buf.len() - offset
      ),
    };
  }

  let frame = &buf[offset..offset + frame_len];
  let record_type = match WalRecordType::from_u8(frame[4]) {
    Some(t) => t,
    None => {
      return FrameParse::Corrupt {
        reason: format!("unknown record type {}", frame[4]),
      }
    }
  };
  let txid = read_u64(frame, 8);
  let payload_len = read_u32(frame, 16) as usize;
  if framed_size_for_payload(payload_len) != frame_len {
    return FrameParse::Corrupt {
      reason: format!("payload length {payload_len} inconsistent with frame length {frame_len}"),
    };
  }

  let stored_crc = read_u32(frame, WAL_FRAME_HEADER_SIZE + payload_len);
  let computed_crc = crc32c(&frame[..WAL_FRAME_HEADER_SIZE + payload_len]);
  if stored_crc != computed_crc {
    return FrameParse::Corrupt {
      reason: format!("CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"),
    };
  }

  let payload = frame[WAL_FRAME_HEADER_SIZE..WAL_FRAME_HEADER_SIZE + payload_len].to_vec();

  FrameParse::Ok {
    record: WalRecord::new(record_type, txid, payload),
    next_offset: offset + frame_len,
  }
}

// ============================================================================
// Value encoding within payloads
// ============================================================================

fn push_u32(buf: &mut Vec<u8>, value: u32) {
  buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, value: u64) {
  buf.extend_from_slice(&value.to_le_bytes());
}

fn push_prop_value(buf: &mut Vec<u8>, value: &PropValue) {
  buf.push(value.tag() as u8);
  match value {
    PropValue::Null => {}
    PropValue::Bool(b) => buf.push(*b as u8),
    PropValue::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
    PropValue::F64(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
    PropValue::String(s) => {
      push_u32(buf, s.len() as u32);
      buf.extend_from_slice(s.as_bytes());
    }
    PropValue::VectorF32(v) => {
      push_u32(buf, v.len() as u32);
      for x in v {
        buf.extend_from_slice(&x.to_le_bytes());
      }
    }
  }
}

struct PayloadReader<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> PayloadReader<'a> {
  fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  fn take(&mut self, n: usize) -> Option<&'a [u8]> {
    if self.pos + n > self.buf.len() {
      return None;
    }
    let slice = &self.buf[self.pos..self.pos + n];
    self.pos += n;
    Some(slice)
  }

  fn u8(&mut self) -> Option<u8> {
    self.take(1).map(|s| s[0])
  }

  fn u32(&mut self) -> Option<u32> {
    self
      .take(4)
      .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
  }

  fn u64(&mut self) -> Option<u64> {
    self.take(8).map(|s| {
      u64::from_le_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]])
    })
  }

  fn string(&mut self) -> Option<String> {
    let len = self.u32()? as usize;
    let bytes = self.take(len)?;
    String::from_utf8(bytes.to_vec()).ok()
  }

  fn prop_value(&mut self) -> Option<PropValue> {
    let tag = PropValueTag::from_u8(self.u8()?)?;
    match tag {
      PropValueTag::Null => Some(PropValue::Null),
      PropValueTag::Bool => Some(PropValue::Bool(self.u8()? != 0)),
      PropValueTag::I64 => Some(PropValue::I64(self.u64()? as i64)),
      PropValueTag::F64 => Some(PropValue::F64(f64::from_bits(self.u64()?))),
      PropValueTag::String => Some(PropValue::String(self.string()?)),
      PropValueTag::VectorF32 => {
        let count = self.u32()? as usize;
        let bytes = self.take(count * 4)?;
        let mut vec = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(4) {
          vec.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Some(PropValue::VectorF32(vec))
      }
    }
  }
}

// ============================================================================
// Payload builders
// ============================================================================

pub fn build_control_payload() -> Vec<u8> {
  Vec::new()
}

pub fn build_define_payload(id: u32, name: &str) -> Vec<u8> {
  let mut buf = Vec::with_capacity(8 + name.len());
  push_u32(&mut buf, id);
  push_u32(&mut buf, name.len() as u32);
  buf.extend_from_slice(name.as_bytes());
  buf
}

pub fn build_create_node_payload(node_id: NodeId, key: Option<&str>) -> Vec<u8> {
  let mut buf = Vec::with_capacity(13 + key.map_or(0, |k| k.len()));
  push_u64(&mut buf, node_id);
  match key {
    Some(key) => {
      buf.push(1);
      push_u32(&mut buf, key.len() as u32);
      buf.extend_from_slice(key.as_bytes());
    }
    None => buf.push(0),
  }
  buf
}

pub fn build_delete_node_payload(node_id: NodeId) -> Vec<u8> {
  let mut buf = Vec::with_capacity(8);
  push_u64(&mut buf, node_id);
  buf
}

pub fn build_edge_payload(src: NodeId, etype: ETypeId, dst: NodeId) -> Vec<u8> {
  let mut buf = Vec::with_capacity(20);
  push_u64(&mut buf, src);
  push_u64(&mut buf, dst);
  push_u32(&mut buf, etype);
  buf
}

pub fn build_node_prop_payload(node_id: NodeId, key_id: PropKeyId, value: &PropValue) -> Vec<u8> {
  let mut buf = Vec::with_capacity(16);
  push_u64(&mut buf, node_id);
  push_u32(&mut buf, key_id);
  push_prop_value(&mut buf, value);
  buf
}

pub fn build_del_node_prop_payload(node_id: NodeId, key_id: PropKeyId) -> Vec<u8> {
  let mut buf = Vec::with_capacity(12);
  push_u64(&mut buf, node_id);
  push_u32(&mut buf, key_id);
  buf
}

pub fn build_edge_prop_payload(
  src: NodeId,
  etype: ETypeId,
  dst: NodeId,
  key_id: PropKeyId,
  value: &PropValue,
) -> Vec<u8> {
  let mut buf = Vec::with_capacity(28);
  push_u64(&mut buf, src);
  push_u64(&mut buf, dst);
  push_u32(&mut buf, etype);
  push_u32(&mut buf, key_id);
  push_prop_value(&mut buf, value);
  buf
}

pub fn build_del_edge_prop_payload(
  src: NodeId,
  etype: ETypeId,
  dst: NodeId,
  key_id: PropKeyId,
) -> Vec<u8> {
  let mut buf = Vec::with_capacity(24);
  push_u64(&mut buf, src);
  push_u64(&mut buf, dst);
  push_u32(&mut buf, etype);
  push_u32(&mut buf, key_id);
  buf
}

pub fn build_node_vector_payload(node_id: NodeId, key_id: PropKeyId, vector: &[f32]) -> Vec<u8> {
  let mut buf = Vec::with_capacity(16 + vector.len() * 4);
  push_u64(&mut buf, node_id);
  push_u32(&mut buf, key_id);
  push_u32(&mut buf, vector.len() as u32);
  for x in vector {
    buf.extend_from_slice(&x.to_le_bytes());
  }
  buf
}

pub fn build_del_node_vector_payload(node_id: NodeId, key_id: PropKeyId) -> Vec<u8> {
  let mut buf = Vec::with_capacity(12);
  push_u64(&mut buf, node_id);
  push_u32(&mut buf, key_id);
  buf
}

pub fn build_node_label_payload(node_id: NodeId, label_id: LabelId) -> Vec<u8> {
  let mut buf = Vec::with_capacity(12);
  push_u64(&mut buf, node_id);
  push_u32(&mut buf, label_id);
  buf
}

// ============================================================================
// Decoded payloads
// ============================================================================

/// Typed view of a record payload, used by recovery replay.
#[derive(Debug, Clone, PartialEq)]
pub enum WalPayload {
  Control,
  Define {
    id: u32,
    name: String,
  },
  CreateNode {
    node_id: NodeId,
    key: Option<String>,
  },
  DeleteNode {
    node_id: NodeId,
  },
  Edge {
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
  },
  NodeProp {
    node_id: NodeId,
    key_id: PropKeyId,
    value: PropValue,
  },
  DelNodeProp {
    node_id: NodeId,
    key_id: PropKeyId,
  },
  EdgeProp {
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
    value: PropValue,
  },
  DelEdgeProp {
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
  },
  NodeVector {
    node_id: NodeId,
    key_id: PropKeyId,
    vector: Vec<f32>,
  },
  DelNodeVector {
    node_id: NodeId,
    key_id: PropKeyId,
  },
  NodeLabel {
    node_id: NodeId,
    label_id: LabelId,
  },
}

impl WalRecord {
  /// Decode the payload according to the record type.
  pub fn decode(&self) -> Option<WalPayload> {
    let mut r = PayloadReader::new(&self.payload);
    match self.record_type {
      WalRecordType::Begin | WalRecordType::Commit | WalRecordType::Rollback => {
        Some(WalPayload::Control)
      }
      WalRecordType::DefineLabel | WalRecordType::DefineEtype | WalRecordType::DefinePropkey => {
        let id = r.u32()?;
        let name = r.string()?;
        Some(WalPayload::Define { id, name })
      }
      WalRecordType::CreateNode => {
        let node_id = r.u64()?;
        let has_key = r.u8()? != 0;
        let key = if has_key { Some(r.string()?) } else { None };
        Some(WalPayload::CreateNode { node_id, key })
      }
      WalRecordType::DeleteNode => Some(WalPayload::DeleteNode { node_id: r.u64()? }),
      WalRecordType::AddEdge | WalRecordType::DeleteEdge => {
        let src = r.u64()?;
        let dst = r.u64()?;
        let etype = r.u32()?;
        Some(WalPayload::Edge { src, etype, dst })
      }
      WalRecordType::SetNodeProp => {
        let node_id = r.u64()?;
        let key_id = r.u32()?;
        let value = r.prop_value()?;
        Some(WalPayload::NodeProp {
          node_id,
          key_id,
          value,
        })
      }
      WalRecordType::DelNodeProp => {
        let node_id = r.u64()?;
        let key_id = r.u32()?;
        Some(WalPayload::DelNodeProp { node_id, key_id })
      }
      WalRecordType::SetEdgeProp => {
        let src = r.u64()?;
        let dst = r.u64()?;
        let etype = r.u32()?;
        let key_id = r.u32()?;
        let value = r.prop_value()?;
        Some(WalPayload::EdgeProp {
          src,
          etype,
          dst,
          key_id,
          value,
        })
      }
      WalRecordType::DelEdgeProp => {
        let src = r.u64()?;
        let dst = r.u64()?;
        let etype = r.u32()?;
        let key_id = r.u32()?;
        Some(WalPayload::DelEdgeProp {
          src,
          etype,
          dst,
          key_id,
        })
      }
      WalRecordType::SetNodeVector => {
        let node_id = r.u64()?;
        let key_id = r.u32()?;
        let count = r.u32()? as usize;
        let bytes = r.take(count * 4)?;
        let mut vector = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(4) {
          vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Some(WalPayload::NodeVector {
          node_id,
          key_id,
          vector,
        })
      }
      WalRecordType::DelNodeVector => {
        let node_id = r.u64()?;
        let key_id = r.u32()?;
        Some(WalPayload::DelNodeVector { node_id, key_id })
      }
      WalRecordType::AddNodeLabel | WalRecordType::RemoveNodeLabel => {
        let node_id = r.u64()?;
        let label_id = r.u32()?;
        Some(WalPayload::NodeLabel { node_id, label_id })
      }
    }
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_frame_round_trip() {
    let record = WalRecord::new(
      WalRecordType::CreateNode,
      42,
      build_create_node_payload(7, Some("user:alice")),
    );
    let frame = record.build();
    assert_eq!(frame.len() % WAL_RECORD_ALIGNMENT, 0);
    assert_eq!(frame.len(), record.framed_size());

    match decode_frame(&frame, 0) {
      FrameParse::Ok {
        record: decoded,
        next_offset,
      } => {
        assert_eq!(decoded, record);
        assert_eq!(next_offset, frame.len());
      }
      other => panic!("expected Ok, got {other:?}"),
    }
  }

  #[test]
  fn test_decode_create_node_payload() {
    let record = WalRecord::new(
      WalRecordType::CreateNode,
      1,
      build_create_node_payload(9, None),
    );
    assert_eq!(
      record.decode(),
      Some(WalPayload::CreateNode {
        node_id: 9,
        key: None
      })
    );
  }

  #[test]
  fn test_decode_prop_values() {
    for value in [
      PropValue::Bool(true),
      PropValue::I64(-5),
      PropValue::F64(2.5),
      PropValue::String("hello".to_string()),
      PropValue::VectorF32(vec![0.5, -0.5]),
    ] {
      let record = WalRecord::new(
        WalRecordType::SetNodeProp,
        1,
        build_node_prop_payload(3, 2, &value),
      );
      match record.decode() {
        Some(WalPayload::NodeProp {
          node_id,
          key_id,
          value: decoded,
        }) => {
          assert_eq!(node_id, 3);
          assert_eq!(key_id, 2);
          assert_eq!(decoded, value);
        }
        other => panic!("unexpected decode: {other:?}"),
      }
    }
  }

  #[test]
  fn test_corrupt_frame_detected() {
    let record = WalRecord::new(WalRecordType::Commit, 3, build_control_payload());
    let mut frame = record.build();
    frame[9] ^= 0x40; // inside the txid field
    assert!(matches!(decode_frame(&frame, 0), FrameParse::Corrupt { .. }));
  }

  #[test]
  fn test_zero_length_is_end() {
    let buf = vec![0u8; 64];
    assert!(matches!(decode_frame(&buf, 0), FrameParse::End));
  }

  #[test]
  fn test_truncated_frame_is_corrupt() {
    let record = WalRecord::new(
      WalRecordType::CreateNode,
      1,
      build_create_node_payload(1, Some("k")),
    );
    let frame = record.build();
    assert!(matches!(
      decode_frame(&frame[..frame.len() - 8], 0),
      FrameParse::Corrupt { .. }
    ));
  }
}
