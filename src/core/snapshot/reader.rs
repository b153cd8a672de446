//! CSR snapshot reader: zero-copy parsing over memory-mapped bytes.
//!
//! The reader borrows slices straight from the mapping; a `SnapshotData`
//! keeps its `Arc<Mmap>` alive, so views created before a checkpoint swap
//! stay valid until they are dropped.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::constants::*;
use crate::core::snapshot::sections::{parse_section_table, SectionEntry, SectionId};
use crate::core::snapshot::{SnapshotFlags, SnapshotHeader};
use crate::error::{HeronError, Result};
use crate::types::*;
use crate::util::binary::*;
use crate::util::crc::crc32c;
use crate::util::hash::xxhash64_str;
use crate::util::mmap::Mmap;

// ============================================================================
// Parse options
// ============================================================================

/// Options for parsing a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ParseSnapshotOptions {
  /// Skip CRC validation. Only safe for a snapshot this process just wrote
  /// and synced.
  pub skip_crc_validation: bool,
}

// ============================================================================
// SnapshotData
// ============================================================================

/// Parsed snapshot with section views into the mapped file.
#[derive(Debug)]
pub struct SnapshotData {
  mmap: Arc<Mmap>,
  /// Byte offset of the snapshot within the mapping.
  base: usize,
  pub header: SnapshotHeader,
  sections: Vec<SectionEntry>,
  /// Lazily decoded string table entries (indexed by StringId).
  string_cache: Vec<OnceLock<Arc<str>>>,
}

impl SnapshotData {
  /// Parse a snapshot that starts at `offset` within the mapping.
  pub fn parse_at_offset(
    mmap: Arc<Mmap>,
    offset: usize,
    options: &ParseSnapshotOptions,
  ) -> Result<Self> {
    let buffer = mmap
      .get(offset..)
      .ok_or_else(|| HeronError::InvalidSnapshot("snapshot offset beyond file".to_string()))?;

    if buffer.len() < SNAPSHOT_HEADER_SIZE {
      return Err(HeronError::InvalidSnapshot(format!(
        "snapshot too small: {} bytes",
        buffer.len()
      )));
    }

    let magic = read_u32(buffer, 0);
    if magic != MAGIC_SNAPSHOT {
      return Err(HeronError::InvalidMagic {
        expected: MAGIC_SNAPSHOT,
        got: magic,
      });
    }

    let version = read_u32(buffer, 4);
    let min_reader_version = read_u32(buffer, 8);
    if VERSION_SNAPSHOT < min_reader_version {
      return Err(HeronError::VersionMismatch {
        required: min_reader_version,
        supported: VERSION_SNAPSHOT,
      });
    }

    let header = SnapshotHeader {
      magic,
      version,
      min_reader_version,
      flags: SnapshotFlags::from_bits_truncate(read_u32(buffer, 12)),
      generation: read_u64(buffer, 16),
      num_nodes: read_u64(buffer, 24),
      num_edges: read_u64(buffer, 32),
      max_node_id: read_u64(buffer, 40),
      num_labels: read_u64(buffer, 48),
      num_etypes: read_u64(buffer, 56),
      num_propkeys: read_u64(buffer, 64),
      num_strings: read_u64(buffer, 72),
    };

    let parsed = parse_section_table(buffer)?;
    let sections = parsed.sections;
    let aligned_end = align_up(parsed.max_section_end, SECTION_ALIGNMENT);
    let total_size = aligned_end + 4; // footer CRC

    if total_size > buffer.len() {
      return Err(HeronError::InvalidSnapshot(format!(
        "snapshot truncated: expected {total_size} bytes, found {}",
        buffer.len()
      )));
    }

    if !options.skip_crc_validation {
      let footer_crc = read_u32(buffer, total_size - 4);
      let computed = crc32c(&buffer[..total_size - 4]);
      if footer_crc != computed {
        return Err(HeronError::CrcMismatch {
          stored: footer_crc,
          computed,
        });
      }

      for (i, section) in sections.iter().enumerate() {
        if section.length == 0 {
          continue;
        }
        let start = section.offset as usize;
        let end = start + section.length as usize;
        let computed = crc32c(&buffer[start..end]);
        if computed != section.crc {
          return Err(HeronError::InvalidSnapshot(format!(
            "section {i} CRC mismatch: stored {:#010x}, computed {computed:#010x}",
            section.crc
          )));
        }
      }
    }

    let string_cache = Self::init_string_cache(header.num_strings)?;

    Ok(Self {
      mmap,
      base: offset,
      header,
      sections,
      string_cache,
    })
  }

  /// Parse a standalone snapshot buffer (offset 0).
  pub fn parse(mmap: Arc<Mmap>, options: &ParseSnapshotOptions) -> Result<Self> {
    Self::parse_at_offset(mmap, 0, options)
  }

  fn init_string_cache(num_strings: u64) -> Result<Vec<OnceLock<Arc<str>>>> {
    let len = usize::try_from(num_strings)
      .ok()
      .and_then(|n| n.checked_add(1))
      .ok_or_else(|| HeronError::InvalidSnapshot("string table too large".to_string()))?;
    Ok(std::iter::repeat_with(OnceLock::new).take(len).collect())
  }

  /// Raw bytes of a section, or None when empty.
  pub fn section_slice(&self, id: SectionId) -> Option<&[u8]> {
    let section = self.sections.get(id as usize)?;
    if section.length == 0 {
      return None;
    }
    let start = self.base + section.offset as usize;
    let end = start + section.length as usize;
    Some(&self.mmap[start..end])
  }

  // ==========================================================================
  // Node accessors
  // ==========================================================================

  /// NodeID at a physical position.
  #[inline]
  pub fn node_id(&self, phys: PhysNode) -> Option<NodeId> {
    let section = self.section_slice(SectionId::PhysToNodeId)?;
    let idx = phys as usize;
    if idx * 8 + 8 > section.len() {
      return None;
    }
    Some(read_u64_at(section, idx))
  }

  /// Physical position of a NodeID, or None if absent.
  #[inline]
  pub fn phys_node(&self, node_id: NodeId) -> Option<PhysNode> {
    let section = self.section_slice(SectionId::NodeIdToPhys)?;
    let idx = node_id as usize;
    if idx * 4 + 4 > section.len() {
      return None;
    }
    let phys = read_i32_at(section, idx);
    if phys < 0 {
      None
    } else {
      Some(phys as PhysNode)
    }
  }

  #[inline]
  pub fn has_node(&self, node_id: NodeId) -> bool {
    self.phys_node(node_id).is_some()
  }

  #[inline]
  pub fn num_nodes(&self) -> u64 {
    self.header.num_nodes
  }

  #[inline]
  pub fn num_edges(&self) -> u64 {
    self.header.num_edges
  }

  #[inline]
  pub fn max_node_id(&self) -> u64 {
    self.header.max_node_id
  }

  // ==========================================================================
  // String table
  // ==========================================================================

  /// String by StringID. ID 0 is the reserved empty string.
  pub fn string(&self, string_id: StringId) -> Option<String> {
    if string_id == 0 {
      return Some(String::new());
    }

    let offsets = self.section_slice(SectionId::StringOffsets)?;
    let bytes = self.section_slice(SectionId::StringBytes)?;

    let idx = string_id as usize;
    if idx * 4 + 8 > offsets.len() {
      return None;
    }

    let start = read_u32_at(offsets, idx) as usize;
    let end = read_u32_at(offsets, idx + 1) as usize;
    if start > end || end > bytes.len() {
      return None;
    }

    String::from_utf8(bytes[start..end].to_vec()).ok()
  }

  fn string_cached(&self, string_id: StringId) -> Option<&str> {
    if string_id == 0 {
      return Some("");
    }
    let cell = self.string_cache.get(string_id as usize)?;
    if let Some(value) = cell.get() {
      return Some(value.as_ref());
    }
    let value = self.string(string_id)?;
    let _ = cell.set(Arc::from(value));
    cell.get().map(|v| v.as_ref())
  }

  // ==========================================================================
  // Edges
  // ==========================================================================

  fn edge_range(&self, offsets_id: SectionId, phys: PhysNode) -> Option<(usize, usize)> {
    let offsets = self.section_slice(offsets_id)?;
    let idx = phys as usize;
    if idx * 4 + 8 > offsets.len() {
      return None;
    }
    let start = read_u32_at(offsets, idx) as usize;
    let end = read_u32_at(offsets, idx + 1) as usize;
    Some((start, end))
  }

  fn out_edge_range(&self, phys: PhysNode) -> Option<(usize, usize)> {
    self.edge_range(SectionId::OutOffsets, phys)
  }

  fn in_edge_range(&self, phys: PhysNode) -> Option<(usize, usize)> {
    if !self.header.flags.contains(SnapshotFlags::HAS_IN_EDGES) {
      return None;
    }
    self.edge_range(SectionId::InOffsets, phys)
  }

  pub fn out_degree(&self, phys: PhysNode) -> usize {
    self
      .out_edge_range(phys)
      .map_or(0, |(start, end)| end - start)
  }

  pub fn in_degree(&self, phys: PhysNode) -> usize {
    self
      .in_edge_range(phys)
      .map_or(0, |(start, end)| end - start)
  }

  /// Binary search the sorted `(etype, dst)` edge run of one node.
  fn edge_lower_bound(
    etypes: &[u8],
    dsts: &[u8],
    start: usize,
    end: usize,
    etype: ETypeId,
    dst_phys: PhysNode,
  ) -> usize {
    let mut lo = start;
    let mut hi = end;
    while lo < hi {
      let mid = (lo + hi) / 2;
      let mid_etype = read_u32_at(etypes, mid);
      let mid_dst = read_u32_at(dsts, mid);
      if mid_etype < etype || (mid_etype == etype && mid_dst < dst_phys) {
        lo = mid + 1;
      } else {
        hi = mid;
      }
    }
    lo
  }

  /// Does the edge exist in the snapshot?
  pub fn has_edge(&self, src_phys: PhysNode, etype: ETypeId, dst_phys: PhysNode) -> bool {
    self.find_edge_index(src_phys, etype, dst_phys).is_some()
  }

  /// Edge index for a specific edge (position in the out-edge arrays).
  pub fn find_edge_index(
    &self,
    src_phys: PhysNode,
    etype: ETypeId,
    dst_phys: PhysNode,
  ) -> Option<usize> {
    let (start, end) = self.out_edge_range(src_phys)?;
    let etypes = self.section_slice(SectionId::OutEtype)?;
    let dsts = self.section_slice(SectionId::OutDst)?;

    let lo = Self::edge_lower_bound(etypes, dsts, start, end, etype, dst_phys);
    if lo < end && read_u32_at(etypes, lo) == etype && read_u32_at(dsts, lo) == dst_phys {
      Some(lo)
    } else {
      None
    }
  }

  /// Iterate `(dst_phys, etype)` out-edges of a node.
  pub fn iter_out_edges(&self, phys: PhysNode) -> EdgeIter<'_> {
    let (current, end) = self.out_edge_range(phys).unwrap_or((0, 0));
    EdgeIter {
      others: self.section_slice(SectionId::OutDst),
      etypes: self.section_slice(SectionId::OutEtype),
      current,
      end,
    }
  }

  /// Iterate `(src_phys, etype)` in-edges of a node.
  pub fn iter_in_edges(&self, phys: PhysNode) -> EdgeIter<'_> {
    let (current, end) = self.in_edge_range(phys).unwrap_or((0, 0));
    EdgeIter {
      others: self.section_slice(SectionId::InSrc),
      etypes: self.section_slice(SectionId::InEtype),
      current,
      end,
    }
  }

  // ==========================================================================
  // Key index
  // ==========================================================================

  /// Look up a node by key.
  pub fn lookup_by_key(&self, key: &str) -> Option<NodeId> {
    let hash64 = xxhash64_str(key);

    let entries = self.section_slice(SectionId::KeyEntries)?;
    let num_entries = entries.len() / KEY_INDEX_ENTRY_SIZE;
    if num_entries == 0 {
      return None;
    }

    let buckets = self.section_slice(SectionId::KeyBuckets)?;
    if buckets.len() < 8 {
      return None;
    }
    let num_buckets = buckets.len() / 4 - 1;
    let bucket = (hash64 % num_buckets as u64) as usize;
    let lo = read_u32_at(buckets, bucket) as usize;
    let hi = read_u32_at(buckets, bucket + 1) as usize;

    // Walk collision run; confirm with a real string comparison.
    for i in lo..hi.min(num_entries) {
      let offset = i * KEY_INDEX_ENTRY_SIZE;
      if read_u64(entries, offset) != hash64 {
        continue;
      }
      let string_id = read_u32(entries, offset + 8);
      let node_id = read_u64(entries, offset + 16);
      if let Some(entry_key) = self.string(string_id) {
        if entry_key == key {
          return Some(node_id);
        }
      }
    }

    None
  }

  /// Key of a node, if any.
  pub fn node_key(&self, phys: PhysNode) -> Option<String> {
    let keys = self.section_slice(SectionId::NodeKeyStrings)?;
    let idx = phys as usize;
    if idx * 4 + 4 > keys.len() {
      return None;
    }
    let string_id = read_u32_at(keys, idx);
    if string_id == 0 {
      return None;
    }
    self.string(string_id)
  }

  // ==========================================================================
  // Labels
  // ==========================================================================

  /// All labels of a node.
  pub fn node_labels(&self, phys: PhysNode) -> Option<Vec<LabelId>> {
    if !self.header.flags.contains(SnapshotFlags::HAS_NODE_LABELS) {
      return None;
    }
    let offsets = self.section_slice(SectionId::NodeLabelOffsets)?;
    let labels = self.section_slice(SectionId::NodeLabelIds)?;

    let idx = phys as usize;
    if idx * 4 + 8 > offsets.len() {
      return None;
    }
    let start = read_u32_at(offsets, idx) as usize;
    let end = read_u32_at(offsets, idx + 1) as usize;

    let mut out = Vec::with_capacity(end.saturating_sub(start));
    for i in start..end {
      if i * 4 + 4 > labels.len() {
        break;
      }
      out.push(read_u32_at(labels, i));
    }
    Some(out)
  }

  pub fn label_name(&self, label_id: LabelId) -> Option<&str> {
    self.name_from_table(SectionId::LabelStringIds, label_id)
  }

  pub fn etype_name(&self, etype_id: ETypeId) -> Option<&str> {
    self.name_from_table(SectionId::EtypeStringIds, etype_id)
  }

  pub fn propkey_name(&self, propkey_id: PropKeyId) -> Option<&str> {
    self.name_from_table(SectionId::PropkeyStringIds, propkey_id)
  }

  fn name_from_table(&self, table: SectionId, id: u32) -> Option<&str> {
    let string_ids = self.section_slice(table)?;
    let idx = id as usize;
    if idx * 4 + 4 > string_ids.len() {
      return None;
    }
    let string_id = read_u32_at(string_ids, idx);
    if string_id == 0 {
      return None;
    }
    self.string_cached(string_id)
  }

  // ==========================================================================
  // Properties
  // ==========================================================================

  /// All properties of a node.
  pub fn node_props(&self, phys: PhysNode) -> Option<HashMap<PropKeyId, PropValue>> {
    self.props_at(
      SectionId::NodePropOffsets,
      SectionId::NodePropKeys,
      SectionId::NodePropVals,
      phys as usize,
    )
  }

  /// One property of a node; binary search over the sorted key run.
  pub fn node_prop(&self, phys: PhysNode, prop_key_id: PropKeyId) -> Option<PropValue> {
    self.prop_at(
      SectionId::NodePropOffsets,
      SectionId::NodePropKeys,
      SectionId::NodePropVals,
      phys as usize,
      prop_key_id,
    )
  }

  /// All properties of an edge, by out-edge index.
  pub fn edge_props(&self, edge_idx: usize) -> Option<HashMap<PropKeyId, PropValue>> {
    self.props_at(
      SectionId::EdgePropOffsets,
      SectionId::EdgePropKeys,
      SectionId::EdgePropVals,
      edge_idx,
    )
  }

  /// One property of an edge, by out-edge index.
  pub fn edge_prop(&self, edge_idx: usize, prop_key_id: PropKeyId) -> Option<PropValue> {
    self.prop_at(
      SectionId::EdgePropOffsets,
      SectionId::EdgePropKeys,
      SectionId::EdgePropVals,
      edge_idx,
      prop_key_id,
    )
  }

  fn props_at(
    &self,
    offsets_id: SectionId,
    keys_id: SectionId,
    vals_id: SectionId,
    idx: usize,
  ) -> Option<HashMap<PropKeyId, PropValue>> {
    if !self.header.flags.contains(SnapshotFlags::HAS_PROPERTIES) {
      return None;
    }
    let offsets = self.section_slice(offsets_id)?;
    let keys = self.section_slice(keys_id)?;
    let vals = self.section_slice(vals_id)?;

    if idx * 4 + 8 > offsets.len() {
      return None;
    }
    let start = read_u32_at(offsets, idx) as usize;
    let end = read_u32_at(offsets, idx + 1) as usize;

    let mut props = HashMap::new();
    for i in start..end {
      if i * 4 + 4 > keys.len() {
        break;
      }
      let key_id = read_u32_at(keys, i);
      if let Some(value) = self.decode_prop_value(vals, i * PROP_VALUE_DISK_SIZE) {
        props.insert(key_id, value);
      }
    }
    Some(props)
  }

  fn prop_at(
    &self,
    offsets_id: SectionId,
    keys_id: SectionId,
    vals_id: SectionId,
    idx: usize,
    prop_key_id: PropKeyId,
  ) -> Option<PropValue> {
    if !self.header.flags.contains(SnapshotFlags::HAS_PROPERTIES) {
      return None;
    }
    let offsets = self.section_slice(offsets_id)?;
    let keys = self.section_slice(keys_id)?;
    let vals = self.section_slice(vals_id)?;

    if idx * 4 + 8 > offsets.len() {
      return None;
    }
    let start = read_u32_at(offsets, idx) as usize;
    let end = read_u32_at(offsets, idx + 1) as usize;

    // Keys are written sorted per node/edge; binary search the run.
    let mut lo = start;
    let mut hi = end;
    while lo < hi {
      let mid = (lo + hi) / 2;
      if read_u32_at(keys, mid) < prop_key_id {
        lo = mid + 1;
      } else {
        hi = mid;
      }
    }
    if lo < end && read_u32_at(keys, lo) == prop_key_id {
      return self.decode_prop_value(vals, lo * PROP_VALUE_DISK_SIZE);
    }
    None
  }

  fn decode_prop_value(&self, vals: &[u8], offset: usize) -> Option<PropValue> {
    if offset + PROP_VALUE_DISK_SIZE > vals.len() {
      return None;
    }

    let tag = vals[offset];
    let payload = read_u64(vals, offset + 8);

    match PropValueTag::from_u8(tag)? {
      PropValueTag::Null => Some(PropValue::Null),
      PropValueTag::Bool => Some(PropValue::Bool(payload != 0)),
      PropValueTag::I64 => Some(PropValue::I64(payload as i64)),
      PropValueTag::F64 => Some(PropValue::F64(f64::from_bits(payload))),
      PropValueTag::String => Some(PropValue::String(self.string(payload as u32)?)),
      PropValueTag::VectorF32 => {
        if !self.header.flags.contains(SnapshotFlags::HAS_VECTORS) {
          return None;
        }
        let offsets = self.section_slice(SectionId::VectorOffsets)?;
        let data = self.section_slice(SectionId::VectorData)?;

        let idx = payload as usize;
        if (idx + 2) * 8 > offsets.len() {
          return None;
        }
        let start = read_u64_at(offsets, idx) as usize;
        let end = read_u64_at(offsets, idx + 1) as usize;
        if start > end || end > data.len() || (end - start) % 4 != 0 {
          return None;
        }
        Some(PropValue::VectorF32(decode_f32_slice(&data[start..end])))
      }
    }
  }

  // ==========================================================================
  // Vector store sections
  // ==========================================================================

  /// Serialized vector store manifests keyed by PropKeyId, as raw slices.
  pub fn vector_store_blobs(&self) -> Vec<(PropKeyId, &[u8])> {
    let Some(index) = self.section_slice(SectionId::VectorStoreIndex) else {
      return Vec::new();
    };
    let Some(blobs) = self.section_slice(SectionId::VectorStoreData) else {
      return Vec::new();
    };
    if index.len() < 4 {
      return Vec::new();
    }

    let count = read_u32(index, 0) as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
      let entry = 4 + i * 20;
      if entry + 20 > index.len() {
        break;
      }
      let prop_key_id = read_u32(index, entry);
      let offset = read_u64(index, entry + 4) as usize;
      let length = read_u64(index, entry + 12) as usize;
      if offset + length > blobs.len() {
        break;
      }
      out.push((prop_key_id, &blobs[offset..offset + length]));
    }
    out
  }
}

// ============================================================================
// Edge iterator
// ============================================================================

/// Iterator over one node's adjacency: yields `(other_phys, etype)`.
pub struct EdgeIter<'a> {
  others: Option<&'a [u8]>,
  etypes: Option<&'a [u8]>,
  current: usize,
  end: usize,
}

impl<'a> Iterator for EdgeIter<'a> {
  type Item = (PhysNode, ETypeId);

  fn next(&mut self) -> Option<Self::Item> {
    if self.current >= self.end {
      return None;
    }
    let others = self.others?;
    let etypes = self.etypes?;
    if self.current * 4 + 4 > others.len() || self.current * 4 + 4 > etypes.len() {
      return None;
    }
    let other = read_u32_at(others, self.current);
    let etype = read_u32_at(etypes, self.current);
    self.current += 1;
    Some((other, etype))
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    let remaining = self.end.saturating_sub(self.current);
    (remaining, Some(remaining))
  }
}

impl<'a> ExactSizeIterator for EdgeIter<'a> {}
