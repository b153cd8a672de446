//! Core types: identifiers, property values, the database header, and the
//! in-memory delta overlay.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use serde::Serialize;

use crate::constants::*;
use crate::error::{HeronError, Result};
use crate::util::binary::{read_u32, read_u64, write_u32, write_u64};
use crate::util::crc::crc32c;

// ============================================================================
// Identifiers
// ============================================================================

/// 64-bit monotonic node identifier. Never reused.
pub type NodeId = u64;

/// Dense label identifier, assigned in registration order.
pub type LabelId = u32;

/// Dense edge-type identifier, assigned in registration order.
pub type ETypeId = u32;

/// Dense property-key identifier, assigned in registration order.
pub type PropKeyId = u32;

/// Monotonic transaction identifier.
pub type TxId = u64;

/// Physical node index within a snapshot (dense position).
pub type PhysNode = u32;

/// Index into a snapshot string table (0 = none/empty).
pub type StringId = u32;

/// Shared vector payload.
pub type VectorRef = Arc<Vec<f32>>;

// ============================================================================
// Property values
// ============================================================================

/// On-disk tag for a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum PropValueTag {
  Null = 0,
  Bool = 1,
  I64 = 2,
  F64 = 3,
  String = 4,
  VectorF32 = 5,
}

impl PropValueTag {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      0 => Some(PropValueTag::Null),
      1 => Some(PropValueTag::Bool),
      2 => Some(PropValueTag::I64),
      3 => Some(PropValueTag::F64),
      4 => Some(PropValueTag::String),
      5 => Some(PropValueTag::VectorF32),
      _ => None,
    }
  }
}

/// Tagged property value.
///
/// `Null` only appears when decoding damaged or legacy data; the write path
/// never stores it.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
  Null,
  Bool(bool),
  I64(i64),
  F64(f64),
  String(String),
  VectorF32(Vec<f32>),
}

impl PropValue {
  pub fn tag(&self) -> PropValueTag {
    match self {
      PropValue::Null => PropValueTag::Null,
      PropValue::Bool(_) => PropValueTag::Bool,
      PropValue::I64(_) => PropValueTag::I64,
      PropValue::F64(_) => PropValueTag::F64,
      PropValue::String(_) => PropValueTag::String,
      PropValue::VectorF32(_) => PropValueTag::VectorF32,
    }
  }
}

// ============================================================================
// Database header (page 0)
// ============================================================================

/// Fixed-offset byte layout of the 4KB header page.
///
/// The header is the single atomic switch point: a checkpoint becomes
/// visible exactly when the header referencing the new snapshot is fsynced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
  pub format_version: u32,
  pub page_size: u32,
  pub db_size_pages: u64,
  pub active_snapshot_gen: u64,
  pub snapshot_start_page: u64,
  pub snapshot_page_count: u64,
  pub wal_start_page: u64,
  pub wal_page_count: u64,
  pub wal_primary_head: u64,
  pub wal_secondary_head: u64,
  pub active_wal_region: u8,
  pub checkpoint_in_progress: u8,
  pub max_node_id: NodeId,
  pub next_tx_id: TxId,
  pub change_counter: u64,
}

const HEADER_CRC_OFFSET: usize = 120;

impl DbHeader {
  /// Create a fresh header for a new database file.
  pub fn new(page_size: u32, wal_page_count: u64) -> Self {
    Self {
      format_version: VERSION_SINGLE_FILE,
      page_size,
      db_size_pages: 1 + wal_page_count,
      active_snapshot_gen: INITIAL_SNAPSHOT_GEN,
      snapshot_start_page: 0,
      snapshot_page_count: 0,
      wal_start_page: 1,
      wal_page_count,
      wal_primary_head: 0,
      wal_secondary_head: 0,
      active_wal_region: 0,
      checkpoint_in_progress: 0,
      max_node_id: 0,
      next_tx_id: INITIAL_TX_ID,
      change_counter: 0,
    }
  }

  /// Parse and validate a header page.
  pub fn parse(buf: &[u8]) -> Result<Self> {
    if buf.len() < DB_HEADER_SIZE {
      return Err(HeronError::InvalidHeader(format!(
        "header page too small: {} bytes",
        buf.len()
      )));
    }

    if buf[0..16] != MAGIC_HERONDB {
      return Err(HeronError::InvalidFileMagic);
    }

    let stored_crc = read_u32(buf, HEADER_CRC_OFFSET);
    let computed_crc = crc32c(&buf[..HEADER_CRC_OFFSET]);
    if stored_crc != computed_crc {
      return Err(HeronError::CrcMismatch {
        stored: stored_crc,
        computed: computed_crc,
      });
    }

    let format_version = read_u32(buf, 16);
    if format_version > VERSION_SINGLE_FILE || format_version < MIN_READER_SINGLE_FILE {
      return Err(HeronError::VersionMismatch {
        required: format_version,
        supported: VERSION_SINGLE_FILE,
      });
    }

    let header = Self {
      format_version,
      page_size: read_u32(buf, 20),
      db_size_pages: read_u64(buf, 24),
      active_snapshot_gen: read_u64(buf, 32),
      snapshot_start_page: read_u64(buf, 40),
      snapshot_page_count: read_u64(buf, 48),
      wal_start_page: read_u64(buf, 56),
      wal_page_count: read_u64(buf, 64),
      wal_primary_head: read_u64(buf, 72),
      wal_secondary_head: read_u64(buf, 80),
      active_wal_region: buf[88],
      checkpoint_in_progress: buf[89],
      max_node_id: read_u64(buf, 96),
      next_tx_id: read_u64(buf, 104),
      change_counter: read_u64(buf, 112),
    };

    if header.active_wal_region > 1 {
      return Err(HeronError::InvalidHeader(format!(
        "invalid active WAL region: {}",
        header.active_wal_region
      )));
    }
    if header.wal_start_page != 1 {
      return Err(HeronError::InvalidHeader(format!(
        "invalid WAL start page: {}",
        header.wal_start_page
      )));
    }

    Ok(header)
  }

  /// Serialize to a full header page, including the trailing CRC.
  pub fn serialize_to_page(&self) -> Vec<u8> {
    let mut buf = vec![0u8; DB_HEADER_SIZE];
    buf[0..16].copy_from_slice(&MAGIC_HERONDB);
    write_u32(&mut buf, 16, self.format_version);
    write_u32(&mut buf, 20, self.page_size);
    write_u64(&mut buf, 24, self.db_size_pages);
    write_u64(&mut buf, 32, self.active_snapshot_gen);
    write_u64(&mut buf, 40, self.snapshot_start_page);
    write_u64(&mut buf, 48, self.snapshot_page_count);
    write_u64(&mut buf, 56, self.wal_start_page);
    write_u64(&mut buf, 64, self.wal_page_count);
    write_u64(&mut buf, 72, self.wal_primary_head);
    write_u64(&mut buf, 80, self.wal_secondary_head);
    buf[88] = self.active_wal_region;
    buf[89] = self.checkpoint_in_progress;
    write_u64(&mut buf, 96, self.max_node_id);
    write_u64(&mut buf, 104, self.next_tx_id);
    write_u64(&mut buf, 112, self.change_counter);

    let crc = crc32c(&buf[..HEADER_CRC_OFFSET]);
    write_u32(&mut buf, HEADER_CRC_OFFSET, crc);
    buf
  }

  /// First page after the WAL area (where the snapshot lives).
  pub fn wal_end_page(&self) -> u64 {
    self.wal_start_page + self.wal_page_count
  }
}

// ============================================================================
// Delta overlay
// ============================================================================

/// Per-node patch within the delta.
#[derive(Debug, Clone, Default)]
pub struct NodeDelta {
  pub key: Option<String>,
  pub labels: Option<Vec<LabelId>>,
  pub labels_removed: Option<Vec<LabelId>>,
  /// `None` value = property tombstone
  pub props: Option<HashMap<PropKeyId, Option<PropValue>>>,
}

/// One adjacency edit: the edge type plus the other endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgePatch {
  pub etype: ETypeId,
  pub other: NodeId,
}

/// In-memory overlay of mutations not yet captured in a snapshot.
///
/// Populated when a transaction commits (after its WAL batch is durable)
/// and cleared when a checkpoint merges it into a new snapshot. The same
/// shape doubles as the per-transaction staging area.
#[derive(Debug, Clone, Default)]
pub struct DeltaState {
  pub created_nodes: HashMap<NodeId, NodeDelta>,
  pub modified_nodes: HashMap<NodeId, NodeDelta>,
  pub deleted_nodes: HashSet<NodeId>,

  pub out_add: HashMap<NodeId, Vec<EdgePatch>>,
  pub out_del: HashMap<NodeId, Vec<EdgePatch>>,
  pub in_add: HashMap<NodeId, Vec<EdgePatch>>,
  pub in_del: HashMap<NodeId, Vec<EdgePatch>>,

  /// `None` value = property tombstone
  pub edge_props: HashMap<(NodeId, ETypeId, NodeId), HashMap<PropKeyId, Option<PropValue>>>,

  pub new_labels: HashMap<LabelId, String>,
  pub new_etypes: HashMap<ETypeId, String>,
  pub new_propkeys: HashMap<PropKeyId, String>,

  pub key_index: HashMap<String, NodeId>,
  pub key_index_deleted: HashSet<String>,

  /// Vector edits keyed by (node, propkey); `None` = delete
  pub pending_vectors: HashMap<(NodeId, PropKeyId), Option<VectorRef>>,
}

impl DeltaState {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.created_nodes.is_empty()
      && self.modified_nodes.is_empty()
      && self.deleted_nodes.is_empty()
      && self.out_add.is_empty()
      && self.out_del.is_empty()
      && self.edge_props.is_empty()
      && self.new_labels.is_empty()
      && self.new_etypes.is_empty()
      && self.new_propkeys.is_empty()
      && self.key_index.is_empty()
      && self.key_index_deleted.is_empty()
      && self.pending_vectors.is_empty()
  }

  pub fn clear(&mut self) {
    *self = Self::default();
  }

  // ==========================================================================
  // Nodes
  // ==========================================================================

  pub fn create_node(&mut self, node_id: NodeId, key: Option<&str>) {
    self.deleted_nodes.remove(&node_id);
    let entry = self.created_nodes.entry(node_id).or_default();
    entry.key = key.map(|k| k.to_string());
    if let Some(key) = key {
      self.key_index.insert(key.to_string(), node_id);
      self.key_index_deleted.remove(key);
    }
  }

  pub fn delete_node(&mut self, node_id: NodeId) {
    if let Some(node) = self.created_nodes.remove(&node_id) {
      if let Some(key) = node.key {
        self.key_index.remove(&key);
        self.key_index_deleted.insert(key);
      }
    }
    self.modified_nodes.remove(&node_id);
    self.out_add.remove(&node_id);
    self.in_add.remove(&node_id);
    self.deleted_nodes.insert(node_id);
  }

  pub fn is_node_created(&self, node_id: NodeId) -> bool {
    self.created_nodes.contains_key(&node_id)
  }

  pub fn is_node_deleted(&self, node_id: NodeId) -> bool {
    self.deleted_nodes.contains(&node_id)
  }

  /// Patch for a node, whether created here or modified over the snapshot.
  pub fn node_delta(&self, node_id: NodeId) -> Option<&NodeDelta> {
    self
      .created_nodes
      .get(&node_id)
      .or_else(|| self.modified_nodes.get(&node_id))
  }

  fn node_delta_mut(&mut self, node_id: NodeId) -> &mut NodeDelta {
    if self.created_nodes.contains_key(&node_id) {
      self.created_nodes.entry(node_id).or_default()
    } else {
      self.modified_nodes.entry(node_id).or_default()
    }
  }

  // ==========================================================================
  // Node labels
  // ==========================================================================

  pub fn add_node_label(&mut self, node_id: NodeId, label_id: LabelId) {
    let delta = self.node_delta_mut(node_id);
    if let Some(removed) = delta.labels_removed.as_mut() {
      removed.retain(|&l| l != label_id);
    }
    let labels = delta.labels.get_or_insert_with(Vec::new);
    if !labels.contains(&label_id) {
      labels.push(label_id);
    }
  }

  pub fn remove_node_label(&mut self, node_id: NodeId, label_id: LabelId) {
    let delta = self.node_delta_mut(node_id);
    if let Some(labels) = delta.labels.as_mut() {
      labels.retain(|&l| l != label_id);
    }
    let removed = delta.labels_removed.get_or_insert_with(Vec::new);
    if !removed.contains(&label_id) {
      removed.push(label_id);
    }
  }

  // ==========================================================================
  // Node properties
  // ==========================================================================

  pub fn set_node_prop(&mut self, node_id: NodeId, key_id: PropKeyId, value: PropValue) {
    let delta = self.node_delta_mut(node_id);
    delta
      .props
      .get_or_insert_with(HashMap::new)
      .insert(key_id, Some(value));
  }

  pub fn delete_node_prop(&mut self, node_id: NodeId, key_id: PropKeyId) {
    let delta = self.node_delta_mut(node_id);
    delta
      .props
      .get_or_insert_with(HashMap::new)
      .insert(key_id, None);
  }

  /// Outer `None` = untouched; inner `None` = tombstone.
  pub fn node_prop(&self, node_id: NodeId, key_id: PropKeyId) -> Option<Option<&PropValue>> {
    self
      .node_delta(node_id)
      .and_then(|d| d.props.as_ref())
      .and_then(|p| p.get(&key_id))
      .map(|v| v.as_ref())
  }

  // ==========================================================================
  // Edges
  // ==========================================================================

  pub fn add_edge(&mut self, src: NodeId, etype: ETypeId, dst: NodeId) {
    let patch = EdgePatch { etype, other: dst };
    if let Some(dels) = self.out_del.get_mut(&src) {
      dels.retain(|p| *p != patch);
    }
    let adds = self.out_add.entry(src).or_default();
    if !adds.contains(&patch) {
      adds.push(patch);
    }

    let rev = EdgePatch { etype, other: src };
    if let Some(dels) = self.in_del.get_mut(&dst) {
      dels.retain(|p| *p != rev);
    }
    let adds = self.in_add.entry(dst).or_default();
    if !adds.contains(&rev) {
      adds.push(rev);
    }
  }

  pub fn delete_edge(&mut self, src: NodeId, etype: ETypeId, dst: NodeId) {
    let patch = EdgePatch { etype, other: dst };
    if let Some(adds) = self.out_add.get_mut(&src) {
      adds.retain(|p| *p != patch);
    }
    let dels = self.out_del.entry(src).or_default();
    if !dels.contains(&patch) {
      dels.push(patch);
    }

    let rev = EdgePatch { etype, other: src };
    if let Some(adds) = self.in_add.get_mut(&dst) {
      adds.retain(|p| *p != rev);
    }
    let dels = self.in_del.entry(dst).or_default();
    if !dels.contains(&rev) {
      dels.push(rev);
    }

    self.edge_props.remove(&(src, etype, dst));
  }

  pub fn is_edge_added(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> bool {
    self
      .out_add
      .get(&src)
      .is_some_and(|v| v.contains(&EdgePatch { etype, other: dst }))
  }

  pub fn is_edge_deleted(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> bool {
    self
      .out_del
      .get(&src)
      .is_some_and(|v| v.contains(&EdgePatch { etype, other: dst }))
  }

  pub fn total_edges_added(&self) -> usize {
    self.out_add.values().map(|v| v.len()).sum()
  }

  pub fn total_edges_deleted(&self) -> usize {
    self.out_del.values().map(|v| v.len()).sum()
  }

  // ==========================================================================
  // Edge properties
  // ==========================================================================

  pub fn set_edge_prop(
    &mut self,
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
    key_id: PropKeyId,
    value: PropValue,
  ) {
    self
      .edge_props
      .entry((src, etype, dst))
      .or_default()
      .insert(key_id, Some(value));
  }

  pub fn delete_edge_prop(&mut self, src: NodeId, etype: ETypeId, dst: NodeId, key_id: PropKeyId) {
    self
      .edge_props
      .entry((src, etype, dst))
      .or_default()
      .insert(key_id, None);
  }

  pub fn edge_props_delta(
    &self,
    src: NodeId,
    etype: ETypeId,
    dst: NodeId,
  ) -> Option<&HashMap<PropKeyId, Option<PropValue>>> {
    self.edge_props.get(&(src, etype, dst))
  }

  // ==========================================================================
  // Schema definitions
  // ==========================================================================

  pub fn define_label(&mut self, id: LabelId, name: &str) {
    self.new_labels.insert(id, name.to_string());
  }

  pub fn define_etype(&mut self, id: ETypeId, name: &str) {
    self.new_etypes.insert(id, name.to_string());
  }

  pub fn define_propkey(&mut self, id: PropKeyId, name: &str) {
    self.new_propkeys.insert(id, name.to_string());
  }
}

// ============================================================================
// Stats
// ============================================================================

/// Snapshot/delta/WAL counters returned by `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
  pub snapshot_gen: u64,
  pub snapshot_nodes: u64,
  pub snapshot_edges: u64,
  pub snapshot_max_node_id: NodeId,
  pub delta_nodes_created: usize,
  pub delta_nodes_deleted: usize,
  pub delta_edges_added: usize,
  pub delta_edges_deleted: usize,
  pub wal_active_region: u8,
  pub wal_used_bytes: u64,
  pub wal_primary_size: u64,
  pub wal_secondary_size: u64,
  pub checkpoint_in_progress: bool,
  pub recommend_checkpoint: bool,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_round_trip() {
    let mut header = DbHeader::new(4096, 256);
    header.max_node_id = 41;
    header.next_tx_id = 7;
    header.wal_primary_head = 1024;
    header.active_wal_region = 1;
    header.checkpoint_in_progress = 1;

    let page = header.serialize_to_page();
    assert_eq!(page.len(), DB_HEADER_SIZE);

    let parsed = DbHeader::parse(&page).expect("parse");
    assert_eq!(parsed, header);
  }

  #[test]
  fn test_header_rejects_bad_magic() {
    let header = DbHeader::new(4096, 256);
    let mut page = header.serialize_to_page();
    page[0] ^= 0xff;
    assert!(matches!(
      DbHeader::parse(&page),
      Err(HeronError::InvalidFileMagic)
    ));
  }

  #[test]
  fn test_header_rejects_bit_flip() {
    let header = DbHeader::new(4096, 256);
    let mut page = header.serialize_to_page();
    // Byte 20 sits inside the page_size field, covered by the CRC.
    page[20] ^= 0x01;
    assert!(matches!(
      DbHeader::parse(&page),
      Err(HeronError::CrcMismatch { .. })
    ));
  }

  #[test]
  fn test_delta_edge_add_then_delete() {
    let mut delta = DeltaState::new();
    delta.add_edge(1, 10, 2);
    assert!(delta.is_edge_added(1, 10, 2));

    delta.delete_edge(1, 10, 2);
    assert!(!delta.is_edge_added(1, 10, 2));
    assert!(delta.is_edge_deleted(1, 10, 2));

    // Re-adding clears the tombstone
    delta.add_edge(1, 10, 2);
    assert!(delta.is_edge_added(1, 10, 2));
    assert!(!delta.is_edge_deleted(1, 10, 2));
  }

  #[test]
  fn test_delta_node_lifecycle() {
    let mut delta = DeltaState::new();
    delta.create_node(5, Some("n5"));
    assert!(delta.is_node_created(5));
    assert_eq!(delta.key_index.get("n5"), Some(&5));

    delta.delete_node(5);
    assert!(!delta.is_node_created(5));
    assert!(delta.is_node_deleted(5));
    assert!(delta.key_index_deleted.contains("n5"));
  }

  #[test]
  fn test_delta_prop_tombstone() {
    let mut delta = DeltaState::new();
    delta.set_node_prop(1, 3, PropValue::I64(9));
    assert_eq!(delta.node_prop(1, 3), Some(Some(&PropValue::I64(9))));

    delta.delete_node_prop(1, 3);
    assert_eq!(delta.node_prop(1, 3), Some(None));
    assert_eq!(delta.node_prop(1, 4), None);
  }
}
