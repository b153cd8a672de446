//! CSR snapshot writer.
//!
//! Serializes a merged `(snapshot + delta)` view of the graph into a new
//! snapshot buffer. The output is deterministic for a given logical input:
//! nodes are sorted by NodeID, per-node edge runs by `(etype, dst)`, the
//! string table is interned in a fixed order, and no timestamps are
//! embedded.

use std::collections::HashMap;

use crate::constants::*;
use crate::core::snapshot::sections::{
  section_table_size, write_section_table, SectionEntry, SectionId,
};
use crate::core::snapshot::SnapshotFlags;
use crate::error::{HeronError, Result};
use crate::types::*;
use crate::util::binary::*;
use crate::util::crc::crc32c;
use crate::util::hash::xxhash64_str;
use crate::vector::serialize::serialize_manifest;
use crate::vector::types::VectorManifest;

// ============================================================================
// Builder input
// ============================================================================

/// Node data for snapshot building.
#[derive(Debug, Clone)]
pub struct NodeData {
  pub node_id: NodeId,
  pub key: Option<String>,
  pub labels: Vec<LabelId>,
  pub props: HashMap<PropKeyId, PropValue>,
}

/// Edge data for snapshot building.
#[derive(Debug, Clone)]
pub struct EdgeData {
  pub src: NodeId,
  pub etype: ETypeId,
  pub dst: NodeId,
  pub props: HashMap<PropKeyId, PropValue>,
}

/// Input for building a snapshot.
#[derive(Debug, Default)]
pub struct SnapshotBuildInput {
  pub generation: u64,
  pub nodes: Vec<NodeData>,
  pub edges: Vec<EdgeData>,
  pub labels: HashMap<LabelId, String>,
  pub etypes: HashMap<ETypeId, String>,
  pub propkeys: HashMap<PropKeyId, String>,
  pub vector_stores: HashMap<PropKeyId, VectorManifest>,
}

// ============================================================================
// String table
// ============================================================================

struct StringTable {
  strings: Vec<String>,
  string_to_id: HashMap<String, StringId>,
}

impl StringTable {
  fn new() -> Self {
    // StringID 0 is reserved/empty
    let mut table = Self {
      strings: vec![String::new()],
      string_to_id: HashMap::new(),
    };
    table.string_to_id.insert(String::new(), 0);
    table
  }

  fn intern(&mut self, s: &str) -> StringId {
    if let Some(&id) = self.string_to_id.get(s) {
      return id;
    }
    let id = self.strings.len() as StringId;
    self.strings.push(s.to_string());
    self.string_to_id.insert(s.to_string(), id);
    id
  }

  fn lookup(&self, s: &str) -> StringId {
    self.string_to_id.get(s).copied().unwrap_or(0)
  }

  fn len(&self) -> usize {
    self.strings.len()
  }
}

// ============================================================================
// CSR building
// ============================================================================

struct CsrData {
  offsets: Vec<u32>,
  /// dst for out-edges, src for in-edges
  others: Vec<u32>,
  etypes: Vec<u32>,
}

fn build_out_csr(
  num_nodes: usize,
  edges: &[EdgeData],
  node_id_to_phys: &HashMap<NodeId, PhysNode>,
) -> CsrData {
  let mut per_node: Vec<Vec<(ETypeId, PhysNode)>> = vec![Vec::new(); num_nodes];
  for edge in edges {
    if let (Some(&src_phys), Some(&dst_phys)) = (
      node_id_to_phys.get(&edge.src),
      node_id_to_phys.get(&edge.dst),
    ) {
      per_node[src_phys as usize].push((edge.etype, dst_phys));
    }
  }

  let mut offsets = Vec::with_capacity(num_nodes + 1);
  let mut others = Vec::new();
  let mut etypes = Vec::new();
  offsets.push(0);
  for node_edges in per_node.iter_mut() {
    node_edges.sort_unstable();
    for &(etype, dst_phys) in node_edges.iter() {
      others.push(dst_phys);
      etypes.push(etype);
    }
    offsets.push(others.len() as u32);
  }

  CsrData {
    offsets,
    others,
    etypes,
  }
}

fn build_in_csr(num_nodes: usize, out_csr: &CsrData) -> CsrData {
  let mut per_node: Vec<Vec<(ETypeId, PhysNode)>> = vec![Vec::new(); num_nodes];
  for src_phys in 0..num_nodes {
    let start = out_csr.offsets[src_phys] as usize;
    let end = out_csr.offsets[src_phys + 1] as usize;
    for i in start..end {
      per_node[out_csr.others[i] as usize].push((out_csr.etypes[i], src_phys as PhysNode));
    }
  }

  let mut offsets = Vec::with_capacity(num_nodes + 1);
  let mut others = Vec::new();
  let mut etypes = Vec::new();
  offsets.push(0);
  for node_edges in per_node.iter_mut() {
    node_edges.sort_unstable();
    for &(etype, src_phys) in node_edges.iter() {
      others.push(src_phys);
      etypes.push(etype);
    }
    offsets.push(others.len() as u32);
  }

  CsrData {
    offsets,
    others,
    etypes,
  }
}

// ============================================================================
// Key index building
// ============================================================================

struct KeyEntry {
  hash64: u64,
  string_id: StringId,
  node_id: NodeId,
}

struct KeyIndexData {
  entries: Vec<KeyEntry>,
  buckets: Vec<u32>,
}

fn build_key_index(nodes: &[NodeData], node_key_strings: &[StringId]) -> KeyIndexData {
  let mut entries: Vec<KeyEntry> = Vec::new();
  for (i, node) in nodes.iter().enumerate() {
    if let Some(ref key) = node.key {
      entries.push(KeyEntry {
        hash64: xxhash64_str(key),
        string_id: node_key_strings[i],
        node_id: node.node_id,
      });
    }
  }

  // ~0.5 load factor at write time
  let num_buckets = std::cmp::max(16, entries.len() * 2);
  let mut buckets = vec![0u32; num_buckets + 1];
  if entries.is_empty() {
    return KeyIndexData { entries, buckets };
  }

  let num_buckets_u64 = num_buckets as u64;
  entries.sort_by(|a, b| {
    let a_bucket = a.hash64 % num_buckets_u64;
    let b_bucket = b.hash64 % num_buckets_u64;
    a_bucket
      .cmp(&b_bucket)
      .then(a.hash64.cmp(&b.hash64))
      .then(a.string_id.cmp(&b.string_id))
      .then(a.node_id.cmp(&b.node_id))
  });

  let mut counts = vec![0u32; num_buckets];
  for entry in &entries {
    counts[(entry.hash64 % num_buckets_u64) as usize] += 1;
  }
  for i in 0..num_buckets {
    buckets[i + 1] = buckets[i] + counts[i];
  }

  KeyIndexData { entries, buckets }
}

// ============================================================================
// Property encoding
// ============================================================================

struct VectorTable {
  offsets: Vec<u64>,
  data: Vec<u8>,
}

impl VectorTable {
  fn new() -> Self {
    Self {
      offsets: vec![0],
      data: Vec::new(),
    }
  }

  fn push(&mut self, vec: &[f32]) -> u64 {
    self.data.extend_from_slice(&encode_f32_slice(vec));
    self.offsets.push(self.data.len() as u64);
    (self.offsets.len() - 2) as u64
  }

  fn is_empty(&self) -> bool {
    self.offsets.len() <= 1
  }
}

fn encode_prop_value(
  value: &PropValue,
  string_table: &StringTable,
  vectors: &mut VectorTable,
) -> (u8, u64) {
  match value {
    PropValue::Null => (PropValueTag::Null as u8, 0),
    PropValue::Bool(b) => (PropValueTag::Bool as u8, u64::from(*b)),
    PropValue::I64(v) => (PropValueTag::I64 as u8, *v as u64),
    PropValue::F64(v) => (PropValueTag::F64 as u8, v.to_bits()),
    PropValue::String(s) => (PropValueTag::String as u8, string_table.lookup(s) as u64),
    PropValue::VectorF32(vec) => (PropValueTag::VectorF32 as u8, vectors.push(vec)),
  }
}

fn encode_prop_vals(vals: &[(u8, u64)]) -> Vec<u8> {
  let mut data = vec![0u8; vals.len() * PROP_VALUE_DISK_SIZE];
  for (i, (tag, payload)) in vals.iter().enumerate() {
    let offset = i * PROP_VALUE_DISK_SIZE;
    data[offset] = *tag;
    write_u64(&mut data, offset + 8, *payload);
  }
  data
}

// ============================================================================
// Snapshot building
// ============================================================================

fn validate_edge_endpoints(
  edges: &[EdgeData],
  node_id_to_phys: &HashMap<NodeId, PhysNode>,
) -> Result<()> {
  for edge in edges {
    if !node_id_to_phys.contains_key(&edge.src) || !node_id_to_phys.contains_key(&edge.dst) {
      return Err(HeronError::InvalidSnapshot(format!(
        "edge references missing node(s): src={}, dst={}",
        edge.src, edge.dst
      )));
    }
  }
  Ok(())
}

fn intern_name_table(
  count: usize,
  names: &HashMap<u32, String>,
  string_table: &mut StringTable,
) -> Vec<StringId> {
  let mut ids = vec![0u32];
  for i in 1..=count as u32 {
    ids.push(match names.get(&i) {
      Some(name) => string_table.intern(name),
      None => 0,
    });
  }
  ids
}

/// Build a complete snapshot buffer in memory.
pub fn build_snapshot_to_memory(input: SnapshotBuildInput) -> Result<Vec<u8>> {
  let SnapshotBuildInput {
    generation,
    mut nodes,
    edges,
    labels,
    etypes,
    propkeys,
    vector_stores,
  } = input;

  // Deterministic ordering
  nodes.sort_by_key(|n| n.node_id);

  let num_nodes = nodes.len();
  let num_edges = edges.len();

  let phys_to_node_id: Vec<NodeId> = nodes.iter().map(|n| n.node_id).collect();
  let mut node_id_to_phys: HashMap<NodeId, PhysNode> = HashMap::with_capacity(num_nodes);
  let mut max_node_id: NodeId = 0;
  for (i, node) in nodes.iter().enumerate() {
    node_id_to_phys.insert(node.node_id, i as PhysNode);
    max_node_id = max_node_id.max(node.node_id);
  }

  validate_edge_endpoints(&edges, &node_id_to_phys)?;

  let mut string_table = StringTable::new();
  let label_string_ids = intern_name_table(labels.len(), &labels, &mut string_table);
  let etype_string_ids = intern_name_table(etypes.len(), &etypes, &mut string_table);
  let propkey_string_ids = intern_name_table(propkeys.len(), &propkeys, &mut string_table);

  let node_key_strings: Vec<StringId> = nodes
    .iter()
    .map(|n| n.key.as_deref().map_or(0, |k| string_table.intern(k)))
    .collect();

  // Intern string property values in (node order, key order)
  for node in &nodes {
    let mut sorted: Vec<_> = node.props.iter().collect();
    sorted.sort_by_key(|(k, _)| **k);
    for (_, value) in sorted {
      if let PropValue::String(s) = value {
        string_table.intern(s);
      }
    }
  }
  for edge in &edges {
    let mut sorted: Vec<_> = edge.props.iter().collect();
    sorted.sort_by_key(|(k, _)| **k);
    for (_, value) in sorted {
      if let PropValue::String(s) = value {
        string_table.intern(s);
      }
    }
  }

  let out_csr = build_out_csr(num_nodes, &edges, &node_id_to_phys);
  let in_csr = build_in_csr(num_nodes, &out_csr);
  let key_index = build_key_index(&nodes, &node_key_strings);

  let has_properties =
    nodes.iter().any(|n| !n.props.is_empty()) || edges.iter().any(|e| !e.props.is_empty());

  // ==========================================================================
  // Section assembly
  // ==========================================================================

  let mut section_payloads: Vec<(SectionId, Vec<u8>)> = Vec::new();
  let mut add_section = |id: SectionId, data: Vec<u8>| {
    section_payloads.push((id, data));
  };

  add_section(SectionId::PhysToNodeId, encode_u64_slice(&phys_to_node_id));

  {
    let size = (max_node_id + 1) as usize;
    let mut data = vec![0u8; size * 4];
    for i in 0..size {
      write_i32(&mut data, i * 4, -1);
    }
    for (&node_id, &phys) in &node_id_to_phys {
      write_i32(&mut data, node_id as usize * 4, phys as i32);
    }
    add_section(SectionId::NodeIdToPhys, data);
  }

  add_section(SectionId::OutOffsets, encode_u32_slice(&out_csr.offsets));
  add_section(SectionId::OutDst, encode_u32_slice(&out_csr.others));
  add_section(SectionId::OutEtype, encode_u32_slice(&out_csr.etypes));
  add_section(SectionId::InOffsets, encode_u32_slice(&in_csr.offsets));
  add_section(SectionId::InSrc, encode_u32_slice(&in_csr.others));
  add_section(SectionId::InEtype, encode_u32_slice(&in_csr.etypes));

  // String table
  {
    let num_strings = string_table.len();
    let total_bytes: usize = string_table.strings.iter().map(|s| s.len()).sum();
    let mut offsets_data = vec![0u8; (num_strings + 1) * 4];
    let mut bytes_data = Vec::with_capacity(total_bytes);
    for (i, s) in string_table.strings.iter().enumerate() {
      write_u32(&mut offsets_data, i * 4, bytes_data.len() as u32);
      bytes_data.extend_from_slice(s.as_bytes());
    }
    write_u32(&mut offsets_data, num_strings * 4, bytes_data.len() as u32);
    add_section(SectionId::StringOffsets, offsets_data);
    add_section(SectionId::StringBytes, bytes_data);
  }

  add_section(SectionId::LabelStringIds, encode_u32_slice(&label_string_ids));
  add_section(SectionId::EtypeStringIds, encode_u32_slice(&etype_string_ids));
  add_section(
    SectionId::PropkeyStringIds,
    encode_u32_slice(&propkey_string_ids),
  );
  add_section(SectionId::NodeKeyStrings, encode_u32_slice(&node_key_strings));

  // Key index
  {
    let mut data = vec![0u8; key_index.entries.len() * KEY_INDEX_ENTRY_SIZE];
    for (i, entry) in key_index.entries.iter().enumerate() {
      let offset = i * KEY_INDEX_ENTRY_SIZE;
      write_u64(&mut data, offset, entry.hash64);
      write_u32(&mut data, offset + 8, entry.string_id);
      write_u32(&mut data, offset + 12, 0);
      write_u64(&mut data, offset + 16, entry.node_id);
    }
    add_section(SectionId::KeyBuckets, encode_u32_slice(&key_index.buckets));
    add_section(SectionId::KeyEntries, data);
  }

  // Node labels
  {
    let mut offsets: Vec<u32> = Vec::with_capacity(num_nodes + 1);
    let mut ids: Vec<u32> = Vec::new();
    offsets.push(0);
    for node in &nodes {
      let mut labels = node.labels.clone();
      labels.sort_unstable();
      labels.dedup();
      ids.extend_from_slice(&labels);
      offsets.push(ids.len() as u32);
    }
    add_section(SectionId::NodeLabelOffsets, encode_u32_slice(&offsets));
    add_section(SectionId::NodeLabelIds, encode_u32_slice(&ids));
  }

  // Node and edge properties (vector values spill into the vector table)
  let mut vector_table = VectorTable::new();
  {
    let mut offsets = vec![0u32; num_nodes + 1];
    let mut keys: Vec<u32> = Vec::new();
    let mut vals: Vec<(u8, u64)> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
      offsets[i] = keys.len() as u32;
      let mut sorted: Vec<_> = node.props.iter().collect();
      sorted.sort_by_key(|(k, _)| **k);
      for (&key_id, value) in sorted {
        keys.push(key_id);
        vals.push(encode_prop_value(value, &string_table, &mut vector_table));
      }
    }
    offsets[num_nodes] = keys.len() as u32;
    add_section(SectionId::NodePropOffsets, encode_u32_slice(&offsets));
    add_section(SectionId::NodePropKeys, encode_u32_slice(&keys));
    add_section(SectionId::NodePropVals, encode_prop_vals(&vals));
  }

  {
    let mut edge_prop_map: HashMap<(PhysNode, ETypeId, PhysNode), &HashMap<PropKeyId, PropValue>> =
      HashMap::new();
    for edge in &edges {
      if edge.props.is_empty() {
        continue;
      }
      if let (Some(&src_phys), Some(&dst_phys)) = (
        node_id_to_phys.get(&edge.src),
        node_id_to_phys.get(&edge.dst),
      ) {
        edge_prop_map.insert((src_phys, edge.etype, dst_phys), &edge.props);
      }
    }

    let mut offsets = vec![0u32; num_edges + 1];
    let mut keys: Vec<u32> = Vec::new();
    let mut vals: Vec<(u8, u64)> = Vec::new();
    let mut edge_idx = 0usize;
    for src_phys in 0..num_nodes {
      let start = out_csr.offsets[src_phys] as usize;
      let end = out_csr.offsets[src_phys + 1] as usize;
      for i in start..end {
        offsets[edge_idx] = keys.len() as u32;
        let key = (
          src_phys as PhysNode,
          out_csr.etypes[i],
          out_csr.others[i],
        );
        if let Some(props) = edge_prop_map.get(&key) {
          let mut sorted: Vec<_> = props.iter().collect();
          sorted.sort_by_key(|(k, _)| **k);
          for (&key_id, value) in sorted {
            keys.push(key_id);
            vals.push(encode_prop_value(value, &string_table, &mut vector_table));
          }
        }
        edge_idx += 1;
      }
    }
    offsets[num_edges] = keys.len() as u32;
    add_section(SectionId::EdgePropOffsets, encode_u32_slice(&offsets));
    add_section(SectionId::EdgePropKeys, encode_u32_slice(&keys));
    add_section(SectionId::EdgePropVals, encode_prop_vals(&vals));
  }

  let has_vectors = !vector_table.is_empty();
  if has_vectors {
    add_section(
      SectionId::VectorOffsets,
      encode_u64_slice(&vector_table.offsets),
    );
    add_section(SectionId::VectorData, vector_table.data);
  }

  // Vector store manifests, sorted by propkey for determinism
  let has_vector_stores = !vector_stores.is_empty();
  if has_vector_stores {
    let mut ordered: Vec<(PropKeyId, &VectorManifest)> =
      vector_stores.iter().map(|(&k, v)| (k, v)).collect();
    ordered.sort_by_key(|(k, _)| *k);

    let mut index_data = vec![0u8; 4 + ordered.len() * 20];
    write_u32(&mut index_data, 0, ordered.len() as u32);
    let mut blob_data = Vec::new();
    for (i, (prop_key_id, manifest)) in ordered.iter().enumerate() {
      let encoded = serialize_manifest(manifest);
      let entry = 4 + i * 20;
      write_u32(&mut index_data, entry, *prop_key_id);
      write_u64(&mut index_data, entry + 4, blob_data.len() as u64);
      write_u64(&mut index_data, entry + 12, encoded.len() as u64);
      blob_data.extend_from_slice(&encoded);
    }
    add_section(SectionId::VectorStoreIndex, index_data);
    add_section(SectionId::VectorStoreData, blob_data);
  }

  // ==========================================================================
  // Layout and final buffer
  // ==========================================================================

  let table_end = SNAPSHOT_HEADER_SIZE + section_table_size();
  let mut data_offset = align_up(table_end, SECTION_ALIGNMENT);

  let mut entries = vec![SectionEntry::default(); SectionId::COUNT];
  for (id, data) in &section_payloads {
    entries[*id as usize] = SectionEntry {
      offset: data_offset as u64,
      length: data.len() as u64,
      crc: crc32c(data),
    };
    data_offset = align_up(data_offset + data.len(), SECTION_ALIGNMENT);
  }

  let total_size = data_offset + 4;
  let mut buffer = vec![0u8; total_size];

  // Header
  write_u32(&mut buffer, 0, MAGIC_SNAPSHOT);
  write_u32(&mut buffer, 4, VERSION_SNAPSHOT);
  write_u32(&mut buffer, 8, MIN_READER_SNAPSHOT);

  let mut flags = SnapshotFlags::HAS_IN_EDGES | SnapshotFlags::HAS_NODE_LABELS;
  if has_properties {
    flags |= SnapshotFlags::HAS_PROPERTIES;
  }
  if key_index.buckets.len() > 1 {
    flags |= SnapshotFlags::HAS_KEY_BUCKETS;
  }
  if has_vectors {
    flags |= SnapshotFlags::HAS_VECTORS;
  }
  if has_vector_stores {
    flags |= SnapshotFlags::HAS_VECTOR_STORES;
  }
  write_u32(&mut buffer, 12, flags.bits());

  write_u64(&mut buffer, 16, generation);
  write_u64(&mut buffer, 24, num_nodes as u64);
  write_u64(&mut buffer, 32, num_edges as u64);
  write_u64(&mut buffer, 40, max_node_id);
  write_u64(&mut buffer, 48, labels.len() as u64);
  write_u64(&mut buffer, 56, etypes.len() as u64);
  write_u64(&mut buffer, 64, propkeys.len() as u64);
  write_u64(&mut buffer, 72, string_table.len() as u64);

  write_section_table(&mut buffer, &entries);

  for (id, data) in &section_payloads {
    let offset = entries[*id as usize].offset as usize;
    buffer[offset..offset + data.len()].copy_from_slice(data);
  }

  let footer_crc = crc32c(&buffer[..total_size - 4]);
  write_u32(&mut buffer, total_size - 4, footer_crc);

  Ok(buffer)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::snapshot::reader::{ParseSnapshotOptions, SnapshotData};
  use crate::util::mmap::map_file;
  use std::io::Write;
  use std::sync::Arc;
  use tempfile::NamedTempFile;

  fn parse_buffer(buffer: &[u8]) -> SnapshotData {
    let mut tmp = NamedTempFile::new().expect("temp file");
    tmp.write_all(buffer).expect("write");
    tmp.flush().expect("flush");
    let mmap = map_file(tmp.as_file()).expect("map");
    SnapshotData::parse(Arc::new(mmap), &ParseSnapshotOptions::default()).expect("parse")
  }

  fn sample_input() -> SnapshotBuildInput {
    let mut alice_props = HashMap::new();
    alice_props.insert(1, PropValue::String("Alice".to_string()));
    alice_props.insert(2, PropValue::I64(30));
    alice_props.insert(4, PropValue::VectorF32(vec![0.1, 0.2, 0.3]));

    let mut bob_props = HashMap::new();
    bob_props.insert(1, PropValue::String("Bob".to_string()));

    let mut edge_props = HashMap::new();
    edge_props.insert(3, PropValue::F64(0.9));

    SnapshotBuildInput {
      generation: 1,
      nodes: vec![
        NodeData {
          node_id: 1,
          key: Some("user:alice".to_string()),
          labels: vec![1],
          props: alice_props,
        },
        NodeData {
          node_id: 2,
          key: Some("user:bob".to_string()),
          labels: vec![1],
          props: bob_props,
        },
        NodeData {
          node_id: 3,
          key: None,
          labels: vec![2],
          props: HashMap::new(),
        },
      ],
      edges: vec![
        EdgeData {
          src: 1,
          etype: 1,
          dst: 2,
          props: edge_props,
        },
        EdgeData {
          src: 2,
          etype: 1,
          dst: 1,
          props: HashMap::new(),
        },
        EdgeData {
          src: 1,
          etype: 2,
          dst: 3,
          props: HashMap::new(),
        },
      ],
      labels: HashMap::from([(1, "Person".to_string()), (2, "Document".to_string())]),
      etypes: HashMap::from([(1, "KNOWS".to_string()), (2, "CREATED".to_string())]),
      propkeys: HashMap::from([
        (1, "name".to_string()),
        (2, "age".to_string()),
        (3, "weight".to_string()),
        (4, "embedding".to_string()),
      ]),
      vector_stores: HashMap::new(),
    }
  }

  #[test]
  fn test_build_and_parse_round_trip() {
    let buffer = build_snapshot_to_memory(sample_input()).expect("build");
    let snapshot = parse_buffer(&buffer);

    assert_eq!(snapshot.header.generation, 1);
    assert_eq!(snapshot.header.num_nodes, 3);
    assert_eq!(snapshot.header.num_edges, 3);
    assert_eq!(snapshot.header.max_node_id, 3);

    let alice = snapshot.phys_node(1).expect("alice");
    assert_eq!(snapshot.node_key(alice), Some("user:alice".to_string()));
    assert_eq!(snapshot.lookup_by_key("user:alice"), Some(1));
    assert_eq!(snapshot.lookup_by_key("user:carol"), None);

    assert_eq!(
      snapshot.node_prop(alice, 1),
      Some(PropValue::String("Alice".to_string()))
    );
    assert_eq!(snapshot.node_prop(alice, 2), Some(PropValue::I64(30)));
    match snapshot.node_prop(alice, 4) {
      Some(PropValue::VectorF32(v)) => {
        assert_eq!(v.len(), 3);
        assert!((v[0] - 0.1).abs() < 1e-6);
      }
      other => panic!("expected vector, got {other:?}"),
    }

    assert_eq!(snapshot.node_labels(alice), Some(vec![1]));
    assert_eq!(snapshot.label_name(1), Some("Person"));
    assert_eq!(snapshot.etype_name(2), Some("CREATED"));
    assert_eq!(snapshot.propkey_name(4), Some("embedding"));
  }

  #[test]
  fn test_edges_sorted_and_searchable() {
    let buffer = build_snapshot_to_memory(sample_input()).expect("build");
    let snapshot = parse_buffer(&buffer);

    let alice = snapshot.phys_node(1).expect("alice");
    let bob = snapshot.phys_node(2).expect("bob");
    let doc = snapshot.phys_node(3).expect("doc");

    assert_eq!(snapshot.out_degree(alice), 2);
    assert!(snapshot.has_edge(alice, 1, bob));
    assert!(snapshot.has_edge(alice, 2, doc));
    assert!(!snapshot.has_edge(alice, 2, bob));

    // Sorted by (etype, dst)
    let edges: Vec<_> = snapshot.iter_out_edges(alice).collect();
    assert_eq!(edges, vec![(bob, 1), (doc, 2)]);

    // In-edges present
    assert_eq!(snapshot.in_degree(doc), 1);
    let in_edges: Vec<_> = snapshot.iter_in_edges(doc).collect();
    assert_eq!(in_edges, vec![(alice, 2)]);
  }

  #[test]
  fn test_edge_props_by_index() {
    let buffer = build_snapshot_to_memory(sample_input()).expect("build");
    let snapshot = parse_buffer(&buffer);

    let alice = snapshot.phys_node(1).expect("alice");
    let bob = snapshot.phys_node(2).expect("bob");
    let edge_idx = snapshot.find_edge_index(alice, 1, bob).expect("edge");
    assert_eq!(snapshot.edge_prop(edge_idx, 3), Some(PropValue::F64(0.9)));
    assert_eq!(snapshot.edge_prop(edge_idx, 1), None);
  }

  #[test]
  fn test_deterministic_output() {
    let a = build_snapshot_to_memory(sample_input()).expect("build a");
    let b = build_snapshot_to_memory(sample_input()).expect("build b");
    assert_eq!(a, b);
  }

  #[test]
  fn test_empty_snapshot() {
    let buffer = build_snapshot_to_memory(SnapshotBuildInput {
      generation: 1,
      ..Default::default()
    })
    .expect("build");
    let snapshot = parse_buffer(&buffer);
    assert_eq!(snapshot.header.num_nodes, 0);
    assert_eq!(snapshot.header.num_edges, 0);
    assert_eq!(snapshot.lookup_by_key("anything"), None);
  }

  #[test]
  fn test_single_node_no_edges() {
    let buffer = build_snapshot_to_memory(SnapshotBuildInput {
      generation: 1,
      nodes: vec![NodeData {
        node_id: 7,
        key: Some("solo".to_string()),
        labels: Vec::new(),
        props: HashMap::new(),
      }],
      ..Default::default()
    })
    .expect("build");
    let snapshot = parse_buffer(&buffer);
    assert_eq!(snapshot.header.num_nodes, 1);
    let phys = snapshot.phys_node(7).expect("phys");
    assert_eq!(snapshot.out_degree(phys), 0);
    assert_eq!(snapshot.lookup_by_key("solo"), Some(7));
  }

  #[test]
  fn test_missing_edge_endpoint_rejected() {
    let input = SnapshotBuildInput {
      generation: 1,
      edges: vec![EdgeData {
        src: 1,
        etype: 1,
        dst: 2,
        props: HashMap::new(),
      }],
      ..Default::default()
    };
    assert!(build_snapshot_to_memory(input).is_err());
  }

  #[test]
  fn test_corrupted_snapshot_rejected() {
    let buffer = build_snapshot_to_memory(sample_input()).expect("build");

    let mut tmp = NamedTempFile::new().expect("temp file");
    let mut corrupted = buffer.clone();
    let mid = corrupted.len() / 2;
    corrupted[mid] ^= 0xff;
    tmp.write_all(&corrupted).expect("write");
    tmp.flush().expect("flush");

    let mmap = map_file(tmp.as_file()).expect("map");
    assert!(SnapshotData::parse(Arc::new(mmap), &ParseSnapshotOptions::default()).is_err());
  }

  #[test]
  fn test_string_table_interning() {
    let mut table = StringTable::new();
    assert_eq!(table.len(), 1);
    assert_eq!(table.intern("hello"), 1);
    assert_eq!(table.intern("world"), 2);
    assert_eq!(table.intern("hello"), 1);
    assert_eq!(table.len(), 3);
  }

  #[test]
  fn test_csr_offsets() {
    let nodes: Vec<NodeData> = (1..=3)
      .map(|id| NodeData {
        node_id: id,
        key: None,
        labels: Vec::new(),
        props: HashMap::new(),
      })
      .collect();
    let edges = vec![
      EdgeData {
        src: 1,
        etype: 1,
        dst: 2,
        props: HashMap::new(),
      },
      EdgeData {
        src: 1,
        etype: 1,
        dst: 3,
        props: HashMap::new(),
      },
      EdgeData {
        src: 2,
        etype: 2,
        dst: 1,
        props: HashMap::new(),
      },
    ];

    let mut node_id_to_phys = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
      node_id_to_phys.insert(node.node_id, i as PhysNode);
    }

    let out_csr = build_out_csr(nodes.len(), &edges, &node_id_to_phys);
    assert_eq!(out_csr.offsets, vec![0, 2, 3, 3]);

    let in_csr = build_in_csr(nodes.len(), &out_csr);
    assert_eq!(in_csr.offsets, vec![0, 1, 2, 3]);
  }
}
