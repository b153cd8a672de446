//! Vector manifest serialization.
//!
//! A manifest serializes to a framed little-endian buffer with magic,
//! version, and a trailing CRC, carrying the config, every fragment's row
//! group data and tombstones, and any attached IVF / IVF-PQ index payload.

use crate::constants::{MAGIC_VECTOR_MANIFEST, VERSION_VECTOR_MANIFEST};
use crate::error::{HeronError, Result};
use crate::util::crc::crc32c;
use crate::vector::ivf::index::IvfIndex;
use crate::vector::ivf::pq::{IvfPqIndex, ProductQuantizer};
use crate::vector::types::{
  DistanceMetric, Fragment, RowGroup, VectorIndex, VectorLocation, VectorManifest,
  VectorStoreConfig,
};

const INDEX_TAG_NONE: u8 = 0;
const INDEX_TAG_IVF: u8 = 1;
const INDEX_TAG_IVFPQ: u8 = 2;

// ============================================================================
// Writing
// ============================================================================

struct Writer {
  buf: Vec<u8>,
}

impl Writer {
  fn new() -> Self {
    Self { buf: Vec::new() }
  }

  fn u8(&mut self, v: u8) {
    self.buf.push(v);
  }

  fn u32(&mut self, v: u32) {
    self.buf.extend_from_slice(&v.to_le_bytes());
  }

  fn u64(&mut self, v: u64) {
    self.buf.extend_from_slice(&v.to_le_bytes());
  }

  fn f32_slice(&mut self, values: &[f32]) {
    self.u32(values.len() as u32);
    for v in values {
      self.buf.extend_from_slice(&v.to_le_bytes());
    }
  }

  fn u64_slice(&mut self, values: &[u64]) {
    self.u32(values.len() as u32);
    for v in values {
      self.buf.extend_from_slice(&v.to_le_bytes());
    }
  }
}

fn write_config(w: &mut Writer, config: &VectorStoreConfig) {
  w.u32(config.dimensions as u32);
  w.u8(config.metric as u8);
  w.u8(config.normalize as u8);
  w.u8(0);
  w.u8(0);
  w.u32(config.row_group_size as u32);
  w.u32(config.fragment_target_size as u32);
}

fn write_fragment(w: &mut Writer, fragment: &Fragment) {
  w.u32(fragment.id);
  w.u8(fragment.sealed as u8);
  w.u8(0);
  w.u8(0);
  w.u8(0);
  w.u32(fragment.total_vectors as u32);
  w.u32(fragment.deleted_count as u32);
  w.u64_slice(&fragment.node_ids);
  w.u64_slice(&fragment.tombstones);

  let flat_len: usize = fragment.row_groups.iter().map(|rg| rg.data.len()).sum();
  w.u32(flat_len as u32);
  for rg in &fragment.row_groups {
    for v in &rg.data {
      w.buf.extend_from_slice(&v.to_le_bytes());
    }
  }
}

fn write_ivf(w: &mut Writer, index: &IvfIndex) {
  w.u32(index.dimensions as u32);
  w.u32(index.n_clusters as u32);
  w.u32(index.n_probe as u32);
  w.u8(index.metric as u8);
  w.u8(index.trained as u8);
  w.u8(0);
  w.u8(0);
  w.f32_slice(&index.centroids);
  w.u32(index.lists.len() as u32);
  for list in &index.lists {
    w.u64_slice(list);
  }
}

fn write_ivfpq(w: &mut Writer, index: &IvfPqIndex) {
  w.u32(index.dimensions as u32);
  w.u32(index.n_clusters as u32);
  w.u32(index.n_probe as u32);
  w.u8(index.metric as u8);
  w.u8(index.residual as u8);
  w.u8(index.trained as u8);
  w.u8(0);
  w.f32_slice(&index.centroids);

  w.u32(index.pq.m as u32);
  w.u32(index.pq.n_centroids as u32);
  w.f32_slice(&index.pq.codebooks);

  w.u32(index.lists.len() as u32);
  for list in &index.lists {
    w.u32(list.len() as u32);
    for (node_id, code) in list {
      w.u64(*node_id);
      w.buf.extend_from_slice(code);
    }
  }
}

/// Serialize a manifest to a framed byte buffer.
pub fn serialize_manifest(manifest: &VectorManifest) -> Vec<u8> {
  let mut w = Writer::new();
  w.u32(MAGIC_VECTOR_MANIFEST);
  w.u32(VERSION_VECTOR_MANIFEST);

  write_config(&mut w, &manifest.config);
  w.u32(manifest.next_fragment_id);

  w.u32(manifest.fragments.len() as u32);
  for fragment in &manifest.fragments {
    write_fragment(&mut w, fragment);
  }

  match &manifest.index {
    None => w.u8(INDEX_TAG_NONE),
    Some(VectorIndex::Ivf(index)) => {
      w.u8(INDEX_TAG_IVF);
      write_ivf(&mut w, index);
    }
    Some(VectorIndex::IvfPq(index)) => {
      w.u8(INDEX_TAG_IVFPQ);
      write_ivfpq(&mut w, index);
    }
  }

  let crc = crc32c(&w.buf);
  w.u32(crc);
  w.buf
}

// ============================================================================
// Reading
// ============================================================================

struct Reader<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> Reader<'a> {
  fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  fn fail(what: &str) -> HeronError {
    HeronError::InvalidSnapshot(format!("vector manifest truncated at {what}"))
  }

  fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
    if self.pos + n > self.buf.len() {
      return Err(Self::fail(what));
    }
    let slice = &self.buf[self.pos..self.pos + n];
    self.pos += n;
    Ok(slice)
  }

  fn u8(&mut self, what: &str) -> Result<u8> {
    Ok(self.take(1, what)?[0])
  }

  fn u32(&mut self, what: &str) -> Result<u32> {
    let s = self.take(4, what)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
  }

  fn u64(&mut self, what: &str) -> Result<u64> {
    let s = self.take(8, what)?;
    Ok(u64::from_le_bytes([
      s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
    ]))
  }

  fn f32_slice(&mut self, what: &str) -> Result<Vec<f32>> {
    let count = self.u32(what)? as usize;
    let bytes = self.take(count * 4, what)?;
    let mut out = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(4) {
      out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
  }

  fn u64_slice(&mut self, what: &str) -> Result<Vec<u64>> {
    let count = self.u32(what)? as usize;
    let bytes = self.take(count * 8, what)?;
    let mut out = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(8) {
      out.push(u64::from_le_bytes([
        chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
      ]));
    }
    Ok(out)
  }
}

fn read_config(r: &mut Reader<'_>) -> Result<VectorStoreConfig> {
  let dimensions = r.u32("config.dimensions")? as usize;
  let metric = DistanceMetric::from_u8(r.u8("config.metric")?)
    .ok_or_else(|| HeronError::InvalidSnapshot("unknown vector metric".to_string()))?;
  let normalize = r.u8("config.normalize")? != 0;
  r.u8("config.pad")?;
  r.u8("config.pad")?;
  let row_group_size = r.u32("config.row_group_size")? as usize;
  let fragment_target_size = r.u32("config.fragment_target_size")? as usize;

  if dimensions == 0 || row_group_size == 0 || fragment_target_size == 0 {
    return Err(HeronError::InvalidSnapshot(
      "degenerate vector store config".to_string(),
    ));
  }

  Ok(VectorStoreConfig {
    dimensions,
    metric,
    row_group_size,
    fragment_target_size,
    normalize,
  })
}

fn read_fragment(r: &mut Reader<'_>, config: &VectorStoreConfig) -> Result<Fragment> {
  let id = r.u32("fragment.id")?;
  let sealed = r.u8("fragment.sealed")? != 0;
  r.take(3, "fragment.pad")?;
  let total_vectors = r.u32("fragment.total")? as usize;
  let deleted_count = r.u32("fragment.deleted")? as usize;
  let node_ids = r.u64_slice("fragment.node_ids")?;
  let tombstones = r.u64_slice("fragment.tombstones")?;

  let flat_len = r.u32("fragment.data_len")? as usize;
  let bytes = r.take(flat_len * 4, "fragment.data")?;
  if node_ids.len() != total_vectors || flat_len != total_vectors * config.dimensions {
    return Err(HeronError::InvalidSnapshot(
      "fragment slot count mismatch".to_string(),
    ));
  }

  // Re-split the flat data into row groups of the configured size.
  let mut row_groups = Vec::new();
  let mut cursor = 0usize;
  let mut remaining = total_vectors;
  while remaining > 0 {
    let take = remaining.min(config.row_group_size);
    let mut rg = RowGroup::new(config.row_group_size, config.dimensions);
    let end = cursor + take * config.dimensions * 4;
    for chunk in bytes[cursor..end].chunks_exact(4) {
      rg.data
        .push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    rg.count = take;
    row_groups.push(rg);
    cursor = end;
    remaining -= take;
  }

  Ok(Fragment {
    id,
    row_groups,
    node_ids,
    tombstones,
    total_vectors,
    deleted_count,
    sealed,
  })
}

fn read_ivf(r: &mut Reader<'_>) -> Result<IvfIndex> {
  let dimensions = r.u32("ivf.dimensions")? as usize;
  let n_clusters = r.u32("ivf.n_clusters")? as usize;
  let n_probe = r.u32("ivf.n_probe")? as usize;
  let metric = DistanceMetric::from_u8(r.u8("ivf.metric")?)
    .ok_or_else(|| HeronError::InvalidSnapshot("unknown ivf metric".to_string()))?;
  let trained = r.u8("ivf.trained")? != 0;
  r.take(2, "ivf.pad")?;
  let centroids = r.f32_slice("ivf.centroids")?;

  let list_count = r.u32("ivf.list_count")? as usize;
  let mut lists = Vec::with_capacity(list_count);
  for _ in 0..list_count {
    lists.push(r.u64_slice("ivf.list")?);
  }

  Ok(IvfIndex {
    dimensions,
    n_clusters,
    n_probe,
    metric,
    centroids,
    lists,
    trained,
  })
}

fn read_ivfpq(r: &mut Reader<'_>) -> Result<IvfPqIndex> {
  let dimensions = r.u32("ivfpq.dimensions")? as usize;
  let n_clusters = r.u32("ivfpq.n_clusters")? as usize;
  let n_probe = r.u32("ivfpq.n_probe")? as usize;
  let metric = DistanceMetric::from_u8(r.u8("ivfpq.metric")?)
    .ok_or_else(|| HeronError::InvalidSnapshot("unknown ivfpq metric".to_string()))?;
  let residual = r.u8("ivfpq.residual")? != 0;
  let trained = r.u8("ivfpq.trained")? != 0;
  r.u8("ivfpq.pad")?;
  let centroids = r.f32_slice("ivfpq.centroids")?;

  let m = r.u32("pq.m")? as usize;
  let n_centroids = r.u32("pq.n_centroids")? as usize;
  let codebooks = r.f32_slice("pq.codebooks")?;
  let mut pq = ProductQuantizer::new(dimensions, m, n_centroids)?;
  pq.codebooks = codebooks;
  pq.trained = trained;

  let list_count = r.u32("ivfpq.list_count")? as usize;
  let mut lists = Vec::with_capacity(list_count);
  for _ in 0..list_count {
    let entries = r.u32("ivfpq.list_len")? as usize;
    let mut list = Vec::with_capacity(entries);
    for _ in 0..entries {
      let node_id = r.u64("ivfpq.entry.node")?;
      let code = r.take(m, "ivfpq.entry.code")?.to_vec();
      list.push((node_id, code));
    }
    lists.push(list);
  }

  Ok(IvfPqIndex {
    dimensions,
    n_clusters,
    n_probe,
    metric,
    residual,
    centroids,
    pq,
    lists,
    trained,
  })
}

/// Deserialize a manifest from a framed byte buffer.
pub fn deserialize_manifest(buf: &[u8]) -> Result<VectorManifest> {
  if buf.len() < 12 {
    return Err(HeronError::InvalidSnapshot(
      "vector manifest too small".to_string(),
    ));
  }

  let stored_crc = u32::from_le_bytes([
    buf[buf.len() - 4],
    buf[buf.len() - 3],
    buf[buf.len() - 2],
    buf[buf.len() - 1],
  ]);
  let computed_crc = crc32c(&buf[..buf.len() - 4]);
  if stored_crc != computed_crc {
    return Err(HeronError::CrcMismatch {
      stored: stored_crc,
      computed: computed_crc,
    });
  }

  let mut r = Reader::new(&buf[..buf.len() - 4]);

  let magic = r.u32("magic")?;
  if magic != MAGIC_VECTOR_MANIFEST {
    return Err(HeronError::InvalidMagic {
      expected: MAGIC_VECTOR_MANIFEST,
      got: magic,
    });
  }
  let version = r.u32("version")?;
  if version > VERSION_VECTOR_MANIFEST {
    return Err(HeronError::VersionMismatch {
      required: version,
      supported: VERSION_VECTOR_MANIFEST,
    });
  }

  let config = read_config(&mut r)?;
  let next_fragment_id = r.u32("next_fragment_id")?;

  let fragment_count = r.u32("fragment_count")? as usize;
  let mut fragments = Vec::with_capacity(fragment_count);
  for _ in 0..fragment_count {
    fragments.push(read_fragment(&mut r, &config)?);
  }

  let index = match r.u8("index_tag")? {
    INDEX_TAG_NONE => None,
    INDEX_TAG_IVF => Some(VectorIndex::Ivf(read_ivf(&mut r)?)),
    INDEX_TAG_IVFPQ => Some(VectorIndex::IvfPq(read_ivfpq(&mut r)?)),
    other => {
      return Err(HeronError::InvalidSnapshot(format!(
        "unknown vector index tag {other}"
      )))
    }
  };

  // Rebuild the node -> slot mapping from live slots.
  let mut locations = hashbrown::HashMap::new();
  for fragment in &fragments {
    for local in 0..fragment.total_vectors {
      if fragment.is_deleted(local) {
        continue;
      }
      locations.insert(
        fragment.node_ids[local],
        VectorLocation {
          fragment: fragment.id,
          local: local as u32,
        },
      );
    }
  }

  Ok(VectorManifest {
    config,
    fragments,
    locations,
    next_fragment_id,
    index,
  })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vector::ivf::index::{IvfConfig, SearchOptions};
  use crate::vector::store::{
    create_vector_store, vector_store_delete, vector_store_get, vector_store_insert,
    vector_store_iter, vector_store_len,
  };

  fn sample_store() -> VectorManifest {
    let mut store = create_vector_store(
      VectorStoreConfig::new(4)
        .with_metric(DistanceMetric::Euclidean)
        .with_row_group_size(2)
        .with_fragment_target_size(4),
    );
    for i in 1..=6u64 {
      vector_store_insert(&mut store, i, &[i as f32, 0.0, 1.0, -1.0]).expect("insert");
    }
    vector_store_delete(&mut store, 2);
    store
  }

  #[test]
  fn test_manifest_round_trip() {
    let store = sample_store();
    let bytes = serialize_manifest(&store);
    let decoded = deserialize_manifest(&bytes).expect("deserialize");

    assert_eq!(decoded.config, store.config);
    assert_eq!(decoded.fragments, store.fragments);
    assert_eq!(decoded.next_fragment_id, store.next_fragment_id);
    assert_eq!(vector_store_len(&decoded), 5);
    assert_eq!(vector_store_get(&decoded, 2), None);
    assert_eq!(
      vector_store_get(&decoded, 5),
      Some(vec![5.0, 0.0, 1.0, -1.0])
    );
  }

  #[test]
  fn test_manifest_with_ivf_round_trip() {
    let mut store = sample_store();

    let mut index = IvfIndex::new(
      IvfConfig::new(4, 2)
        .with_metric(DistanceMetric::Euclidean)
        .with_seed(9),
    );
    let mut flat = Vec::new();
    let mut entries = Vec::new();
    for (_, node_id, vector) in vector_store_iter(&store) {
      flat.extend_from_slice(vector);
      entries.push((node_id, vector.to_vec()));
    }
    index.train(&flat, entries.len(), Some(9)).expect("train");
    for (node_id, vector) in entries {
      index.insert(node_id, &vector).expect("insert");
    }
    store.index = Some(VectorIndex::Ivf(index));

    let bytes = serialize_manifest(&store);
    let decoded = deserialize_manifest(&bytes).expect("deserialize");

    let Some(VectorIndex::Ivf(decoded_index)) = &decoded.index else {
      panic!("expected ivf index");
    };
    assert!(decoded_index.trained);

    let results = decoded_index
      .search(&decoded, &[5.0, 0.0, 1.0, -1.0], 2, &SearchOptions::default())
      .expect("search");
    assert_eq!(results[0].node_id, 5);
  }

  #[test]
  fn test_corrupted_manifest_rejected() {
    let store = sample_store();
    let mut bytes = serialize_manifest(&store);
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x10;
    assert!(matches!(
      deserialize_manifest(&bytes),
      Err(HeronError::CrcMismatch { .. })
    ));
  }

  #[test]
  fn test_truncated_manifest_rejected() {
    let store = sample_store();
    let bytes = serialize_manifest(&store);
    assert!(deserialize_manifest(&bytes[..bytes.len() / 2]).is_err());
  }
}
