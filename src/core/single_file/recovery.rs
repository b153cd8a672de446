//! WAL recovery.
//!
//! At open, the primary region is scanned forward from its start; if a
//! checkpoint was interrupted the secondary region is scanned after it.
//! Only complete `Begin..Commit` groups are replayed. A damaged frame
//! before the recorded head is fatal corruption; garbage at or past the
//! head is a tolerated truncated tail.

use hashbrown::HashMap;

use crate::core::pager::FilePager;
use crate::core::wal::buffer::{WalBuffer, WalRegion};
use crate::core::wal::record::{decode_frame, FrameParse, WalPayload, WalRecord, WalRecordType};
use crate::error::{HeronError, Result};
use crate::types::*;

// ============================================================================
// Scanning
// ============================================================================

/// Scan one region's frames from offset 0 up to `head`.
pub fn scan_region(
  pager: &FilePager,
  wal: &WalBuffer,
  region: WalRegion,
) -> Result<Vec<WalRecord>> {
  let head = wal.region_head(region) as usize;
  if head == 0 {
    return Ok(Vec::new());
  }
  let bytes = pager.read_at(wal.region_start(region), head)?;

  let mut records = Vec::new();
  let mut offset = 0usize;
  while offset < head {
    match decode_frame(&bytes, offset) {
      FrameParse::Ok {
        record,
        next_offset,
      } => {
        records.push(record);
        offset = next_offset;
      }
      FrameParse::End => {
        // Unwritten space before the recorded head: the tail of the last
        // write never made it to disk. Keep what precedes it.
        log::warn!(
          "WAL {:?} region: truncated tail at offset {offset} (head {head})",
          region
        );
        break;
      }
      FrameParse::Corrupt { reason } => {
        return Err(HeronError::CorruptWalRecord {
          offset: offset as u64,
          reason,
        });
      }
    }
  }
  Ok(records)
}

/// Group records into transactions and keep only committed groups, in
/// commit order.
pub fn committed_transactions(records: &[WalRecord]) -> Vec<(TxId, Vec<&WalRecord>)> {
  let mut open: HashMap<TxId, Vec<&WalRecord>> = HashMap::new();
  let mut committed = Vec::new();

  for record in records {
    match record.record_type {
      WalRecordType::Begin => {
        open.insert(record.txid, Vec::new());
      }
      WalRecordType::Commit => {
        if let Some(group) = open.remove(&record.txid) {
          committed.push((record.txid, group));
        }
      }
      WalRecordType::Rollback => {
        open.remove(&record.txid);
      }
      _ => {
        if let Some(group) = open.get_mut(&record.txid) {
          group.push(record);
        }
      }
    }
  }

  // Anything still open had no Commit; it is dropped.
  if !open.is_empty() {
    log::debug!("dropping {} uncommitted WAL transaction(s)", open.len());
  }
  committed
}

// ============================================================================
// Replay
// ============================================================================

/// Mutable state threaded through replay.
pub struct ReplayContext {
  pub delta: DeltaState,
  pub next_node_id: NodeId,
  pub next_label_id: LabelId,
  pub next_etype_id: ETypeId,
  pub next_propkey_id: PropKeyId,
  pub label_names: HashMap<String, LabelId>,
  pub label_ids: HashMap<LabelId, String>,
  pub etype_names: HashMap<String, ETypeId>,
  pub etype_ids: HashMap<ETypeId, String>,
  pub propkey_names: HashMap<String, PropKeyId>,
  pub propkey_ids: HashMap<PropKeyId, String>,
  pub prop_types: HashMap<PropKeyId, PropValueTag>,
}

impl ReplayContext {
  pub fn new() -> Self {
    Self {
      delta: DeltaState::new(),
      next_node_id: crate::constants::INITIAL_NODE_ID,
      next_label_id: crate::constants::INITIAL_LABEL_ID,
      next_etype_id: crate::constants::INITIAL_ETYPE_ID,
      next_propkey_id: crate::constants::INITIAL_PROPKEY_ID,
      label_names: HashMap::new(),
      label_ids: HashMap::new(),
      etype_names: HashMap::new(),
      etype_ids: HashMap::new(),
      propkey_names: HashMap::new(),
      propkey_ids: HashMap::new(),
      prop_types: HashMap::new(),
    }
  }

  /// Apply one committed record to the delta and registries.
  pub fn replay(&mut self, record: &WalRecord) {
    let Some(payload) = record.decode() else {
      log::warn!(
        "skipping undecodable {:?} record for tx {}",
        record.record_type,
        record.txid
      );
      return;
    };

    match (record.record_type, payload) {
      (WalRecordType::DefineLabel, WalPayload::Define { id, name }) => {
        self.label_names.insert(name.clone(), id);
        self.label_ids.insert(id, name.clone());
        self.delta.define_label(id, &name);
        self.next_label_id = self.next_label_id.max(id + 1);
      }
      (WalRecordType::DefineEtype, WalPayload::Define { id, name }) => {
        self.etype_names.insert(name.clone(), id);
        self.etype_ids.insert(id, name.clone());
        self.delta.define_etype(id, &name);
        self.next_etype_id = self.next_etype_id.max(id + 1);
      }
      (WalRecordType::DefinePropkey, WalPayload::Define { id, name }) => {
        self.propkey_names.insert(name.clone(), id);
        self.propkey_ids.insert(id, name.clone());
        self.delta.define_propkey(id, &name);
        self.next_propkey_id = self.next_propkey_id.max(id + 1);
      }
      (WalRecordType::CreateNode, WalPayload::CreateNode { node_id, key }) => {
        self.delta.create_node(node_id, key.as_deref());
        self.next_node_id = self.next_node_id.max(node_id + 1);
      }
      (WalRecordType::DeleteNode, WalPayload::DeleteNode { node_id }) => {
        self.delta.delete_node(node_id);
        // Cascade the vector tombstones like the live path does
        let touched: Vec<PropKeyId> = self
          .delta
          .pending_vectors
          .keys()
          .filter(|(n, _)| *n == node_id)
          .map(|(_, pk)| *pk)
          .collect();
        for pk in touched {
          self.delta.pending_vectors.insert((node_id, pk), None);
        }
      }
      (WalRecordType::AddEdge, WalPayload::Edge { src, etype, dst }) => {
        self.delta.add_edge(src, etype, dst);
      }
      (WalRecordType::DeleteEdge, WalPayload::Edge { src, etype, dst }) => {
        self.delta.delete_edge(src, etype, dst);
      }
      (
        WalRecordType::SetNodeProp,
        WalPayload::NodeProp {
          node_id,
          key_id,
          value,
        },
      ) => {
        self.prop_types.entry(key_id).or_insert_with(|| value.tag());
        self.delta.set_node_prop(node_id, key_id, value);
      }
      (WalRecordType::DelNodeProp, WalPayload::DelNodeProp { node_id, key_id }) => {
        self.delta.delete_node_prop(node_id, key_id);
      }
      (
        WalRecordType::SetEdgeProp,
        WalPayload::EdgeProp {
          src,
          etype,
          dst,
          key_id,
          value,
        },
      ) => {
        self.prop_types.entry(key_id).or_insert_with(|| value.tag());
        self.delta.set_edge_prop(src, etype, dst, key_id, value);
      }
      (
        WalRecordType::DelEdgeProp,
        WalPayload::DelEdgeProp {
          src,
          etype,
          dst,
          key_id,
        },
      ) => {
        self.delta.delete_edge_prop(src, etype, dst, key_id);
      }
      (
        WalRecordType::SetNodeVector,
        WalPayload::NodeVector {
          node_id,
          key_id,
          vector,
        },
      ) => {
        self
          .delta
          .pending_vectors
          .insert((node_id, key_id), Some(std::sync::Arc::new(vector)));
      }
      (WalRecordType::DelNodeVector, WalPayload::DelNodeVector { node_id, key_id }) => {
        self.delta.pending_vectors.insert((node_id, key_id), None);
      }
      (WalRecordType::AddNodeLabel, WalPayload::NodeLabel { node_id, label_id }) => {
        self.delta.add_node_label(node_id, label_id);
      }
      (WalRecordType::RemoveNodeLabel, WalPayload::NodeLabel { node_id, label_id }) => {
        self.delta.remove_node_label(node_id, label_id);
      }
      (record_type, payload) => {
        log::warn!("ignoring mismatched WAL record {record_type:?} / {payload:?}");
      }
    }
  }
}

impl Default for ReplayContext {
  fn default() -> Self {
    Self::new()
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::wal::record::{
    build_control_payload, build_create_node_payload, build_define_payload, build_edge_payload,
  };

  fn record(record_type: WalRecordType, txid: TxId, payload: Vec<u8>) -> WalRecord {
    WalRecord::new(record_type, txid, payload)
  }

  #[test]
  fn test_committed_groups_only() {
    let records = vec![
      record(WalRecordType::Begin, 1, build_control_payload()),
      record(
        WalRecordType::CreateNode,
        1,
        build_create_node_payload(1, Some("a")),
      ),
      record(WalRecordType::Commit, 1, build_control_payload()),
      // tx 2 never commits
      record(WalRecordType::Begin, 2, build_control_payload()),
      record(
        WalRecordType::CreateNode,
        2,
        build_create_node_payload(2, Some("b")),
      ),
      // tx 3 rolls back
      record(WalRecordType::Begin, 3, build_control_payload()),
      record(
        WalRecordType::CreateNode,
        3,
        build_create_node_payload(3, Some("c")),
      ),
      record(WalRecordType::Rollback, 3, build_control_payload()),
    ];

    let committed = committed_transactions(&records);
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].0, 1);
    assert_eq!(committed[0].1.len(), 1);
  }

  #[test]
  fn test_replay_rebuilds_delta_and_counters() {
    let mut ctx = ReplayContext::new();

    ctx.replay(&record(
      WalRecordType::DefineEtype,
      1,
      build_define_payload(1, "CALLS"),
    ));
    ctx.replay(&record(
      WalRecordType::CreateNode,
      1,
      build_create_node_payload(5, Some("n5")),
    ));
    ctx.replay(&record(
      WalRecordType::CreateNode,
      1,
      build_create_node_payload(6, None),
    ));
    ctx.replay(&record(
      WalRecordType::AddEdge,
      1,
      build_edge_payload(5, 1, 6),
    ));

    assert_eq!(ctx.next_node_id, 7);
    assert_eq!(ctx.next_etype_id, 2);
    assert_eq!(ctx.etype_names.get("CALLS"), Some(&1));
    assert!(ctx.delta.is_node_created(5));
    assert!(ctx.delta.is_edge_added(5, 1, 6));
    assert_eq!(ctx.delta.key_index.get("n5"), Some(&5));
  }

  #[test]
  fn test_replay_delete_node_tombstones_vectors() {
    let mut ctx = ReplayContext::new();
    ctx.replay(&record(
      WalRecordType::CreateNode,
      1,
      build_create_node_payload(1, None),
    ));
    ctx.replay(&record(
      WalRecordType::SetNodeVector,
      1,
      crate::core::wal::record::build_node_vector_payload(1, 3, &[0.6, 0.8]),
    ));
    assert!(ctx.delta.pending_vectors[&(1, 3)].is_some());

    ctx.replay(&record(
      WalRecordType::DeleteNode,
      1,
      crate::core::wal::record::build_delete_node_payload(1),
    ));
    assert!(ctx.delta.pending_vectors[&(1, 3)].is_none());
  }
}
