//! Transaction lifecycle: begin, commit, rollback.
//!
//! One writer at a time. Mutations stage in the transaction's own delta;
//! commit serializes the staging as a single WAL batch in canonical order
//! (definitions, node creates, node deletes, label edits, edge adds, edge
//! deletes, prop sets, prop dels, vector edits), appends it, makes it
//! durable per the sync mode, and only then applies it to the live delta.
//! Rollback discards the staging without touching WAL or delta.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::wal::record::{
  build_control_payload, build_create_node_payload, build_define_payload,
  build_del_edge_prop_payload, build_del_node_prop_payload, build_del_node_vector_payload,
  build_delete_node_payload, build_edge_payload, build_edge_prop_payload,
  build_node_label_payload, build_node_prop_payload, build_node_vector_payload,
  framed_size_for_payload, WalRecord, WalRecordType,
};
use crate::error::{HeronError, Result};
use crate::types::*;

use super::open::SyncMode;
use super::{SingleFileDB, TxState};

impl SingleFileDB {
  // ==========================================================================
  // Begin / rollback
  // ==========================================================================

  /// Open the single write transaction slot.
  pub fn begin(&self) -> Result<TxId> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }

    let mut slot = self.current_tx.lock();
    if slot.is_some() {
      return Err(HeronError::TransactionInProgress);
    }

    let txid = self.alloc_tx_id();
    *slot = Some(Arc::new(Mutex::new(TxState::new(txid))));
    Ok(txid)
  }

  /// Discard the open transaction. Nothing reaches the WAL.
  pub fn rollback(&self) -> Result<()> {
    let tx_handle = self
      .current_tx
      .lock()
      .take()
      .ok_or(HeronError::NoTransaction)?;

    let staged = std::mem::take(&mut tx_handle.lock().staged);
    self.undo_staged_definitions(&staged);
    Ok(())
  }

  /// Definitions are registered eagerly for id stability; a rollback
  /// unregisters them and rewinds the allocators (safe under the single
  /// writer).
  fn undo_staged_definitions(&self, staged: &DeltaState) {
    if !staged.new_labels.is_empty() {
      let mut names = self.label_names.write();
      let mut ids = self.label_ids.write();
      let mut min_id = u32::MAX;
      for (&id, name) in &staged.new_labels {
        names.remove(name);
        ids.remove(&id);
        min_id = min_id.min(id);
      }
      self.next_label_id.store(min_id, Ordering::SeqCst);
    }
    if !staged.new_etypes.is_empty() {
      let mut names = self.etype_names.write();
      let mut ids = self.etype_ids.write();
      let mut min_id = u32::MAX;
      for (&id, name) in &staged.new_etypes {
        names.remove(name);
        ids.remove(&id);
        min_id = min_id.min(id);
      }
      self.next_etype_id.store(min_id, Ordering::SeqCst);
    }
    if !staged.new_propkeys.is_empty() {
      let mut names = self.propkey_names.write();
      let mut ids = self.propkey_ids.write();
      let mut min_id = u32::MAX;
      for (&id, name) in &staged.new_propkeys {
        names.remove(name);
        ids.remove(&id);
        min_id = min_id.min(id);
      }
      self.next_propkey_id.store(min_id, Ordering::SeqCst);
    }
  }

  pub fn has_transaction(&self) -> bool {
    self.current_tx.lock().is_some()
  }

  pub fn current_txid(&self) -> Option<TxId> {
    self.current_tx.lock().as_ref().map(|tx| tx.lock().txid)
  }

  /// Staging handle when the calling thread owns the open transaction.
  pub(crate) fn tx_for_current_thread(&self) -> Option<Arc<Mutex<TxState>>> {
    let slot = self.current_tx.lock();
    let handle = slot.as_ref()?;
    if handle.lock().owner == std::thread::current().id() {
      Some(Arc::clone(handle))
    } else {
      None
    }
  }

  /// The open transaction, or `NoTransaction`.
  pub(crate) fn require_write_tx(&self) -> Result<(TxId, Arc<Mutex<TxState>>)> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }
    let slot = self.current_tx.lock();
    let handle = slot.as_ref().ok_or(HeronError::NoTransaction)?;
    let txid = handle.lock().txid;
    Ok((txid, Arc::clone(handle)))
  }

  // ==========================================================================
  // Commit
  // ==========================================================================

  /// Commit the open transaction.
  pub fn commit(&self) -> Result<()> {
    let tx_handle = self
      .current_tx
      .lock()
      .take()
      .ok_or(HeronError::NoTransaction)?;

    let (txid, mut staged) = {
      let mut tx = tx_handle.lock();
      (tx.txid, std::mem::take(&mut tx.staged))
    };

    if staged.is_empty() {
      return Ok(());
    }

    // Framed batch size, computed without building the records; used for
    // the checkpoint threshold check and the WAL-full fast path.
    let batch_size = estimate_batch_size(&staged);

    // Trigger the checkpoint before appending so this batch lands in the
    // right region (secondary while the checkpoint runs).
    if self.auto_checkpoint && !self.is_checkpoint_running() && self.should_checkpoint(batch_size)
    {
      if self.background_checkpoint {
        if let Err(e) = self.start_background_checkpoint() {
          log::warn!("auto-checkpoint failed to start: {e}");
        }
      } else if let Err(e) = self.checkpoint() {
        log::warn!("auto-checkpoint failed: {e}");
      }
    }

    let group_commit_active = self.group_commit_enabled && self.sync_mode == SyncMode::Normal;
    let mut group_seq = 0u64;

    // The batch is applied to the live delta inside the commit lock, so a
    // checkpoint can never freeze a delta that is missing a WAL-durable
    // transaction.
    let mut attempted_reclaim = false;
    loop {
      let batch = build_batch_bytes(txid, &staged);
      debug_assert_eq!(batch.len() as u64, batch_size);

      let append_result = {
        let _commit_guard = self.commit_lock.lock();
        let mut pager = self.pager.lock();
        let mut wal = self.wal.lock();

        match wal.write_frame_bytes(batch) {
          Err(e) => Err(e),
          Ok(()) => {
            let should_sync = !group_commit_active && self.sync_mode != SyncMode::Off;
            wal.flush(&mut pager)?;

            {
              let mut header = self.header.write();
              header.wal_primary_head = wal.primary_head();
              header.wal_secondary_head = wal.secondary_head();
              header.active_wal_region = wal.active_region() as u8;
              header.max_node_id = self.max_assigned_node_id();
              header.next_tx_id = self.next_tx_id.load(Ordering::SeqCst);
              header.change_counter += 1;
              Self::write_header_locked(&mut pager, &header)?;
            }

            if should_sync {
              pager.sync()?;
            }

            if group_commit_active {
              let mut state = self.group_commit_state.lock();
              state.next_seq = state.next_seq.saturating_add(1);
              group_seq = state.next_seq;
            }

            self.apply_committed(&mut staged);
            Ok(())
          }
        }
      };

      match append_result {
        Ok(()) => break,
        Err(HeronError::WalFull { needed, available })
          if self.auto_checkpoint && !attempted_reclaim =>
        {
          // One reclaim attempt: a blocking checkpoint empties the WAL.
          log::warn!(
            "WAL full (need {needed}, have {available}); forcing a blocking checkpoint"
          );
          attempted_reclaim = true;
          self.checkpoint()?;
        }
        Err(e) => return Err(e),
      }
    }

    if group_commit_active {
      self.wait_for_group_commit(group_seq)?;
    }

    Ok(())
  }

  /// Apply a durably-logged staging to the live in-memory state. Drains
  /// the staging.
  fn apply_committed(&self, staged: &mut DeltaState) {
    let pending_vectors = std::mem::take(&mut staged.pending_vectors);
    let deleted_nodes: Vec<NodeId> = staged.deleted_nodes.iter().copied().collect();
    let touched_keys: Vec<String> = staged
      .key_index
      .keys()
      .cloned()
      .chain(staged.key_index_deleted.iter().cloned())
      .collect();

    self.apply_pending_vectors(&pending_vectors);

    {
      let mut delta = self.delta.write();
      merge_delta(&mut delta, std::mem::take(staged));
    }

    // Cascade: a deleted node's vectors go with it.
    if !deleted_nodes.is_empty() {
      let mut stores = self.vector_stores.write();
      for store in stores.values_mut() {
        for &node_id in &deleted_nodes {
          crate::vector::store::vector_store_delete(store, node_id);
        }
      }
    }

    for key in touched_keys {
      self.key_cache_invalidate(&key);
    }
  }

  // ==========================================================================
  // Group commit
  // ==========================================================================

  /// Coalesce fsyncs across commits: the first waiter becomes the flusher,
  /// sleeps out the window, then flushes for everyone queued behind it.
  fn wait_for_group_commit(&self, seq: u64) -> Result<()> {
    {
      let mut state = self.group_commit_state.lock();
      if state.flushing {
        while state.flushed_seq < seq && state.last_error_seq < seq {
          self.group_commit_cv.wait(&mut state);
        }
        if state.last_error_seq >= seq {
          let message = state
            .last_error
            .as_deref()
            .unwrap_or("group commit flush failed");
          return Err(HeronError::Internal(message.to_string()));
        }
        return Ok(());
      }
      state.flushing = true;
    }

    if self.group_commit_window_ms > 0 {
      std::thread::sleep(Duration::from_millis(self.group_commit_window_ms));
    }

    let flush_result = {
      let mut pager = self.pager.lock();
      let mut wal = self.wal.lock();
      wal.flush(&mut pager).and_then(|_| pager.sync())
    };

    let mut state = self.group_commit_state.lock();
    state.flushed_seq = state.next_seq;
    state.flushing = false;
    match &flush_result {
      Ok(()) => {
        state.last_error_seq = 0;
        state.last_error = None;
      }
      Err(e) => {
        state.last_error_seq = state.next_seq;
        state.last_error = Some(e.to_string());
      }
    }
    self.group_commit_cv.notify_all();

    flush_result
  }
}

// ============================================================================
// Batch building
// ============================================================================

fn prop_value_payload_len(value: &PropValue) -> usize {
  1 + match value {
    PropValue::Null => 0,
    PropValue::Bool(_) => 1,
    PropValue::I64(_) | PropValue::F64(_) => 8,
    PropValue::String(s) => 4 + s.len(),
    PropValue::VectorF32(v) => 4 + v.len() * 4,
  }
}

/// Walk a staging in canonical order, reporting each record's payload
/// length. `build_batch_bytes` walks the same order; the two must agree.
fn estimate_batch_size(staged: &DeltaState) -> u64 {
  let mut total = framed_size_for_payload(0) as u64 * 2; // Begin + Commit

  for name in sorted_values(&staged.new_labels) {
    total += framed_size_for_payload(8 + name.len()) as u64;
  }
  for name in sorted_values(&staged.new_etypes) {
    total += framed_size_for_payload(8 + name.len()) as u64;
  }
  for name in sorted_values(&staged.new_propkeys) {
    total += framed_size_for_payload(8 + name.len()) as u64;
  }

  for (_, node) in sorted_nodes(&staged.created_nodes) {
    let key_len = node.key.as_ref().map_or(0, |k| 4 + k.len());
    total += framed_size_for_payload(9 + key_len) as u64;
  }
  for _ in sorted_ids(&staged.deleted_nodes) {
    total += framed_size_for_payload(8) as u64;
  }

  for (node_id, node) in label_edit_nodes(staged) {
    if staged.deleted_nodes.contains(&node_id) {
      continue;
    }
    let adds = node.labels.as_ref().map_or(0, |l| l.len());
    let dels = node.labels_removed.as_ref().map_or(0, |l| l.len());
    total += (adds + dels) as u64 * framed_size_for_payload(12) as u64;
  }

  total += edge_counts(&staged.out_add) as u64 * framed_size_for_payload(20) as u64;
  total += edge_counts(&staged.out_del) as u64 * framed_size_for_payload(20) as u64;

  for (node_id, node) in sorted_nodes(&staged.created_nodes).into_iter().chain(sorted_nodes(&staged.modified_nodes)) {
    if staged.deleted_nodes.contains(&node_id) {
      continue;
    }
    if let Some(props) = node.props.as_ref() {
      for (_, value) in sorted_props(props) {
        total += match value {
          Some(v) => framed_size_for_payload(12 + prop_value_payload_len(v)) as u64,
          None => framed_size_for_payload(12) as u64,
        };
      }
    }
  }

  for ((_, _, _), props) in sorted_edge_props(&staged.edge_props) {
    for (_, value) in sorted_props(props) {
      total += match value {
        Some(v) => framed_size_for_payload(24 + prop_value_payload_len(v)) as u64,
        None => framed_size_for_payload(24) as u64,
      };
    }
  }

  for ((node_id, _), op) in sorted_vector_ops(&staged.pending_vectors) {
    if staged.deleted_nodes.contains(&node_id) {
      continue;
    }
    total += match op {
      Some(v) => framed_size_for_payload(16 + v.len() * 4) as u64,
      None => framed_size_for_payload(12) as u64,
    };
  }

  total
}

/// Serialize the staging as framed bytes, `Begin` through `Commit`.
fn build_batch_bytes(txid: TxId, staged: &DeltaState) -> Vec<u8> {
  let mut out = Vec::new();
  let mut push = |record_type: WalRecordType, payload: Vec<u8>| {
    out.extend_from_slice(&WalRecord::new(record_type, txid, payload).build());
  };

  push(WalRecordType::Begin, build_control_payload());

  for (id, name) in sorted_entries(&staged.new_labels) {
    push(WalRecordType::DefineLabel, build_define_payload(id, name));
  }
  for (id, name) in sorted_entries(&staged.new_etypes) {
    push(WalRecordType::DefineEtype, build_define_payload(id, name));
  }
  for (id, name) in sorted_entries(&staged.new_propkeys) {
    push(WalRecordType::DefinePropkey, build_define_payload(id, name));
  }

  for (node_id, node) in sorted_nodes(&staged.created_nodes) {
    push(
      WalRecordType::CreateNode,
      build_create_node_payload(node_id, node.key.as_deref()),
    );
  }
  for node_id in sorted_ids(&staged.deleted_nodes) {
    push(WalRecordType::DeleteNode, build_delete_node_payload(node_id));
  }

  for (node_id, node) in label_edit_nodes(staged) {
    if staged.deleted_nodes.contains(&node_id) {
      continue;
    }
    if let Some(labels) = node.labels.as_ref() {
      for &label_id in labels {
        push(
          WalRecordType::AddNodeLabel,
          build_node_label_payload(node_id, label_id),
        );
      }
    }
    if let Some(removed) = node.labels_removed.as_ref() {
      for &label_id in removed {
        push(
          WalRecordType::RemoveNodeLabel,
          build_node_label_payload(node_id, label_id),
        );
      }
    }
  }

  for (src, patches) in sorted_edge_lists(&staged.out_add) {
    for patch in patches {
      push(
        WalRecordType::AddEdge,
        build_edge_payload(src, patch.etype, patch.other),
      );
    }
  }
  for (src, patches) in sorted_edge_lists(&staged.out_del) {
    for patch in patches {
      push(
        WalRecordType::DeleteEdge,
        build_edge_payload(src, patch.etype, patch.other),
      );
    }
  }

  for (node_id, node) in sorted_nodes(&staged.created_nodes).into_iter().chain(sorted_nodes(&staged.modified_nodes)) {
    if staged.deleted_nodes.contains(&node_id) {
      continue;
    }
    if let Some(props) = node.props.as_ref() {
      for (key_id, value) in sorted_props(props) {
        match value {
          Some(v) => push(
            WalRecordType::SetNodeProp,
            build_node_prop_payload(node_id, key_id, v),
          ),
          None => push(
            WalRecordType::DelNodeProp,
            build_del_node_prop_payload(node_id, key_id),
          ),
        }
      }
    }
  }

  for ((src, etype, dst), props) in sorted_edge_props(&staged.edge_props) {
    for (key_id, value) in sorted_props(props) {
      match value {
        Some(v) => push(
          WalRecordType::SetEdgeProp,
          build_edge_prop_payload(src, etype, dst, key_id, v),
        ),
        None => push(
          WalRecordType::DelEdgeProp,
          build_del_edge_prop_payload(src, etype, dst, key_id),
        ),
      }
    }
  }

  for ((node_id, key_id), op) in sorted_vector_ops(&staged.pending_vectors) {
    if staged.deleted_nodes.contains(&node_id) {
      continue;
    }
    match op {
      Some(v) => push(
        WalRecordType::SetNodeVector,
        build_node_vector_payload(node_id, key_id, v),
      ),
      None => push(
        WalRecordType::DelNodeVector,
        build_del_node_vector_payload(node_id, key_id),
      ),
    }
  }

  push(WalRecordType::Commit, build_control_payload());
  out
}

// ============================================================================
// Deterministic iteration helpers
// ============================================================================

fn sorted_entries(map: &hashbrown::HashMap<u32, String>) -> Vec<(u32, &String)> {
  let mut out: Vec<(u32, &String)> = map.iter().map(|(&id, name)| (id, name)).collect();
  out.sort_by_key(|(id, _)| *id);
  out
}

fn sorted_values(map: &hashbrown::HashMap<u32, String>) -> Vec<&String> {
  sorted_entries(map).into_iter().map(|(_, name)| name).collect()
}

fn sorted_nodes(map: &hashbrown::HashMap<NodeId, NodeDelta>) -> Vec<(NodeId, &NodeDelta)> {
  let mut out: Vec<(NodeId, &NodeDelta)> = map.iter().map(|(&id, node)| (id, node)).collect();
  out.sort_by_key(|(id, _)| *id);
  out
}

fn label_edit_nodes(staged: &DeltaState) -> Vec<(NodeId, &NodeDelta)> {
  let mut out = sorted_nodes(&staged.created_nodes);
  out.extend(sorted_nodes(&staged.modified_nodes));
  out.sort_by_key(|(id, _)| *id);
  out
}

fn sorted_ids(set: &hashbrown::HashSet<NodeId>) -> Vec<NodeId> {
  let mut out: Vec<NodeId> = set.iter().copied().collect();
  out.sort_unstable();
  out
}

fn sorted_edge_lists(
  map: &hashbrown::HashMap<NodeId, Vec<EdgePatch>>,
) -> Vec<(NodeId, Vec<EdgePatch>)> {
  let mut out: Vec<(NodeId, Vec<EdgePatch>)> = map
    .iter()
    .map(|(&src, patches)| {
      let mut patches = patches.clone();
      patches.sort_by_key(|p| (p.etype, p.other));
      (src, patches)
    })
    .collect();
  out.sort_by_key(|(src, _)| *src);
  out
}

fn edge_counts(map: &hashbrown::HashMap<NodeId, Vec<EdgePatch>>) -> usize {
  map.values().map(|v| v.len()).sum()
}

type EdgePropMap = hashbrown::HashMap<(NodeId, ETypeId, NodeId), hashbrown::HashMap<PropKeyId, Option<PropValue>>>;

fn sorted_edge_props(
  map: &EdgePropMap,
) -> Vec<((NodeId, ETypeId, NodeId), &hashbrown::HashMap<PropKeyId, Option<PropValue>>)> {
  let mut out: Vec<_> = map.iter().map(|(&k, v)| (k, v)).collect();
  out.sort_by_key(|(k, _)| *k);
  out
}

fn sorted_props(
  map: &hashbrown::HashMap<PropKeyId, Option<PropValue>>,
) -> Vec<(PropKeyId, Option<&PropValue>)> {
  let mut out: Vec<(PropKeyId, Option<&PropValue>)> = map
    .iter()
    .map(|(&k, v)| (k, v.as_ref()))
    .collect();
  out.sort_by_key(|(k, _)| *k);
  out
}

fn sorted_vector_ops(
  map: &hashbrown::HashMap<(NodeId, PropKeyId), Option<VectorRef>>,
) -> Vec<((NodeId, PropKeyId), Option<&Vec<f32>>)> {
  let mut out: Vec<((NodeId, PropKeyId), Option<&Vec<f32>>)> = map
    .iter()
    .map(|(&k, v)| (k, v.as_ref().map(|a| a.as_ref())))
    .collect();
  out.sort_by_key(|(k, _)| *k);
  out
}

// ============================================================================
// Delta merging
// ============================================================================

/// Fold a newer overlay into an older one, preserving the newer layer's
/// view. Used both for commit apply (staging -> live delta) and for the
/// background-checkpoint failure path (live -> frozen).
pub(crate) fn merge_delta(target: &mut DeltaState, mut newer: DeltaState) {
  target.new_labels.extend(newer.new_labels.drain());
  target.new_etypes.extend(newer.new_etypes.drain());
  target.new_propkeys.extend(newer.new_propkeys.drain());

  for (node_id, mut node) in newer.created_nodes.drain() {
    target.create_node(node_id, node.key.as_deref());
    if let Some(labels) = node.labels.take() {
      for label_id in labels {
        target.add_node_label(node_id, label_id);
      }
    }
    if let Some(removed) = node.labels_removed.take() {
      for label_id in removed {
        target.remove_node_label(node_id, label_id);
      }
    }
    if let Some(props) = node.props.take() {
      for (key_id, value) in props {
        match value {
          Some(value) => target.set_node_prop(node_id, key_id, value),
          None => target.delete_node_prop(node_id, key_id),
        }
      }
    }
  }

  for node_id in newer.deleted_nodes.drain() {
    target.delete_node(node_id);
  }

  for (node_id, mut node) in newer.modified_nodes.drain() {
    if let Some(labels) = node.labels.take() {
      for label_id in labels {
        target.add_node_label(node_id, label_id);
      }
    }
    if let Some(removed) = node.labels_removed.take() {
      for label_id in removed {
        target.remove_node_label(node_id, label_id);
      }
    }
    if let Some(props) = node.props.take() {
      for (key_id, value) in props {
        match value {
          Some(value) => target.set_node_prop(node_id, key_id, value),
          None => target.delete_node_prop(node_id, key_id),
        }
      }
    }
  }

  for (src, patches) in newer.out_add.drain() {
    for patch in patches {
      target.add_edge(src, patch.etype, patch.other);
    }
  }
  for (src, patches) in newer.out_del.drain() {
    for patch in patches {
      target.delete_edge(src, patch.etype, patch.other);
    }
  }

  for ((src, etype, dst), props) in newer.edge_props.drain() {
    for (key_id, value) in props {
      match value {
        Some(value) => target.set_edge_prop(src, etype, dst, key_id, value),
        None => target.delete_edge_prop(src, etype, dst, key_id),
      }
    }
  }

  target.key_index.extend(newer.key_index.drain());
  for key in newer.key_index_deleted.drain() {
    target.key_index.remove(&key);
    target.key_index_deleted.insert(key);
  }

  target.pending_vectors.extend(newer.pending_vectors.drain());
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_estimate_matches_built_size() {
    let mut staged = DeltaState::new();
    staged.define_label(1, "Person");
    staged.define_etype(1, "CALLS");
    staged.define_propkey(1, "name");
    staged.create_node(1, Some("a"));
    staged.create_node(2, None);
    staged.add_edge(1, 1, 2);
    staged.set_node_prop(1, 1, PropValue::String("Alice".to_string()));
    staged.set_node_prop(2, 1, PropValue::I64(5));
    staged.delete_node_prop(2, 1);
    staged.add_node_label(1, 1);
    staged.set_edge_prop(1, 1, 2, 1, PropValue::F64(0.5));
    staged
      .pending_vectors
      .insert((1, 1), Some(std::sync::Arc::new(vec![0.6, 0.8])));
    staged.pending_vectors.insert((2, 1), None);

    let estimated = estimate_batch_size(&staged);
    let built = build_batch_bytes(9, &staged);
    assert_eq!(estimated, built.len() as u64);
  }

  #[test]
  fn test_batch_is_deterministic() {
    let mut staged = DeltaState::new();
    staged.create_node(3, Some("c"));
    staged.create_node(1, Some("a"));
    staged.create_node(2, None);
    staged.add_edge(1, 1, 2);
    staged.add_edge(1, 1, 3);

    let a = build_batch_bytes(5, &staged);
    let b = build_batch_bytes(5, &staged);
    assert_eq!(a, b);
  }

  #[test]
  fn test_merge_delta_layers() {
    let mut older = DeltaState::new();
    older.create_node(1, Some("a"));
    older.add_edge(1, 1, 2);

    let mut newer = DeltaState::new();
    newer.delete_edge(1, 1, 2);
    newer.create_node(3, Some("c"));
    newer.delete_node(1);

    merge_delta(&mut older, newer);

    assert!(older.is_node_deleted(1));
    assert!(!older.is_node_created(1));
    assert!(older.is_node_created(3));
    assert!(older.is_edge_deleted(1, 1, 2));
    assert!(older.key_index_deleted.contains("a"));
    assert_eq!(older.key_index.get("c"), Some(&3));
  }
}
