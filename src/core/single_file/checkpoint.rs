//! Checkpointing: merge `snapshot + delta` into a new snapshot and clear
//! the WAL.
//!
//! Two variants share the same build path. The blocking variant holds the
//! commit lock for its whole duration. The background variant runs in four
//! phases: **Switch** (redirect writers to the secondary WAL region and
//! freeze the delta), **Build** (serialize the new snapshot off-lock),
//! **Write** (write pages and sync), **Complete** (a short exclusive phase
//! that folds the secondary region into the primary, publishes the new
//! header, remaps, and drops the frozen delta).
//!
//! New snapshots are appended after the current allocation and the old
//! pages are only marked free, so readers still holding the old mapping
//! stay consistent; `vacuum()` reclaims the space offline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver};
use serde::Serialize;

use crate::core::pager::pages_to_store;
use crate::core::snapshot::reader::{ParseSnapshotOptions, SnapshotData};
use crate::core::snapshot::writer::{
  build_snapshot_to_memory, EdgeData, NodeData, SnapshotBuildInput,
};
use crate::error::{HeronError, Result};
use crate::types::*;
use crate::vector::types::VectorManifest;

use super::transaction::merge_delta;
use super::SingleFileDB;

/// Pages written per pager lock acquisition during the Write phase, so
/// commits can interleave with the snapshot write.
const WRITE_CHUNK_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Status and stats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
  Idle,
  /// Background checkpoint building/writing; commits go to the secondary
  /// WAL region.
  Running,
  /// Brief exclusive finish.
  Completing,
}

/// Counters from a finished checkpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckpointStats {
  pub num_nodes: u64,
  pub num_edges: u64,
  pub generation: u64,
  pub duration_ms: u64,
}

/// Completion handle for a background checkpoint.
pub struct CheckpointHandle {
  receiver: Receiver<Result<CheckpointStats>>,
}

impl CheckpointHandle {
  /// Block until the checkpoint finishes.
  pub fn wait(self) -> Result<CheckpointStats> {
    self
      .receiver
      .recv()
      .map_err(|_| HeronError::Internal("checkpoint worker vanished".to_string()))?
  }
}

// ============================================================================
// Engine entry points
// ============================================================================

impl SingleFileDB {
  pub fn is_checkpoint_running(&self) -> bool {
    *self.checkpoint_status.lock() != CheckpointStatus::Idle
  }

  /// Would the active WAL region cross the threshold after `pending_bytes`
  /// more are appended? Usage is scoped to the active region.
  pub fn should_checkpoint(&self, pending_bytes: u64) -> bool {
    let wal = self.wal.lock();
    let primary = wal.primary_region_size();
    if primary == 0 {
      return false;
    }
    (wal.active_used() + pending_bytes) as f64 / primary as f64 >= self.checkpoint_threshold
  }

  /// Synchronous checkpoint. Pauses writers for its duration.
  pub fn checkpoint(&self) -> Result<CheckpointStats> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }

    // Wait out any background checkpoint, then claim the slot.
    loop {
      let mut status = self.checkpoint_status.lock();
      if *status == CheckpointStatus::Idle {
        *status = CheckpointStatus::Running;
        break;
      }
      drop(status);
      std::thread::sleep(std::time::Duration::from_millis(1));
    }

    let result = self.checkpoint_blocking_inner();
    *self.checkpoint_status.lock() = CheckpointStatus::Idle;
    result
  }

  /// `optimize()`: the spec-facing name for a synchronous checkpoint.
  pub fn optimize(&self) -> Result<CheckpointStats> {
    self.checkpoint()
  }

  fn checkpoint_blocking_inner(&self) -> Result<CheckpointStats> {
    let started = Instant::now();
    let _commit_guard = self.commit_lock.lock();

    let (buffer, num_nodes, num_edges, new_gen) = {
      let snapshot_guard = self.snapshot.read();
      let delta = self.delta.read();
      let vector_stores = self.vector_stores.read().clone();
      let new_gen = self.header.read().active_snapshot_gen + 1;

      let input = collect_graph_data(
        snapshot_guard.as_deref(),
        &delta,
        vector_stores,
        new_gen,
      );
      let num_nodes = input.nodes.len() as u64;
      let num_edges = input.edges.len() as u64;
      (build_snapshot_to_memory(input)?, num_nodes, num_edges, new_gen)
    };

    let (new_start, new_count) = self.write_snapshot_buffer(&buffer)?;

    {
      let mut pager = self.pager.lock();
      let mut wal = self.wal.lock();
      let mut header = self.header.write();

      let old_start = header.snapshot_start_page;
      let old_count = header.snapshot_page_count;

      wal.flush(&mut pager)?;
      wal.reset();

      header.active_snapshot_gen = new_gen;
      header.snapshot_start_page = new_start;
      header.snapshot_page_count = new_count;
      header.db_size_pages = new_start + new_count;
      header.wal_primary_head = 0;
      header.wal_secondary_head = 0;
      header.active_wal_region = 0;
      header.checkpoint_in_progress = 0;
      header.max_node_id = self.max_assigned_node_id();
      header.next_tx_id = self.next_tx_id.load(std::sync::atomic::Ordering::SeqCst);
      header.change_counter += 1;

      Self::write_header_locked(&mut pager, &header)?;
      pager.sync()?;

      let snapshot_offset = (new_start * header.page_size as u64) as usize;
      let mmap = Arc::new(pager.mmap()?);
      let snap = SnapshotData::parse_at_offset(
        mmap,
        snapshot_offset,
        &ParseSnapshotOptions {
          skip_crc_validation: true,
        },
      )?;
      *self.snapshot.write() = Some(Arc::new(snap));

      if old_count > 0 {
        pager.free_pages(old_start, old_count);
      }
    }

    self.delta.write().clear();
    self.key_cache_clear();

    Ok(CheckpointStats {
      num_nodes,
      num_edges,
      generation: new_gen,
      duration_ms: started.elapsed().as_millis() as u64,
    })
  }

  /// Start a background checkpoint. The Switch phase runs on the calling
  /// thread; Build/Write/Complete run on a worker. Returns a handle that
  /// resolves when the checkpoint finishes.
  pub fn start_background_checkpoint(&self) -> Result<CheckpointHandle> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }

    // The worker needs an owning handle; `open` stores a weak one.
    let db = self
      .self_ref
      .lock()
      .upgrade()
      .ok_or_else(|| HeronError::Internal("engine handle already dropped".to_string()))?;

    {
      let mut status = self.checkpoint_status.lock();
      if *status != CheckpointStatus::Idle {
        return Err(HeronError::CheckpointInProgress);
      }
      *status = CheckpointStatus::Running;
    }

    // Phase 1: Switch, under the commit lock so the WAL redirect and the
    // delta freeze observe the same set of commits. New commits land in
    // the secondary region from the moment the header below is durable.
    let switch_result: Result<(
      Option<Arc<SnapshotData>>,
      Arc<DeltaState>,
      hashbrown::HashMap<PropKeyId, VectorManifest>,
      u64,
    )> = (|| {
      let _commit_guard = self.commit_lock.lock();

      {
        let mut pager = self.pager.lock();
        let mut wal = self.wal.lock();
        wal.flush(&mut pager)?;
        wal.switch_to_secondary();

        let mut header = self.header.write();
        header.active_wal_region = 1;
        header.checkpoint_in_progress = 1;
        header.wal_primary_head = wal.primary_head();
        header.wal_secondary_head = wal.secondary_head();
        header.change_counter += 1;
        Self::write_header_locked(&mut pager, &header)?;
        pager.sync()?;
      }

      let frozen = Arc::new(std::mem::take(&mut *self.delta.write()));
      *self.frozen_delta.write() = Some(Arc::clone(&frozen));

      let snapshot = self.snapshot.read().clone();
      let vector_stores = self.vector_stores.read().clone();
      let new_gen = self.header.read().active_snapshot_gen + 1;
      Ok((snapshot, frozen, vector_stores, new_gen))
    })();

    let (snapshot, frozen, vector_stores, new_gen) = match switch_result {
      Ok(captured) => captured,
      Err(e) => {
        // Switch failed before anything was frozen; fall back to primary.
        let mut wal = self.wal.lock();
        wal.switch_to_primary();
        *self.checkpoint_status.lock() = CheckpointStatus::Idle;
        return Err(e);
      }
    };

    let (sender, receiver) = bounded(1);
    let spawned = std::thread::Builder::new()
      .name("heron-checkpoint".to_string())
      .spawn(move || {
        let result = db.run_background_phases(snapshot, frozen, vector_stores, new_gen);
        if let Err(e) = &result {
          log::error!("background checkpoint failed: {e}");
          db.recover_failed_background_checkpoint();
        }
        *db.checkpoint_status.lock() = CheckpointStatus::Idle;
        let _ = sender.send(result);
      });

    if let Err(e) = spawned {
      self.recover_failed_background_checkpoint();
      *self.checkpoint_status.lock() = CheckpointStatus::Idle;
      return Err(HeronError::Internal(format!(
        "failed to spawn checkpoint worker: {e}"
      )));
    }

    Ok(CheckpointHandle { receiver })
  }

  /// Phases 2-4 on the worker thread.
  fn run_background_phases(
    &self,
    snapshot: Option<Arc<SnapshotData>>,
    frozen: Arc<DeltaState>,
    vector_stores: hashbrown::HashMap<PropKeyId, VectorManifest>,
    new_gen: u64,
  ) -> Result<CheckpointStats> {
    let started = Instant::now();

    // Phase 2: Build, off-lock. Commits keep flowing into the secondary
    // region and the (fresh) live delta.
    let input = collect_graph_data(snapshot.as_deref(), &frozen, vector_stores, new_gen);
    let num_nodes = input.nodes.len() as u64;
    let num_edges = input.edges.len() as u64;
    let buffer = build_snapshot_to_memory(input)?;
    drop(snapshot);

    // Phase 3: Write.
    let (new_start, new_count) = self.write_snapshot_buffer(&buffer)?;

    // Phase 4: Complete. Short exclusive section: merge the secondary
    // region (at its *current* head, so commits that raced the build are
    // preserved), publish the header, remap, drop the frozen delta.
    {
      *self.checkpoint_status.lock() = CheckpointStatus::Completing;
      let _commit_guard = self.commit_lock.lock();
      let mut pager = self.pager.lock();
      let mut wal = self.wal.lock();

      wal.merge_secondary_into_primary(&mut pager)?;

      let mut header = self.header.write();
      let old_start = header.snapshot_start_page;
      let old_count = header.snapshot_page_count;

      header.active_snapshot_gen = new_gen;
      header.snapshot_start_page = new_start;
      header.snapshot_page_count = new_count;
      header.db_size_pages = new_start + new_count;
      header.wal_primary_head = wal.primary_head();
      header.wal_secondary_head = 0;
      header.active_wal_region = 0;
      header.checkpoint_in_progress = 0;
      header.max_node_id = self.max_assigned_node_id();
      header.next_tx_id = self.next_tx_id.load(std::sync::atomic::Ordering::SeqCst);
      header.change_counter += 1;

      Self::write_header_locked(&mut pager, &header)?;
      pager.sync()?;

      let snapshot_offset = (new_start * header.page_size as u64) as usize;
      let mmap = Arc::new(pager.mmap()?);
      let snap = SnapshotData::parse_at_offset(
        mmap,
        snapshot_offset,
        &ParseSnapshotOptions {
          skip_crc_validation: true,
        },
      )?;
      *self.snapshot.write() = Some(Arc::new(snap));

      if old_count > 0 {
        pager.free_pages(old_start, old_count);
      }

      *self.frozen_delta.write() = None;
    }

    self.key_cache_clear();

    Ok(CheckpointStats {
      num_nodes,
      num_edges,
      generation: new_gen,
      duration_ms: started.elapsed().as_millis() as u64,
    })
  }

  /// Best-effort rollback after a failed Build/Write: fold the secondary
  /// region back into the primary, restore the frozen delta underneath the
  /// live one, and keep the old snapshot. The database stays valid; on a
  /// crash instead, recovery replays both regions.
  fn recover_failed_background_checkpoint(&self) {
    let _commit_guard = self.commit_lock.lock();

    {
      let mut pager = self.pager.lock();
      let mut wal = self.wal.lock();
      if let Err(e) = wal.merge_secondary_into_primary(&mut pager) {
        log::error!("could not merge secondary WAL after failed checkpoint: {e}");
        return;
      }

      let mut header = self.header.write();
      header.wal_primary_head = wal.primary_head();
      header.wal_secondary_head = 0;
      header.active_wal_region = 0;
      header.checkpoint_in_progress = 0;
      header.change_counter += 1;
      if let Err(e) =
        Self::write_header_locked(&mut pager, &header).and_then(|_| pager.sync())
      {
        log::error!("could not persist header after failed checkpoint: {e}");
        return;
      }
    }

    let frozen = self.frozen_delta.write().take();
    if let Some(frozen) = frozen {
      let mut live = self.delta.write();
      let newer = std::mem::take(&mut *live);
      let mut combined = (*frozen).clone();
      merge_delta(&mut combined, newer);
      *live = combined;
    }
  }

  /// Write a snapshot buffer after the current allocation (never over the
  /// old snapshot, which readers may still be mapping). Returns
  /// `(start_page, page_count)`.
  fn write_snapshot_buffer(&self, buffer: &[u8]) -> Result<(u64, u64)> {
    let (page_size, wal_end) = {
      let header = self.header.read();
      (header.page_size as usize, header.wal_end_page())
    };
    let page_count = pages_to_store(buffer.len(), page_size) as u64;

    let start_page = {
      let mut pager = self.pager.lock();
      let start_page = pager.num_pages().max(wal_end);
      pager.ensure_pages(start_page + page_count)?;
      start_page
    };

    // Chunked writes: the pager lock is released between chunks so
    // commits can interleave.
    let mut written = 0usize;
    while written < buffer.len() {
      let end = (written + WRITE_CHUNK_BYTES).min(buffer.len());
      let offset = start_page * page_size as u64 + written as u64;
      self.pager.lock().write_at(offset, &buffer[written..end])?;
      written = end;
    }

    self.pager.lock().sync()?;
    Ok((start_page, page_count))
  }

  // ==========================================================================
  // Vacuum
  // ==========================================================================

  /// Reclaim free pages by moving the snapshot down to the first page
  /// after the WAL area and truncating. Offline: no open transaction and
  /// no running checkpoint.
  pub fn vacuum(&self) -> Result<()> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }
    if self.has_transaction() {
      return Err(HeronError::TransactionInProgress);
    }
    if self.is_checkpoint_running() {
      return Err(HeronError::CheckpointInProgress);
    }

    let _commit_guard = self.commit_lock.lock();
    let mut pager = self.pager.lock();
    let mut header = self.header.write();

    if header.snapshot_page_count == 0 {
      let target = header.wal_end_page();
      if pager.num_pages() > target {
        pager.truncate_pages(target)?;
        header.db_size_pages = target;
        header.change_counter += 1;
        Self::write_header_locked(&mut pager, &header)?;
        pager.sync()?;
      }
      return Ok(());
    }

    let target_start = header.wal_end_page();
    if header.snapshot_start_page != target_start {
      let page_size = header.page_size as u64;
      let bytes = pager.read_at(
        header.snapshot_start_page * page_size,
        (header.snapshot_page_count * page_size) as usize,
      )?;
      pager.write_at(target_start * page_size, &bytes)?;
      pager.sync()?;
      header.snapshot_start_page = target_start;
    }

    header.db_size_pages = header.snapshot_start_page + header.snapshot_page_count;
    header.change_counter += 1;
    Self::write_header_locked(&mut pager, &header)?;
    pager.sync()?;

    // Remap over the moved snapshot before shrinking the file, so the
    // live mapping never covers truncated pages.
    let snapshot_offset = (header.snapshot_start_page * header.page_size as u64) as usize;
    let mmap = Arc::new(pager.mmap()?);
    let snap = SnapshotData::parse_at_offset(
      mmap,
      snapshot_offset,
      &ParseSnapshotOptions {
        skip_crc_validation: true,
      },
    )?;
    *self.snapshot.write() = Some(Arc::new(snap));

    pager.truncate_pages(header.db_size_pages)?;

    Ok(())
  }
}

// ============================================================================
// Build input collection
// ============================================================================

/// Materialize the merged `(snapshot + delta)` logical view as builder
/// input. Deterministic for a given snapshot generation and delta.
fn collect_graph_data(
  snapshot: Option<&SnapshotData>,
  delta: &DeltaState,
  vector_stores: hashbrown::HashMap<PropKeyId, VectorManifest>,
  generation: u64,
) -> SnapshotBuildInput {
  // Name tables: snapshot names plus delta definitions.
  let mut labels: HashMap<LabelId, String> = HashMap::new();
  let mut etypes: HashMap<ETypeId, String> = HashMap::new();
  let mut propkeys: HashMap<PropKeyId, String> = HashMap::new();
  if let Some(snap) = snapshot {
    for i in 1..=snap.header.num_labels as u32 {
      if let Some(name) = snap.label_name(i) {
        labels.insert(i, name.to_string());
      }
    }
    for i in 1..=snap.header.num_etypes as u32 {
      if let Some(name) = snap.etype_name(i) {
        etypes.insert(i, name.to_string());
      }
    }
    for i in 1..=snap.header.num_propkeys as u32 {
      if let Some(name) = snap.propkey_name(i) {
        propkeys.insert(i, name.to_string());
      }
    }
  }
  labels.extend(delta.new_labels.iter().map(|(&id, n)| (id, n.clone())));
  etypes.extend(delta.new_etypes.iter().map(|(&id, n)| (id, n.clone())));
  propkeys.extend(delta.new_propkeys.iter().map(|(&id, n)| (id, n.clone())));

  let node_alive = |node_id: NodeId| -> bool {
    if delta.is_node_deleted(node_id) {
      return false;
    }
    if delta.is_node_created(node_id) {
      return true;
    }
    snapshot.is_some_and(|s| s.has_node(node_id))
  };

  // Nodes: surviving snapshot nodes with delta edits applied, then nodes
  // created in the delta.
  let mut nodes: Vec<NodeData> = Vec::new();

  if let Some(snap) = snapshot {
    for phys in 0..snap.header.num_nodes as PhysNode {
      let Some(node_id) = snap.node_id(phys) else {
        continue;
      };
      if delta.is_node_deleted(node_id) {
        continue;
      }

      let mut node_labels = snap.node_labels(phys).unwrap_or_default();
      let mut props: std::collections::HashMap<PropKeyId, PropValue> =
        snap.node_props(phys).unwrap_or_default();

      if let Some(edit) = delta.node_delta(node_id) {
        if let Some(removed) = edit.labels_removed.as_ref() {
          node_labels.retain(|l| !removed.contains(l));
        }
        if let Some(added) = edit.labels.as_ref() {
          for &label_id in added {
            if !node_labels.contains(&label_id) {
              node_labels.push(label_id);
            }
          }
        }
        if let Some(prop_edits) = edit.props.as_ref() {
          for (&key_id, value) in prop_edits {
            match value {
              Some(v) => {
                props.insert(key_id, v.clone());
              }
              None => {
                props.remove(&key_id);
              }
            }
          }
        }
      }

      nodes.push(NodeData {
        node_id,
        key: snap.node_key(phys),
        labels: node_labels,
        props,
      });
    }
  }

  for (&node_id, edit) in &delta.created_nodes {
    if delta.is_node_deleted(node_id) {
      continue;
    }
    let mut node_labels = edit.labels.clone().unwrap_or_default();
    if let Some(removed) = edit.labels_removed.as_ref() {
      node_labels.retain(|l| !removed.contains(l));
    }
    let props: std::collections::HashMap<PropKeyId, PropValue> = edit
      .props
      .as_ref()
      .map(|m| {
        m.iter()
          .filter_map(|(&k, v)| v.as_ref().map(|v| (k, v.clone())))
          .collect()
      })
      .unwrap_or_default();

    nodes.push(NodeData {
      node_id,
      key: edit.key.clone(),
      labels: node_labels,
      props,
    });
  }

  // Edges: surviving snapshot edges, then delta additions, deduplicated.
  let mut edges: Vec<EdgeData> = Vec::new();
  let mut seen: hashbrown::HashSet<(NodeId, ETypeId, NodeId)> = hashbrown::HashSet::new();

  let merged_edge_props = |snap_props: Option<std::collections::HashMap<PropKeyId, PropValue>>,
                           src: NodeId,
                           etype: ETypeId,
                           dst: NodeId|
   -> std::collections::HashMap<PropKeyId, PropValue> {
    let mut props = snap_props.unwrap_or_default();
    if let Some(edits) = delta.edge_props_delta(src, etype, dst) {
      for (&key_id, value) in edits {
        match value {
          Some(v) => {
            props.insert(key_id, v.clone());
          }
          None => {
            props.remove(&key_id);
          }
        }
      }
    }
    props
  };

  if let Some(snap) = snapshot {
    for phys in 0..snap.header.num_nodes as PhysNode {
      let Some(src) = snap.node_id(phys) else {
        continue;
      };
      if !node_alive(src) {
        continue;
      }
      for (dst_phys, etype) in snap.iter_out_edges(phys) {
        let Some(dst) = snap.node_id(dst_phys) else {
          continue;
        };
        if !node_alive(dst) || delta.is_edge_deleted(src, etype, dst) {
          continue;
        }
        if !seen.insert((src, etype, dst)) {
          continue;
        }
        let snap_props = snap
          .find_edge_index(phys, etype, dst_phys)
          .and_then(|idx| snap.edge_props(idx));
        edges.push(EdgeData {
          src,
          etype,
          dst,
          props: merged_edge_props(snap_props, src, etype, dst),
        });
      }
    }
  }

  for (&src, patches) in &delta.out_add {
    if !node_alive(src) {
      continue;
    }
    for patch in patches {
      if !node_alive(patch.other) {
        continue;
      }
      if !seen.insert((src, patch.etype, patch.other)) {
        continue;
      }
      edges.push(EdgeData {
        src,
        etype: patch.etype,
        dst: patch.other,
        props: merged_edge_props(None, src, patch.etype, patch.other),
      });
    }
  }

  SnapshotBuildInput {
    generation,
    nodes,
    edges,
    labels: labels.into_iter().collect(),
    etypes: etypes.into_iter().collect(),
    propkeys: propkeys.into_iter().collect(),
    vector_stores: vector_stores.into_iter().collect(),
  }
}
