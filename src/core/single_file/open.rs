//! Opening and closing single-file databases.
//!
//! Open parses and validates the header, memory-maps the snapshot, replays
//! the WAL into the delta, and rebuilds the vector stores. A failed header
//! or snapshot checksum fails the open; a truncated WAL tail does not.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use crate::constants::*;
use crate::core::pager::{create_pager, is_valid_page_size, open_pager, pages_to_store};
use crate::core::snapshot::reader::{ParseSnapshotOptions, SnapshotData};
use crate::core::wal::buffer::{WalBuffer, WalRegion};
use crate::error::{HeronError, Result};
use crate::types::*;
use crate::vector::serialize::deserialize_manifest;
use crate::vector::store::{create_vector_store, vector_store_delete, vector_store_insert};
use crate::vector::types::VectorStoreConfig;

use super::recovery::{committed_transactions, scan_region, ReplayContext};
use super::{CheckpointStatus, GroupCommitState, KeyCache, SingleFileDB};

// ============================================================================
// Options
// ============================================================================

/// Durability mode for commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
  /// fsync every commit
  Full,
  /// group commit: one fsync per window
  Normal,
  /// write-through only; the OS decides when bytes hit disk
  Off,
}

/// Options for opening a single-file database.
#[derive(Debug, Clone, Serialize)]
pub struct OpenOptions {
  pub read_only: bool,
  pub create_if_missing: bool,
  /// Only honored when creating; existing files keep their page size.
  pub page_size: usize,
  /// WAL area size in bytes; only honored when creating.
  pub wal_size: usize,
  pub sync_mode: SyncMode,
  pub group_commit: bool,
  pub group_commit_window_ms: u64,
  pub auto_checkpoint: bool,
  /// Active-region usage ratio that triggers a checkpoint.
  pub checkpoint_threshold: f64,
  /// Non-blocking checkpoints (writers continue in the secondary region).
  pub background_checkpoint: bool,
  /// Cache key lookups.
  pub cache_keys: bool,
}

impl Default for OpenOptions {
  fn default() -> Self {
    Self {
      read_only: false,
      create_if_missing: true,
      page_size: DEFAULT_PAGE_SIZE,
      wal_size: WAL_DEFAULT_SIZE,
      sync_mode: SyncMode::Full,
      group_commit: false,
      group_commit_window_ms: 2,
      auto_checkpoint: true,
      checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
      background_checkpoint: true,
      cache_keys: false,
    }
  }
}

impl OpenOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn read_only(mut self, value: bool) -> Self {
    self.read_only = value;
    self
  }

  pub fn create_if_missing(mut self, value: bool) -> Self {
    self.create_if_missing = value;
    self
  }

  pub fn page_size(mut self, value: usize) -> Self {
    self.page_size = value;
    self
  }

  pub fn wal_size(mut self, value: usize) -> Self {
    self.wal_size = value;
    self
  }

  pub fn sync_mode(mut self, value: SyncMode) -> Self {
    self.sync_mode = value;
    self
  }

  pub fn group_commit(mut self, enabled: bool, window_ms: u64) -> Self {
    self.group_commit = enabled;
    self.group_commit_window_ms = window_ms;
    self
  }

  pub fn auto_checkpoint(mut self, value: bool) -> Self {
    self.auto_checkpoint = value;
    self
  }

  pub fn checkpoint_threshold(mut self, value: f64) -> Self {
    self.checkpoint_threshold = value.clamp(0.0, 1.0);
    self
  }

  pub fn background_checkpoint(mut self, value: bool) -> Self {
    self.background_checkpoint = value;
    self
  }

  pub fn cache_keys(mut self, value: bool) -> Self {
    self.cache_keys = value;
    self
  }
}

// ============================================================================
// Open
// ============================================================================

/// Open (or create) a single-file database.
pub fn open_single_file<P: AsRef<Path>>(
  path: P,
  options: OpenOptions,
) -> Result<Arc<SingleFileDB>> {
  let path = path.as_ref();

  if !is_valid_page_size(options.page_size) {
    return Err(HeronError::Internal(format!(
      "invalid page size {}: must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]",
      options.page_size
    )));
  }

  let file_exists = path.exists();
  if !file_exists && !options.create_if_missing {
    return Err(HeronError::InvalidPath(format!(
      "database does not exist at {}",
      path.display()
    )));
  }
  if !file_exists && options.read_only {
    return Err(HeronError::ReadOnly);
  }

  let (mut pager, header, is_new) = if file_exists {
    let pager = open_pager(path, options.page_size, options.read_only)?;
    let header_bytes = pager.read_at(0, DB_HEADER_SIZE)?;
    let header = DbHeader::parse(&header_bytes)?;

    if header.page_size as usize != options.page_size {
      // The file knows its own page size; reopen the pager with it.
      drop(pager);
      let pager = open_pager(path, header.page_size as usize, options.read_only)?;
      (pager, header, false)
    } else {
      (pager, header, false)
    }
  } else {
    let mut pager = create_pager(path, options.page_size)?;
    let wal_page_count = pages_to_store(options.wal_size, options.page_size) as u64;
    if wal_page_count < MIN_WAL_PAGES {
      return Err(HeronError::Internal(format!(
        "WAL size {} too small: minimum is {MIN_WAL_PAGES} pages",
        options.wal_size
      )));
    }

    let header = DbHeader::new(options.page_size as u32, wal_page_count);
    SingleFileDB::write_header_locked(&mut pager, &header)?;
    pager.ensure_pages(1 + wal_page_count)?;
    pager.sync()?;

    (pager, header, true)
  };

  let mut wal = WalBuffer::from_header(&header);

  // Seed the replay context from the snapshot, then roll the WAL forward.
  let mut ctx = ReplayContext::new();
  ctx.next_node_id = ctx.next_node_id.max(header.max_node_id + 1);

  let snapshot = if header.snapshot_page_count > 0 {
    let snapshot_offset = (header.snapshot_start_page * header.page_size as u64) as usize;
    let mmap = Arc::new(pager.mmap()?);
    let snap =
      SnapshotData::parse_at_offset(mmap, snapshot_offset, &ParseSnapshotOptions::default())?;

    for i in 1..=snap.header.num_labels as u32 {
      if let Some(name) = snap.label_name(i) {
        ctx.label_names.insert(name.to_string(), i);
        ctx.label_ids.insert(i, name.to_string());
      }
    }
    for i in 1..=snap.header.num_etypes as u32 {
      if let Some(name) = snap.etype_name(i) {
        ctx.etype_names.insert(name.to_string(), i);
        ctx.etype_ids.insert(i, name.to_string());
      }
    }
    for i in 1..=snap.header.num_propkeys as u32 {
      if let Some(name) = snap.propkey_name(i) {
        ctx.propkey_names.insert(name.to_string(), i);
        ctx.propkey_ids.insert(i, name.to_string());
      }
    }

    ctx.next_node_id = ctx.next_node_id.max(snap.header.max_node_id + 1);
    ctx.next_label_id = ctx.next_label_id.max(snap.header.num_labels as u32 + 1);
    ctx.next_etype_id = ctx.next_etype_id.max(snap.header.num_etypes as u32 + 1);
    ctx.next_propkey_id = ctx.next_propkey_id.max(snap.header.num_propkeys as u32 + 1);

    Some(Arc::new(snap))
  } else {
    None
  };

  // Rebuild vector stores from the snapshot's manifests.
  let mut vector_stores: HashMap<PropKeyId, crate::vector::types::VectorManifest> = HashMap::new();
  if let Some(snap) = snapshot.as_ref() {
    for (prop_key_id, blob) in snap.vector_store_blobs() {
      vector_stores.insert(prop_key_id, deserialize_manifest(blob)?);
    }
  }

  // WAL recovery. The interrupted-checkpoint case replays the secondary
  // region after the primary.
  if !is_new {
    let mut records = scan_region(&pager, &wal, WalRegion::Primary)?;
    if header.checkpoint_in_progress == 1 {
      log::warn!("recovering from an interrupted checkpoint: replaying secondary WAL region");
      records.extend(scan_region(&pager, &wal, WalRegion::Secondary)?);
    }
    for (_txid, group) in committed_transactions(&records) {
      for record in group {
        ctx.replay(record);
      }
    }
  }

  // Apply replayed vector edits to the stores.
  for ((node_id, prop_key_id), operation) in ctx.delta.pending_vectors.drain() {
    match operation {
      Some(vector) => {
        let store = vector_stores.entry(prop_key_id).or_insert_with(|| {
          create_vector_store(VectorStoreConfig::new(vector.len()))
        });
        if let Err(e) = vector_store_insert(store, node_id, vector.as_ref()) {
          log::warn!("dropping replayed vector for node {node_id} (propkey {prop_key_id}): {e}");
        }
      }
      None => {
        if let Some(store) = vector_stores.get_mut(&prop_key_id) {
          vector_store_delete(store, node_id);
        }
      }
    }
  }

  // Replayed node deletes cascade into vectors loaded from the snapshot.
  for &node_id in ctx.delta.deleted_nodes.iter() {
    for store in vector_stores.values_mut() {
      vector_store_delete(store, node_id);
    }
  }

  // An interrupted checkpoint left the secondary region active; fold it
  // back into the primary so the invariants hold before the first commit.
  let mut header = header;
  if header.checkpoint_in_progress == 1 && !options.read_only {
    wal.merge_secondary_into_primary(&mut pager)?;
    header.wal_primary_head = wal.primary_head();
    header.wal_secondary_head = 0;
    header.active_wal_region = 0;
    header.checkpoint_in_progress = 0;
    header.change_counter += 1;
    SingleFileDB::write_header_locked(&mut pager, &header)?;
    pager.sync()?;
  }

  let next_tx_id = header.next_tx_id.max(INITIAL_TX_ID);

  let db = Arc::new(SingleFileDB {
    path: path.to_path_buf(),
    read_only: options.read_only,
    pager: Mutex::new(pager),
    header: RwLock::new(header),
    wal: Mutex::new(wal),
    snapshot: RwLock::new(snapshot),
    delta: RwLock::new(ctx.delta),
    frozen_delta: RwLock::new(None),
    next_node_id: AtomicU64::new(ctx.next_node_id),
    next_label_id: AtomicU32::new(ctx.next_label_id),
    next_etype_id: AtomicU32::new(ctx.next_etype_id),
    next_propkey_id: AtomicU32::new(ctx.next_propkey_id),
    next_tx_id: AtomicU64::new(next_tx_id),
    current_tx: Mutex::new(None),
    commit_lock: Mutex::new(()),
    group_commit_state: Mutex::new(GroupCommitState::default()),
    group_commit_cv: Condvar::new(),
    label_names: RwLock::new(ctx.label_names),
    label_ids: RwLock::new(ctx.label_ids),
    etype_names: RwLock::new(ctx.etype_names),
    etype_ids: RwLock::new(ctx.etype_ids),
    propkey_names: RwLock::new(ctx.propkey_names),
    propkey_ids: RwLock::new(ctx.propkey_ids),
    prop_types: RwLock::new(ctx.prop_types),
    auto_checkpoint: options.auto_checkpoint,
    checkpoint_threshold: options.checkpoint_threshold,
    background_checkpoint: options.background_checkpoint,
    checkpoint_status: Mutex::new(CheckpointStatus::Idle),
    sync_mode: options.sync_mode,
    group_commit_enabled: options.group_commit,
    group_commit_window_ms: options.group_commit_window_ms,
    vector_stores: RwLock::new(vector_stores),
    key_cache: Mutex::new(options.cache_keys.then(KeyCache::default)),
    self_ref: Mutex::new(Weak::new()),
  });

  *db.self_ref.lock() = Arc::downgrade(&db);
  Ok(db)
}

// ============================================================================
// Close
// ============================================================================

/// Flush and close a database handle.
///
/// Waits for a running background checkpoint, flushes the WAL, persists
/// the header, and syncs.
pub fn close_single_file(db: &SingleFileDB) -> Result<()> {
  while db.is_checkpoint_running() {
    std::thread::sleep(std::time::Duration::from_millis(1));
  }

  if db.read_only {
    return Ok(());
  }

  let mut pager = db.pager.lock();
  let mut wal = db.wal.lock();
  wal.flush(&mut pager)?;

  {
    let mut header = db.header.write();
    header.wal_primary_head = wal.primary_head();
    header.wal_secondary_head = wal.secondary_head();
    header.active_wal_region = wal.active_region() as u8;
    header.max_node_id = db.max_assigned_node_id();
    header.next_tx_id = db.next_tx_id.load(std::sync::atomic::Ordering::SeqCst);
    header.change_counter += 1;
    SingleFileDB::write_header_locked(&mut pager, &header)?;
  }

  pager.sync()?;
  Ok(())
}
