//! Single-file database engine (.heron)
//!
//! Layout: `[Header (4KB)] [WAL area (primary + secondary)] [Snapshot]`.
//!
//! Reads merge the memory-mapped snapshot with the in-memory delta; writes
//! stage in a per-transaction overlay, become durable as a framed WAL batch
//! at commit, and land in the base snapshot at the next checkpoint.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::constants::*;
use crate::core::pager::FilePager;
use crate::core::snapshot::reader::SnapshotData;
use crate::core::wal::buffer::WalBuffer;
use crate::error::Result;
use crate::types::*;
use crate::vector::types::VectorManifest;

mod checkpoint;
mod iter;
mod open;
mod read;
mod recovery;
mod schema;
mod transaction;
mod vector;
mod write;

pub use checkpoint::{CheckpointHandle, CheckpointStats, CheckpointStatus};
pub use iter::{FullEdge, NodeIterator};
pub use open::{close_single_file, open_single_file, OpenOptions, SyncMode};
pub use read::NodeView;
pub use vector::{IvfBuildOptions, VectorSearchOptions};

// ============================================================================
// Transaction state
// ============================================================================

/// State of the single open write transaction.
#[derive(Debug)]
pub struct TxState {
  pub txid: TxId,
  /// Thread that opened the transaction; only its reads see the staging.
  pub owner: ThreadId,
  /// Staged mutations, applied to the live delta at commit.
  pub staged: DeltaState,
}

impl TxState {
  fn new(txid: TxId) -> Self {
    Self {
      txid,
      owner: std::thread::current().id(),
      staged: DeltaState::new(),
    }
  }
}

#[derive(Debug, Default)]
pub(crate) struct GroupCommitState {
  pub next_seq: u64,
  pub flushed_seq: u64,
  pub flushing: bool,
  pub last_error_seq: u64,
  pub last_error: Option<String>,
}

/// Bounded key -> NodeId lookup cache.
#[derive(Debug, Default)]
pub(crate) struct KeyCache {
  pub entries: HashMap<String, Option<NodeId>>,
}

impl KeyCache {
  const CAPACITY: usize = 1024;

  pub fn insert(&mut self, key: &str, value: Option<NodeId>) {
    if self.entries.len() >= Self::CAPACITY {
      self.entries.clear();
    }
    self.entries.insert(key.to_string(), value);
  }
}

// ============================================================================
// Database handle
// ============================================================================

/// Single-file database engine.
#[derive(Debug)]
pub struct SingleFileDB {
  pub(crate) path: PathBuf,
  pub(crate) read_only: bool,

  pub(crate) pager: Mutex<FilePager>,
  pub(crate) header: RwLock<DbHeader>,
  pub(crate) wal: Mutex<WalBuffer>,
  /// Memory-mapped snapshot; `Arc` so a checkpoint can swap it while
  /// readers keep their view alive.
  pub(crate) snapshot: RwLock<Option<Arc<SnapshotData>>>,
  /// Committed changes since the snapshot.
  pub(crate) delta: RwLock<DeltaState>,
  /// Delta captured at a background checkpoint's Switch phase; reads
  /// consult it between the live delta and the snapshot until Complete.
  pub(crate) frozen_delta: RwLock<Option<Arc<DeltaState>>>,

  // ID allocators
  pub(crate) next_node_id: AtomicU64,
  pub(crate) next_label_id: AtomicU32,
  pub(crate) next_etype_id: AtomicU32,
  pub(crate) next_propkey_id: AtomicU32,
  pub(crate) next_tx_id: AtomicU64,

  /// The single writer slot.
  pub(crate) current_tx: Mutex<Option<Arc<Mutex<TxState>>>>,
  /// Serializes commits so WAL append order matches delta apply order.
  pub(crate) commit_lock: Mutex<()>,

  pub(crate) group_commit_state: Mutex<GroupCommitState>,
  pub(crate) group_commit_cv: Condvar,

  // Schema registries
  pub(crate) label_names: RwLock<HashMap<String, LabelId>>,
  pub(crate) label_ids: RwLock<HashMap<LabelId, String>>,
  pub(crate) etype_names: RwLock<HashMap<String, ETypeId>>,
  pub(crate) etype_ids: RwLock<HashMap<ETypeId, String>>,
  pub(crate) propkey_names: RwLock<HashMap<String, PropKeyId>>,
  pub(crate) propkey_ids: RwLock<HashMap<PropKeyId, String>>,
  /// Expected value variant per propkey, seeded from replay.
  pub(crate) prop_types: RwLock<HashMap<PropKeyId, PropValueTag>>,

  // Checkpoint configuration
  pub(crate) auto_checkpoint: bool,
  pub(crate) checkpoint_threshold: f64,
  pub(crate) background_checkpoint: bool,
  pub(crate) checkpoint_status: Mutex<CheckpointStatus>,

  // Durability configuration
  pub(crate) sync_mode: SyncMode,
  pub(crate) group_commit_enabled: bool,
  pub(crate) group_commit_window_ms: u64,

  /// Vector stores keyed by propkey.
  pub(crate) vector_stores: RwLock<HashMap<PropKeyId, VectorManifest>>,

  pub(crate) key_cache: Mutex<Option<KeyCache>>,

  /// Weak self-reference so commits can hand the background checkpoint
  /// worker an owning handle.
  pub(crate) self_ref: Mutex<Weak<SingleFileDB>>,
}

impl SingleFileDB {
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  // ==========================================================================
  // ID allocators
  // ==========================================================================

  pub(crate) fn alloc_node_id(&self) -> NodeId {
    self.next_node_id.fetch_add(1, Ordering::SeqCst)
  }

  pub(crate) fn alloc_label_id(&self) -> LabelId {
    self.next_label_id.fetch_add(1, Ordering::SeqCst)
  }

  pub(crate) fn alloc_etype_id(&self) -> ETypeId {
    self.next_etype_id.fetch_add(1, Ordering::SeqCst)
  }

  pub(crate) fn alloc_propkey_id(&self) -> PropKeyId {
    self.next_propkey_id.fetch_add(1, Ordering::SeqCst)
  }

  pub(crate) fn alloc_tx_id(&self) -> TxId {
    self.next_tx_id.fetch_add(1, Ordering::SeqCst)
  }

  /// Current max assigned node id (for header persistence).
  pub(crate) fn max_assigned_node_id(&self) -> NodeId {
    self.next_node_id.load(Ordering::SeqCst).saturating_sub(1)
  }

  // ==========================================================================
  // Key cache
  // ==========================================================================

  pub(crate) fn key_cache_get(&self, key: &str) -> Option<Option<NodeId>> {
    self
      .key_cache
      .lock()
      .as_ref()
      .and_then(|c| c.entries.get(key).copied())
  }

  pub(crate) fn key_cache_put(&self, key: &str, value: Option<NodeId>) {
    if let Some(cache) = self.key_cache.lock().as_mut() {
      cache.insert(key, value);
    }
  }

  pub(crate) fn key_cache_invalidate(&self, key: &str) {
    if let Some(cache) = self.key_cache.lock().as_mut() {
      cache.entries.remove(key);
    }
  }

  pub(crate) fn key_cache_clear(&self) {
    if let Some(cache) = self.key_cache.lock().as_mut() {
      cache.entries.clear();
    }
  }

  // ==========================================================================
  // Stats
  // ==========================================================================

  /// Snapshot/delta/WAL counters.
  pub fn stats(&self) -> DbStats {
    // The WAL mutex is taken alone; never while holding the header lock.
    let wal_stats = self.wal.lock().stats();
    let active_used = if wal_stats.active_region == 0 {
      wal_stats.primary_used
    } else {
      wal_stats.secondary_used
    };
    let recommend_checkpoint = wal_stats.primary_size > 0
      && active_used as f64 / wal_stats.primary_size as f64 >= self.checkpoint_threshold;

    let delta = self.delta.read();
    let snapshot = self.snapshot.read();
    let header = self.header.read();

    let (snapshot_nodes, snapshot_edges, snapshot_max_node_id) = match snapshot.as_ref() {
      Some(snap) => (
        snap.header.num_nodes,
        snap.header.num_edges,
        snap.header.max_node_id,
      ),
      None => (0, 0, 0),
    };

    DbStats {
      snapshot_gen: header.active_snapshot_gen,
      snapshot_nodes,
      snapshot_edges,
      snapshot_max_node_id,
      delta_nodes_created: delta.created_nodes.len(),
      delta_nodes_deleted: delta.deleted_nodes.len(),
      delta_edges_added: delta.total_edges_added(),
      delta_edges_deleted: delta.total_edges_deleted(),
      wal_active_region: wal_stats.active_region,
      wal_used_bytes: wal_stats.primary_used + wal_stats.secondary_used,
      wal_primary_size: wal_stats.primary_size,
      wal_secondary_size: wal_stats.secondary_size,
      checkpoint_in_progress: header.checkpoint_in_progress == 1,
      recommend_checkpoint,
    }
  }

  /// WAL buffer counters.
  pub fn wal_stats(&self) -> crate::core::wal::buffer::WalBufferStats {
    self.wal.lock().stats()
  }

  /// Persist the current header page. Caller decides whether to sync.
  pub(crate) fn write_header_locked(
    pager: &mut FilePager,
    header: &DbHeader,
  ) -> Result<()> {
    let bytes = header.serialize_to_page();
    pager.write_page(0, &bytes)
  }
}

// ============================================================================
// Path helpers
// ============================================================================

/// Does the path use the single-file extension?
pub fn is_single_file_path<P: AsRef<Path>>(path: P) -> bool {
  path
    .as_ref()
    .extension()
    .map(|ext| ext == EXT_HERON)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_is_single_file_path() {
    assert!(is_single_file_path("/tmp/db.heron"));
    assert!(!is_single_file_path("/tmp/db.sqlite"));
    assert!(!is_single_file_path("/tmp/heron"));
  }
}
