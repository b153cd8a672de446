//! Error types for HeronDB.
//!
//! Structured, inspectable errors; recoverable conditions (truncated WAL
//! tail) are handled locally and never surface as panics.

use thiserror::Error;

use crate::types::{NodeId, PropValueTag};

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, HeronError>;

#[derive(Debug, Error)]
pub enum HeronError {
  // ==========================================================================
  // I/O and corruption
  // ==========================================================================
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Invalid magic: expected {expected:#010x}, got {got:#010x}")]
  InvalidMagic { expected: u32, got: u32 },

  #[error("Invalid file magic")]
  InvalidFileMagic,

  #[error("Version mismatch: file requires reader version {required}, this build supports {supported}")]
  VersionMismatch { required: u32, supported: u32 },

  #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
  CrcMismatch { stored: u32, computed: u32 },

  #[error("Corrupted header: {0}")]
  InvalidHeader(String),

  #[error("Corrupted snapshot: {0}")]
  InvalidSnapshot(String),

  #[error("Corrupted WAL record at offset {offset}: {reason}")]
  CorruptWalRecord { offset: u64, reason: String },

  /// CRC/length failure at the end of the WAL scan. Recovery keeps what
  /// precedes it and discards the rest; never fatal at open.
  #[error("Truncated WAL tail at offset {offset}")]
  TruncatedWalTail { offset: u64 },

  // ==========================================================================
  // Schema
  // ==========================================================================
  #[error("Vector dimension mismatch: expected {expected}, got {got}")]
  VectorDimensionMismatch { expected: usize, got: usize },

  #[error("Property type mismatch for key {key_id}: expected {expected:?}, got {got:?}")]
  PropTypeMismatch {
    key_id: u32,
    expected: PropValueTag,
    got: PropValueTag,
  },

  #[error("Unknown property key: {0}")]
  UnknownPropKey(String),

  #[error("Unknown edge type: {0}")]
  UnknownEtype(String),

  // ==========================================================================
  // Not found
  // ==========================================================================
  #[error("Node not found: {0}")]
  NodeNotFound(NodeId),

  #[error("No node with key: {0}")]
  KeyNotFound(String),

  #[error("Edge not found: {src} -[{etype}]-> {dst}")]
  EdgeNotFound { src: NodeId, etype: u32, dst: NodeId },

  // ==========================================================================
  // Invariant violations
  // ==========================================================================
  #[error("Duplicate node key: {0}")]
  DuplicateKey(String),

  #[error("Self edges are not allowed: node {0}")]
  SelfEdge(NodeId),

  #[error("Edge endpoint missing: node {0}")]
  EdgeEndpointMissing(NodeId),

  // ==========================================================================
  // Access / concurrency
  // ==========================================================================
  #[error("Database is read-only")]
  ReadOnly,

  #[error("A transaction is already in progress")]
  TransactionInProgress,

  #[error("No active transaction")]
  NoTransaction,

  #[error("A checkpoint is already running")]
  CheckpointInProgress,

  // ==========================================================================
  // Capacity
  // ==========================================================================
  #[error("WAL region full: need {needed} bytes, {available} available")]
  WalFull { needed: u64, available: u64 },

  #[error("Out of space: {0}")]
  OutOfSpace(String),

  // ==========================================================================
  // Validation
  // ==========================================================================
  #[error("Invalid vector: {0}")]
  InvalidVector(String),

  #[error("Index is not trained")]
  IndexNotTrained,

  #[error("Not enough training vectors: {n} < {k} clusters")]
  NotEnoughTrainingVectors { n: usize, k: usize },

  #[error("Empty query set")]
  EmptyQuerySet,

  #[error("Invalid path: {0}")]
  InvalidPath(String),

  #[error("Internal error: {0}")]
  Internal(String),
}

impl HeronError {
  /// Corruption errors are fatal at open; anything else either fails the
  /// single operation or is handled locally.
  pub fn is_corruption(&self) -> bool {
    matches!(
      self,
      HeronError::InvalidMagic { .. }
        | HeronError::InvalidFileMagic
        | HeronError::VersionMismatch { .. }
        | HeronError::CrcMismatch { .. }
        | HeronError::InvalidHeader(_)
        | HeronError::InvalidSnapshot(_)
        | HeronError::CorruptWalRecord { .. }
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_corruption_classification() {
    assert!(HeronError::InvalidFileMagic.is_corruption());
    assert!(HeronError::CrcMismatch {
      stored: 1,
      computed: 2
    }
    .is_corruption());
    assert!(!HeronError::ReadOnly.is_corruption());
    assert!(!HeronError::TruncatedWalTail { offset: 0 }.is_corruption());
  }

  #[test]
  fn test_display_contains_context() {
    let err = HeronError::WalFull {
      needed: 128,
      available: 64,
    };
    let msg = err.to_string();
    assert!(msg.contains("128"));
    assert!(msg.contains("64"));
  }
}
