//! Magic numbers and format constants for HeronDB.

use crate::types::NodeId;

// ============================================================================
// Magic bytes
// ============================================================================

/// Single-file magic: "HeronDB format 1" (16 bytes)
pub const MAGIC_HERONDB: [u8; 16] = [
  0x48, 0x65, 0x72, 0x6f, 0x6e, 0x44, 0x42, 0x20, // "HeronDB "
  0x66, 0x6f, 0x72, 0x6d, 0x61, 0x74, 0x20, 0x31, // "format 1"
];

/// Snapshot magic: "HSN1" (little-endian u32)
pub const MAGIC_SNAPSHOT: u32 = 0x314e5348;

/// Vector manifest magic: "HVM1" (little-endian u32)
pub const MAGIC_VECTOR_MANIFEST: u32 = 0x314d5648;

// ============================================================================
// Versions
// ============================================================================

pub const VERSION_SINGLE_FILE: u32 = 1;
pub const MIN_READER_SINGLE_FILE: u32 = 1;

pub const VERSION_SNAPSHOT: u32 = 1;
pub const MIN_READER_SNAPSHOT: u32 = 1;

pub const VERSION_VECTOR_MANIFEST: u32 = 1;

// ============================================================================
// Alignment
// ============================================================================

/// 64-byte section alignment for mmap friendliness
pub const SECTION_ALIGNMENT: usize = 64;
/// 8-byte alignment for WAL frames
pub const WAL_RECORD_ALIGNMENT: usize = 8;

// ============================================================================
// Single-file format
// ============================================================================

/// Single-file extension
pub const EXT_HERON: &str = "heron";

/// Default page size (4KB, matches OS pages and SSD blocks)
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 65536;

/// Database header occupies the first page regardless of page size
pub const DB_HEADER_SIZE: usize = 4096;

/// Default WAL area size (64MB)
pub const WAL_DEFAULT_SIZE: usize = 64 * 1024 * 1024;

/// Fraction of the WAL area given to the primary region
pub const WAL_PRIMARY_FRACTION: f64 = 0.75;

/// Minimum WAL pages to keep after a vacuum (64KB at 4KB pages)
pub const MIN_WAL_PAGES: u64 = 16;

// ============================================================================
// WAL framing
// ============================================================================

/// Fixed frame header: len(4) + type(1) + flags(1) + reserved(2) + txid(8) + payload_len(4)
pub const WAL_FRAME_HEADER_SIZE: usize = 20;

// ============================================================================
// Snapshot format
// ============================================================================

/// Snapshot header size (fields + padding, before the section table)
pub const SNAPSHOT_HEADER_SIZE: usize = 96;

/// Section table entry: offset(8) + length(8) + crc(4) + reserved(4)
pub const SECTION_ENTRY_SIZE: usize = 24;

/// Key index entry: hash64(8) + string_id(4) + pad(4) + node_id(8)
pub const KEY_INDEX_ENTRY_SIZE: usize = 24;

/// Property value disk encoding: tag(1) + pad(7) + payload(8)
pub const PROP_VALUE_DISK_SIZE: usize = 16;

// ============================================================================
// Checkpoint defaults
// ============================================================================

pub const DEFAULT_CHECKPOINT_THRESHOLD: f64 = 0.75;

// ============================================================================
// Vector store defaults
// ============================================================================

/// Vectors per row group
pub const DEFAULT_ROW_GROUP_SIZE: usize = 1024;

/// Vectors per fragment before it is sealed
pub const DEFAULT_FRAGMENT_TARGET_SIZE: usize = 65536;

/// Sealed fragments above this deletion ratio are eligible for compaction
pub const DEFAULT_COMPACTION_MIN_DELETED_RATIO: f64 = 0.2;

/// PQ codebook size (codes are u8)
pub const PQ_DEFAULT_CENTROIDS: usize = 256;

// ============================================================================
// Initial IDs (start from 1, 0 is reserved/null)
// ============================================================================

pub const INITIAL_NODE_ID: NodeId = 1;
pub const INITIAL_LABEL_ID: u32 = 1;
pub const INITIAL_ETYPE_ID: u32 = 1;
pub const INITIAL_PROPKEY_ID: u32 = 1;
pub const INITIAL_TX_ID: u64 = 1;

/// Snapshot generation starts at 1 (0 means no snapshot)
pub const INITIAL_SNAPSHOT_GEN: u64 = 0;
