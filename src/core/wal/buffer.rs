//! Dual-region WAL buffer.
//!
//! The WAL area is a fixed reserved byte range after the header page:
//! 75% primary region, 25% secondary. Writers append framed records at the
//! active region's head; the checkpoint engine redirects writers to the
//! secondary region while it rebuilds the snapshot, then merges the
//! secondary bytes back after the primary head.
//!
//! Appends are buffered in memory and written through the pager on
//! `flush`; fsync policy is owned by the commit path.

use serde::Serialize;

use crate::constants::{WAL_PRIMARY_FRACTION, WAL_RECORD_ALIGNMENT};
use crate::core::pager::FilePager;
use crate::core::wal::record::WalRecord;
use crate::error::{HeronError, Result};
use crate::types::DbHeader;

/// WAL region selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRegion {
  Primary = 0,
  Secondary = 1,
}

impl WalRegion {
  pub fn from_u8(v: u8) -> Self {
    if v == 1 {
      WalRegion::Secondary
    } else {
      WalRegion::Primary
    }
  }
}

/// WAL usage counters for `stats()`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WalBufferStats {
  pub primary_used: u64,
  pub secondary_used: u64,
  pub primary_size: u64,
  pub secondary_size: u64,
  pub active_region: u8,
}

#[derive(Debug)]
pub struct WalBuffer {
  /// Absolute byte offset of the WAL area (start of the primary region).
  area_start: u64,
  primary_size: u64,
  secondary_size: u64,
  primary_head: u64,
  secondary_head: u64,
  active: WalRegion,
  /// Appended but not yet written through: (absolute offset, bytes).
  pending: Vec<(u64, Vec<u8>)>,
}

/// Split a WAL area into primary/secondary region sizes (8-byte aligned).
pub fn split_wal_area(area_bytes: u64) -> (u64, u64) {
  let primary = ((area_bytes as f64 * WAL_PRIMARY_FRACTION) as u64) & !(WAL_RECORD_ALIGNMENT as u64 - 1);
  (primary, area_bytes - primary)
}

impl WalBuffer {
  /// Rebuild buffer state from a parsed header.
  pub fn from_header(header: &DbHeader) -> Self {
    let area_start = header.wal_start_page * header.page_size as u64;
    let area_bytes = header.wal_page_count * header.page_size as u64;
    let (primary_size, secondary_size) = split_wal_area(area_bytes);

    Self {
      area_start,
      primary_size,
      secondary_size,
      primary_head: header.wal_primary_head,
      secondary_head: header.wal_secondary_head,
      active: WalRegion::from_u8(header.active_wal_region),
      pending: Vec::new(),
    }
  }

  // ==========================================================================
  // Geometry
  // ==========================================================================

  pub fn primary_region_size(&self) -> u64 {
    self.primary_size
  }

  pub fn secondary_region_size(&self) -> u64 {
    self.secondary_size
  }

  /// Absolute byte offset of a region's start.
  pub fn region_start(&self, region: WalRegion) -> u64 {
    match region {
      WalRegion::Primary => self.area_start,
      WalRegion::Secondary => self.area_start + self.primary_size,
    }
  }

  pub fn region_size(&self, region: WalRegion) -> u64 {
    match region {
      WalRegion::Primary => self.primary_size,
      WalRegion::Secondary => self.secondary_size,
    }
  }

  pub fn region_head(&self, region: WalRegion) -> u64 {
    match region {
      WalRegion::Primary => self.primary_head,
      WalRegion::Secondary => self.secondary_head,
    }
  }

  pub fn primary_head(&self) -> u64 {
    self.primary_head
  }

  pub fn secondary_head(&self) -> u64 {
    self.secondary_head
  }

  pub fn active_region(&self) -> WalRegion {
    self.active
  }

  /// Bytes used across both regions.
  pub fn used_space(&self) -> u64 {
    self.primary_head + self.secondary_head
  }

  /// Bytes used in the active region only. The auto-checkpoint threshold
  /// is evaluated against this, not `used_space`.
  pub fn active_used(&self) -> u64 {
    self.region_head(self.active)
  }

  pub fn stats(&self) -> WalBufferStats {
    WalBufferStats {
      primary_used: self.primary_head,
      secondary_used: self.secondary_head,
      primary_size: self.primary_size,
      secondary_size: self.secondary_size,
      active_region: self.active as u8,
    }
  }

  // ==========================================================================
  // Region control
  // ==========================================================================

  pub fn switch_to_secondary(&mut self) {
    self.active = WalRegion::Secondary;
  }

  pub fn switch_to_primary(&mut self) {
    self.active = WalRegion::Primary;
  }

  /// Reset both regions to empty (after a checkpoint captured them).
  pub fn reset(&mut self) {
    self.primary_head = 0;
    self.secondary_head = 0;
    self.active = WalRegion::Primary;
    self.pending.clear();
  }

  // ==========================================================================
  // Appending
  // ==========================================================================

  /// Append one framed record to the active region.
  pub fn write_record(&mut self, record: &WalRecord) -> Result<()> {
    self.write_frame_bytes(record.build())
  }

  /// Append pre-framed bytes (a commit batch) to the active region.
  ///
  /// Fails without side effects if the active region would overflow.
  pub fn write_frame_bytes(&mut self, bytes: Vec<u8>) -> Result<()> {
    debug_assert_eq!(bytes.len() % WAL_RECORD_ALIGNMENT, 0);

    let head = self.region_head(self.active);
    let size = self.region_size(self.active);
    let needed = bytes.len() as u64;
    if head + needed > size {
      return Err(HeronError::WalFull {
        needed,
        available: size - head,
      });
    }

    let offset = self.region_start(self.active) + head;
    self.pending.push((offset, bytes));
    match self.active {
      WalRegion::Primary => self.primary_head += needed,
      WalRegion::Secondary => self.secondary_head += needed,
    }
    Ok(())
  }

  /// Would a batch of `bytes` fit in the active region?
  pub fn fits(&self, bytes: u64) -> bool {
    self.active_used() + bytes <= self.region_size(self.active)
  }

  /// Write all buffered appends through the pager. Does not fsync.
  pub fn flush(&mut self, pager: &mut FilePager) -> Result<()> {
    for (offset, bytes) in self.pending.drain(..) {
      pager.write_at(offset, &bytes)?;
    }
    Ok(())
  }

  pub fn has_pending(&self) -> bool {
    !self.pending.is_empty()
  }

  // ==========================================================================
  // Merge (checkpoint Complete phase)
  // ==========================================================================

  /// Concatenate the secondary region's bytes after the primary head,
  /// reset the secondary head, and re-activate the primary region.
  ///
  /// Uses the current secondary head so commits that raced the checkpoint
  /// build are preserved.
  pub fn merge_secondary_into_primary(&mut self, pager: &mut FilePager) -> Result<()> {
    self.flush(pager)?;

    let sec_head = self.secondary_head;
    if sec_head > 0 {
      if self.primary_head + sec_head > self.primary_size {
        return Err(HeronError::WalFull {
          needed: sec_head,
          available: self.primary_size - self.primary_head,
        });
      }
      let bytes = pager.read_at(self.region_start(WalRegion::Secondary), sec_head as usize)?;
      pager.write_at(self.region_start(WalRegion::Primary) + self.primary_head, &bytes)?;
      self.primary_head += sec_head;
      self.secondary_head = 0;
    }

    self.active = WalRegion::Primary;
    Ok(())
  }

  /// Read a region's written bytes `[0, head)` for scanning.
  pub fn read_region(&self, pager: &FilePager, region: WalRegion) -> Result<Vec<u8>> {
    let head = self.region_head(region);
    if head == 0 {
      return Ok(Vec::new());
    }
    pager.read_at(self.region_start(region), head as usize)
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::pager::create_pager;
  use crate::core::wal::record::{build_control_payload, decode_frame, FrameParse, WalRecordType};
  use tempfile::tempdir;

  fn test_header() -> DbHeader {
    // 16 WAL pages = 64KB area -> 48KB primary, 16KB secondary
    DbHeader::new(4096, 16)
  }

  fn test_pager(dir: &tempfile::TempDir) -> FilePager {
    let mut pager = create_pager(dir.path().join("wal.heron"), 4096).expect("create");
    pager.allocate_pages(17).expect("allocate");
    pager
  }

  #[test]
  fn test_region_split() {
    let (primary, secondary) = split_wal_area(64 * 1024);
    assert_eq!(primary + secondary, 64 * 1024);
    assert_eq!(primary % 8, 0);
    assert!(primary > secondary);
  }

  #[test]
  fn test_append_and_scan() {
    let dir = tempdir().expect("tempdir");
    let mut pager = test_pager(&dir);
    let mut wal = WalBuffer::from_header(&test_header());

    for txid in 1..=3u64 {
      let record = WalRecord::new(WalRecordType::Begin, txid, build_control_payload());
      wal.write_record(&record).expect("write");
    }
    wal.flush(&mut pager).expect("flush");

    let bytes = wal.read_region(&pager, WalRegion::Primary).expect("read");
    let mut offset = 0;
    let mut txids = Vec::new();
    while offset < bytes.len() {
      match decode_frame(&bytes, offset) {
        FrameParse::Ok {
          record,
          next_offset,
        } => {
          txids.push(record.txid);
          offset = next_offset;
        }
        other => panic!("unexpected parse: {other:?}"),
      }
    }
    assert_eq!(txids, vec![1, 2, 3]);
  }

  #[test]
  fn test_overflow_rejected() {
    let mut wal = WalBuffer::from_header(&test_header());
    let huge = vec![0u8; wal.primary_region_size() as usize + 8];
    assert!(matches!(
      wal.write_frame_bytes(huge),
      Err(HeronError::WalFull { .. })
    ));
    // A failed append leaves the head untouched.
    assert_eq!(wal.primary_head(), 0);
  }

  #[test]
  fn test_switch_and_merge() {
    let dir = tempdir().expect("tempdir");
    let mut pager = test_pager(&dir);
    let mut wal = WalBuffer::from_header(&test_header());

    let r1 = WalRecord::new(WalRecordType::Begin, 1, build_control_payload());
    wal.write_record(&r1).expect("write primary");
    let primary_len = wal.primary_head();

    wal.switch_to_secondary();
    let r2 = WalRecord::new(WalRecordType::Begin, 2, build_control_payload());
    wal.write_record(&r2).expect("write secondary");
    assert_eq!(wal.active_region(), WalRegion::Secondary);
    assert!(wal.secondary_head() > 0);

    wal.merge_secondary_into_primary(&mut pager).expect("merge");
    assert_eq!(wal.active_region(), WalRegion::Primary);
    assert_eq!(wal.secondary_head(), 0);
    assert_eq!(wal.primary_head(), primary_len * 2);

    // Both records now sit in the primary region, in order.
    let bytes = wal.read_region(&pager, WalRegion::Primary).expect("read");
    let mut txids = Vec::new();
    let mut offset = 0;
    while let FrameParse::Ok {
      record,
      next_offset,
    } = decode_frame(&bytes, offset)
    {
      txids.push(record.txid);
      offset = next_offset;
    }
    assert_eq!(txids, vec![1, 2]);
  }

  #[test]
  fn test_active_used_tracks_region() {
    let mut wal = WalBuffer::from_header(&test_header());
    let record = WalRecord::new(WalRecordType::Begin, 1, build_control_payload());
    wal.write_record(&record).expect("write");
    let primary_used = wal.active_used();
    assert!(primary_used > 0);

    wal.switch_to_secondary();
    assert_eq!(wal.active_used(), 0);
    assert_eq!(wal.used_space(), primary_used);
  }
}
