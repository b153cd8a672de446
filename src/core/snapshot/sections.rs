//! Snapshot section table.
//!
//! Every section is a flat little-endian array, 64-byte aligned, stored
//! uncompressed, with its own CRC recorded in the table entry. Offsets are
//! relative to the snapshot start so the same buffer parses standalone or
//! embedded after the WAL area.

use crate::constants::{SECTION_ENTRY_SIZE, SNAPSHOT_HEADER_SIZE};
use crate::error::{HeronError, Result};
use crate::util::binary::{read_u32, read_u64, write_u32, write_u64};

// ============================================================================
// Section identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SectionId {
  PhysToNodeId = 0,
  NodeIdToPhys = 1,
  OutOffsets = 2,
  OutDst = 3,
  OutEtype = 4,
  InOffsets = 5,
  InSrc = 6,
  InEtype = 7,
  StringOffsets = 8,
  StringBytes = 9,
  LabelStringIds = 10,
  EtypeStringIds = 11,
  PropkeyStringIds = 12,
  NodeKeyStrings = 13,
  KeyBuckets = 14,
  KeyEntries = 15,
  NodeLabelOffsets = 16,
  NodeLabelIds = 17,
  NodePropOffsets = 18,
  NodePropKeys = 19,
  NodePropVals = 20,
  EdgePropOffsets = 21,
  EdgePropKeys = 22,
  EdgePropVals = 23,
  VectorOffsets = 24,
  VectorData = 25,
  VectorStoreIndex = 26,
  VectorStoreData = 27,
}

impl SectionId {
  pub const COUNT: usize = 28;

  pub fn from_u32(v: u32) -> Option<Self> {
    if v < Self::COUNT as u32 {
      // Safety: repr(u32) with dense discriminants 0..COUNT
      Some(unsafe { std::mem::transmute::<u32, SectionId>(v) })
    } else {
      None
    }
  }
}

// ============================================================================
// Section table
// ============================================================================

/// One section table entry: `offset:u64, length:u64, crc32c:u32, reserved:u32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionEntry {
  /// Byte offset relative to the snapshot start; 0 when empty.
  pub offset: u64,
  pub length: u64,
  pub crc: u32,
}

/// Total size of the section table.
pub fn section_table_size() -> usize {
  SectionId::COUNT * SECTION_ENTRY_SIZE
}

pub struct ParsedSectionTable {
  pub sections: Vec<SectionEntry>,
  /// End (relative offset) of the furthest section payload.
  pub max_section_end: usize,
}

/// Parse the section table from a snapshot-relative buffer.
pub fn parse_section_table(buffer: &[u8]) -> Result<ParsedSectionTable> {
  let table_end = SNAPSHOT_HEADER_SIZE + section_table_size();
  if buffer.len() < table_end {
    return Err(HeronError::InvalidSnapshot(format!(
      "snapshot too small for section table: {} bytes",
      buffer.len()
    )));
  }

  let mut sections = Vec::with_capacity(SectionId::COUNT);
  let mut max_section_end = table_end;

  for i in 0..SectionId::COUNT {
    let entry_offset = SNAPSHOT_HEADER_SIZE + i * SECTION_ENTRY_SIZE;
    let offset = read_u64(buffer, entry_offset);
    let length = read_u64(buffer, entry_offset + 8);
    let crc = read_u32(buffer, entry_offset + 16);

    if length > 0 {
      let end = offset
        .checked_add(length)
        .ok_or_else(|| HeronError::InvalidSnapshot("section range overflow".to_string()))?;
      if end as usize > buffer.len() {
        return Err(HeronError::InvalidSnapshot(format!(
          "section {i} range [{offset}, {end}) exceeds snapshot of {} bytes",
          buffer.len()
        )));
      }
      if (offset as usize) < table_end {
        return Err(HeronError::InvalidSnapshot(format!(
          "section {i} overlaps header/table at offset {offset}"
        )));
      }
      max_section_end = max_section_end.max(end as usize);
    }

    sections.push(SectionEntry {
      offset,
      length,
      crc,
    });
  }

  Ok(ParsedSectionTable {
    sections,
    max_section_end,
  })
}

/// Serialize a section table into `buffer` at the fixed table offset.
pub fn write_section_table(buffer: &mut [u8], sections: &[SectionEntry]) {
  debug_assert_eq!(sections.len(), SectionId::COUNT);
  for (i, entry) in sections.iter().enumerate() {
    let entry_offset = SNAPSHOT_HEADER_SIZE + i * SECTION_ENTRY_SIZE;
    write_u64(buffer, entry_offset, entry.offset);
    write_u64(buffer, entry_offset + 8, entry.length);
    write_u32(buffer, entry_offset + 16, entry.crc);
    write_u32(buffer, entry_offset + 20, 0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_section_id_from_u32() {
    assert_eq!(SectionId::from_u32(0), Some(SectionId::PhysToNodeId));
    assert_eq!(SectionId::from_u32(27), Some(SectionId::VectorStoreData));
    assert_eq!(SectionId::from_u32(28), None);
  }

  #[test]
  fn test_table_round_trip() {
    let mut sections = vec![SectionEntry::default(); SectionId::COUNT];
    let payload_start = SNAPSHOT_HEADER_SIZE + section_table_size();
    sections[3] = SectionEntry {
      offset: payload_start as u64,
      length: 16,
      crc: 0xabcd1234,
    };

    let mut buffer = vec![0u8; payload_start + 64];
    write_section_table(&mut buffer, &sections);

    let parsed = parse_section_table(&buffer).expect("parse");
    assert_eq!(parsed.sections[3].offset, payload_start as u64);
    assert_eq!(parsed.sections[3].length, 16);
    assert_eq!(parsed.sections[3].crc, 0xabcd1234);
    assert_eq!(parsed.max_section_end, payload_start + 16);
  }

  #[test]
  fn test_overlapping_section_rejected() {
    let mut sections = vec![SectionEntry::default(); SectionId::COUNT];
    sections[0] = SectionEntry {
      offset: 8, // inside the header
      length: 16,
      crc: 0,
    };
    let mut buffer = vec![0u8; SNAPSHOT_HEADER_SIZE + section_table_size() + 64];
    write_section_table(&mut buffer, &sections);
    assert!(parse_section_table(&buffer).is_err());
  }
}
