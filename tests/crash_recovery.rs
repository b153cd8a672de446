//! Crash and corruption recovery: uncommitted work vanishes, damaged
//! committed records are detected, tail garbage is tolerated.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};

use herondb::{close_single_file, open_single_file, OpenOptions};
use tempfile::tempdir;

const WAL_SIZE: usize = 64 * 1024;
const PAGE_SIZE: u64 = 4096;
const WAL_PAGES: u64 = (WAL_SIZE as u64) / PAGE_SIZE;

fn options() -> OpenOptions {
  OpenOptions::new().wal_size(WAL_SIZE)
}

fn flip_byte(path: &std::path::Path, offset: u64) {
  let mut file = fs::OpenOptions::new()
    .read(true)
    .write(true)
    .open(path)
    .expect("open for corruption");
  let mut byte = [0u8; 1];
  file.seek(SeekFrom::Start(offset)).expect("seek");
  file.read_exact(&mut byte).expect("read");
  byte[0] ^= 0x01;
  file.seek(SeekFrom::Start(offset)).expect("seek back");
  file.write_all(&byte).expect("write");
  file.sync_all().expect("sync");
}

#[test]
fn test_uncommitted_transaction_is_lost() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("crash.heron");

  {
    let db = open_single_file(&path, options()).expect("open");
    db.begin().expect("begin safe");
    db.create_node(Some("safe")).expect("create safe");
    db.commit().expect("commit safe");

    // Second transaction never commits; nothing of it reaches the WAL.
    db.begin().expect("begin lost");
    db.create_node(Some("lost")).expect("create lost");
    close_single_file(&db).expect("close");
  }

  let db = open_single_file(&path, options()).expect("reopen");
  assert!(db.node_by_key("safe").is_some());
  assert_eq!(db.node_by_key("lost"), None);
}

#[test]
fn test_committed_state_survives_without_clean_close() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("live.heron");
  let crash_copy = dir.path().join("crash-copy.heron");

  let db = open_single_file(&path, options()).expect("open");
  db.begin().expect("begin");
  db.create_node(Some("durable")).expect("create");
  db.commit().expect("commit");

  // Simulate a crash: copy the file as-is, with no close() bookkeeping.
  fs::copy(&path, &crash_copy).expect("copy");
  drop(db);

  let recovered = open_single_file(&crash_copy, options()).expect("open crash copy");
  assert!(recovered.node_by_key("durable").is_some());
}

#[test]
fn test_truncated_wal_tail_is_tolerated() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("tail.heron");

  {
    let db = open_single_file(&path, options()).expect("open");
    db.begin().expect("begin");
    db.create_node(Some("a")).expect("a");
    db.create_node(Some("b")).expect("b");
    db.commit().expect("commit");
    db.optimize().expect("optimize");
    close_single_file(&db).expect("close");
  }

  // Zero out the last 20 bytes of the WAL region. After the checkpoint
  // the WAL is empty, so this is tail garbage and must be tolerated.
  {
    let mut file = fs::OpenOptions::new()
      .write(true)
      .open(&path)
      .expect("open for damage");
    let wal_end = (1 + WAL_PAGES) * PAGE_SIZE;
    file
      .seek(SeekFrom::Start(wal_end - 20))
      .expect("seek");
    file.write_all(&[0u8; 20]).expect("zero");
    file.sync_all().expect("sync");
  }

  let db = open_single_file(&path, options()).expect("reopen succeeds");
  assert!(db.node_by_key("a").is_some());
  assert!(db.node_by_key("b").is_some());
}

#[test]
fn test_bit_flip_in_committed_record_is_corruption() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("flip.heron");

  {
    let db = open_single_file(&path, options()).expect("open");
    db.begin().expect("begin");
    db.create_node(Some("victim")).expect("create");
    db.commit().expect("commit");
    close_single_file(&db).expect("close");
  }

  // The first WAL frame starts at the beginning of the WAL area; flip a
  // byte inside it (past the length field, within the CRC-covered span).
  flip_byte(&path, PAGE_SIZE + 9);

  let err = open_single_file(&path, options()).expect_err("open must fail");
  assert!(err.is_corruption(), "expected corruption, got {err}");
}

#[test]
fn test_corrupted_header_rejected() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("header.heron");

  {
    let db = open_single_file(&path, options()).expect("open");
    db.begin().expect("begin");
    db.create_node(Some("n")).expect("create");
    db.commit().expect("commit");
    close_single_file(&db).expect("close");
  }

  let before = fs::read(&path).expect("read file");
  flip_byte(&path, 20);

  let err = open_single_file(&path, options()).expect_err("open must fail");
  assert!(err.is_corruption(), "expected corruption, got {err}");

  // A failed open does not modify the file.
  let mut after = fs::read(&path).expect("read file again");
  after[20] ^= 0x01;
  assert_eq!(before, after);
}

#[test]
fn test_empty_wal_reopen() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("empty.heron");

  {
    let db = open_single_file(&path, options()).expect("open");
    close_single_file(&db).expect("close");
  }

  let db = open_single_file(&path, options()).expect("reopen");
  assert_eq!(db.count_nodes(), 0);
  assert_eq!(db.stats().wal_used_bytes, 0);
}

#[test]
fn test_empty_snapshot_reopen() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("empty-snap.heron");

  {
    let db = open_single_file(&path, options()).expect("open");
    // Write a node, checkpoint, then delete it and checkpoint again so
    // the live snapshot has zero nodes.
    db.begin().expect("begin");
    let n = db.create_node(Some("gone")).expect("create");
    db.commit().expect("commit");
    db.optimize().expect("optimize");

    db.begin().expect("begin 2");
    db.delete_node(n).expect("delete");
    db.commit().expect("commit 2");
    db.optimize().expect("optimize 2");
    close_single_file(&db).expect("close");
  }

  let db = open_single_file(&path, options()).expect("reopen");
  assert_eq!(db.count_nodes(), 0);
  assert_eq!(db.node_by_key("gone"), None);
  assert_eq!(db.stats().snapshot_gen, 2);
}

#[test]
fn test_repeated_reopen_is_stable() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("stable.heron");

  {
    let db = open_single_file(&path, options()).expect("open");
    db.begin().expect("begin");
    let a = db.create_node(Some("a")).expect("a");
    let b = db.create_node(Some("b")).expect("b");
    let e = db.get_or_create_etype("E").expect("etype");
    db.add_edge(a, e, b).expect("edge");
    db.commit().expect("commit");
    close_single_file(&db).expect("close");
  }

  // Each reopen replays the same WAL; state must not drift.
  for _ in 0..3 {
    let db = open_single_file(&path, options()).expect("reopen");
    assert_eq!(db.count_nodes(), 2);
    assert_eq!(db.count_edges(), 1);
    close_single_file(&db).expect("close");
  }
}

#[test]
fn test_recovery_without_commit_record_drops_group() {
  let dir = tempdir().expect("tempdir");
  let path = dir.path().join("nogroup.heron");

  {
    let db = open_single_file(&path, options()).expect("open");
    db.begin().expect("begin");
    db.create_node(Some("committed")).expect("create");
    db.commit().expect("commit");
    close_single_file(&db).expect("close");
  }

  // Find the Commit frame in the WAL area and overwrite its length field
  // with zeros, truncating the log just before the commit.
  {
    let mut bytes = fs::read(&path).expect("read");
    let wal_start = PAGE_SIZE as usize;
    let wal_end = ((1 + WAL_PAGES) * PAGE_SIZE) as usize;
    let mut offset = wal_start;
    let mut commit_offset = None;
    while offset + 8 <= wal_end {
      let frame_len =
        u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
          as usize;
      if frame_len == 0 {
        break;
      }
      // Record type 2 = Commit
      if bytes[offset + 4] == 2 {
        commit_offset = Some(offset);
        break;
      }
      offset += frame_len;
    }
    let commit_offset = commit_offset.expect("commit frame present");
    for b in &mut bytes[commit_offset..commit_offset + 8] {
      *b = 0;
    }
    // The header still records the old head, so the zeroed frame reads as
    // a truncated tail; recovery keeps scanning cleanly and drops the
    // uncommitted group.
    fs::write(&path, &bytes).expect("write back");
  }

  let db = open_single_file(&path, options()).expect("reopen");
  assert_eq!(db.node_by_key("committed"), None);
  assert_eq!(db.count_nodes(), 0);
}
