//! Page-based file I/O.
//!
//! The pager exclusively owns the database file handle. All byte access by
//! the WAL buffer, snapshot writer, and header updates goes through it;
//! readers borrow an `Mmap` of the whole file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::constants::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::{HeronError, Result};
use crate::util::mmap::{map_file, Mmap};

// ============================================================================
// Positioned I/O
// ============================================================================

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
  use std::os::unix::fs::FileExt;
  file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
  use std::os::unix::fs::FileExt;
  file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
  use std::os::windows::fs::FileExt;
  let mut pos = 0usize;
  while pos < buf.len() {
    let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
    if n == 0 {
      return Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "short read",
      ));
    }
    pos += n;
  }
  Ok(())
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
  use std::os::windows::fs::FileExt;
  let mut pos = 0usize;
  while pos < buf.len() {
    let n = file.seek_write(&buf[pos..], offset + pos as u64)?;
    pos += n;
  }
  Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Page size must be a power of two between 4KB and 64KB.
pub fn is_valid_page_size(page_size: usize) -> bool {
  page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}

/// Number of pages needed to store `bytes`.
pub fn pages_to_store(bytes: usize, page_size: usize) -> usize {
  bytes.div_ceil(page_size)
}

// ============================================================================
// FilePager
// ============================================================================

/// Page-granular file access with write-through semantics.
#[derive(Debug)]
pub struct FilePager {
  path: PathBuf,
  file: File,
  page_size: usize,
  file_size: u64,
  read_only: bool,
  /// Pages marked reclaimable by `free_pages`. Bookkeeping only; the file
  /// is never shrunk except by an explicit `truncate_pages`.
  free_ranges: Vec<(u64, u64)>,
}

/// Create a new database file. Fails if one already exists.
pub fn create_pager<P: AsRef<Path>>(path: P, page_size: usize) -> Result<FilePager> {
  let path = path.as_ref();
  if !is_valid_page_size(page_size) {
    return Err(HeronError::Internal(format!(
      "invalid page size: {page_size}"
    )));
  }

  let file = OpenOptions::new()
    .read(true)
    .write(true)
    .create_new(true)
    .open(path)?;
  fs2::FileExt::try_lock_exclusive(&file)?;

  sync_parent_dir(path)?;

  Ok(FilePager {
    path: path.to_path_buf(),
    file,
    page_size,
    file_size: 0,
    read_only: false,
    free_ranges: Vec::new(),
  })
}

/// Open an existing database file.
pub fn open_pager<P: AsRef<Path>>(path: P, page_size: usize, read_only: bool) -> Result<FilePager> {
  let path = path.as_ref();
  if !is_valid_page_size(page_size) {
    return Err(HeronError::Internal(format!(
      "invalid page size: {page_size}"
    )));
  }

  let file = OpenOptions::new()
    .read(true)
    .write(!read_only)
    .open(path)?;
  if read_only {
    fs2::FileExt::try_lock_shared(&file)?;
  } else {
    fs2::FileExt::try_lock_exclusive(&file)?;
  }

  let file_size = file.metadata()?.len();

  Ok(FilePager {
    path: path.to_path_buf(),
    file,
    page_size,
    file_size,
    read_only,
    free_ranges: Vec::new(),
  })
}

/// Flush the directory entry so a freshly created file survives a crash.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
  if let Some(parent) = path.parent() {
    let dir = if parent.as_os_str().is_empty() {
      File::open(".")?
    } else {
      File::open(parent)?
    };
    dir.sync_all()?;
  }
  Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
  Ok(())
}

impl FilePager {
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn file(&self) -> &File {
    &self.file
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn file_size(&self) -> u64 {
    self.file_size
  }

  pub fn num_pages(&self) -> u64 {
    self.file_size / self.page_size as u64
  }

  /// Read one full page.
  pub fn read_page(&self, page_no: u64) -> Result<Vec<u8>> {
    let offset = page_no * self.page_size as u64;
    let mut buf = vec![0u8; self.page_size];
    pread(&self.file, &mut buf, offset)?;
    Ok(buf)
  }

  /// Read an arbitrary byte range.
  pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    pread(&self.file, &mut buf, offset)?;
    Ok(buf)
  }

  /// Write one page. `bytes` must not exceed the page size; short writes
  /// leave the rest of the page untouched.
  pub fn write_page(&mut self, page_no: u64, bytes: &[u8]) -> Result<()> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }
    if bytes.len() > self.page_size {
      return Err(HeronError::Internal(format!(
        "page write of {} bytes exceeds page size {}",
        bytes.len(),
        self.page_size
      )));
    }
    let offset = page_no * self.page_size as u64;
    pwrite(&self.file, bytes, offset)?;
    let end = offset + bytes.len() as u64;
    if end > self.file_size {
      self.file_size = end;
    }
    Ok(())
  }

  /// Positioned write-through of an arbitrary byte range.
  pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }
    pwrite(&self.file, bytes, offset)?;
    let end = offset + bytes.len() as u64;
    if end > self.file_size {
      self.file_size = end;
    }
    Ok(())
  }

  /// Grow the file by `n` pages, returning the first new page number. A
  /// partially-written final page is absorbed into it first.
  ///
  /// On failure the file length is left unchanged.
  pub fn allocate_pages(&mut self, n: u64) -> Result<u64> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }
    let first_new = self.num_pages();
    let new_size = (first_new + n) * self.page_size as u64;
    if new_size > self.file_size {
      self
        .file
        .set_len(new_size)
        .map_err(|e| HeronError::OutOfSpace(format!("allocating {n} pages: {e}")))?;
      self.file_size = new_size;
    }
    Ok(first_new)
  }

  /// Grow the file so `page_count` pages exist. No-op when already large
  /// enough.
  pub fn ensure_pages(&mut self, page_count: u64) -> Result<()> {
    let current = self.num_pages();
    if page_count > current {
      self.allocate_pages(page_count - current)?;
    }
    Ok(())
  }

  /// Mark pages reclaimable. Bookkeeping only; no truncation.
  pub fn free_pages(&mut self, start: u64, count: u64) {
    if count > 0 {
      self.free_ranges.push((start, count));
    }
  }

  pub fn free_page_count(&self) -> u64 {
    self.free_ranges.iter().map(|(_, c)| c).sum()
  }

  /// Shrink the file to `page_count` pages (vacuum only).
  pub fn truncate_pages(&mut self, page_count: u64) -> Result<()> {
    if self.read_only {
      return Err(HeronError::ReadOnly);
    }
    let new_size = page_count * self.page_size as u64;
    self.file.set_len(new_size)?;
    self.file_size = new_size;
    self.free_ranges.retain(|&(start, _)| start < page_count);
    Ok(())
  }

  /// Map the whole file read-only.
  pub fn mmap(&self) -> Result<Mmap> {
    map_file(&self.file)
  }

  /// Flush buffered writes to stable storage.
  pub fn sync(&self) -> Result<()> {
    self.file.sync_data()?;
    Ok(())
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn test_create_write_read_page() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pager.heron");

    let mut pager = create_pager(&path, 4096).expect("create");
    pager.allocate_pages(2).expect("allocate");

    let mut page = vec![0u8; 4096];
    page[0] = 0xab;
    page[4095] = 0xcd;
    pager.write_page(1, &page).expect("write");
    pager.sync().expect("sync");

    let read = pager.read_page(1).expect("read");
    assert_eq!(read[0], 0xab);
    assert_eq!(read[4095], 0xcd);
  }

  #[test]
  fn test_allocate_grows_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("grow.heron");

    let mut pager = create_pager(&path, 4096).expect("create");
    assert_eq!(pager.num_pages(), 0);

    let first = pager.allocate_pages(4).expect("allocate");
    assert_eq!(first, 0);
    assert_eq!(pager.num_pages(), 4);

    let next = pager.allocate_pages(2).expect("allocate");
    assert_eq!(next, 4);
    assert_eq!(pager.file_size(), 6 * 4096);
  }

  #[test]
  fn test_free_pages_is_bookkeeping_only() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("free.heron");

    let mut pager = create_pager(&path, 4096).expect("create");
    pager.allocate_pages(8).expect("allocate");
    pager.free_pages(4, 4);
    assert_eq!(pager.free_page_count(), 4);
    assert_eq!(pager.num_pages(), 8);
  }

  #[test]
  fn test_reject_invalid_page_size() {
    let dir = tempdir().expect("tempdir");
    assert!(create_pager(dir.path().join("bad.heron"), 1000).is_err());
    assert!(create_pager(dir.path().join("bad2.heron"), 2048).is_err());
    assert!(is_valid_page_size(4096));
    assert!(is_valid_page_size(65536));
    assert!(!is_valid_page_size(131072));
  }

  #[test]
  fn test_read_only_rejects_writes() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("ro.heron");
    {
      let mut pager = create_pager(&path, 4096).expect("create");
      pager.allocate_pages(1).expect("allocate");
      pager.write_page(0, &[1u8; 4096]).expect("write");
    }

    let mut pager = open_pager(&path, 4096, true).expect("open");
    assert!(matches!(
      pager.write_page(0, &[2u8; 16]),
      Err(HeronError::ReadOnly)
    ));
  }
}
