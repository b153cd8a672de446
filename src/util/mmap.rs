//! Read-only memory mapping helpers.

use std::fs::File;

use crate::error::Result;

pub use memmap2::Mmap;

/// Map an open file read-only.
///
/// Safety: the mapping is only used for files this process owns through
/// the pager; the pager never truncates below a live mapping's range, and
/// checkpoint page reuse only grows the file.
pub fn map_file(file: &File) -> Result<Mmap> {
  let mmap = unsafe { Mmap::map(file)? };
  Ok(mmap)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_map_file_reads_contents() {
    let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
    tmp.write_all(b"mapped bytes").expect("write");
    tmp.flush().expect("flush");

    let mmap = map_file(tmp.as_file()).expect("map");
    assert_eq!(&mmap[..], b"mapped bytes");
  }
}
