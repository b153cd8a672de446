//! Storage layer: pager, WAL, CSR snapshots, and the single-file engine.

pub mod pager;
pub mod single_file;
pub mod snapshot;
pub mod wal;
