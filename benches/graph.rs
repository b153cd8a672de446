//! Graph write/read benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use herondb::{open_single_file, OpenOptions, SyncMode};
use tempfile::tempdir;

fn bench_insert_nodes(c: &mut Criterion) {
  c.bench_function("insert_1k_nodes", |b| {
    b.iter_with_setup(
      || {
        let dir = tempdir().expect("tempdir");
        let db = open_single_file(
          dir.path().join("bench.heron"),
          OpenOptions::new()
            .wal_size(8 * 1024 * 1024)
            .sync_mode(SyncMode::Off)
            .auto_checkpoint(false),
        )
        .expect("open");
        (dir, db)
      },
      |(_dir, db)| {
        db.begin().expect("begin");
        for i in 0..1000 {
          db.create_node(Some(&format!("node-{i}"))).expect("create");
        }
        db.commit().expect("commit");
      },
    )
  });
}

fn bench_key_lookup(c: &mut Criterion) {
  let dir = tempdir().expect("tempdir");
  let db = open_single_file(
    dir.path().join("lookup.heron"),
    OpenOptions::new()
      .wal_size(8 * 1024 * 1024)
      .sync_mode(SyncMode::Off)
      .auto_checkpoint(false),
  )
  .expect("open");

  db.begin().expect("begin");
  for i in 0..10_000 {
    db.create_node(Some(&format!("node-{i}"))).expect("create");
  }
  db.commit().expect("commit");
  db.optimize().expect("optimize");

  c.bench_function("key_lookup_snapshot", |b| {
    let mut i = 0usize;
    b.iter(|| {
      let key = format!("node-{}", i % 10_000);
      i += 1;
      black_box(db.node_by_key(&key))
    })
  });
}

fn bench_traversal(c: &mut Criterion) {
  let dir = tempdir().expect("tempdir");
  let db = open_single_file(
    dir.path().join("traverse.heron"),
    OpenOptions::new()
      .wal_size(8 * 1024 * 1024)
      .sync_mode(SyncMode::Off)
      .auto_checkpoint(false),
  )
  .expect("open");

  db.begin().expect("begin");
  let etype = db.get_or_create_etype("LINKS").expect("etype");
  let nodes: Vec<_> = (0..1000)
    .map(|i| db.create_node(Some(&format!("t{i}"))).expect("create"))
    .collect();
  for (i, &src) in nodes.iter().enumerate() {
    for j in 1..=8 {
      let dst = nodes[(i + j * 7) % nodes.len()];
      if src != dst {
        db.add_edge(src, etype, dst).expect("edge");
      }
    }
  }
  db.commit().expect("commit");
  db.optimize().expect("optimize");

  c.bench_function("out_edges_snapshot", |b| {
    let mut i = 0usize;
    b.iter(|| {
      let node = nodes[i % nodes.len()];
      i += 1;
      black_box(db.out_edges(node, None))
    })
  });
}

criterion_group!(benches, bench_insert_nodes, bench_key_lookup, bench_traversal);
criterion_main!(benches);
