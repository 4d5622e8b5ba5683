//! End-to-end behavior of the public database API.

use std::sync::Arc;
use std::thread;

use cinderdb::tmpfs::TempDir;
use cinderdb::{Database, Options, ReadOptions, WriteBatch, WriteOptions};

fn open(dir: &TempDir) -> Database {
    Database::open(
        Options::default()
            .create_if_missing(true)
            .write_buffer_size(256 * 1024),
        dir.path(),
    )
    .expect("open database")
}

#[test]
fn small_writes_then_read() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let wopts = WriteOptions::default();
    let ropts = ReadOptions::default();

    db.put(&wopts, b"a", b"1").unwrap();
    db.put(&wopts, b"b", b"2").unwrap();
    db.delete(&wopts, b"a").unwrap();

    assert_eq!(db.get(&ropts, b"a").unwrap(), None);
    assert_eq!(db.get(&ropts, b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let wopts = WriteOptions::default();

    db.put(&wopts, b"k", b"v1").unwrap();
    let snapshot = db.snapshot();
    db.put(&wopts, b"k", b"v2").unwrap();

    assert_eq!(
        db.get(&ReadOptions::default(), b"k").unwrap(),
        Some(b"v2".to_vec())
    );
    let pinned = ReadOptions::default().snapshot(Some(snapshot.sequence()));
    assert_eq!(db.get(&pinned, b"k").unwrap(), Some(b"v1".to_vec()));
    db.release_snapshot(snapshot);
}

#[test]
fn snapshot_survives_flushes() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(
        Options::default()
            .create_if_missing(true)
            .write_buffer_size(16 * 1024),
        dir.path(),
    )
    .unwrap();
    let wopts = WriteOptions::default();

    db.put(&wopts, b"pinned", b"before").unwrap();
    let snapshot = db.snapshot();

    // Enough churn to seal and flush several memtables.
    for round in 0..10 {
        for i in 0..200 {
            let key = format!("churn{i:04}");
            let value = format!("round{round}-{}", "x".repeat(100));
            db.put(&wopts, key.as_bytes(), value.as_bytes()).unwrap();
        }
    }
    db.put(&wopts, b"pinned", b"after").unwrap();

    let pinned = ReadOptions::default().snapshot(Some(snapshot.sequence()));
    assert_eq!(db.get(&pinned, b"pinned").unwrap(), Some(b"before".to_vec()));
    assert_eq!(db.get(&pinned, b"churn0000").unwrap(), None);
    assert_eq!(
        db.get(&ReadOptions::default(), b"pinned").unwrap(),
        Some(b"after".to_vec())
    );
    db.release_snapshot(snapshot);
}

#[test]
fn batched_writes_are_atomic_and_ordered() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    let mut batch = WriteBatch::new();
    batch.put(b"x", b"1");
    batch.put(b"y", b"2");
    batch.put(b"x", b"3");
    db.write(&WriteOptions::default(), batch).unwrap();

    let ropts = ReadOptions::default();
    // The later op in the batch wins.
    assert_eq!(db.get(&ropts, b"x").unwrap(), Some(b"3".to_vec()));
    assert_eq!(db.get(&ropts, b"y").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn concurrent_writers_group_commit() {
    const THREADS: usize = 16;
    const WRITES_PER_THREAD: usize = 1000;

    let dir = TempDir::new().unwrap();
    let db = Arc::new(open(&dir));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let wopts = WriteOptions::default();
                for i in 0..WRITES_PER_THREAD {
                    let key = format!("t{t:02}-k{i:05}");
                    let value = format!("t{t:02}-v{i:05}");
                    db.put(&wopts, key.as_bytes(), value.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every write consumed exactly one sequence number, in queue order.
    let snapshot = db.snapshot();
    assert_eq!(snapshot.sequence(), (THREADS * WRITES_PER_THREAD) as u64);
    db.release_snapshot(snapshot);

    let ropts = ReadOptions::default();
    for t in 0..THREADS {
        for i in 0..WRITES_PER_THREAD {
            let key = format!("t{t:02}-k{i:05}");
            let value = format!("t{t:02}-v{i:05}");
            assert_eq!(
                db.get(&ropts, key.as_bytes()).unwrap(),
                Some(value.into_bytes()),
                "lost write {key}"
            );
        }
    }
}

#[test]
fn reads_span_memtable_and_tables() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(
        Options::default()
            .create_if_missing(true)
            .write_buffer_size(8 * 1024),
        dir.path(),
    )
    .unwrap();
    let wopts = WriteOptions::default();

    // Old generation ends up in tables, new generation stays in memory.
    for i in 0..500 {
        let key = format!("key{i:04}");
        db.put(&wopts, key.as_bytes(), format!("old{i}").as_bytes())
            .unwrap();
    }
    for i in 0..500 {
        if i % 3 == 0 {
            let key = format!("key{i:04}");
            db.put(&wopts, key.as_bytes(), format!("new{i}").as_bytes())
                .unwrap();
        }
    }

    let ropts = ReadOptions::default();
    for i in 0..500 {
        let key = format!("key{i:04}");
        let expected = if i % 3 == 0 {
            format!("new{i}")
        } else {
            format!("old{i}")
        };
        assert_eq!(
            db.get(&ropts, key.as_bytes()).unwrap(),
            Some(expected.into_bytes()),
            "wrong value for {key}"
        );
    }
}

#[test]
fn scan_merges_all_layers_in_order() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(
        Options::default()
            .create_if_missing(true)
            .write_buffer_size(8 * 1024),
        dir.path(),
    )
    .unwrap();
    let wopts = WriteOptions::default();

    let mut expected = Vec::new();
    for i in (0..400).rev() {
        let key = format!("key{i:04}");
        let value = format!("value{i}-{}", "pad".repeat(20));
        db.put(&wopts, key.as_bytes(), value.as_bytes()).unwrap();
    }
    for i in 0..400 {
        let key = format!("key{i:04}");
        let value = format!("value{i}-{}", "pad".repeat(20));
        expected.push((key.into_bytes(), value.into_bytes()));
    }
    // Delete a band in the middle.
    for i in 100..200 {
        let key = format!("key{i:04}");
        db.delete(&wopts, key.as_bytes()).unwrap();
    }
    expected.retain(|(k, _)| {
        let i: usize = std::str::from_utf8(&k[3..]).unwrap().parse().unwrap();
        !(100..200).contains(&i)
    });

    let scanned: Vec<_> = db
        .scan(&ReadOptions::default(), ..)
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(scanned, expected);
}

#[test]
fn scan_subrange_with_excluded_start() {
    use std::ops::Bound;

    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let wopts = WriteOptions::default();
    for key in ["a", "b", "c", "d", "e"] {
        db.put(&wopts, key.as_bytes(), b"v").unwrap();
    }

    let range = (
        Bound::Excluded(b"b".to_vec()),
        Bound::Included(b"d".to_vec()),
    );
    let keys: Vec<_> = db
        .scan(&ReadOptions::default(), range)
        .unwrap()
        .map(|e| e.unwrap().0)
        .collect();
    assert_eq!(keys, vec![b"c".to_vec(), b"d".to_vec()]);
}
