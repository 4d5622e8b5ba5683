//! Durability and crash-recovery behavior.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use cinderdb::tmpfs::TempDir;
use cinderdb::{Database, Error, Options, ReadOptions, WriteBatch, WriteOptions};

fn base_options() -> Options {
    Options::default()
        .create_if_missing(true)
        .write_buffer_size(64 * 1024)
}

#[test]
fn synced_writes_survive_reopen() {
    const KEYS: usize = 2000;
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(base_options(), dir.path()).unwrap();
        let sync = WriteOptions::default().sync(true);
        // Ten keys per synced batch keeps the fsync count sane.
        for chunk in 0..KEYS / 10 {
            let mut batch = WriteBatch::new();
            for i in 0..10 {
                let key = format!("key{:06}", chunk * 10 + i);
                batch.put(key.as_bytes(), b"durable");
            }
            db.write(&sync, batch).unwrap();
        }
    }

    let db = Database::open(Options::default(), dir.path()).unwrap();
    let ropts = ReadOptions::default();
    for i in 0..KEYS {
        let key = format!("key{i:06}");
        assert_eq!(
            db.get(&ropts, key.as_bytes()).unwrap(),
            Some(b"durable".to_vec()),
            "lost {key} across reopen"
        );
    }
}

#[test]
fn recovery_replays_multiple_wal_generations() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(base_options(), dir.path()).unwrap();
        let wopts = WriteOptions::default();
        // Enough data to roll the WAL and flush several memtables.
        for i in 0..2000 {
            let key = format!("key{i:06}");
            let value = format!("value{i}-{}", "p".repeat(64));
            db.put(&wopts, key.as_bytes(), value.as_bytes()).unwrap();
        }
        // Overwrites land in a newer WAL than the originals.
        for i in 0..500 {
            let key = format!("key{i:06}");
            db.put(&wopts, key.as_bytes(), b"overwritten").unwrap();
        }
    }

    let db = Database::open(Options::default(), dir.path()).unwrap();
    let ropts = ReadOptions::default();
    for i in 0..2000 {
        let key = format!("key{i:06}");
        let got = db.get(&ropts, key.as_bytes()).unwrap();
        if i < 500 {
            assert_eq!(got, Some(b"overwritten".to_vec()), "stale {key}");
        } else {
            assert!(got.is_some(), "lost {key}");
        }
    }
}

#[test]
fn deletes_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(base_options(), dir.path()).unwrap();
        let wopts = WriteOptions::default();
        db.put(&wopts, b"keep", b"v").unwrap();
        db.put(&wopts, b"drop", b"v").unwrap();
        db.delete(&wopts, b"drop").unwrap();
    }

    let db = Database::open(Options::default(), dir.path()).unwrap();
    let ropts = ReadOptions::default();
    assert_eq!(db.get(&ropts, b"keep").unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.get(&ropts, b"drop").unwrap(), None);
}

#[test]
fn sequences_continue_after_reopen() {
    let dir = TempDir::new().unwrap();
    let first_seq = {
        let db = Database::open(base_options(), dir.path()).unwrap();
        db.put(&WriteOptions::default(), b"a", b"1").unwrap();
        let snapshot = db.snapshot();
        let seq = snapshot.sequence();
        db.release_snapshot(snapshot);
        seq
    };

    let db = Database::open(Options::default(), dir.path()).unwrap();
    db.put(&WriteOptions::default(), b"b", b"2").unwrap();
    let snapshot = db.snapshot();
    assert!(
        snapshot.sequence() > first_seq,
        "sequence numbers must never move backwards"
    );
    db.release_snapshot(snapshot);
}

#[test]
fn reused_log_keeps_accepting_writes() {
    let dir = TempDir::new().unwrap();
    let options = base_options().reuse_logs(true);

    {
        let db = Database::open(options.clone(), dir.path()).unwrap();
        db.put(&WriteOptions::default(), b"first", b"1").unwrap();
    }
    {
        let db = Database::open(options.clone(), dir.path()).unwrap();
        assert_eq!(
            db.get(&ReadOptions::default(), b"first").unwrap(),
            Some(b"1".to_vec())
        );
        db.put(&WriteOptions::default(), b"second", b"2").unwrap();
    }

    let db = Database::open(options, dir.path()).unwrap();
    let ropts = ReadOptions::default();
    assert_eq!(db.get(&ropts, b"first").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(&ropts, b"second").unwrap(), Some(b"2".to_vec()));
}

/// Finds the newest WAL in the directory.
fn newest_wal(dir: &TempDir) -> std::path::PathBuf {
    let mut logs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "log"))
        .map(|e| e.path())
        .collect();
    logs.sort();
    logs.pop().expect("database has a WAL")
}

#[test]
fn torn_wal_tail_truncates_by_default() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(base_options(), dir.path()).unwrap();
        let sync = WriteOptions::default().sync(true);
        db.put(&sync, b"intact", b"v").unwrap();
        db.put(&sync, b"torn", b"v").unwrap();
    }

    // Tear the final record mid-payload.
    let wal = newest_wal(&dir);
    let len = std::fs::metadata(&wal).unwrap().len();
    let file = OpenOptions::new().write(true).open(&wal).unwrap();
    file.set_len(len - 2).unwrap();

    let db = Database::open(Options::default(), dir.path()).unwrap();
    let ropts = ReadOptions::default();
    assert_eq!(db.get(&ropts, b"intact").unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.get(&ropts, b"torn").unwrap(), None);
}

#[test]
fn torn_wal_tail_fails_paranoid_open() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(base_options(), dir.path()).unwrap();
        let sync = WriteOptions::default().sync(true);
        db.put(&sync, b"a", b"v").unwrap();
        db.put(&sync, b"b", b"v").unwrap();
    }

    // Corrupt the last record's payload in place.
    let wal = newest_wal(&dir);
    let len = std::fs::metadata(&wal).unwrap().len();
    let mut file = OpenOptions::new().write(true).open(&wal).unwrap();
    file.seek(SeekFrom::Start(len - 1)).unwrap();
    file.write_all(&[0xff]).unwrap();
    file.sync_all().unwrap();

    let result = Database::open(Options::default().paranoid_checks(true), dir.path());
    assert!(matches!(result, Err(Error::Corruption(_))));
}

#[test]
fn reopen_after_flushes_reads_from_tables() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(
            Options::default()
                .create_if_missing(true)
                .write_buffer_size(8 * 1024),
            dir.path(),
        )
        .unwrap();
        let wopts = WriteOptions::default();
        for i in 0..1000 {
            let key = format!("key{i:05}");
            let value = "v".repeat(64);
            db.put(&wopts, key.as_bytes(), value.as_bytes()).unwrap();
        }
        db.compact_range(None, None).unwrap();
    }

    let db = Database::open(Options::default(), dir.path()).unwrap();
    let ropts = ReadOptions::default();
    for i in 0..1000 {
        let key = format!("key{i:05}");
        assert!(
            db.get(&ropts, key.as_bytes()).unwrap().is_some(),
            "lost {key} after table-only reopen"
        );
    }
    // Everything was flushed before reopen, so the data came off tables.
    let l0: usize = db
        .property("cinderdb.num-files-at-level0")
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(l0, 0);
}
