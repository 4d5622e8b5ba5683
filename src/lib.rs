pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod flock;
pub mod ikey;
pub mod memtable;
pub mod sstable;
pub mod tmpfs;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use config::{Compression, Options, ReadOptions, WriteOptions};
pub use db::{destroy_db, repair_db, Database, Snapshot};
pub use error::{Error, Result};
pub use filter::BloomFilterPolicy;
