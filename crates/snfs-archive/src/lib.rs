//! snfs-archive: snapshots of the encrypted physical root
//!
//! # Overview
//! - `bundle`: the record stream inside a snapshot, sealed with a BLAKE3 digest
//! - `manager`: timestamped snapshot files, newest-first restore, retention

pub mod bundle;
pub mod manager;

pub use bundle::{BundleReader, BundleWriter, Entry, BUNDLE_MAGIC};
pub use manager::{
    parse_snapshot_name, snapshot_name, unpack, verify, ArchiveManager, ArchiveSnapshot,
    SnapshotReport,
};
