//! Timestamped snapshots of the physical root.
//!
//! Snapshots hold the encrypted physical files exactly as stored; no key
//! material is involved. The caller guarantees that no file handles are open
//! while a snapshot is taken.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use snfs_core::config::ArchiveConfig;
use snfs_core::{SnfsError, SnfsResult};
use tracing::{debug, info, warn};

use crate::bundle::{BundleReader, BundleWriter, Entry};

const NAME_PREFIX: &str = "snfs-";
const NAME_SUFFIX: &str = ".snfsa.zst";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// A snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSnapshot {
    pub path: PathBuf,
    pub created: DateTime<Utc>,
}

/// Summary of a snapshot just written.
#[derive(Debug, Clone)]
pub struct SnapshotReport {
    pub snapshot: ArchiveSnapshot,
    pub entries: usize,
    pub content_bytes: u64,
    pub compressed_bytes: u64,
}

pub fn snapshot_name(created: DateTime<Utc>) -> String {
    format!(
        "{NAME_PREFIX}{}{NAME_SUFFIX}",
        created.format(TIMESTAMP_FORMAT)
    )
}

/// Parse a snapshot file name back to its creation time.
pub fn parse_snapshot_name(name: &str) -> Option<DateTime<Utc>> {
    let ts = name.strip_prefix(NAME_PREFIX)?.strip_suffix(NAME_SUFFIX)?;
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn archive_err(e: anyhow::Error) -> SnfsError {
    SnfsError::Archive(format!("{e:#}"))
}

#[derive(Debug, Clone)]
pub struct ArchiveManager {
    dir: PathBuf,
    level: i32,
    keep: usize,
}

impl ArchiveManager {
    /// `keep == 0` disables pruning.
    pub fn new(dir: PathBuf, level: i32, keep: usize) -> Self {
        Self { dir, level, keep }
    }

    pub fn from_config(config: &ArchiveConfig, dir: PathBuf) -> Self {
        Self::new(dir, config.compression_level, config.keep)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All snapshots in the archive directory, oldest first.
    ///
    /// Ordering is by the timestamp in the name, not by file mtime.
    pub fn list(&self) -> SnfsResult<Vec<ArchiveSnapshot>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(created) = name.to_str().and_then(parse_snapshot_name) else {
                continue;
            };
            if entry.file_type()?.is_file() {
                snapshots.push(ArchiveSnapshot {
                    path: entry.path(),
                    created,
                });
            }
        }
        snapshots.sort_by_key(|s| s.created);
        Ok(snapshots)
    }

    pub fn latest(&self) -> SnfsResult<Option<ArchiveSnapshot>> {
        Ok(self.list()?.pop())
    }

    /// Bundle `physical_root` into a new snapshot, then prune old ones.
    pub fn snapshot(&self, physical_root: &Path) -> SnfsResult<SnapshotReport> {
        self.snapshot_at(physical_root, Utc::now())
    }

    pub(crate) fn snapshot_at(
        &self,
        physical_root: &Path,
        now: DateTime<Utc>,
    ) -> SnfsResult<SnapshotReport> {
        let report = self.write_snapshot(physical_root, now).map_err(archive_err)?;
        info!(
            path = %report.snapshot.path.display(),
            entries = report.entries,
            bytes = report.content_bytes,
            compressed = report.compressed_bytes,
            "snapshot written"
        );

        if let Err(e) = self.prune() {
            warn!("snapshot pruning failed: {e}");
        }
        Ok(report)
    }

    fn write_snapshot(&self, root: &Path, now: DateTime<Utc>) -> Result<SnapshotReport> {
        let root = root
            .canonicalize()
            .with_context(|| format!("physical root {}", root.display()))?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating archive dir {}", self.dir.display()))?;
        if self.dir.canonicalize()?.starts_with(&root) {
            bail!(
                "archive dir {} is inside the physical root {}",
                self.dir.display(),
                root.display()
            );
        }
        let dir = &self.dir;

        // distinct names even for snapshots within the same millisecond
        let mut created = now;
        while dir.join(snapshot_name(created)).exists() {
            created += Duration::milliseconds(1);
        }
        let name = snapshot_name(created);
        let path = dir.join(&name);
        let tmp = dir.join(format!(".{name}.tmp"));

        let result = (|| -> Result<(usize, u64)> {
            let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
            let encoder = zstd::Encoder::new(BufWriter::new(file), self.level)
                .context("starting zstd stream")?;
            let mut bundle = BundleWriter::new(encoder)?;
            walk(&root, Path::new(""), &mut bundle)?;
            let (entries, bytes) = (bundle.entries(), bundle.content_bytes());

            let encoder = bundle.finish()?;
            let file = encoder
                .finish()
                .context("finishing zstd stream")?
                .into_inner()
                .map_err(|e| e.into_error())?;
            file.sync_all()?;
            Ok((entries, bytes))
        })();

        let (entries, content_bytes) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        fs::rename(&tmp, &path).with_context(|| format!("publishing {}", path.display()))?;

        Ok(SnapshotReport {
            compressed_bytes: fs::metadata(&path)?.len(),
            snapshot: ArchiveSnapshot { path, created },
            entries,
            content_bytes,
        })
    }

    /// Delete all but the newest `keep` snapshots.
    pub fn prune(&self) -> SnfsResult<usize> {
        if self.keep == 0 {
            return Ok(0);
        }
        let snapshots = self.list()?;
        let excess = snapshots.len().saturating_sub(self.keep);
        for old in &snapshots[..excess] {
            fs::remove_file(&old.path)?;
            debug!(path = %old.path.display(), "pruned snapshot");
        }
        Ok(excess)
    }

    /// Restore the newest snapshot into `physical_root` if the root is
    /// missing or empty. Returns the snapshot used, or `None` if nothing was
    /// done.
    ///
    /// The snapshot is unpacked into a sibling staging directory first; the
    /// root is only replaced once the whole bundle has verified.
    pub fn restore_latest(&self, physical_root: &Path) -> SnfsResult<Option<ArchiveSnapshot>> {
        if !is_empty_dir(physical_root)? {
            debug!(root = %physical_root.display(), "physical root not empty, skipping restore");
            return Ok(None);
        }
        let Some(latest) = self.latest()? else {
            debug!(dir = %self.dir.display(), "no snapshots to restore");
            return Ok(None);
        };

        self.restore_into(&latest, physical_root).map_err(archive_err)?;
        info!(
            snapshot = %latest.path.display(),
            root = %physical_root.display(),
            "restored snapshot"
        );
        Ok(Some(latest))
    }

    fn restore_into(&self, snapshot: &ArchiveSnapshot, root: &Path) -> Result<()> {
        let staging = staging_dir(root)?;
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)
            .with_context(|| format!("creating staging dir {}", staging.display()))?;

        if let Err(e) = unpack(&snapshot.path, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.context(format!("unpacking {}", snapshot.path.display())));
        }

        if root.exists() {
            fs::remove_dir(root).with_context(|| format!("clearing {}", root.display()))?;
        }
        fs::rename(&staging, root)
            .with_context(|| format!("moving restored tree into {}", root.display()))?;
        Ok(())
    }
}

/// Recursively bundle `root/rel` in sorted name order.
fn walk<W: std::io::Write>(root: &Path, rel: &Path, bundle: &mut BundleWriter<W>) -> Result<()> {
    let dir = root.join(rel);
    let mut children: Vec<_> = fs::read_dir(&dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let child_rel = rel.join(child.file_name());
        let file_type = child.file_type()?;
        if file_type.is_dir() {
            bundle.add_dir(&child_rel)?;
            walk(root, &child_rel, bundle)?;
        } else if file_type.is_file() {
            let file = File::open(child.path())
                .with_context(|| format!("opening {}", child_rel.display()))?;
            let len = file.metadata()?.len();
            bundle.add_file(&child_rel, len, BufReader::new(file))?;
        } else {
            warn!(path = %child_rel.display(), "skipping non-regular entry");
        }
    }
    Ok(())
}

/// Verify and extract a snapshot into an existing empty directory.
pub fn unpack(snapshot: &Path, dest: &Path) -> Result<()> {
    let file = File::open(snapshot)?;
    let decoder = zstd::Decoder::new(file).context("starting zstd stream")?;
    let mut bundle = BundleReader::new(decoder)?;

    while let Some(entry) = bundle.next_entry()? {
        match entry {
            Entry::Dir(rel) => fs::create_dir_all(dest.join(&rel))?,
            Entry::File { path: rel, .. } => {
                let target = dest.join(&rel);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = BufWriter::new(
                    File::create(&target).with_context(|| format!("creating {}", rel.display()))?,
                );
                bundle.copy_content(&mut out)?;
                std::io::Write::flush(&mut out)?;
            }
        }
    }
    Ok(())
}

/// Read a snapshot end to end and check its digest without extracting.
pub fn verify(snapshot: &Path) -> SnfsResult<usize> {
    let run = || -> Result<usize> {
        let decoder = zstd::Decoder::new(File::open(snapshot)?)?;
        let mut bundle = BundleReader::new(decoder)?;
        let mut n = 0;
        while bundle.next_entry()?.is_some() {
            n += 1;
        }
        Ok(n)
    };
    run().map_err(archive_err)
}

fn is_empty_dir(path: &Path) -> SnfsResult<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn staging_dir(root: &Path) -> Result<PathBuf> {
    let name = root
        .file_name()
        .with_context(|| format!("physical root has no name: {}", root.display()))?;
    let mut staging_name = std::ffi::OsString::from(".");
    staging_name.push(name);
    staging_name.push(".restoring");
    Ok(root.with_file_name(staging_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_round_trip_and_sort() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap() + Duration::milliseconds(42);
        let name = snapshot_name(t);
        assert_eq!(name, "snfs-20240309T070501042Z.snfsa.zst");
        assert_eq!(parse_snapshot_name(&name), Some(t));

        assert_eq!(parse_snapshot_name("snfs-garbage.snfsa.zst"), None);
        assert_eq!(parse_snapshot_name("other-20240309T070501042Z.snfsa.zst"), None);
    }

    #[test]
    fn staging_is_a_hidden_sibling() {
        let staging = staging_dir(Path::new("/srv/data")).unwrap();
        assert_eq!(staging, Path::new("/srv/.data.restoring"));
    }

    #[test]
    fn missing_dir_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ArchiveManager::new(dir.path().join("nope"), 3, 10);
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn same_millisecond_snapshots_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        let manager = ArchiveManager::new(dir.path().join("archives"), 3, 0);

        let now = Utc::now();
        let a = manager.snapshot_at(&root, now).unwrap();
        let b = manager.snapshot_at(&root, now).unwrap();
        assert_ne!(a.snapshot.path, b.snapshot.path);
        assert_eq!(manager.list().unwrap().len(), 2);
    }
}
