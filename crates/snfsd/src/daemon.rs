//! Daemon lifecycle: restore, unlock, mount, flush, snapshot

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use snfs_archive::ArchiveManager;
use snfs_core::config::{expand_tilde, SnfsConfig};
use snfs_crypto::{KdfParams, KeyManager, MasterKey};
use snfs_fuse::VirtualFsRouter;
use snfs_store::EncryptedFileStore;
use tracing::{debug, info, warn};

use crate::passphrase;

/// Filesystem locations from the config, with `~` expanded.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub virtual_root: PathBuf,
    pub physical_root: PathBuf,
    pub key_file: PathBuf,
    pub archive_dir: PathBuf,
}

impl DaemonPaths {
    pub fn resolve(config: &SnfsConfig) -> Self {
        Self {
            virtual_root: expand_tilde(&config.paths.virtual_root),
            physical_root: expand_tilde(&config.paths.physical_root),
            key_file: expand_tilde(&config.paths.key_file),
            archive_dir: expand_tilde(&config.archive.dir),
        }
    }

    /// Create the mountpoint and the physical root if missing.
    pub fn create_roots(&self) -> Result<()> {
        for dir in [&self.virtual_root, &self.physical_root] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn key_manager(config: &SnfsConfig, paths: &DaemonPaths) -> KeyManager {
    KeyManager::new(paths.key_file.clone(), KdfParams::from(&config.crypto))
}

pub fn archive_manager(config: &SnfsConfig, paths: &DaemonPaths) -> ArchiveManager {
    ArchiveManager::from_config(&config.archive, paths.archive_dir.clone())
}

pub async fn run(config: SnfsConfig) -> Result<()> {
    let paths = DaemonPaths::resolve(&config);
    info!(
        virtual_root = %paths.virtual_root.display(),
        physical_root = %paths.physical_root.display(),
        "daemon starting"
    );

    // A snapshot can only land in an empty root, so restore before creating
    // anything inside it.
    if config.archive.enabled && config.archive.restore_on_start {
        restore_on_start(&archive_manager(&config, &paths), &paths);
    }
    paths.create_roots()?;

    let master = unlock(&key_manager(&config, &paths))?;
    let router = open_router(&config, &paths, &master)?;
    drop(master);

    serve(router.clone(), &config, &paths).await?;

    shutdown(&router, &config, &paths);
    info!("daemon stopped");
    Ok(())
}

/// Unlock the master key, creating the key file on first run.
fn unlock(keys: &KeyManager) -> Result<MasterKey> {
    if keys.is_initialized() {
        let master = keys
            .unlock(passphrase::current()?)
            .with_context(|| format!("unlocking {}", keys.path().display()))?;
        info!("master key unlocked");
        return Ok(master);
    }

    info!(path = %keys.path().display(), "no key file found, creating one");
    let (_, master) = keys
        .first_run_setup(passphrase::new_for(passphrase::PASSPHRASE_ENV)?)
        .context("first-run key setup")?;
    Ok(master)
}

/// Restore the newest snapshot into an empty physical root. Failures only warn.
pub fn restore_on_start(archive: &ArchiveManager, paths: &DaemonPaths) {
    match archive.restore_latest(&paths.physical_root) {
        Ok(Some(snapshot)) => {
            info!(snapshot = %snapshot.path.display(), "physical root restored")
        }
        Ok(None) => debug!("no restore needed"),
        Err(e) => warn!("restore failed: {e}  (continuing with the current physical root)"),
    }
}

pub fn open_router(
    config: &SnfsConfig,
    paths: &DaemonPaths,
    master: &MasterKey,
) -> Result<Arc<VirtualFsRouter>> {
    let store = EncryptedFileStore::new(master, config.crypto.block_size, config.fuse.cache_blocks)
        .context("building encrypted file store")?;
    Ok(Arc::new(VirtualFsRouter::new(
        paths.physical_root.clone(),
        store,
    )))
}

/// Flush every open handle, then snapshot the physical root if configured.
///
/// Returns true when a snapshot was written.
pub fn shutdown(router: &VirtualFsRouter, config: &SnfsConfig, paths: &DaemonPaths) -> bool {
    if let Err(e) = router.flush_all() {
        warn!("flush on shutdown failed: {e}");
    }

    if !(config.archive.enabled && config.archive.snapshot_on_exit) {
        return false;
    }
    let open = router.open_handles();
    if open > 0 {
        warn!(open, "handles still open after unmount, skipping snapshot");
        return false;
    }

    match archive_manager(config, paths).snapshot(&paths.physical_root) {
        Ok(report) => {
            info!(
                snapshot = %report.snapshot.path.display(),
                entries = report.entries,
                compressed_bytes = report.compressed_bytes,
                "snapshot written"
            );
            true
        }
        Err(e) => {
            warn!("snapshot failed: {e}");
            false
        }
    }
}

/// Mount and block until the filesystem is unmounted or a signal arrives.
#[cfg(feature = "fuse")]
async fn serve(
    router: Arc<VirtualFsRouter>,
    config: &SnfsConfig,
    paths: &DaemonPaths,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mount = snfs_fuse::mount(snfs_fuse::MountConfig {
        router,
        mountpoint: paths.virtual_root.clone(),
        allow_other: config.fuse.allow_other,
        attr_ttl: std::time::Duration::from_secs(config.fuse.attr_ttl_secs),
    });
    tokio::pin!(mount);

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        res = &mut mount => return res.context("FUSE session failed"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    let mountpoint = paths.virtual_root.clone();
    let unmounted = tokio::task::spawn_blocking(move || snfs_fuse::unmount(&mountpoint))
        .await
        .context("unmount task panicked")?;
    match unmounted {
        Ok(()) => mount.await.context("FUSE session failed"),
        Err(e) => {
            warn!("unmount failed: {e}  (flushing anyway)");
            Ok(())
        }
    }
}

#[cfg(not(feature = "fuse"))]
async fn serve(
    _router: Arc<VirtualFsRouter>,
    _config: &SnfsConfig,
    _paths: &DaemonPaths,
) -> Result<()> {
    anyhow::bail!("mounting requires the fuse feature: cargo build -p snfsd --features fuse")
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::path::Path;

    fn config(base: &Path) -> SnfsConfig {
        let mut config = SnfsConfig::default();
        config.paths.virtual_root = base.join("notes");
        config.paths.physical_root = base.join("data");
        config.paths.key_file = base.join("keys/key");
        config.archive.dir = base.join("archives");
        config.crypto.argon2_mem_cost_kib = 64;
        config.crypto.argon2_time_cost = 1;
        config.crypto.argon2_parallelism = 1;
        config.crypto.block_size = 512;
        config
    }

    fn first_run(config: &SnfsConfig, paths: &DaemonPaths) -> MasterKey {
        key_manager(config, paths)
            .first_run_setup(SecretString::from("hunter2"))
            .unwrap()
            .1
    }

    #[test]
    fn paths_expand_tilde() {
        let mut config = SnfsConfig::default();
        config.paths.key_file = PathBuf::from("~/.securenotefs/key");
        let paths = DaemonPaths::resolve(&config);
        assert!(!paths.key_file.starts_with("~"));
        assert!(paths.key_file.ends_with(".securenotefs/key"));
        assert_eq!(paths.physical_root, PathBuf::from("data"));
    }

    #[test]
    fn shutdown_flushes_then_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let paths = DaemonPaths::resolve(&config);
        paths.create_roots().unwrap();

        let master = first_run(&config, &paths);
        let router = open_router(&config, &paths, &master).unwrap();
        let fh = router.create(Path::new("/n"), 0o644).unwrap();
        router.write(fh, 0, b"kept across restarts").unwrap();
        router.release(fh).unwrap();

        assert!(shutdown(&router, &config, &paths));
        let archive = archive_manager(&config, &paths);
        assert_eq!(archive.list().unwrap().len(), 1);

        // lose the physical root, then start again
        std::fs::remove_dir_all(&paths.physical_root).unwrap();
        restore_on_start(&archive, &paths);
        let master = key_manager(&config, &paths)
            .unlock(SecretString::from("hunter2"))
            .unwrap();
        let router = open_router(&config, &paths, &master).unwrap();
        let fh = router.open(Path::new("/n")).unwrap();
        assert_eq!(router.read(fh, 0, 100).unwrap(), b"kept across restarts");
        router.release(fh).unwrap();
    }

    #[test]
    fn open_handles_block_the_exit_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let paths = DaemonPaths::resolve(&config);
        paths.create_roots().unwrap();

        let master = first_run(&config, &paths);
        let router = open_router(&config, &paths, &master).unwrap();
        let fh = router.create(Path::new("/busy"), 0o644).unwrap();
        router.write(fh, 0, b"pending").unwrap();

        assert!(!shutdown(&router, &config, &paths));
        assert!(archive_manager(&config, &paths).list().unwrap().is_empty());
        // the pending write still reached disk
        let header = router
            .store()
            .read_header(&paths.physical_root.join("busy"))
            .unwrap();
        assert_eq!(header.logical_length, 7);
    }

    #[test]
    fn disabled_archive_skips_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.archive.enabled = false;
        let paths = DaemonPaths::resolve(&config);
        paths.create_roots().unwrap();

        let master = first_run(&config, &paths);
        let router = open_router(&config, &paths, &master).unwrap();
        assert!(!shutdown(&router, &config, &paths));
        assert!(!paths.archive_dir.exists());
    }

    #[test]
    fn failed_restore_leaves_root_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let paths = DaemonPaths::resolve(&config);
        std::fs::create_dir_all(&paths.archive_dir).unwrap();
        std::fs::write(
            paths.archive_dir.join("snfs-20240101T000000000Z.snfsa.zst"),
            b"not a bundle",
        )
        .unwrap();

        restore_on_start(&archive_manager(&config, &paths), &paths);
        paths.create_roots().unwrap();
        assert_eq!(std::fs::read_dir(&paths.physical_root).unwrap().count(), 0);
    }
}
