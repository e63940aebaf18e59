//! VirtualFsRouter: maps virtual paths onto the physical root, owns the
//! open-handle table, and forwards file content through the encrypted store.
//!
//! ## Locking
//!
//! The handle table sits behind one short-held mutex used only for lookups,
//! insertion, removal and reference counting. Each open handle has its own
//! mutex covering its block cache and header, so different files proceed in
//! parallel while operations on the same file are serialised. Block I/O never
//! happens with the table locked.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use snfs_core::{HandleId, SnfsError, SnfsResult};
use snfs_store::{EncryptedFile, EncryptedFileStore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Attributes reported for a virtual node. For files `size` is the logical
/// (plaintext) length; everything else passes through from the physical file.
#[derive(Debug, Clone)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl NodeAttr {
    fn from_metadata(kind: NodeKind, size: u64, meta: &Metadata) -> Self {
        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
        let atime = meta.accessed().unwrap_or(mtime);

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let ctime = UNIX_EPOCH
                + std::time::Duration::new(
                    meta.ctime().max(0) as u64,
                    meta.ctime_nsec().clamp(0, 999_999_999) as u32,
                );
            Self {
                kind,
                size,
                perm: (meta.mode() & 0o7777) as u16,
                nlink: meta.nlink() as u32,
                uid: meta.uid(),
                gid: meta.gid(),
                atime,
                mtime,
                ctime,
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                kind,
                size,
                perm: if kind == NodeKind::Directory { 0o755 } else { 0o644 },
                nlink: 1,
                uid: 0,
                gid: 0,
                atime,
                mtime,
                ctime: mtime,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: NodeKind,
}

/// Filesystem statistics of the physical root.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

// ── Handle table ──────────────────────────────────────────────────────────

struct HandleState {
    virtual_path: PathBuf,
    file: EncryptedFile,
}

/// One open file shared by every concurrent opener of its path.
pub struct OpenHandle {
    id: HandleId,
    state: Mutex<HandleState>,
}

impl OpenHandle {
    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct TableEntry {
    handle: Arc<OpenHandle>,
    refs: usize,
}

#[derive(Default)]
struct HandleTable {
    /// Physical path → handle, for handles whose file still has a name
    by_path: HashMap<PathBuf, HandleId>,
    arena: HashMap<HandleId, TableEntry>,
}

// ── VirtualFsRouter ───────────────────────────────────────────────────────

pub struct VirtualFsRouter {
    physical_root: PathBuf,
    store: EncryptedFileStore,
    table: Mutex<HandleTable>,
    /// fh 0 is left to directory handles in the host adapter
    next_id: AtomicU64,
}

impl VirtualFsRouter {
    pub fn new(physical_root: PathBuf, store: EncryptedFileStore) -> Self {
        Self {
            physical_root,
            store,
            table: Mutex::new(HandleTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn physical_root(&self) -> &Path {
        &self.physical_root
    }

    pub fn store(&self) -> &EncryptedFileStore {
        &self.store
    }

    /// Mirror `virtual_path` under the physical root.
    ///
    /// The virtual root is `/`; `..` components are rejected.
    pub fn physical_path(&self, virtual_path: &Path) -> SnfsResult<PathBuf> {
        let mut out = self.physical_root.clone();
        for component in virtual_path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => out.push(name),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(SnfsError::InvalidArgument(format!(
                        "path escapes the virtual root: {}",
                        virtual_path.display()
                    )))
                }
            }
        }
        Ok(out)
    }

    fn virtual_path_of(&self, physical: &Path) -> PathBuf {
        let rel = physical.strip_prefix(&self.physical_root).unwrap_or(physical);
        Path::new("/").join(rel)
    }

    fn table(&self) -> MutexGuard<'_, HandleTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, fh: HandleId) -> SnfsResult<Arc<OpenHandle>> {
        self.table()
            .arena
            .get(&fh)
            .map(|e| e.handle.clone())
            .ok_or(SnfsError::UnknownHandle(fh))
    }

    fn handle_for_path(&self, physical: &Path) -> Option<Arc<OpenHandle>> {
        let table = self.table();
        let id = table.by_path.get(physical)?;
        table.arena.get(id).map(|e| e.handle.clone())
    }

    /// Take another reference on an already-open path.
    fn acquire_existing(&self, physical: &Path) -> Option<HandleId> {
        let mut table = self.table();
        let id = *table.by_path.get(physical)?;
        let entry = table.arena.get_mut(&id)?;
        entry.refs += 1;
        Some(id)
    }

    /// Insert a freshly opened file. If another opener won the race for the
    /// same path, share theirs and hand back ours to be dropped unlocked.
    fn attach(
        &self,
        physical: PathBuf,
        virtual_path: PathBuf,
        file: EncryptedFile,
        replace: bool,
    ) -> (HandleId, Option<EncryptedFile>) {
        let mut table = self.table();
        if !replace {
            if let Some(&id) = table.by_path.get(&physical) {
                if let Some(entry) = table.arena.get_mut(&id) {
                    entry.refs += 1;
                    return (id, Some(file));
                }
            }
        }

        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(OpenHandle {
            id,
            state: Mutex::new(HandleState { virtual_path, file }),
        });
        table.arena.insert(id, TableEntry { handle, refs: 1 });
        table.by_path.insert(physical, id);
        (id, None)
    }

    // ── attributes and directories ────────────────────────────────────────

    pub fn getattr(&self, virtual_path: &Path) -> SnfsResult<NodeAttr> {
        let physical = self.physical_path(virtual_path)?;
        let meta = fs::symlink_metadata(&physical)?;

        if meta.is_dir() {
            return Ok(NodeAttr::from_metadata(NodeKind::Directory, meta.len(), &meta));
        }
        if !meta.is_file() {
            return Err(SnfsError::InvalidArgument(format!(
                "not a regular file: {}",
                virtual_path.display()
            )));
        }

        let size = match self.handle_for_path(&physical) {
            Some(handle) => handle.lock().file.logical_len(),
            None => self.store.read_header(&physical)?.logical_length,
        };
        Ok(NodeAttr::from_metadata(NodeKind::File, size, &meta))
    }

    /// Attributes through an open handle, valid even after unlink.
    pub fn getattr_handle(&self, fh: HandleId) -> SnfsResult<NodeAttr> {
        let handle = self.handle(fh)?;
        let state = handle.lock();
        let meta = state.file.metadata()?;
        Ok(NodeAttr::from_metadata(
            NodeKind::File,
            state.file.logical_len(),
            &meta,
        ))
    }

    /// Directory listing passed through from the physical tree, sorted by name.
    pub fn readdir(&self, virtual_path: &Path) -> SnfsResult<Vec<DirEntry>> {
        let physical = self.physical_path(virtual_path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&physical)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                NodeKind::Directory
            } else if file_type.is_file() {
                NodeKind::File
            } else {
                continue;
            };
            entries.push(DirEntry {
                name: entry.file_name(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Directory listing with attributes for every entry.
    ///
    /// An entry whose header fails verification stays listed with its
    /// physical attributes and size 0; `getattr` on it still reports the
    /// failure. Entries removed while listing are left out.
    pub fn readdir_attrs(&self, virtual_path: &Path) -> SnfsResult<Vec<(DirEntry, NodeAttr)>> {
        let mut out = Vec::new();
        for entry in self.readdir(virtual_path)? {
            let child = virtual_path.join(&entry.name);
            let attr = match self.getattr(&child) {
                Ok(attr) => attr,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    if e.is_integrity_failure() {
                        warn!(path = %child.display(), "listing unverifiable file: {e}");
                    } else {
                        debug!(path = %child.display(), "listing with physical attributes: {e}");
                    }
                    match fs::symlink_metadata(self.physical_path(&child)?) {
                        Ok(meta) => NodeAttr::from_metadata(entry.kind, 0, &meta),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            out.push((entry, attr));
        }
        Ok(out)
    }

    pub fn mkdir(&self, virtual_path: &Path, mode: u32) -> SnfsResult<()> {
        let physical = self.physical_path(virtual_path)?;
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        builder.create(&physical)?;
        debug!(path = %virtual_path.display(), mode, "mkdir");
        Ok(())
    }

    pub fn rmdir(&self, virtual_path: &Path) -> SnfsResult<()> {
        let physical = self.physical_path(virtual_path)?;
        fs::remove_dir(&physical)?;
        debug!(path = %virtual_path.display(), "rmdir");
        Ok(())
    }

    // ── file lifecycle ────────────────────────────────────────────────────

    /// Create an empty encrypted file and open it.
    pub fn create(&self, virtual_path: &Path, mode: u32) -> SnfsResult<HandleId> {
        let physical = self.physical_path(virtual_path)?;
        let file = self.store.create_file(&physical)?;
        set_mode(&physical, mode)?;

        let (id, _) = self.attach(physical, virtual_path.to_path_buf(), file, true);
        debug!(path = %virtual_path.display(), fh = %id, "create");
        Ok(id)
    }

    /// Open an existing file. Concurrent opens of one path share a handle.
    pub fn open(&self, virtual_path: &Path) -> SnfsResult<HandleId> {
        let physical = self.physical_path(virtual_path)?;
        if let Some(id) = self.acquire_existing(&physical) {
            debug!(path = %virtual_path.display(), fh = %id, "open (shared)");
            return Ok(id);
        }

        let file = self.store.open(&physical)?;
        let (id, unused) = self.attach(physical, virtual_path.to_path_buf(), file, false);
        drop(unused);
        debug!(path = %virtual_path.display(), fh = %id, "open");
        Ok(id)
    }

    pub fn read(&self, fh: HandleId, offset: u64, size: usize) -> SnfsResult<Vec<u8>> {
        let handle = self.handle(fh)?;
        let mut state = handle.lock();
        state.file.read(offset, size)
    }

    pub fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> SnfsResult<usize> {
        let handle = self.handle(fh)?;
        let mut state = handle.lock();
        state.file.write(offset, data)
    }

    /// Truncate by path, through the open handle if there is one.
    pub fn truncate(&self, virtual_path: &Path, len: u64) -> SnfsResult<()> {
        let physical = self.physical_path(virtual_path)?;
        match self.handle_for_path(&physical) {
            Some(handle) => handle.lock().file.truncate(len),
            None => self.store.truncate(&physical, len),
        }?;
        debug!(path = %virtual_path.display(), len, "truncate");
        Ok(())
    }

    pub fn truncate_handle(&self, fh: HandleId, len: u64) -> SnfsResult<()> {
        let handle = self.handle(fh)?;
        let mut state = handle.lock();
        state.file.truncate(len)
    }

    /// Write dirty blocks and the header of one handle.
    pub fn flush(&self, fh: HandleId) -> SnfsResult<()> {
        let handle = self.handle(fh)?;
        let mut state = handle.lock();
        state.file.flush()
    }

    /// Flush and persist one handle to stable storage.
    pub fn fsync(&self, fh: HandleId) -> SnfsResult<()> {
        let handle = self.handle(fh)?;
        let mut state = handle.lock();
        state.file.sync()
    }

    /// Drop one reference. Every release flushes; the last one removes the
    /// handle from the table.
    pub fn release(&self, fh: HandleId) -> SnfsResult<()> {
        let handle = self.handle(fh)?;
        let flushed = {
            let mut state = handle.lock();
            let result = state.file.flush();
            if let Err(e) = &result {
                warn!(path = %state.virtual_path.display(), fh = %fh, "flush on release failed: {e}");
            }
            result
        };

        let mut table = self.table();
        let last = match table.arena.get_mut(&fh) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if last {
            table.arena.remove(&fh);
            table.by_path.retain(|_, id| *id != fh);
        }
        drop(table);

        debug!(fh = %handle.id, last, "release");
        flushed
    }

    pub fn unlink(&self, virtual_path: &Path) -> SnfsResult<()> {
        let physical = self.physical_path(virtual_path)?;
        fs::remove_file(&physical)?;
        // open handles keep working on the unlinked file but lose their name
        self.table().by_path.remove(&physical);
        debug!(path = %virtual_path.display(), "unlink");
        Ok(())
    }

    /// Rename a file or directory and re-key every open handle beneath it.
    pub fn rename(&self, from: &Path, to: &Path) -> SnfsResult<()> {
        let src = self.physical_path(from)?;
        let dst = self.physical_path(to)?;
        if src == dst {
            return Ok(());
        }
        fs::rename(&src, &dst)?;

        let moved: Vec<(Arc<OpenHandle>, PathBuf)> = {
            let mut table = self.table();
            table.by_path.remove(&dst);

            let keys: Vec<PathBuf> = table
                .by_path
                .keys()
                .filter(|k| k.starts_with(&src))
                .cloned()
                .collect();

            let mut moved = Vec::with_capacity(keys.len());
            for old in keys {
                let (Some(id), Ok(rest)) = (table.by_path.remove(&old), old.strip_prefix(&src)) else {
                    continue;
                };
                let new = if rest.as_os_str().is_empty() {
                    dst.clone()
                } else {
                    dst.join(rest)
                };
                table.by_path.insert(new.clone(), id);
                if let Some(entry) = table.arena.get(&id) {
                    moved.push((entry.handle.clone(), new));
                }
            }
            moved
        };

        for (handle, physical) in moved {
            let mut state = handle.lock();
            state.virtual_path = self.virtual_path_of(&physical);
            state.file.set_path(physical);
        }

        debug!(from = %from.display(), to = %to.display(), "rename");
        Ok(())
    }

    // ── shutdown and introspection ────────────────────────────────────────

    /// Flush and sync every open handle. All handles are attempted; the
    /// first failure is returned.
    pub fn flush_all(&self) -> SnfsResult<()> {
        let handles: Vec<Arc<OpenHandle>> = self
            .table()
            .arena
            .values()
            .map(|e| e.handle.clone())
            .collect();

        let mut first_err = None;
        for handle in &handles {
            let mut state = handle.lock();
            if let Err(e) = state.file.sync() {
                warn!(path = %state.virtual_path.display(), "flush failed: {e}");
                first_err.get_or_insert(e);
            }
        }

        info!(handles = handles.len(), "flushed open handles");
        first_err.map_or(Ok(()), Err)
    }

    pub fn open_handles(&self) -> usize {
        self.table().arena.len()
    }

    /// Virtual paths of open handles, for diagnostics.
    pub fn open_paths(&self) -> Vec<PathBuf> {
        let handles: Vec<Arc<OpenHandle>> = self
            .table()
            .arena
            .values()
            .map(|e| e.handle.clone())
            .collect();
        let mut paths: Vec<PathBuf> = handles
            .iter()
            .map(|h| h.lock().virtual_path.clone())
            .collect();
        paths.sort();
        paths
    }

    // ── pass-through operations ───────────────────────────────────────────

    pub fn statfs(&self) -> SnfsResult<FsStats> {
        Ok(statvfs(&self.physical_root)?)
    }

    /// Existence check. Permission bits are not enforced beyond the host's own.
    pub fn access(&self, virtual_path: &Path) -> SnfsResult<()> {
        let physical = self.physical_path(virtual_path)?;
        fs::symlink_metadata(&physical)?;
        Ok(())
    }

    pub fn chmod(&self, virtual_path: &Path, mode: u32) -> SnfsResult<()> {
        let physical = self.physical_path(virtual_path)?;
        set_mode(&physical, mode)
    }

    pub fn set_times(
        &self,
        virtual_path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> SnfsResult<()> {
        let physical = self.physical_path(virtual_path)?;
        let mut times = fs::FileTimes::new();
        if let Some(t) = atime {
            times = times.set_accessed(t);
        }
        if let Some(t) = mtime {
            times = times.set_modified(t);
        }
        fs::File::open(&physical)?.set_times(times)?;
        Ok(())
    }
}

impl std::fmt::Debug for VirtualFsRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFsRouter")
            .field("physical_root", &self.physical_root)
            .field("open_handles", &self.open_handles())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> SnfsResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> SnfsResult<()> {
    Ok(())
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn statvfs(path: &Path) -> std::io::Result<FsStats> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let mut st = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: c_path is NUL-terminated and st points to writable storage.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), st.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: statvfs returned 0, so st is initialised.
    let st = unsafe { st.assume_init() };

    Ok(FsStats {
        blocks: st.f_blocks as u64,
        bfree: st.f_bfree as u64,
        bavail: st.f_bavail as u64,
        files: st.f_files as u64,
        ffree: st.f_ffree as u64,
        bsize: st.f_bsize as u32,
        namelen: st.f_namemax as u32,
        frsize: st.f_frsize as u32,
    })
}

#[cfg(not(unix))]
fn statvfs(_path: &Path) -> std::io::Result<FsStats> {
    Ok(FsStats {
        blocks: 1 << 30,
        bfree: 1 << 29,
        bavail: 1 << 29,
        files: 1 << 20,
        ffree: 1 << 19,
        bsize: 4096,
        namelen: 255,
        frsize: 4096,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use snfs_crypto::generate_master_key;

    fn router(root: &Path) -> VirtualFsRouter {
        let store = EncryptedFileStore::new(&generate_master_key(), 512, 8).unwrap();
        VirtualFsRouter::new(root.to_path_buf(), store)
    }

    #[test]
    fn paths_mirror_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        assert_eq!(
            r.physical_path(Path::new("/a/b.txt")).unwrap(),
            dir.path().join("a/b.txt")
        );
        assert_eq!(r.physical_path(Path::new("/")).unwrap(), dir.path());
        assert_eq!(
            r.virtual_path_of(&dir.path().join("x/y")),
            PathBuf::from("/x/y")
        );
    }

    #[test]
    fn parent_components_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        assert!(matches!(
            r.physical_path(Path::new("/a/../../etc/passwd")),
            Err(SnfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unknown_handle() {
        let dir = tempfile::tempdir().unwrap();
        let r = router(dir.path());
        assert!(matches!(
            r.read(HandleId(99), 0, 1),
            Err(SnfsError::UnknownHandle(HandleId(99)))
        ));
    }

    #[test]
    fn statfs_reports_the_physical_root() {
        let dir = tempfile::tempdir().unwrap();
        let stats = router(dir.path()).statfs().unwrap();
        assert!(stats.bsize > 0);
    }
}
