//! FUSE adapter: one `PathFilesystem` object forwarding every kernel
//! callback to the [`VirtualFsRouter`](crate::router::VirtualFsRouter).
//!
//! Router calls do blocking file I/O and run on the tokio blocking pool.
//! Errors are mapped to errno by [`errno_for`](crate::errno::errno_for).
//! Symlinks, hard links and extended attributes are left to the trait
//! defaults, which answer `ENOSYS`.

#[cfg(feature = "fuse")]
mod inner {
    use std::ffi::OsStr;
    use std::num::NonZeroU32;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use bytes::Bytes;
    use fuse3::path::prelude::*;
    use fuse3::{Errno, FileType, MountOptions, Timestamp};
    use futures_util::stream;
    use snfs_core::{HandleId, SnfsError, SnfsResult};
    use tracing::{debug, info, warn};

    use crate::errno::errno_for;
    use crate::router::{NodeAttr, NodeKind, VirtualFsRouter};

    const MAX_WRITE: u32 = 128 * 1024;

    /// The FUSE filesystem object.
    pub struct SnfsFs {
        router: Arc<VirtualFsRouter>,
        attr_ttl: Duration,
    }

    fn join(parent: &OsStr, name: &OsStr) -> PathBuf {
        Path::new(parent).join(name)
    }

    fn to_system_time(ts: Timestamp) -> SystemTime {
        UNIX_EPOCH + Duration::new(ts.sec.max(0) as u64, ts.nsec)
    }

    fn kind_of(kind: NodeKind) -> FileType {
        match kind {
            NodeKind::File => FileType::RegularFile,
            NodeKind::Directory => FileType::Directory,
        }
    }

    impl SnfsFs {
        pub fn new(router: Arc<VirtualFsRouter>, attr_ttl: Duration) -> Self {
            Self { router, attr_ttl }
        }

        /// Run `f` against the router on the blocking pool.
        async fn run<T, F>(&self, op: &'static str, f: F) -> fuse3::Result<T>
        where
            T: Send + 'static,
            F: FnOnce(&VirtualFsRouter) -> SnfsResult<T> + Send + 'static,
        {
            let router = self.router.clone();
            match tokio::task::spawn_blocking(move || f(&router)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    if e.is_integrity_failure() {
                        warn!(op, "{e}");
                    } else {
                        debug!(op, "{e}");
                    }
                    Err(Errno::from(errno_for(&e)))
                }
                Err(e) => {
                    warn!(op, "blocking task failed: {e}");
                    Err(Errno::from(libc::EIO))
                }
            }
        }

        fn file_attr(&self, attr: &NodeAttr) -> FileAttr {
            FileAttr {
                size: attr.size,
                blocks: attr.size.div_ceil(512),
                atime: attr.atime,
                mtime: attr.mtime,
                ctime: attr.ctime,
                #[cfg(target_os = "macos")]
                crtime: attr.ctime,
                kind: kind_of(attr.kind),
                perm: attr.perm,
                nlink: attr.nlink,
                uid: attr.uid,
                gid: attr.gid,
                rdev: 0,
                blksize: self.router.store().block_size(),
                #[cfg(target_os = "macos")]
                flags: 0,
            }
        }

        fn entry(&self, attr: &NodeAttr) -> ReplyEntry {
            ReplyEntry {
                ttl: self.attr_ttl,
                attr: self.file_attr(attr),
            }
        }
    }

    // ── PathFilesystem impl ────────────────────────────────────────────────────

    impl PathFilesystem for SnfsFs {
        async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
            debug!(root = %self.router.physical_root().display(), "snfs-fuse init");
            Ok(ReplyInit {
                max_write: NonZeroU32::new(MAX_WRITE).ok_or(Errno::from(libc::EINVAL))?,
            })
        }

        async fn destroy(&self, _req: Request) {
            info!("snfs-fuse unmounted");
        }

        async fn lookup(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
        ) -> fuse3::Result<ReplyEntry> {
            let path = join(parent, name);
            let attr = self.run("lookup", move |r| r.getattr(&path)).await?;
            Ok(self.entry(&attr))
        }

        async fn getattr(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            fh: Option<u64>,
            _flags: u32,
        ) -> fuse3::Result<ReplyAttr> {
            let path = path.map(PathBuf::from);
            let attr = self
                .run("getattr", move |r| match (path, fh) {
                    (Some(p), _) => r.getattr(&p),
                    (None, Some(fh)) => r.getattr_handle(HandleId(fh)),
                    (None, None) => Err(SnfsError::InvalidArgument("getattr without path".into())),
                })
                .await?;
            Ok(ReplyAttr {
                ttl: self.attr_ttl,
                attr: self.file_attr(&attr),
            })
        }

        async fn setattr(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            fh: Option<u64>,
            set_attr: SetAttr,
        ) -> fuse3::Result<ReplyAttr> {
            let path = path.map(PathBuf::from);
            let fh = fh.map(HandleId);
            let size = set_attr.size;
            let mode = set_attr.mode;
            let atime = set_attr.atime.map(to_system_time);
            let mtime = set_attr.mtime.map(to_system_time);

            let attr = self
                .run("setattr", move |r| {
                    if let Some(len) = size {
                        match (fh, &path) {
                            (Some(fh), _) => r.truncate_handle(fh, len)?,
                            (None, Some(p)) => r.truncate(p, len)?,
                            (None, None) => {
                                return Err(SnfsError::InvalidArgument("setattr without path".into()))
                            }
                        }
                    }
                    match (&path, fh) {
                        (Some(p), _) => {
                            if let Some(mode) = mode {
                                r.chmod(p, mode)?;
                            }
                            if atime.is_some() || mtime.is_some() {
                                r.set_times(p, atime, mtime)?;
                            }
                            r.getattr(p)
                        }
                        (None, Some(fh)) => r.getattr_handle(fh),
                        (None, None) => Err(SnfsError::InvalidArgument("setattr without path".into())),
                    }
                })
                .await?;
            Ok(ReplyAttr {
                ttl: self.attr_ttl,
                attr: self.file_attr(&attr),
            })
        }

        async fn mkdir(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
            mode: u32,
            umask: u32,
        ) -> fuse3::Result<ReplyEntry> {
            let path = join(parent, name);
            let attr = self
                .run("mkdir", move |r| {
                    r.mkdir(&path, mode & !umask)?;
                    r.getattr(&path)
                })
                .await?;
            Ok(self.entry(&attr))
        }

        async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
            let path = join(parent, name);
            self.run("unlink", move |r| r.unlink(&path)).await
        }

        async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
            let path = join(parent, name);
            self.run("rmdir", move |r| r.rmdir(&path)).await
        }

        async fn rename(
            &self,
            _req: Request,
            origin_parent: &OsStr,
            origin_name: &OsStr,
            parent: &OsStr,
            name: &OsStr,
        ) -> fuse3::Result<()> {
            let from = join(origin_parent, origin_name);
            let to = join(parent, name);
            self.run("rename", move |r| r.rename(&from, &to)).await
        }

        async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> fuse3::Result<ReplyOpen> {
            let path = PathBuf::from(path);
            let truncate = flags & libc::O_TRUNC as u32 != 0;
            let fh = self
                .run("open", move |r| {
                    let fh = r.open(&path)?;
                    if truncate {
                        r.truncate_handle(fh, 0)?;
                    }
                    Ok(fh)
                })
                .await?;
            Ok(ReplyOpen { fh: fh.0, flags: 0 })
        }

        async fn create(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
            mode: u32,
            _flags: u32,
        ) -> fuse3::Result<ReplyCreated> {
            let path = join(parent, name);
            let (fh, attr) = self
                .run("create", move |r| {
                    let fh = r.create(&path, mode)?;
                    Ok((fh, r.getattr_handle(fh)?))
                })
                .await?;
            Ok(ReplyCreated {
                ttl: self.attr_ttl,
                attr: self.file_attr(&attr),
                generation: 0,
                fh: fh.0,
                flags: 0,
            })
        }

        async fn read(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            offset: u64,
            size: u32,
        ) -> fuse3::Result<ReplyData> {
            let data = self
                .run("read", move |r| r.read(HandleId(fh), offset, size as usize))
                .await?;
            Ok(ReplyData {
                data: Bytes::from(data),
            })
        }

        async fn write(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            offset: u64,
            data: &[u8],
            _write_flags: u32,
            _flags: u32,
        ) -> fuse3::Result<ReplyWrite> {
            let data = data.to_vec();
            let written = self
                .run("write", move |r| r.write(HandleId(fh), offset, &data))
                .await?;
            Ok(ReplyWrite {
                written: written as u32,
            })
        }

        async fn flush(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            _lock_owner: u64,
        ) -> fuse3::Result<()> {
            self.run("flush", move |r| r.flush(HandleId(fh))).await
        }

        async fn fsync(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            _datasync: bool,
        ) -> fuse3::Result<()> {
            self.run("fsync", move |r| r.fsync(HandleId(fh))).await
        }

        async fn release(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            _flags: u32,
            _lock_owner: u64,
            _flush: bool,
        ) -> fuse3::Result<()> {
            self.run("release", move |r| r.release(HandleId(fh))).await
        }

        async fn access(&self, _req: Request, path: &OsStr, _mask: u32) -> fuse3::Result<()> {
            let path = PathBuf::from(path);
            self.run("access", move |r| r.access(&path)).await
        }

        async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
            let st = self.run("statfs", |r| r.statfs()).await?;
            Ok(ReplyStatFs {
                blocks: st.blocks,
                bfree: st.bfree,
                bavail: st.bavail,
                files: st.files,
                ffree: st.ffree,
                bsize: st.bsize,
                namelen: st.namelen,
                frsize: st.frsize,
            })
        }

        // Directory entry stream types
        type DirEntryStream<'a>
            = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
        where
            Self: 'a;

        type DirEntryPlusStream<'a>
            = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
        where
            Self: 'a;

        async fn opendir(
            &self,
            _req: Request,
            _path: &OsStr,
            _flags: u32,
        ) -> fuse3::Result<ReplyOpen> {
            Ok(ReplyOpen { fh: 0, flags: 0 })
        }

        async fn readdir<'a>(
            &'a self,
            _req: Request,
            path: &'a OsStr,
            _fh: u64,
            offset: i64,
        ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
            let dir = PathBuf::from(path);
            let listing = self.run("readdir", move |r| r.readdir(&dir)).await?;

            let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::new();
            let dots = [(".", 1i64), ("..", 2i64)];
            for (name, off) in dots {
                if off > offset {
                    entries.push(Ok(DirectoryEntry {
                        kind: FileType::Directory,
                        name: name.into(),
                        offset: off,
                    }));
                }
            }
            for (i, item) in listing.into_iter().enumerate() {
                let off = i as i64 + 3;
                if off > offset {
                    entries.push(Ok(DirectoryEntry {
                        kind: kind_of(item.kind),
                        name: item.name,
                        offset: off,
                    }));
                }
            }

            Ok(ReplyDirectory {
                entries: stream::iter(entries),
            })
        }

        async fn readdirplus<'a>(
            &'a self,
            _req: Request,
            path: &'a OsStr,
            _fh: u64,
            offset: u64,
            _lock_owner: u64,
        ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
            let dir = PathBuf::from(path);
            let (dir_attr, listing) = self
                .run("readdirplus", move |r| {
                    let dir_attr = r.getattr(&dir)?;
                    Ok((dir_attr, r.readdir_attrs(&dir)?))
                })
                .await?;

            let offset = offset as i64;
            let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> = Vec::new();
            for (name, off) in [(".", 1i64), ("..", 2i64)] {
                if off > offset {
                    entries.push(Ok(DirectoryEntryPlus {
                        kind: FileType::Directory,
                        name: name.into(),
                        offset: off,
                        attr: self.file_attr(&dir_attr),
                        entry_ttl: self.attr_ttl,
                        attr_ttl: self.attr_ttl,
                    }));
                }
            }
            for (i, (item, attr)) in listing.into_iter().enumerate() {
                let off = i as i64 + 3;
                if off > offset {
                    entries.push(Ok(DirectoryEntryPlus {
                        kind: kind_of(item.kind),
                        name: item.name,
                        offset: off,
                        attr: self.file_attr(&attr),
                        entry_ttl: self.attr_ttl,
                        attr_ttl: self.attr_ttl,
                    }));
                }
            }

            Ok(ReplyDirectoryPlus {
                entries: stream::iter(entries),
            })
        }
    }

    // ── Public mount API ──────────────────────────────────────────────────────

    /// Mount configuration
    pub struct MountConfig {
        pub router: Arc<VirtualFsRouter>,
        pub mountpoint: PathBuf,
        pub allow_other: bool,
        pub attr_ttl: Duration,
    }

    /// Mount the filesystem and block until unmounted.
    ///
    /// Returns when the filesystem is unmounted (`fusermount3 -u`, or
    /// [`unmount`] from a signal handler).
    pub async fn mount(cfg: MountConfig) -> std::io::Result<()> {
        let fs = SnfsFs::new(cfg.router, cfg.attr_ttl);

        let mut opts = MountOptions::default();
        opts.fs_name("snfs");
        opts.force_readdir_plus(true);
        if cfg.allow_other {
            opts.allow_other(true);
        }

        info!(mountpoint = %cfg.mountpoint.display(), "mounting snfs (unprivileged via fusermount3)");

        let handle = Session::new(opts)
            .mount_with_unprivileged(fs, &cfg.mountpoint)
            .await?;

        handle.await
    }

    /// Ask the host to unmount `mountpoint`, which ends a running [`mount`].
    pub fn unmount(mountpoint: &Path) -> std::io::Result<()> {
        #[cfg(target_os = "macos")]
        let mut cmd = {
            let mut c = std::process::Command::new("umount");
            c.arg(mountpoint);
            c
        };
        #[cfg(not(target_os = "macos"))]
        let mut cmd = {
            let mut c = std::process::Command::new("fusermount3");
            c.arg("-u").arg(mountpoint);
            c
        };

        let status = cmd.status()?;
        if status.success() {
            return Ok(());
        }
        // plain umount works as root or with FUSE-T
        let fallback = std::process::Command::new("umount").arg(mountpoint).status()?;
        if fallback.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "unmount of {} failed ({status})",
                mountpoint.display()
            )))
        }
    }
}

#[cfg(feature = "fuse")]
pub use inner::{mount, unmount, MountConfig, SnfsFs};
