//! snfs-fuse: the virtual filesystem router and its FUSE adapter
//!
//! The router is plain blocking code and always built. The adapter needs
//! the `fuse` feature.
//!
//! Linux: fuse3 crate (kernel FUSE)
//! macOS: fuse3 with macFUSE 4.x (feature: macos-fuse)

pub mod driver;
pub mod errno;
pub mod router;

// Re-export the mount API when the fuse feature is enabled
#[cfg(feature = "fuse")]
pub use driver::{mount, unmount, MountConfig};

pub use errno::errno_for;
pub use router::{DirEntry, FsStats, NodeAttr, NodeKind, OpenHandle, VirtualFsRouter};
