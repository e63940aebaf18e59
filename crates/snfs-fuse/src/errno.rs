//! Error → errno mapping for the host dispatch layer.

use std::io::ErrorKind;

use snfs_core::SnfsError;

/// The errno reported to the kernel for `err`.
///
/// Integrity failures surface as `EIO`; I/O errors keep their OS code.
pub fn errno_for(err: &SnfsError) -> i32 {
    match err {
        SnfsError::Storage(e) => e.raw_os_error().unwrap_or(match e.kind() {
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::AlreadyExists => libc::EEXIST,
            ErrorKind::PermissionDenied => libc::EACCES,
            ErrorKind::InvalidInput => libc::EINVAL,
            ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
            _ => libc::EIO,
        }),
        SnfsError::UnknownHandle(_) => libc::EBADF,
        SnfsError::InvalidArgument(_) => libc::EINVAL,
        SnfsError::CorruptedBlock { .. }
        | SnfsError::CorruptedHeader
        | SnfsError::AuthenticationFailure
        | SnfsError::MissingKeyFile(_)
        | SnfsError::Archive(_)
        | SnfsError::Config(_)
        | SnfsError::Other(_) => libc::EIO,
    }
}
