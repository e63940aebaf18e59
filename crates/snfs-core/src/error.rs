use std::path::PathBuf;

use thiserror::Error;

use crate::types::HandleId;

pub type SnfsResult<T> = Result<T, SnfsError>;

#[derive(Debug, Error)]
pub enum SnfsError {
    /// Wrong passphrase or a damaged key file. The two are reported
    /// identically so the error does not reveal which one occurred.
    #[error("authentication failed: wrong passphrase or corrupted key file")]
    AuthenticationFailure,

    #[error("corrupted block {index}: authentication tag mismatch")]
    CorruptedBlock { index: u64 },

    #[error("corrupted file header")]
    CorruptedHeader,

    #[error("unknown file handle {0}")]
    UnknownHandle(HandleId),

    #[error("key file not found: {0}")]
    MissingKeyFile(PathBuf),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SnfsError {
    /// True for errors raised by authenticated decryption of stored data.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            SnfsError::CorruptedBlock { .. } | SnfsError::CorruptedHeader
        )
    }

    /// The OS error code of an underlying I/O failure, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            SnfsError::Storage(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// True if the underlying I/O failure was `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnfsError::Storage(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
