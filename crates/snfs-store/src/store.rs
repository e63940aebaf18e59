//! Factory for encrypted files sharing one codec and one set of parameters.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use snfs_core::config::validate_block_size;
use snfs_core::SnfsResult;
use snfs_crypto::{BlockCodec, MasterKey};

use crate::file::{read_header, EncryptedFile};
use crate::header::FileHeader;

#[derive(Debug, Clone)]
pub struct EncryptedFileStore {
    codec: Arc<BlockCodec>,
    block_size: u32,
    cache_blocks: usize,
}

impl EncryptedFileStore {
    /// `block_size` applies to files created by this store; existing files
    /// keep the block size recorded in their header.
    pub fn new(master: &MasterKey, block_size: u32, cache_blocks: usize) -> SnfsResult<Self> {
        validate_block_size(block_size)?;
        Ok(Self {
            codec: Arc::new(BlockCodec::new(master)?),
            block_size,
            cache_blocks: cache_blocks.max(1),
        })
    }

    pub fn codec(&self) -> &BlockCodec {
        &self.codec
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn cache_blocks(&self) -> usize {
        self.cache_blocks
    }

    /// Create an empty encrypted file at `path`. Fails if it already exists.
    pub fn create(&self, path: &Path) -> SnfsResult<FileHeader> {
        let file = self.create_file(path)?;
        Ok(file.header().clone())
    }

    /// Create an empty encrypted file and keep it open.
    pub fn create_file(&self, path: &Path) -> SnfsResult<EncryptedFile> {
        EncryptedFile::create(path, self.codec.clone(), self.block_size, self.cache_blocks)
    }

    /// Open an existing encrypted file, verifying its header.
    pub fn open(&self, path: &Path) -> SnfsResult<EncryptedFile> {
        EncryptedFile::open(path, self.codec.clone(), self.cache_blocks)
    }

    /// Read and verify just the header. Used for attributes of files that
    /// are not open.
    pub fn read_header(&self, path: &Path) -> SnfsResult<FileHeader> {
        let mut file = File::open(path)?;
        read_header(&mut file, &self.codec)
    }

    // One-shot helpers: open, operate, flush.

    pub fn read(&self, path: &Path, offset: u64, len: usize) -> SnfsResult<Vec<u8>> {
        self.open(path)?.read(offset, len)
    }

    pub fn write(&self, path: &Path, offset: u64, data: &[u8]) -> SnfsResult<usize> {
        let mut file = self.open(path)?;
        let n = file.write(offset, data)?;
        file.flush()?;
        Ok(n)
    }

    pub fn truncate(&self, path: &Path, len: u64) -> SnfsResult<()> {
        let mut file = self.open(path)?;
        file.truncate(len)?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snfs_core::SnfsError;
    use snfs_crypto::generate_master_key;

    #[test]
    fn rejects_bad_block_size() {
        let key = generate_master_key();
        assert!(EncryptedFileStore::new(&key, 1000, 8).is_err());
        assert!(EncryptedFileStore::new(&key, 4096, 8).is_ok());
    }

    #[test]
    fn create_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileStore::new(&generate_master_key(), 4096, 8).unwrap();
        let path = dir.path().join("a");

        let header = store.create(&path).unwrap();
        assert_eq!(header.logical_length, 0);
        assert_eq!(header.block_size, 4096);
        assert!(matches!(store.create(&path), Err(SnfsError::Storage(_))));
    }

    #[test]
    fn one_shot_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileStore::new(&generate_master_key(), 512, 8).unwrap();
        let path = dir.path().join("a");
        store.create(&path).unwrap();

        assert_eq!(store.write(&path, 0, b"hello world").unwrap(), 11);
        assert_eq!(store.read(&path, 6, 100).unwrap(), b"world");
        store.truncate(&path, 5).unwrap();
        assert_eq!(store.read_header(&path).unwrap().logical_length, 5);
    }

    #[test]
    fn other_key_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let a = EncryptedFileStore::new(&generate_master_key(), 4096, 8).unwrap();
        let b = EncryptedFileStore::new(&generate_master_key(), 4096, 8).unwrap();
        a.write(&path, 0, b"x").unwrap_err();
        a.create(&path).unwrap();
        a.write(&path, 0, b"secret").unwrap();

        assert!(matches!(b.open(&path), Err(SnfsError::CorruptedHeader)));
    }
}
