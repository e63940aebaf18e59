//! Index/offset arithmetic for the physical block layout.
//!
//! The "encoded extent" is the number of plaintext bytes physically present
//! as encrypted blocks. It never exceeds the logical length; bytes between
//! the two are implicit zeros that have not been materialised yet.

use snfs_crypto::TAG_SIZE;

use crate::header::HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: u64,
}

impl BlockLayout {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size: u64::from(block_size),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Bytes one full block occupies on disk.
    pub fn stride(&self) -> u64 {
        self.block_size + TAG_SIZE as u64
    }

    /// Physical offset of block `index`.
    pub fn block_offset(&self, index: u64) -> u64 {
        HEADER_LEN as u64 + index * self.stride()
    }

    /// Index of the block containing plaintext byte `pos`.
    pub fn block_index(&self, pos: u64) -> u64 {
        pos / self.block_size
    }

    /// Number of blocks needed for `len` plaintext bytes.
    pub fn block_count(&self, len: u64) -> u64 {
        len.div_ceil(self.block_size)
    }

    /// Plaintext length of block `index` in a file of `len` bytes
    /// (0 for blocks past the end).
    pub fn block_len(&self, index: u64, len: u64) -> usize {
        let start = index * self.block_size;
        len.saturating_sub(start).min(self.block_size) as usize
    }

    /// Physical file size for an encoded extent of `encoded` bytes.
    pub fn physical_len(&self, encoded: u64) -> u64 {
        let full = encoded / self.block_size;
        let tail = encoded % self.block_size;
        let mut len = HEADER_LEN as u64 + full * self.stride();
        if tail > 0 {
            len += tail + TAG_SIZE as u64;
        }
        len
    }

    /// Inverse of [`BlockLayout::physical_len`]. `None` if `physical` cannot
    /// be produced by any encoded extent.
    pub fn encoded_from_physical(&self, physical: u64) -> Option<u64> {
        let body = physical.checked_sub(HEADER_LEN as u64)?;
        let full = body / self.stride();
        let rem = body % self.stride();
        match rem {
            0 => Some(full * self.block_size),
            r if r > TAG_SIZE as u64 => Some(full * self.block_size + r - TAG_SIZE as u64),
            _ => None,
        }
    }
}
