//! One open encrypted file: authenticated header, bounded block cache, and
//! the read-modify-write algorithms over whole blocks.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snfs_core::{SnfsError, SnfsResult};
use snfs_crypto::codec::encoded_len;
use snfs_crypto::BlockCodec;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::header::{random_stream_id, FileHeader, HEADER_LEN};
use crate::layout::BlockLayout;

/// A decoded block held in memory.
struct CachedBlock {
    data: Zeroizing<Vec<u8>>,
    dirty: bool,
}

impl CachedBlock {
    fn empty() -> Self {
        Self {
            data: Zeroizing::new(Vec::new()),
            dirty: false,
        }
    }
}

pub struct EncryptedFile {
    file: File,
    path: PathBuf,
    read_only: bool,
    codec: Arc<BlockCodec>,
    header: FileHeader,
    layout: BlockLayout,
    /// Plaintext bytes physically present as encoded blocks. Never above the
    /// logical length, except in a read-only file left by an interrupted shrink.
    encoded: u64,
    cache: BTreeMap<u64, CachedBlock>,
    cache_limit: usize,
    header_dirty: bool,
}

impl std::fmt::Debug for EncryptedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFile")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("encoded", &self.encoded)
            .field("cached_blocks", &self.cache.len())
            .finish()
    }
}

impl EncryptedFile {
    pub(crate) fn create(
        path: &Path,
        codec: Arc<BlockCodec>,
        block_size: u32,
        cache_limit: usize,
    ) -> SnfsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut this = Self {
            file,
            path: path.to_path_buf(),
            read_only: false,
            codec,
            header: FileHeader::new(block_size),
            layout: BlockLayout::new(block_size),
            encoded: 0,
            cache: BTreeMap::new(),
            cache_limit: cache_limit.max(1),
            header_dirty: true,
        };
        this.write_header()?;

        debug!(path = %path.display(), stream = ?this.header.stream_id, block_size, "created");
        Ok(this)
    }

    pub(crate) fn open(path: &Path, codec: Arc<BlockCodec>, cache_limit: usize) -> SnfsResult<Self> {
        let (mut file, read_only) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => (f, false),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => (File::open(path)?, true),
            Err(e) => return Err(e.into()),
        };

        let header = read_header(&mut file, &codec)?;
        let layout = BlockLayout::new(header.block_size);
        let physical = file.metadata()?.len();
        let encoded = layout.encoded_from_physical(physical).ok_or_else(|| {
            warn!(path = %path.display(), physical, "physical size does not match header");
            SnfsError::CorruptedHeader
        })?;

        let mut this = Self {
            file,
            path: path.to_path_buf(),
            read_only,
            codec,
            header,
            layout,
            encoded,
            cache: BTreeMap::new(),
            cache_limit: cache_limit.max(1),
            header_dirty: false,
        };
        if encoded > this.header.logical_length {
            this.finish_shrink(encoded)?;
        }
        Ok(this)
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Plaintext length, including writes not yet flushed.
    pub fn logical_len(&self) -> u64 {
        self.header.logical_length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a rename of the underlying physical file.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    /// Metadata of the physical file, valid after it has been unlinked.
    pub fn metadata(&self) -> SnfsResult<std::fs::Metadata> {
        Ok(self.file.metadata()?)
    }

    pub fn is_dirty(&self) -> bool {
        self.header_dirty || self.cache.values().any(|b| b.dirty)
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// Read up to `len` bytes at `offset`. Short at end of file, empty past it.
    pub fn read(&mut self, offset: u64, len: usize) -> SnfsResult<Vec<u8>> {
        let logical = self.header.logical_length;
        if len == 0 || offset >= logical {
            return Ok(Vec::new());
        }
        let end = logical.min(offset.saturating_add(len as u64));
        let bs = self.layout.block_size();

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = self.layout.block_index(pos);
            let within = (pos - index * bs) as usize;
            let take = (bs - within as u64).min(end - pos) as usize;

            let block = self.cached_block(index, true)?;
            out.extend_from_slice(&block.data[within..within + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, extending the file if needed. Gaps between
    /// the old end and `offset` read back as zeros.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> SnfsResult<usize> {
        self.ensure_writable()?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| SnfsError::InvalidArgument("write beyond maximum file size".into()))?;
        let bs = self.layout.block_size();
        let new_len = self.header.logical_length.max(end);

        // Decode partially covered edge blocks first: an integrity failure
        // must abort before anything is modified.
        for index in [self.layout.block_index(offset), self.layout.block_index(end - 1)] {
            if !self.covers_block(index, offset, end, new_len) {
                self.cached_block(index, true)?;
            }
        }

        if new_len != self.header.logical_length {
            self.header.logical_length = new_len;
            self.header_dirty = true;
        }

        let mut pos = offset;
        let mut consumed = 0usize;
        while pos < end {
            let index = self.layout.block_index(pos);
            let within = (pos - index * bs) as usize;
            let take = (bs - within as u64).min(end - pos) as usize;
            let whole = self.covers_block(index, offset, end, new_len);

            let block = self.cached_block(index, !whole)?;
            block.data[within..within + take].copy_from_slice(&data[consumed..consumed + take]);
            block.dirty = true;

            pos += take as u64;
            consumed += take;
        }

        debug!(path = %self.path.display(), offset, len = data.len(), logical = new_len, "write");
        Ok(data.len())
    }

    /// Change the logical length.
    ///
    /// Shrinking drops blocks past the new end and re-encodes the new final
    /// partial block immediately. Growing only moves the logical length; the
    /// new region reads as zeros and is materialised by a later flush.
    /// Truncating to zero rotates the stream identifier.
    pub fn truncate(&mut self, new_len: u64) -> SnfsResult<()> {
        self.ensure_writable()?;
        let old_len = self.header.logical_length;
        if new_len == old_len {
            return Ok(());
        }
        if new_len == 0 {
            return self.reset();
        }
        if new_len > old_len {
            self.header.logical_length = new_len;
            self.header_dirty = true;
            debug!(path = %self.path.display(), old_len, new_len, "extended");
            return Ok(());
        }

        let bs = self.layout.block_size();
        let tail_index = new_len / bs;
        let tail_len = (new_len % bs) as usize;

        // The surviving tail has to be decoded while the old layout is intact.
        if tail_len > 0 {
            self.cached_block(tail_index, true)?;
        }
        drop(self.cache.split_off(&self.layout.block_count(new_len)));

        self.header.logical_length = new_len;
        self.header_dirty = true;

        let mut rewrite_tail = None;
        if let Some(block) = self.cache.get_mut(&tail_index).filter(|_| tail_len > 0) {
            block.data.truncate(tail_len);
            block.dirty = true;
            if tail_index * bs < self.encoded {
                rewrite_tail = Some(self.codec.encode(&block.data, &self.header.stream_id, tail_index)?);
            }
        }

        // The header commits the shrink; `finish_shrink` completes the rest
        // if the process dies before the file is cut.
        if self.encoded > new_len {
            self.write_header()?;
            if let Some(sealed) = rewrite_tail {
                self.put_block(tail_index, &sealed)?;
                if let Some(block) = self.cache.get_mut(&tail_index) {
                    block.dirty = false;
                }
            }
            self.encoded = new_len.min(self.encoded);
            self.file.set_len(self.layout.physical_len(self.encoded))?;
        }

        debug!(path = %self.path.display(), old_len, new_len, "shrunk");
        Ok(())
    }

    /// Write every dirty block and the header to the physical file.
    pub fn flush(&mut self) -> SnfsResult<()> {
        if self.header_dirty {
            self.write_header()?;
        }

        let dirty: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, b)| b.dirty)
            .map(|(&i, _)| i)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let bs = self.layout.block_size();
        for &index in &dirty {
            self.materialize_before(index)?;

            let len = self.layout.block_len(index, self.header.logical_length);
            let sealed = {
                let Some(block) = self.cache.get_mut(&index) else {
                    continue;
                };
                block.data.resize(len, 0);
                self.codec.encode(&block.data, &self.header.stream_id, index)?
            };
            self.put_block(index, &sealed)?;
            self.encoded = self.encoded.max(index * bs + len as u64);
            if let Some(block) = self.cache.get_mut(&index) {
                block.dirty = false;
            }
        }

        debug!(path = %self.path.display(), blocks = dirty.len(), encoded = self.encoded, "flushed");
        Ok(())
    }

    /// Flush and ask the OS to persist the physical file.
    pub fn sync(&mut self) -> SnfsResult<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    // ── internals ─────────────────────────────────────────────────────────

    fn ensure_writable(&self) -> SnfsResult<()> {
        if self.read_only {
            return Err(std::io::Error::from(ErrorKind::PermissionDenied).into());
        }
        Ok(())
    }

    /// True if `[offset, end)` overwrites block `index` completely in a file of `len` bytes.
    fn covers_block(&self, index: u64, offset: u64, end: u64, len: u64) -> bool {
        let start = index * self.layout.block_size();
        offset <= start && end >= start + self.layout.block_len(index, len) as u64
    }

    /// Fetch block `index` into the cache, zero-extended to its current
    /// logical length. With `load == false` the stored content is not
    /// decoded (the caller overwrites the whole block).
    fn cached_block(&mut self, index: u64, load: bool) -> SnfsResult<&mut CachedBlock> {
        if !self.cache.contains_key(&index) {
            self.make_room()?;
            let data = if load {
                self.read_stored_block(index)?
            } else {
                Zeroizing::new(Vec::new())
            };
            self.cache.insert(index, CachedBlock { data, dirty: false });
        }

        let want = self.layout.block_len(index, self.header.logical_length);
        let block = self.cache.entry(index).or_insert_with(CachedBlock::empty);
        if block.data.len() < want {
            block.data.resize(want, 0);
        }
        Ok(block)
    }

    /// Keep the cache bounded: once full, write everything back and start over.
    fn make_room(&mut self) -> SnfsResult<()> {
        if self.cache.len() < self.cache_limit {
            return Ok(());
        }
        self.flush()?;
        self.cache.clear();
        Ok(())
    }

    /// Decode block `index` as stored. Blocks past the encoded extent are
    /// implicit and come back empty.
    fn read_stored_block(&mut self, index: u64) -> SnfsResult<Zeroizing<Vec<u8>>> {
        let stored = self.layout.block_len(index, self.encoded);
        if stored == 0 {
            return Ok(Zeroizing::new(Vec::new()));
        }

        let mut buf = vec![0u8; encoded_len(stored)];
        self.file
            .seek(SeekFrom::Start(self.layout.block_offset(index)))?;
        self.file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                SnfsError::CorruptedBlock { index }
            } else {
                SnfsError::Storage(e)
            }
        })?;

        self.codec
            .decode(&buf, &self.header.stream_id, index)
            .map_err(|_| {
                warn!(path = %self.path.display(), block = index, "block failed authentication");
                SnfsError::CorruptedBlock { index }
            })
    }

    /// Make every block before `index` physically present so the file never
    /// contains an unauthenticated hole.
    fn materialize_before(&mut self, index: u64) -> SnfsResult<()> {
        let bs = self.layout.block_size();
        if self.encoded >= index * bs {
            return Ok(());
        }

        let mut next = self.encoded / bs;
        let first = next;
        if self.encoded % bs != 0 {
            // stored tail is short: re-encode it at full length
            let mut plain = match self.cache.get(&next) {
                Some(block) => block.data.clone(),
                None => self.read_stored_block(next)?,
            };
            plain.resize(bs as usize, 0);
            let sealed = self.codec.encode(&plain, &self.header.stream_id, next)?;
            self.put_block(next, &sealed)?;
            if let Some(block) = self.cache.get_mut(&next) {
                block.data = plain;
                block.dirty = false;
            }
            next += 1;
            self.encoded = next * bs;
        }

        let zeros = vec![0u8; bs as usize];
        while next < index {
            let sealed = self.codec.encode(&zeros, &self.header.stream_id, next)?;
            self.put_block(next, &sealed)?;
            next += 1;
            self.encoded = next * bs;
        }

        debug!(path = %self.path.display(), from = first, to = index, "materialised zero blocks");
        Ok(())
    }

    /// Complete a shrink whose header reached disk before the physical file
    /// was cut back from `stale` bytes. The surviving tail block holds either
    /// its re-encoded short form or the old full-length ciphertext.
    fn finish_shrink(&mut self, stale: u64) -> SnfsResult<()> {
        let len = self.header.logical_length;
        let tail_index = len / self.layout.block_size();
        let tail_len = (len % self.layout.block_size()) as usize;
        warn!(path = %self.path.display(), logical = len, stale, "completing interrupted truncate");

        self.encoded = len;
        let mut rewrite = None;
        if tail_len > 0 {
            match self.read_stored_block(tail_index) {
                Ok(_) => {}
                Err(SnfsError::CorruptedBlock { .. }) => {
                    self.encoded = stale;
                    let mut plain = self.read_stored_block(tail_index)?;
                    plain.truncate(tail_len);
                    rewrite = Some(self.codec.encode(&plain, &self.header.stream_id, tail_index)?);
                }
                Err(e) => return Err(e),
            }
        }
        if self.read_only {
            return Ok(());
        }

        if let Some(sealed) = rewrite {
            self.put_block(tail_index, &sealed)?;
            self.encoded = len;
        }
        self.file.set_len(self.layout.physical_len(len))?;
        Ok(())
    }

    fn put_block(&mut self, index: u64, sealed: &[u8]) -> SnfsResult<()> {
        self.file
            .seek(SeekFrom::Start(self.layout.block_offset(index)))?;
        self.file.write_all(sealed)?;
        Ok(())
    }

    fn write_header(&mut self) -> SnfsResult<()> {
        let bytes = self.header.encode(&self.codec)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        self.header_dirty = false;
        Ok(())
    }

    /// Truncate to zero with a fresh stream identifier.
    fn reset(&mut self) -> SnfsResult<()> {
        self.cache.clear();
        self.header.stream_id = random_stream_id();
        self.header.logical_length = 0;
        self.write_header()?;
        self.file.set_len(HEADER_LEN as u64)?;
        self.encoded = 0;
        debug!(path = %self.path.display(), stream = ?self.header.stream_id, "reset to empty");
        Ok(())
    }
}

impl Drop for EncryptedFile {
    fn drop(&mut self) {
        if self.is_dirty() && !self.read_only {
            if let Err(e) = self.flush() {
                warn!(path = %self.path.display(), "flush on drop failed: {e}");
            }
        }
    }
}

/// Read and authenticate the header at the start of `file`.
pub(crate) fn read_header(file: &mut File, codec: &BlockCodec) -> SnfsResult<FileHeader> {
    let mut buf = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            SnfsError::CorruptedHeader
        } else {
            SnfsError::Storage(e)
        }
    })?;
    FileHeader::decode(&buf, codec)
}
