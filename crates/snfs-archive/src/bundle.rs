//! Bundle stream format
//!
//! A snapshot is a zstd stream wrapping this byte layout:
//!
//! ```text
//! "SNFSARC1"
//! repeated:
//!   kind u8            0 = directory, 1 = regular file
//!   path_len u32 BE
//!   path bytes         relative to the bundled root, '/' separated
//!   (files only) len u64 BE, then len bytes of content
//! 0xFF                 end marker
//! 32 bytes             BLAKE3 over everything above
//! ```
//!
//! Entries are written in sorted walk order with each directory before its
//! contents, so bundling the same tree twice yields the same stream.

use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};

pub const BUNDLE_MAGIC: &[u8; 8] = b"SNFSARC1";

const KIND_DIR: u8 = 0;
const KIND_FILE: u8 = 1;
const KIND_END: u8 = 0xFF;

/// Longest relative path accepted in a record
const MAX_PATH_LEN: u32 = 64 * 1024;

/// One record read back from a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir(PathBuf),
    File { path: PathBuf, len: u64 },
}

// ── hashing adapters ──────────────────────────────────────────────────────

struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

// ── path encoding ─────────────────────────────────────────────────────────

/// Reject anything that is not a plain relative path of normal components.
fn check_relative(path: &Path) -> Result<()> {
    ensure!(!path.as_os_str().is_empty(), "empty path in bundle");
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => bail!("path escapes the bundle root: {}", path.display()),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn encode_path(path: &Path) -> Result<Vec<u8>> {
    use std::os::unix::ffi::OsStrExt;
    Ok(path.as_os_str().as_bytes().to_vec())
}

#[cfg(not(unix))]
fn encode_path(path: &Path) -> Result<Vec<u8>> {
    let s = path
        .to_str()
        .with_context(|| format!("non UTF-8 path: {}", path.display()))?;
    Ok(s.replace('\\', "/").into_bytes())
}

#[cfg(unix)]
fn decode_path(bytes: Vec<u8>) -> Result<PathBuf> {
    use std::os::unix::ffi::OsStringExt;
    Ok(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn decode_path(bytes: Vec<u8>) -> Result<PathBuf> {
    let s = String::from_utf8(bytes).context("non UTF-8 path in bundle")?;
    Ok(s.split('/').collect())
}

// ── writer ────────────────────────────────────────────────────────────────

pub struct BundleWriter<W: Write> {
    out: HashingWriter<W>,
    entries: usize,
    content_bytes: u64,
}

impl<W: Write> BundleWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut out = HashingWriter {
            inner,
            hasher: blake3::Hasher::new(),
        };
        out.write_all(BUNDLE_MAGIC).context("writing bundle magic")?;
        Ok(Self {
            out,
            entries: 0,
            content_bytes: 0,
        })
    }

    fn write_path_record(&mut self, kind: u8, rel: &Path) -> Result<()> {
        check_relative(rel)?;
        let bytes = encode_path(rel)?;
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|&n| n <= MAX_PATH_LEN)
            .with_context(|| format!("path too long: {}", rel.display()))?;
        self.out.write_all(&[kind])?;
        self.out.write_all(&len.to_be_bytes())?;
        self.out.write_all(&bytes)?;
        self.entries += 1;
        Ok(())
    }

    pub fn add_dir(&mut self, rel: &Path) -> Result<()> {
        self.write_path_record(KIND_DIR, rel)
    }

    /// Append a file of exactly `len` bytes read from `content`.
    pub fn add_file<R: Read>(&mut self, rel: &Path, len: u64, content: R) -> Result<()> {
        self.write_path_record(KIND_FILE, rel)?;
        self.out.write_all(&len.to_be_bytes())?;
        let copied = io::copy(&mut content.take(len), &mut self.out)
            .with_context(|| format!("bundling {}", rel.display()))?;
        ensure!(
            copied == len,
            "{} changed size while bundling ({copied} of {len} bytes)",
            rel.display()
        );
        self.content_bytes += len;
        Ok(())
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn content_bytes(&self) -> u64 {
        self.content_bytes
    }

    /// Write the end marker and digest, returning the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.out.write_all(&[KIND_END])?;
        let digest = self.out.hasher.finalize();
        let mut inner = self.out.inner;
        inner.write_all(digest.as_bytes())?;
        inner.flush()?;
        Ok(inner)
    }
}

// ── reader ────────────────────────────────────────────────────────────────

pub struct BundleReader<R: Read> {
    input: HashingReader<R>,
    /// Bytes of the current file record not yet consumed
    pending: u64,
    done: bool,
}

impl<R: Read> BundleReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        let mut input = HashingReader {
            inner,
            hasher: blake3::Hasher::new(),
        };
        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .context("reading bundle magic")?;
        ensure!(&magic == BUNDLE_MAGIC, "not a snfs bundle");
        Ok(Self {
            input,
            pending: 0,
            done: false,
        })
    }

    /// Next record, or `None` once the end marker and digest check out.
    ///
    /// Content of a file record that the caller did not copy is skipped.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        if self.pending > 0 {
            let pending = self.pending;
            io::copy(&mut (&mut self.input).take(pending), &mut io::sink())?;
            self.pending = 0;
        }

        let mut kind = [0u8; 1];
        self.input
            .read_exact(&mut kind)
            .context("bundle truncated: missing end marker")?;

        match kind[0] {
            KIND_END => {
                self.finish()?;
                Ok(None)
            }
            KIND_DIR => Ok(Some(Entry::Dir(self.read_path()?))),
            KIND_FILE => {
                let path = self.read_path()?;
                let mut len = [0u8; 8];
                self.input.read_exact(&mut len).context("reading file length")?;
                let len = u64::from_be_bytes(len);
                self.pending = len;
                Ok(Some(Entry::File { path, len }))
            }
            other => bail!("unknown bundle record kind {other:#04x}"),
        }
    }

    /// Copy the content of the file record just returned into `out`.
    pub fn copy_content<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let len = self.pending;
        let copied = io::copy(&mut (&mut self.input).take(len), out)?;
        ensure!(copied == len, "bundle truncated inside file content");
        self.pending = 0;
        Ok(())
    }

    fn read_path(&mut self) -> Result<PathBuf> {
        let mut len = [0u8; 4];
        self.input.read_exact(&mut len).context("reading path length")?;
        let len = u32::from_be_bytes(len);
        ensure!(len > 0 && len <= MAX_PATH_LEN, "bad path length {len}");

        let mut bytes = vec![0u8; len as usize];
        self.input.read_exact(&mut bytes).context("reading path")?;
        let path = decode_path(bytes)?;
        check_relative(&path)?;
        Ok(path)
    }

    fn finish(&mut self) -> Result<()> {
        let expected = self.input.hasher.finalize();
        let mut digest = [0u8; 32];
        self.input
            .inner
            .read_exact(&mut digest)
            .context("bundle truncated: missing digest")?;
        ensure!(
            blake3::Hash::from(digest) == expected,
            "bundle digest mismatch"
        );

        let mut trailing = [0u8; 1];
        ensure!(
            self.input.inner.read(&mut trailing)? == 0,
            "trailing data after bundle digest"
        );
        self.done = true;
        Ok(())
    }
}
