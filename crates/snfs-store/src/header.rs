//! Per-file header
//!
//! ```text
//! offset  size  field
//!      0     4  magic "SNFS"
//!      4     2  format version (BE)
//!      6     2  reserved, zero
//!      8    16  stream identifier
//!     24     4  block size (BE)
//!     28     8  logical length (BE)
//!     36    16  SIV tag over bytes 0..36 (header key)
//! ```

use rand::RngCore;
use snfs_core::config::validate_block_size;
use snfs_core::{SnfsError, SnfsResult, StreamId, STREAM_ID_SIZE};
use snfs_crypto::{BlockCodec, TAG_SIZE};

pub const MAGIC: &[u8; 4] = b"SNFS";

/// Current on-disk format version
pub const FORMAT_VERSION: u16 = 1;

const FIELDS_LEN: usize = 36;

/// Total header length on disk, tag included.
pub const HEADER_LEN: usize = FIELDS_LEN + TAG_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub stream_id: StreamId,
    pub block_size: u32,
    pub logical_length: u64,
}

impl FileHeader {
    /// A header for a new, empty file with a fresh stream identifier.
    pub fn new(block_size: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            stream_id: random_stream_id(),
            block_size,
            logical_length: 0,
        }
    }

    fn fields(&self) -> [u8; FIELDS_LEN] {
        let mut buf = [0u8; FIELDS_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[8..24].copy_from_slice(self.stream_id.as_bytes());
        buf[24..28].copy_from_slice(&self.block_size.to_be_bytes());
        buf[28..36].copy_from_slice(&self.logical_length.to_be_bytes());
        buf
    }

    /// Serialize and authenticate.
    pub fn encode(&self, codec: &BlockCodec) -> SnfsResult<[u8; HEADER_LEN]> {
        let fields = self.fields();
        let tag = codec.seal_header(&fields)?;

        let mut out = [0u8; HEADER_LEN];
        out[..FIELDS_LEN].copy_from_slice(&fields);
        out[FIELDS_LEN..].copy_from_slice(&tag);
        Ok(out)
    }

    /// Verify and parse. Any mismatch is `CorruptedHeader`.
    pub fn decode(buf: &[u8; HEADER_LEN], codec: &BlockCodec) -> SnfsResult<Self> {
        let (fields, tag) = buf.split_at(FIELDS_LEN);
        if &fields[0..4] != MAGIC {
            return Err(SnfsError::CorruptedHeader);
        }
        codec
            .verify_header(fields, tag)
            .map_err(|_| SnfsError::CorruptedHeader)?;

        let version = u16::from_be_bytes([fields[4], fields[5]]);
        if version != FORMAT_VERSION {
            return Err(SnfsError::CorruptedHeader);
        }

        let mut sid = [0u8; STREAM_ID_SIZE];
        sid.copy_from_slice(&fields[8..24]);
        let block_size = u32::from_be_bytes([fields[24], fields[25], fields[26], fields[27]]);
        validate_block_size(block_size).map_err(|_| SnfsError::CorruptedHeader)?;

        let mut len = [0u8; 8];
        len.copy_from_slice(&fields[28..36]);

        Ok(Self {
            version,
            stream_id: StreamId::from_bytes(sid),
            block_size,
            logical_length: u64::from_be_bytes(len),
        })
    }
}

/// A fresh random 128-bit stream identifier.
pub fn random_stream_id() -> StreamId {
    let mut bytes = [0u8; STREAM_ID_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    StreamId::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snfs_crypto::generate_master_key;

    fn codec() -> BlockCodec {
        BlockCodec::new(&generate_master_key()).unwrap()
    }

    #[test]
    fn header_roundtrip() {
        let codec = codec();
        let mut header = FileHeader::new(4096);
        header.logical_length = 6000;

        let bytes = header.encode(&codec).unwrap();
        assert_eq!(&bytes[0..4], MAGIC);
        assert_eq!(FileHeader::decode(&bytes, &codec).unwrap(), header);
    }

    #[test]
    fn new_headers_get_distinct_stream_ids() {
        assert_ne!(FileHeader::new(4096).stream_id, FileHeader::new(4096).stream_id);
    }

    #[test]
    fn tampered_length_is_detected() {
        let codec = codec();
        let mut bytes = FileHeader::new(4096).encode(&codec).unwrap();
        bytes[35] ^= 0x01;
        assert!(matches!(
            FileHeader::decode(&bytes, &codec),
            Err(SnfsError::CorruptedHeader)
        ));
    }

    #[test]
    fn foreign_key_is_detected() {
        let bytes = FileHeader::new(4096).encode(&codec()).unwrap();
        assert!(FileHeader::decode(&bytes, &codec()).is_err());
    }

    #[test]
    fn bad_magic_is_detected() {
        let codec = codec();
        let mut bytes = FileHeader::new(4096).encode(&codec).unwrap();
        bytes[0] = b'X';
        assert!(FileHeader::decode(&bytes, &codec).is_err());
    }
}
