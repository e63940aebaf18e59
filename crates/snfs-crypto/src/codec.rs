//! Per-block AES-256-SIV encryption/decryption
//!
//! Encrypted block format (binary):
//! ```text
//! [16 bytes: SIV tag][N bytes: ciphertext]      N = plaintext length
//! nonce = stream_id[0..8] || block_index (8 bytes, big-endian)
//! AAD   = stream_id (16 bytes) || block_index (8 bytes, big-endian)
//! ```
//!
//! The nonce is derived, not stored, so a block costs exactly one tag of
//! overhead. Binding stream id and index into nonce and AAD makes any block
//! swapped within a file, or moved between files, fail authentication.
//! The last block of a file may be short; its length is implied by the
//! file's logical length and is never written next to the block.

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead, Nonce,
};
use snfs_core::{SnfsError, SnfsResult, StreamId, STREAM_ID_SIZE};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::{derive_siv_key, MasterKey};
use crate::TAG_SIZE;

const BLOCK_DOMAIN: &[u8] = b"snfs-block-siv";
const HEADER_DOMAIN: &[u8] = b"snfs-header-siv";

/// Tag verification failed. Carries no plaintext and no detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("authentication tag mismatch")]
pub struct AuthFailure;

/// Encodes and decodes single blocks under keys derived from the master key.
pub struct BlockCodec {
    block_cipher: Aes256SivAead,
    header_cipher: Aes256SivAead,
}

impl std::fmt::Debug for BlockCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCodec").finish_non_exhaustive()
    }
}

impl BlockCodec {
    pub fn new(master: &MasterKey) -> SnfsResult<Self> {
        let block_key = derive_siv_key(master, BLOCK_DOMAIN)?;
        let header_key = derive_siv_key(master, HEADER_DOMAIN)?;
        let block_key: &[u8; 64] = &block_key;
        let header_key: &[u8; 64] = &header_key;
        Ok(Self {
            block_cipher: Aes256SivAead::new(block_key.into()),
            header_cipher: Aes256SivAead::new(header_key.into()),
        })
    }

    /// Encrypt one block. Returns `[16-byte tag][ciphertext]`.
    pub fn encode(
        &self,
        plaintext: &[u8],
        stream_id: &StreamId,
        block_index: u64,
    ) -> SnfsResult<Vec<u8>> {
        let nonce_bytes = derive_nonce(stream_id, block_index);
        let aad = build_aad(stream_id, block_index);

        self.block_cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| SnfsError::Other(anyhow::anyhow!("block encryption failed: {e}")))
    }

    /// Decrypt one block. The tag is verified before any plaintext is released.
    pub fn decode(
        &self,
        ciphertext: &[u8],
        stream_id: &StreamId,
        block_index: u64,
    ) -> Result<Zeroizing<Vec<u8>>, AuthFailure> {
        if ciphertext.len() < TAG_SIZE {
            return Err(AuthFailure);
        }

        let nonce_bytes = derive_nonce(stream_id, block_index);
        let aad = build_aad(stream_id, block_index);

        self.block_cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| AuthFailure)
    }

    /// Compute the authentication tag over serialized header fields.
    pub fn seal_header(&self, header_fields: &[u8]) -> SnfsResult<[u8; TAG_SIZE]> {
        let tag = self
            .header_cipher
            .encrypt(
                &Nonce::default(),
                Payload {
                    msg: &[],
                    aad: header_fields,
                },
            )
            .map_err(|e| SnfsError::Other(anyhow::anyhow!("header sealing failed: {e}")))?;

        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Verify a header tag produced by [`BlockCodec::seal_header`].
    pub fn verify_header(&self, header_fields: &[u8], tag: &[u8]) -> Result<(), AuthFailure> {
        self.header_cipher
            .decrypt(
                &Nonce::default(),
                Payload {
                    msg: tag,
                    aad: header_fields,
                },
            )
            .map(|_| ())
            .map_err(|_| AuthFailure)
    }
}

/// Ciphertext length of a block holding `plaintext_len` bytes.
pub const fn encoded_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_SIZE
}

/// nonce = stream_id[0..8] || block_index (BE)
fn derive_nonce(stream_id: &StreamId, block_index: u64) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(&stream_id.as_bytes()[..8]);
    nonce[8..].copy_from_slice(&block_index.to_be_bytes());
    nonce
}

/// AAD = stream_id (16 bytes) || block_index (8 bytes BE)
fn build_aad(stream_id: &StreamId, block_index: u64) -> [u8; STREAM_ID_SIZE + 8] {
    let mut aad = [0u8; STREAM_ID_SIZE + 8];
    aad[..STREAM_ID_SIZE].copy_from_slice(stream_id.as_bytes());
    aad[STREAM_ID_SIZE..].copy_from_slice(&block_index.to_be_bytes());
    aad
}
