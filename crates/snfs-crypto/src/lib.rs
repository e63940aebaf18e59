//! snfs-crypto: key custody and block encryption for SecureNoteFS
//!
//! Key hierarchy:
//! ```text
//! Passphrase ──Argon2id(salt, params)──▶ Wrapping Key (never stored)
//!   └── wraps (XChaCha20-Poly1305) ──▶ Master Key (256-bit random, stored wrapped in the key file)
//!         ├── Block Key  (HKDF-SHA256, domain="snfs-block-siv")  AES-256-SIV per block
//!         └── Header Key (HKDF-SHA256, domain="snfs-header-siv") AES-256-SIV header tag
//! ```
//!
//! Block AEAD: nonce = stream_id[0..8] || block_index (BE), AAD = stream_id || block_index.
//! SIV is nonce-misuse resistant, so re-encoding a rewritten block under the
//! same derived nonce reveals at most whether the plaintext is unchanged.

pub mod codec;
pub mod kdf;
pub mod keyfile;
pub mod keys;

pub use codec::{AuthFailure, BlockCodec};
pub use kdf::{derive_wrapping_key, KdfParams, WrappingKey};
pub use keyfile::{unlock_key_file, KeyFile, KeyManager};
pub use keys::{generate_master_key, unwrap_master_key, wrap_master_key, MasterKey};

/// Size of a master key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 or SIV authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the Argon2id salt stored in the key file
pub const SALT_SIZE: usize = 16;
