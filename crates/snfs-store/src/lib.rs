//! snfs-store: the encrypted file store
//!
//! Each logical file is one physical file:
//!
//! ```text
//! [52 bytes: FileHeader (36 bytes of fields + 16-byte SIV tag)]
//! [block 0: 16-byte tag + block_size bytes]
//! [block 1: 16-byte tag + block_size bytes]
//! ...
//! [block n: 16-byte tag + tail bytes]          tail = encoded extent mod block_size
//! ```
//!
//! Blocks are encoded independently by [`snfs_crypto::BlockCodec`], so any
//! byte range can be read or rewritten by touching only the blocks that
//! cover it.

pub mod file;
pub mod header;
pub mod layout;
pub mod store;

pub use file::EncryptedFile;
pub use header::{FileHeader, FORMAT_VERSION, HEADER_LEN};
pub use layout::BlockLayout;
pub use store::EncryptedFileStore;
