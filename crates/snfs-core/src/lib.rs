pub mod config;
pub mod error;
pub mod types;

pub use error::{SnfsError, SnfsResult};
pub use types::{HandleId, StreamId, STREAM_ID_SIZE};
