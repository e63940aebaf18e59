use std::fmt;

/// Size of a per-file stream identifier in bytes (128-bit)
pub const STREAM_ID_SIZE: usize = 16;

/// Random per-file identifier generated at file creation.
///
/// Bound into every block nonce together with the block index, so two files
/// never share a nonce space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId([u8; STREAM_ID_SIZE]);

impl StreamId {
    pub fn from_bytes(bytes: [u8; STREAM_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Opaque identifier of an open file handle.
///
/// Handed to the host dispatch layer as its file handle number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fh{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_debug_is_abbreviated() {
        let id = StreamId::from_bytes([0xAB; STREAM_ID_SIZE]);
        assert_eq!(format!("{id:?}"), "StreamId(abababab..)");
    }

    #[test]
    fn handle_id_display() {
        assert_eq!(HandleId(7).to_string(), "fh7");
    }
}
