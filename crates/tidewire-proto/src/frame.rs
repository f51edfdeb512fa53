//! Frame structure and header layout
//!
//! Every frame on the wire is a fixed 28-byte header followed by the body:
//!
//! ```text
//! [0:16)  correlation id (128-bit)
//! [16:24) total size      (u64, big-endian)
//! [24:28) chunk index     (u32, big-endian)
//! [28:)   body bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;
use crate::ProtocolError;

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 28;

/// One wire-level chunk of a logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Id shared by every frame of one logical message
    pub correlation_id: Uuid,
    /// Size of the complete serialized message
    pub total_size: u64,
    /// Position of this chunk, starting at 0
    pub chunk_index: u32,
    /// Chunk body
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(correlation_id: Uuid, total_size: u64, chunk_index: u32, body: Bytes) -> Self {
        Self {
            correlation_id,
            total_size,
            chunk_index,
            body,
        }
    }

    /// Create a frame carrying a whole message
    pub fn whole(correlation_id: Uuid, payload: Bytes) -> Self {
        Self::new(correlation_id, payload.len() as u64, 0, payload)
    }

    /// Serialize header and body into one buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        buf.put_slice(self.correlation_id.as_bytes());
        buf.put_u64(self.total_size);
        buf.put_u32(self.chunk_index);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse a frame from raw bytes
    pub fn parse(mut raw: Bytes) -> Result<Self, ProtocolError> {
        if raw.len() < HEADER_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "buffer size {} is smaller than header size {}",
                raw.len(),
                HEADER_SIZE
            )));
        }

        let mut id = [0u8; 16];
        raw.copy_to_slice(&mut id);
        let total_size = raw.get_u64();
        let chunk_index = raw.get_u32();

        Ok(Self {
            correlation_id: Uuid::from_bytes(id),
            total_size,
            chunk_index,
            body: raw,
        })
    }

    /// Get the body size
    pub fn body_size(&self) -> usize {
        self.body.len()
    }

    /// Check if this frame carries the whole message
    pub fn is_whole(&self) -> bool {
        self.chunk_index == 0 && self.body.len() as u64 == self.total_size
    }
}
