//! Message codec: serialization, chunking and reassembly

use crate::reassembly::{PushOutcome, ReassemblyStore};
use crate::{Frame, Message, ProtocolConfig, ProtocolError};
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The frame completed a logical message
    Complete {
        /// Correlation id of the message
        correlation_id: Uuid,
        /// The reassembled message
        message: Message,
    },
    /// More frames are needed for this id
    Progress {
        /// Correlation id of the message
        correlation_id: Uuid,
        /// Bytes received so far
        received: u64,
        /// Declared total size
        total: u64,
    },
}

/// Per-connection codec turning messages into frames and back
///
/// Encoding is stateless. Decoding is backed by the codec's own
/// [`ReassemblyStore`], so each connection must own its codec.
pub struct MessageCodec {
    /// Size limits
    config: ProtocolConfig,
    /// Partial inbound messages
    store: ReassemblyStore,
}

impl MessageCodec {
    /// Create a codec whose reassembly store sweeps expired buffers
    ///
    /// Must be called from within a tokio runtime for the sweep to run.
    pub fn new(config: ProtocolConfig) -> Self {
        let store = ReassemblyStore::with_sweeper(config.expire_after, config.gc_interval);
        Self { config, store }
    }

    /// Create a codec without a background sweep
    pub fn without_sweeper(config: ProtocolConfig) -> Self {
        let store = ReassemblyStore::new(config.expire_after);
        Self { config, store }
    }

    /// Protocol limits of this codec
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Reassembly store backing [`MessageCodec::decode`]
    pub fn store(&self) -> &ReassemblyStore {
        &self.store
    }

    /// Serialize a message without framing
    pub fn serialize(
        &self,
        correlation_id: Uuid,
        message: &Message,
    ) -> Result<Bytes, ProtocolError> {
        let payload = rmp_serde::to_vec_named(message)?;

        if payload.len() > self.config.max_message_size {
            return Err(ProtocolError::SizeLimitExceeded {
                correlation_id,
                size: payload.len() as u64,
                max: self.config.max_message_size as u64,
            });
        }

        Ok(Bytes::from(payload))
    }

    /// Encode a message into ordered frames, splitting above the threshold
    pub fn encode(
        &self,
        correlation_id: Uuid,
        message: &Message,
    ) -> Result<Vec<Frame>, ProtocolError> {
        let payload = self.serialize(correlation_id, message)?;

        if payload.len() <= self.config.split_threshold {
            return Ok(vec![Frame::whole(correlation_id, payload)]);
        }

        let total_size = payload.len() as u64;
        let frames: Vec<Frame> = (0..payload.len())
            .step_by(self.config.chunk_size)
            .enumerate()
            .map(|(index, start)| {
                let end = (start + self.config.chunk_size).min(payload.len());
                Frame::new(correlation_id, total_size, index as u32, payload.slice(start..end))
            })
            .collect();

        debug!(
            "Split message {} ({} bytes) into {} frames",
            correlation_id,
            total_size,
            frames.len()
        );
        Ok(frames)
    }

    /// Encode a message as exactly one frame regardless of size
    pub fn encode_single(
        &self,
        correlation_id: Uuid,
        message: &Message,
    ) -> Result<Frame, ProtocolError> {
        let payload = self.serialize(correlation_id, message)?;
        Ok(Frame::whole(correlation_id, payload))
    }

    /// Decode one raw frame, returning the message once all chunks arrived
    pub fn decode(&self, raw: Bytes) -> Result<Decoded, ProtocolError> {
        let frame = Frame::parse(raw)?;
        self.decode_frame(frame)
    }

    /// Decode an already parsed frame
    pub fn decode_frame(&self, frame: Frame) -> Result<Decoded, ProtocolError> {
        let correlation_id = frame.correlation_id;

        // Reject before anything is buffered
        if frame.total_size > self.config.max_message_size as u64 {
            return Err(ProtocolError::SizeLimitExceeded {
                correlation_id,
                size: frame.total_size,
                max: self.config.max_message_size as u64,
            });
        }

        let payload = if frame.is_whole() && !self.store.contains(&correlation_id) {
            frame.body
        } else {
            match self
                .store
                .push(correlation_id, frame.total_size, frame.chunk_index, frame.body)?
            {
                PushOutcome::Complete(payload) => payload,
                PushOutcome::Progress { received, total } => {
                    return Ok(Decoded::Progress {
                        correlation_id,
                        received,
                        total,
                    });
                }
            }
        };

        let message: Message = rmp_serde::from_slice(&payload)?;
        Ok(Decoded::Complete {
            correlation_id,
            message,
        })
    }

    /// Release the reassembly store
    pub fn dispose(&self) {
        self.store.dispose();
    }
}
