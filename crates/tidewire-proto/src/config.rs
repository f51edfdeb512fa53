//! Size limits and reassembly timing

use crate::ProtocolError;
use std::time::Duration;

/// Default upper bound for one logical message (100 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Payloads above this size are split into chunks (3 MiB)
pub const DEFAULT_SPLIT_THRESHOLD: usize = 3 * 1024 * 1024;

/// Size of each chunk of a split payload (300 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 300 * 1024;

/// Protocol limits shared by both ends of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Largest serialized message accepted or produced
    pub max_message_size: usize,
    /// Serialized size above which a message is chunked
    pub split_threshold: usize,
    /// Body size of each chunk
    pub chunk_size: usize,
    /// How often abandoned reassembly buffers are swept
    pub gc_interval: Duration,
    /// Age after which an untouched reassembly buffer is dropped
    pub expire_after: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            gc_interval: Duration::from_secs(10),
            expire_after: Duration::from_secs(60),
        }
    }
}

impl ProtocolConfig {
    /// Set the maximum message size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the split threshold
    pub fn with_split_threshold(mut self, size: usize) -> Self {
        self.split_threshold = size;
        self
    }

    /// Set the chunk size
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the reassembly sweep interval
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the reassembly expiry age
    pub fn with_expire_after(mut self, age: Duration) -> Self {
        self.expire_after = age;
        self
    }

    /// Check that the limits are consistent with each other
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.chunk_size == 0 {
            return Err(ProtocolError::InvalidConfig("chunk_size must be non-zero".to_string()));
        }
        if self.chunk_size > self.split_threshold {
            return Err(ProtocolError::InvalidConfig(format!(
                "chunk_size ({}) exceeds split_threshold ({})",
                self.chunk_size, self.split_threshold
            )));
        }
        if self.split_threshold > self.max_message_size {
            return Err(ProtocolError::InvalidConfig(format!(
                "split_threshold ({}) exceeds max_message_size ({})",
                self.split_threshold, self.max_message_size
            )));
        }
        if self.gc_interval.is_zero() {
            return Err(ProtocolError::InvalidConfig("gc_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}
