//! Pluggable codec capability
//!
//! Producers and consumers hold an `Arc<dyn Codec>` chosen when the
//! environment is built. Implementations are stateless and shared across
//! threads.

use crate::error::CodecResult;
use crate::message::Message;
use bytes::Bytes;
use std::fmt;

/// Encoded message: byte length plus the frame bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    size: usize,
    data: Bytes,
}

impl EncodedMessage {
    pub fn new(data: Bytes) -> Self {
        Self {
            size: data.len(),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// Message encoding capability
pub trait Codec: Send + Sync + fmt::Debug {
    /// Serialize a message into a complete frame
    fn encode(&self, message: &Message) -> CodecResult<EncodedMessage>;

    /// Parse a complete frame back into a message
    fn decode(&self, data: &[u8]) -> CodecResult<Message>;

    /// Short identifier for logs
    fn name(&self) -> &'static str;
}
