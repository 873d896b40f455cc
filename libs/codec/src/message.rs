//! Application message model
//!
//! A [`Message`] is an opaque body plus an optional set of [`Properties`].
//! Message and correlation identifiers are one of four variants; reading an
//! identifier as a variant it does not hold is an error rather than a
//! silent conversion.

use crate::error::{CodecError, CodecResult};
use bytes::Bytes;
use uuid::Uuid;

/// Message or correlation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    String(String),
    Ulong(u64),
    Binary(Bytes),
    Uuid(Uuid),
}

impl MessageId {
    /// Build a UUID identifier from raw bytes, which must be exactly 16 long
    pub fn uuid_from_slice(bytes: &[u8]) -> CodecResult<Self> {
        Uuid::from_slice(bytes).map(MessageId::Uuid).map_err(|_| {
            CodecError::invalid_property(
                "uuid identifier",
                format!("expected 16 bytes, got {}", bytes.len()),
            )
        })
    }

    /// Name of the populated variant
    pub fn variant_name(&self) -> &'static str {
        match self {
            MessageId::String(_) => "string",
            MessageId::Ulong(_) => "ulong",
            MessageId::Binary(_) => "binary",
            MessageId::Uuid(_) => "uuid",
        }
    }

    fn wrong(&self, requested: &'static str) -> CodecError {
        CodecError::WrongVariant {
            requested,
            actual: self.variant_name(),
        }
    }

    pub fn as_str(&self) -> CodecResult<&str> {
        match self {
            MessageId::String(value) => Ok(value),
            other => Err(other.wrong("string")),
        }
    }

    pub fn as_u64(&self) -> CodecResult<u64> {
        match self {
            MessageId::Ulong(value) => Ok(*value),
            other => Err(other.wrong("ulong")),
        }
    }

    pub fn as_binary(&self) -> CodecResult<&Bytes> {
        match self {
            MessageId::Binary(value) => Ok(value),
            other => Err(other.wrong("binary")),
        }
    }

    pub fn as_uuid(&self) -> CodecResult<Uuid> {
        match self {
            MessageId::Uuid(value) => Ok(*value),
            other => Err(other.wrong("uuid")),
        }
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        MessageId::String(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        MessageId::String(value.to_string())
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        MessageId::Ulong(value)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        MessageId::Uuid(value)
    }
}

impl From<Bytes> for MessageId {
    fn from(value: Bytes) -> Self {
        MessageId::Binary(value)
    }
}

/// Message metadata. Every field is optional; absent fields are not encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub message_id: Option<MessageId>,
    pub user_id: Option<Bytes>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<MessageId>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Milliseconds since the Unix epoch
    pub absolute_expiry_time: Option<i64>,
    /// Milliseconds since the Unix epoch
    pub creation_time: Option<i64>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&MessageId> {
        self.correlation_id.as_ref()
    }
}

/// Application message: body bytes plus properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub body: Bytes,
    pub properties: Properties,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: Properties::default(),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_message_id(mut self, id: impl Into<MessageId>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<MessageId>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}
