//! Codec errors for message encoding and decoding
//!
//! Encoding failures mean the caller handed over a message the wire format
//! cannot represent. Decoding failures mean the bytes are not a well-formed
//! frame. Consumers treat the latter as fatal to the connection carrying them.

use thiserror::Error;

/// Result alias for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Errors raised while encoding or decoding messages
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// A property value cannot be represented in the wire format
    #[error("Invalid property '{property}': {reason}")]
    InvalidProperty {
        property: &'static str,
        reason: String,
    },

    /// Encoded message would exceed the configured size limit
    #[error("Message too large: {size} bytes exceeds limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// Input ended before a complete field could be read
    #[error("Truncated input: need {need} bytes, got {got} (context: {context})")]
    Truncated {
        need: usize,
        got: usize,
        context: &'static str,
    },

    /// A type tag or variant discriminator is not part of the format
    #[error("Unknown {kind} tag {tag:#04x} at offset {offset}")]
    UnknownTag {
        kind: &'static str,
        tag: u8,
        offset: usize,
    },

    /// A length field disagrees with the bytes actually present
    #[error("Length mismatch in {context}: declared {declared} bytes, {remaining} remaining")]
    LengthMismatch {
        declared: usize,
        remaining: usize,
        context: &'static str,
    },

    /// A string field is not valid UTF-8
    #[error("Invalid UTF-8 in property '{property}'")]
    InvalidUtf8 { property: &'static str },

    /// An identifier was read as a variant it does not hold
    #[error("Wrong identifier variant: requested {requested}, holds {actual}")]
    WrongVariant {
        requested: &'static str,
        actual: &'static str,
    },
}

impl CodecError {
    pub fn invalid_property(property: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidProperty {
            property,
            reason: reason.into(),
        }
    }

    pub fn truncated(need: usize, got: usize, context: &'static str) -> Self {
        Self::Truncated { need, got, context }
    }

    pub fn unknown_tag(kind: &'static str, tag: u8, offset: usize) -> Self {
        Self::UnknownTag { kind, tag, offset }
    }

    pub fn length_mismatch(declared: usize, remaining: usize, context: &'static str) -> Self {
        Self::LengthMismatch {
            declared,
            remaining,
            context,
        }
    }

    /// True for errors raised by `encode`
    pub fn is_encoding(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidProperty { .. } | CodecError::MessageTooLarge { .. }
        )
    }

    /// True for errors raised by `decode`
    pub fn is_decoding(&self) -> bool {
        matches!(
            self,
            CodecError::Truncated { .. }
                | CodecError::UnknownTag { .. }
                | CodecError::LengthMismatch { .. }
                | CodecError::InvalidUtf8 { .. }
        )
    }

    /// Error category for metrics labels
    pub fn category(&self) -> &'static str {
        match self {
            CodecError::InvalidProperty { .. } | CodecError::MessageTooLarge { .. } => "encoding",
            CodecError::WrongVariant { .. } => "access",
            _ => "decoding",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CodecError::invalid_property("message_id", "bad").is_encoding());
        assert!(CodecError::MessageTooLarge { size: 10, limit: 5 }.is_encoding());
        assert!(CodecError::truncated(4, 2, "frame length").is_decoding());
        assert!(CodecError::unknown_tag("property", 0x7f, 9).is_decoding());
        assert!(CodecError::length_mismatch(10, 8, "frame").is_decoding());

        let wrong = CodecError::WrongVariant {
            requested: "string",
            actual: "ulong",
        };
        assert!(!wrong.is_encoding());
        assert!(!wrong.is_decoding());
        assert_eq!(wrong.category(), "access");
    }

    #[test]
    fn test_display_carries_context() {
        let err = CodecError::truncated(16, 3, "uuid identifier");
        let text = err.to_string();
        assert!(text.contains("need 16 bytes"));
        assert!(text.contains("got 3"));
        assert!(text.contains("uuid identifier"));

        let err = CodecError::unknown_tag("frame", 0x09, 4);
        assert_eq!(err.to_string(), "Unknown frame tag 0x09 at offset 4");
    }
}
