//! Transport Error Types
//!
//! Error taxonomy shared by the transport boundary, the retry engine and the
//! client coordinators built on top of them.

use crate::protocol::ResponseCode;
use codec::CodecError;
use thiserror::Error;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection could not be opened or broke while in use
    #[error("Connection error: {message} (address: {address:?})")]
    Connection {
        message: String,
        address: Option<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Broker answered a request with a non-OK response code
    #[error("Response error: {operation} returned {code}")]
    Response { operation: String, code: ResponseCode },

    /// No usable node for a stream (missing, no leader, no replicas)
    #[error("Stream unavailable: {stream}: {reason}")]
    StreamUnavailable { stream: String, reason: String },

    /// Retry engine gave up after the backoff policy ran out
    #[error("Retry exhausted: {description} failed after {attempts} attempts")]
    RetryExhausted {
        description: String,
        attempts: u32,
        #[source]
        last_error: Box<TransportError>,
    },

    /// Message could not be encoded or a frame could not be decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A shared resource is temporarily unusable (e.g. locator recovering)
    #[error("Unavailable: {what}")]
    Unavailable { what: String },

    /// Operation was cancelled before it completed
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Entity or coordinator has been closed
    #[error("Closed: {what}")]
    Closed { what: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Transport timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Monitoring and metrics errors
    #[error("Monitoring error: {message}")]
    Monitoring {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>, address: Option<String>) -> Self {
        Self::Connection {
            message: message.into(),
            address,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        address: Option<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            address,
            source: Some(Box::new(source)),
        }
    }

    pub fn response(operation: impl Into<String>, code: ResponseCode) -> Self {
        Self::Response {
            operation: operation.into(),
            code,
        }
    }

    pub fn stream_unavailable(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StreamUnavailable {
            stream: stream.into(),
            reason: reason.into(),
        }
    }

    pub fn retry_exhausted(
        description: impl Into<String>,
        attempts: u32,
        last_error: TransportError,
    ) -> Self {
        Self::RetryExhausted {
            description: description.into(),
            attempts,
            last_error: Box::new(last_error),
        }
    }

    pub fn unavailable(what: impl Into<String>) -> Self {
        Self::Unavailable { what: what.into() }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed { what: what.into() }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a monitoring error with source
    pub fn monitoring_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Monitoring {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { .. } => true,
            TransportError::Response { .. } => true, // Topology may still be settling
            TransportError::StreamUnavailable { .. } => true,
            TransportError::RetryExhausted { .. } => false,
            TransportError::Codec(_) => false,
            TransportError::Unavailable { .. } => true,
            TransportError::Cancelled { .. } => false,
            TransportError::Closed { .. } => false,
            TransportError::Configuration { .. } => false,
            TransportError::Timeout { .. } => true,
            TransportError::Monitoring { .. } => true,
            TransportError::Io { .. } => true,
        }
    }

    /// True when the error means the entity or environment is gone for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportError::Closed { .. } | TransportError::Cancelled { .. }
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "connection",
            TransportError::Response { .. } => "response",
            TransportError::StreamUnavailable { .. } => "stream_unavailable",
            TransportError::RetryExhausted { .. } => "retry_exhausted",
            TransportError::Codec(_) => "codec",
            TransportError::Unavailable { .. } => "unavailable",
            TransportError::Cancelled { .. } => "cancelled",
            TransportError::Closed { .. } => "closed",
            TransportError::Configuration { .. } => "configuration",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Monitoring { .. } => "monitoring",
            TransportError::Io { .. } => "io",
        }
    }
}

// Box<dyn Error> sources are dropped on clone
impl Clone for TransportError {
    fn clone(&self) -> Self {
        match self {
            TransportError::Connection {
                message, address, ..
            } => TransportError::Connection {
                message: message.clone(),
                address: address.clone(),
                source: None,
            },
            TransportError::Response { operation, code } => TransportError::Response {
                operation: operation.clone(),
                code: *code,
            },
            TransportError::StreamUnavailable { stream, reason } => {
                TransportError::StreamUnavailable {
                    stream: stream.clone(),
                    reason: reason.clone(),
                }
            }
            TransportError::RetryExhausted {
                description,
                attempts,
                last_error,
            } => TransportError::RetryExhausted {
                description: description.clone(),
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            TransportError::Codec(error) => TransportError::Codec(error.clone()),
            TransportError::Unavailable { what } => TransportError::Unavailable { what: what.clone() },
            TransportError::Cancelled { operation } => TransportError::Cancelled {
                operation: operation.clone(),
            },
            TransportError::Closed { what } => TransportError::Closed { what: what.clone() },
            TransportError::Configuration { message, field } => TransportError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
            TransportError::Timeout {
                operation,
                timeout_ms,
            } => TransportError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            TransportError::Monitoring { message, .. } => TransportError::Monitoring {
                message: message.clone(),
                source: None,
            },
            TransportError::Io { message, source } => TransportError::Io {
                message: message.clone(),
                source: std::io::Error::new(source.kind(), message.clone()),
            },
        }
    }
}

/// Convert standard I/O errors to transport errors
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_construction() {
        let err = TransportError::connection("Connection refused", Some("node-1:5552".into()));
        assert_eq!(err.category(), "connection");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("node-1:5552"));
    }

    #[test]
    fn test_retry_exhausted_keeps_last_error() {
        let last = TransportError::stream_unavailable("orders", "no leader");
        let err = TransportError::retry_exhausted("locate orders", 4, last);

        assert!(!err.is_retryable());
        let source = err.source().expect("last error as source");
        assert!(source.to_string().contains("no leader"));

        match err.clone() {
            TransportError::RetryExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last_error, TransportError::StreamUnavailable { .. }));
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_codec_error_conversion() {
        let err: TransportError = CodecError::truncated(4, 1, "frame length").into();
        assert_eq!(err.category(), "codec");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(TransportError::closed("producer").is_terminal());
        assert!(TransportError::cancelled("recovery").is_terminal());
        assert!(!TransportError::unavailable("locator").is_terminal());
        assert!(!TransportError::configuration("test", None).is_retryable());
    }

    #[test]
    fn test_clone_drops_boxed_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::connection_with_source("open failed", None, io_err);
        assert!(err.source().is_some());
        assert!(err.clone().source().is_none());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        match TransportError::from(io_err).clone() {
            TransportError::Io { message, source } => {
                assert!(message.contains("reset by peer"));
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionReset);
            }
            other => panic!("Expected Io error, got {:?}", other),
        }
    }
}
