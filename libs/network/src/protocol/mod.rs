//! Broker Protocol Value Types
//!
//! Plain data exchanged across the transport boundary: node addresses,
//! response codes, offset specifications, delivered chunks and stream
//! topology. Framing of these values on a socket belongs to the transport
//! implementation.

use crate::{Result, TransportError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default broker stream port
pub const DEFAULT_PORT: u16 = 5552;

/// Broker node address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = TransportError;

    /// Parse `host` or `host:port`
    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(TransportError::configuration(
                "address cannot be empty",
                Some("addresses"),
            ));
        }

        match value.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(TransportError::configuration(
                        format!("missing host in address '{}'", value),
                        Some("addresses"),
                    ));
                }
                let port = port.parse::<u16>().map_err(|_| {
                    TransportError::configuration(
                        format!("invalid port in address '{}'", value),
                        Some("addresses"),
                    )
                })?;
                Ok(Address::new(host, port))
            }
            None => Ok(Address::new(value, DEFAULT_PORT)),
        }
    }
}

/// Broker response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    StreamDoesNotExist,
    SubscriptionIdAlreadyExists,
    SubscriptionIdDoesNotExist,
    StreamAlreadyExists,
    StreamNotAvailable,
    AccessRefused,
    PreconditionFailed,
    PublisherDoesNotExist,
    NoOffset,
    InternalError,
    /// Code this client does not know by name
    Other(u16),
}

impl ResponseCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x01 => ResponseCode::Ok,
            0x02 => ResponseCode::StreamDoesNotExist,
            0x03 => ResponseCode::SubscriptionIdAlreadyExists,
            0x04 => ResponseCode::SubscriptionIdDoesNotExist,
            0x05 => ResponseCode::StreamAlreadyExists,
            0x06 => ResponseCode::StreamNotAvailable,
            0x10 => ResponseCode::AccessRefused,
            0x11 => ResponseCode::PreconditionFailed,
            0x12 => ResponseCode::PublisherDoesNotExist,
            0x13 => ResponseCode::NoOffset,
            0x0F => ResponseCode::InternalError,
            other => ResponseCode::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ResponseCode::Ok => 0x01,
            ResponseCode::StreamDoesNotExist => 0x02,
            ResponseCode::SubscriptionIdAlreadyExists => 0x03,
            ResponseCode::SubscriptionIdDoesNotExist => 0x04,
            ResponseCode::StreamAlreadyExists => 0x05,
            ResponseCode::StreamNotAvailable => 0x06,
            ResponseCode::AccessRefused => 0x10,
            ResponseCode::PreconditionFailed => 0x11,
            ResponseCode::PublisherDoesNotExist => 0x12,
            ResponseCode::NoOffset => 0x13,
            ResponseCode::InternalError => 0x0F,
            ResponseCode::Other(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseCode::Ok)
    }

    /// Turn a non-OK code into a [`TransportError::Response`] for `operation`
    pub fn ok_or_error(self, operation: &str) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(TransportError::response(operation, self))
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseCode::Other(code) => write!(f, "code {:#06x}", code),
            named => write!(f, "{:?} ({:#06x})", named, named.as_u16()),
        }
    }
}

/// Where a subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OffsetSpecification {
    /// Oldest message still in the stream
    First,
    /// Last chunk written
    Last,
    /// Only messages written after subscribing
    #[default]
    Next,
    /// Absolute offset
    Offset(u64),
    /// Milliseconds since the Unix epoch
    Timestamp(i64),
}

/// Batch of encoded messages delivered for one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the first entry; entries are consecutive from here
    pub first_offset: u64,
    pub entries: Vec<Bytes>,
}

impl Chunk {
    pub fn new(first_offset: u64, entries: Vec<Bytes>) -> Self {
        Self {
            first_offset,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries paired with their stream offsets
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Bytes)> {
        self.entries
            .iter()
            .enumerate()
            .map(move |(index, entry)| (self.first_offset + index as u64, entry))
    }
}

/// Topology of one stream as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub stream: String,
    pub code: ResponseCode,
    pub leader: Option<Address>,
    pub replicas: Vec<Address>,
}

impl StreamMetadata {
    pub fn new(stream: impl Into<String>, leader: Address) -> Self {
        Self {
            stream: stream.into(),
            code: ResponseCode::Ok,
            leader: Some(leader),
            replicas: Vec::new(),
        }
    }

    pub fn missing(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            code: ResponseCode::StreamDoesNotExist,
            leader: None,
            replicas: Vec::new(),
        }
    }

    pub fn with_replicas(mut self, replicas: Vec<Address>) -> Self {
        self.replicas = replicas;
        self
    }
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Closed by this client
    ClientClose,
    /// Closed by the broker
    ServerClose,
    HeartbeatFailure,
    /// Socket or framing failure
    Unknown(String),
}

impl ShutdownReason {
    /// Anything other than a client-initiated close triggers recovery
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, ShutdownReason::ClientClose)
    }
}
