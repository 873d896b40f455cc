//! # Stream Codec
//!
//! ## Purpose
//!
//! Message model and wire encoding for the stream client:
//! - [`Message`] / [`Properties`] / [`MessageId`] data model
//! - [`Codec`] capability trait, selected when an environment is built
//! - [`BinaryCodec`], the tagged binary implementation
//!
//! ## Architecture Role
//!
//! ```text
//! producers → [codec::encode] → EncodedMessage → network::Connection::publish
//! network chunks → [codec::decode] → Message → consumer handlers
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Connection handling or framing of the transport stream (network/)
//! - Producer/consumer coordination (client/)
//!
//! Codecs hold no mutable state and are shared across threads as
//! `Arc<dyn Codec>`.

pub mod binary;
pub mod codec;
pub mod constants;
pub mod error;
pub mod message;

pub use binary::BinaryCodec;
pub use codec::{Codec, EncodedMessage};
pub use error::{CodecError, CodecResult};
pub use message::{Message, MessageId, Properties};
