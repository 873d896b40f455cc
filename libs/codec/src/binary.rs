//! # Binary Codec - Tagged Wire Format
//!
//! Default [`Codec`] implementation. Encodes the body and every present
//! property as type-tagged entries inside a length-prefixed frame. See
//! [`crate::constants`] for the layout.
//!
//! Decoding is strict: the frame length must match the buffer exactly,
//! every section and string length must fit inside its parent, and unknown
//! tags are rejected instead of skipped.

use crate::codec::{Codec, EncodedMessage};
use crate::constants::{self, id, key, section, value};
use crate::error::{CodecError, CodecResult};
use crate::message::{Message, MessageId, Properties};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Tagged binary codec
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    max_message_size: usize,
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: constants::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Reject messages whose encoded frame would exceed `limit` bytes
    pub fn with_max_message_size(limit: usize) -> Self {
        Self {
            max_message_size: limit,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Codec for BinaryCodec {
    fn encode(&self, message: &Message) -> CodecResult<EncodedMessage> {
        let mut properties = BytesMut::new();
        write_properties(&mut properties, &message.properties)?;

        check_length("body", message.body.len())?;
        check_length("properties", properties.len())?;

        let mut payload_len = 1 + 5 + message.body.len();
        if !properties.is_empty() {
            payload_len += 5 + properties.len();
        }
        let frame_len = constants::FRAME_LENGTH_SIZE + payload_len;
        if frame_len > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: frame_len,
                limit: self.max_message_size,
            });
        }
        check_length("frame", payload_len)?;

        let mut frame = BytesMut::with_capacity(frame_len);
        frame.put_u32(payload_len as u32);
        frame.put_u8(constants::FRAME_MESSAGE);
        if !properties.is_empty() {
            frame.put_u8(section::PROPERTIES);
            frame.put_u32(properties.len() as u32);
            frame.put_slice(&properties);
        }
        frame.put_u8(section::BODY);
        frame.put_u32(message.body.len() as u32);
        frame.put_slice(&message.body);

        Ok(EncodedMessage::new(frame.freeze()))
    }

    fn decode(&self, data: &[u8]) -> CodecResult<Message> {
        let mut frame = Reader::new(data);
        let declared = frame.u32("frame length")? as usize;
        if declared != frame.remaining() {
            return Err(CodecError::length_mismatch(
                declared,
                frame.remaining(),
                "frame",
            ));
        }

        let tag_offset = frame.position();
        let frame_type = frame.u8("frame type")?;
        if frame_type != constants::FRAME_MESSAGE {
            return Err(CodecError::unknown_tag("frame", frame_type, tag_offset));
        }

        let mut message = Message::default();
        while frame.remaining() > 0 {
            let tag_offset = frame.position();
            let tag = frame.u8("section tag")?;
            let len = frame.u32("section length")? as usize;
            if len > frame.remaining() {
                return Err(CodecError::truncated(len, frame.remaining(), "section"));
            }
            let start = frame.position();
            let content = frame.take(len, "section")?;
            match tag {
                section::PROPERTIES => {
                    message.properties = read_properties(Reader::at(content, start))?;
                }
                section::BODY => message.body = Bytes::copy_from_slice(content),
                other => return Err(CodecError::unknown_tag("section", other, tag_offset)),
            }
        }

        Ok(message)
    }

    fn name(&self) -> &'static str {
        "binary"
    }
}

fn check_length(property: &'static str, len: usize) -> CodecResult<()> {
    if len > u32::MAX as usize {
        return Err(CodecError::invalid_property(
            property,
            format!("{} bytes exceeds the 32-bit length field", len),
        ));
    }
    Ok(())
}

fn put_sized(buf: &mut BytesMut, property: &'static str, bytes: &[u8]) -> CodecResult<()> {
    check_length(property, bytes.len())?;
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
    Ok(())
}

fn put_string(buf: &mut BytesMut, key: u8, property: &'static str, text: &str) -> CodecResult<()> {
    buf.put_u8(key);
    buf.put_u8(value::STRING);
    put_sized(buf, property, text.as_bytes())
}

fn put_id(
    buf: &mut BytesMut,
    key: u8,
    property: &'static str,
    identifier: &MessageId,
) -> CodecResult<()> {
    buf.put_u8(key);
    buf.put_u8(value::ID);
    match identifier {
        MessageId::String(text) => {
            buf.put_u8(id::STRING);
            put_sized(buf, property, text.as_bytes())?;
        }
        MessageId::Ulong(number) => {
            buf.put_u8(id::ULONG);
            buf.put_u64(*number);
        }
        MessageId::Binary(raw) => {
            buf.put_u8(id::BINARY);
            put_sized(buf, property, raw)?;
        }
        MessageId::Uuid(uuid) => {
            buf.put_u8(id::UUID);
            buf.put_slice(uuid.as_bytes());
        }
    }
    Ok(())
}

fn write_properties(buf: &mut BytesMut, properties: &Properties) -> CodecResult<()> {
    if let Some(message_id) = &properties.message_id {
        put_id(buf, key::MESSAGE_ID, "message_id", message_id)?;
    }
    if let Some(user_id) = &properties.user_id {
        buf.put_u8(key::USER_ID);
        buf.put_u8(value::BINARY);
        put_sized(buf, "user_id", user_id)?;
    }
    if let Some(to) = &properties.to {
        put_string(buf, key::TO, "to", to)?;
    }
    if let Some(subject) = &properties.subject {
        put_string(buf, key::SUBJECT, "subject", subject)?;
    }
    if let Some(reply_to) = &properties.reply_to {
        put_string(buf, key::REPLY_TO, "reply_to", reply_to)?;
    }
    if let Some(correlation_id) = &properties.correlation_id {
        put_id(buf, key::CORRELATION_ID, "correlation_id", correlation_id)?;
    }
    if let Some(content_type) = &properties.content_type {
        put_string(buf, key::CONTENT_TYPE, "content_type", content_type)?;
    }
    if let Some(content_encoding) = &properties.content_encoding {
        put_string(buf, key::CONTENT_ENCODING, "content_encoding", content_encoding)?;
    }
    if let Some(expiry) = properties.absolute_expiry_time {
        buf.put_u8(key::ABSOLUTE_EXPIRY_TIME);
        buf.put_u8(value::LONG);
        buf.put_i64(expiry);
    }
    if let Some(creation) = properties.creation_time {
        buf.put_u8(key::CREATION_TIME);
        buf.put_u8(value::LONG);
        buf.put_i64(creation);
    }
    if let Some(group_id) = &properties.group_id {
        put_string(buf, key::GROUP_ID, "group_id", group_id)?;
    }
    if let Some(sequence) = properties.group_sequence {
        buf.put_u8(key::GROUP_SEQUENCE);
        buf.put_u8(value::UINT);
        buf.put_u32(sequence);
    }
    if let Some(reply_to_group_id) = &properties.reply_to_group_id {
        put_string(buf, key::REPLY_TO_GROUP_ID, "reply_to_group_id", reply_to_group_id)?;
    }
    Ok(())
}

fn read_properties(mut reader: Reader<'_>) -> CodecResult<Properties> {
    let mut properties = Properties::default();
    while reader.remaining() > 0 {
        let key_offset = reader.position();
        let property_key = reader.u8("property key")?;
        let type_offset = reader.position();
        let value_type = reader.u8("property value type")?;

        let expected = match property_key {
            key::MESSAGE_ID | key::CORRELATION_ID => value::ID,
            key::USER_ID => value::BINARY,
            key::ABSOLUTE_EXPIRY_TIME | key::CREATION_TIME => value::LONG,
            key::GROUP_SEQUENCE => value::UINT,
            key::TO
            | key::SUBJECT
            | key::REPLY_TO
            | key::CONTENT_TYPE
            | key::CONTENT_ENCODING
            | key::GROUP_ID
            | key::REPLY_TO_GROUP_ID => value::STRING,
            other => return Err(CodecError::unknown_tag("property", other, key_offset)),
        };
        if value_type != expected {
            return Err(CodecError::unknown_tag("value type", value_type, type_offset));
        }

        match property_key {
            key::MESSAGE_ID => properties.message_id = Some(reader.id("message_id")?),
            key::CORRELATION_ID => properties.correlation_id = Some(reader.id("correlation_id")?),
            key::USER_ID => properties.user_id = Some(reader.sized_bytes("user_id")?),
            key::TO => properties.to = Some(reader.string("to")?),
            key::SUBJECT => properties.subject = Some(reader.string("subject")?),
            key::REPLY_TO => properties.reply_to = Some(reader.string("reply_to")?),
            key::CONTENT_TYPE => properties.content_type = Some(reader.string("content_type")?),
            key::CONTENT_ENCODING => {
                properties.content_encoding = Some(reader.string("content_encoding")?)
            }
            key::ABSOLUTE_EXPIRY_TIME => {
                properties.absolute_expiry_time = Some(reader.i64("absolute_expiry_time")?)
            }
            key::CREATION_TIME => properties.creation_time = Some(reader.i64("creation_time")?),
            key::GROUP_ID => properties.group_id = Some(reader.string("group_id")?),
            key::GROUP_SEQUENCE => properties.group_sequence = Some(reader.u32("group_sequence")?),
            _ => {
                properties.reply_to_group_id = Some(reader.string("reply_to_group_id")?)
            }
        }
    }
    Ok(properties)
}

/// Bounds-checked cursor over a frame. `base` is the absolute offset of
/// `buf[0]` inside the frame, used for error reporting.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self::at(buf, 0)
    }

    fn at(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn position(&self) -> usize {
        self.base + self.pos
    }

    fn take(&mut self, n: usize, context: &'static str) -> CodecResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(CodecError::truncated(n, self.remaining(), context));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, context: &'static str) -> CodecResult<u8> {
        Ok(self.take(1, context)?.get_u8())
    }

    fn u32(&mut self, context: &'static str) -> CodecResult<u32> {
        Ok(self.take(4, context)?.get_u32())
    }

    fn u64(&mut self, context: &'static str) -> CodecResult<u64> {
        Ok(self.take(8, context)?.get_u64())
    }

    fn i64(&mut self, context: &'static str) -> CodecResult<i64> {
        Ok(self.take(8, context)?.get_i64())
    }

    fn sized(&mut self, context: &'static str) -> CodecResult<&'a [u8]> {
        let len = self.u32(context)? as usize;
        self.take(len, context)
    }

    fn sized_bytes(&mut self, context: &'static str) -> CodecResult<Bytes> {
        Ok(Bytes::copy_from_slice(self.sized(context)?))
    }

    fn string(&mut self, property: &'static str) -> CodecResult<String> {
        let raw = self.sized(property)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8 { property })
    }

    fn id(&mut self, property: &'static str) -> CodecResult<MessageId> {
        let offset = self.position();
        match self.u8("identifier variant")? {
            id::STRING => Ok(MessageId::String(self.string(property)?)),
            id::ULONG => Ok(MessageId::Ulong(self.u64(property)?)),
            id::BINARY => Ok(MessageId::Binary(self.sized_bytes(property)?)),
            id::UUID => {
                let raw = self.take(id::UUID_SIZE, "uuid identifier")?;
                let mut bytes = [0u8; id::UUID_SIZE];
                bytes.copy_from_slice(raw);
                Ok(MessageId::Uuid(Uuid::from_bytes(bytes)))
            }
            other => Err(CodecError::unknown_tag("identifier variant", other, offset)),
        }
    }
}
