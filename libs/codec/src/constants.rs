//! Wire format constants
//!
//! ```text
//! frame     := length:u32 | FRAME_MESSAGE:u8 | section*
//! section   := tag:u8 | length:u32 | content
//! property  := key:u8 | value-type:u8 | value
//! id value  := discriminator:u8 | (len:u32 utf8 | u64 | len:u32 bytes | 16 bytes)
//! ```
//!
//! All integers are big-endian. The frame length counts every byte after
//! the length field itself.

/// Size of the frame length prefix
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Default upper bound for an encoded message (16MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Frame type tag for an application message
pub const FRAME_MESSAGE: u8 = 0x01;

pub mod section {
    pub const PROPERTIES: u8 = 0x02;
    pub const BODY: u8 = 0x03;
}

pub mod value {
    pub const STRING: u8 = 0xA1;
    pub const BINARY: u8 = 0xA2;
    pub const LONG: u8 = 0x81;
    pub const UINT: u8 = 0x70;
    pub const ID: u8 = 0xA5;
}

/// Identifier variant discriminators
pub mod id {
    pub const STRING: u8 = 0;
    pub const ULONG: u8 = 1;
    pub const BINARY: u8 = 2;
    pub const UUID: u8 = 3;

    pub const UUID_SIZE: usize = 16;
}

/// Property keys
pub mod key {
    pub const MESSAGE_ID: u8 = 0x10;
    pub const USER_ID: u8 = 0x11;
    pub const TO: u8 = 0x12;
    pub const SUBJECT: u8 = 0x13;
    pub const REPLY_TO: u8 = 0x14;
    pub const CORRELATION_ID: u8 = 0x15;
    pub const CONTENT_TYPE: u8 = 0x16;
    pub const CONTENT_ENCODING: u8 = 0x17;
    pub const ABSOLUTE_EXPIRY_TIME: u8 = 0x18;
    pub const CREATION_TIME: u8 = 0x19;
    pub const GROUP_ID: u8 = 0x1A;
    pub const GROUP_SEQUENCE: u8 = 0x1B;
    pub const REPLY_TO_GROUP_ID: u8 = 0x1C;
}
