use bytes::{BufMut, BytesMut};
use std::convert::TryInto;

use super::{
    ProtocolError, Status, MAGIC_ALT_REQUEST_VALUE, MAGIC_REQUEST_VALUE, MAGIC_RESPONSE_VALUE,
};

/// Both request and response headers occupy a fixed 24 bytes.
pub const HEADER_LEN: usize = 24;

/// Response magic for frames carrying flexible framing extras.
pub(crate) const MAGIC_ALT_RESPONSE_VALUE: u8 = 0x18;

/// Largest body this client will emit or accept unless the handshake
/// negotiated another limit. Matches the server-side default of 20 MiB.
pub const DEFAULT_MAX_BODY: usize = 20 * 1024 * 1024;

/// Append the unsigned-LEB128 encoding of `v` to `buf`. Used to prefix a
/// document key with its collection id once collections are negotiated.
pub fn write_uleb128(buf: &mut BytesMut, mut v: u32) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if v == 0 {
            break;
        }
    }
}

/// Number of bytes [`write_uleb128`] will emit for `v`.
pub fn uleb128_len(v: u32) -> usize {
    match v {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

/// A fully-specified request ready to be framed. The connection fills in
/// the opaque at dispatch time; everything else comes from the operation.
#[derive(Debug, Default)]
pub struct RequestFrame<'a> {
    pub opcode: u8,
    pub vbucket: u16,
    pub data_type: u8,
    pub opaque: u32,
    pub cas: u64,
    /// Flexible framing extras; non-empty switches to the alternative
    /// request magic whose header carries the framing length.
    pub framing_extras: &'a [u8],
    pub extras: &'a [u8],
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> RequestFrame<'a> {
    pub fn body_len(&self) -> usize {
        self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Frame the request into `buf`. Refuses to emit a frame whose body
    /// exceeds `max_body`.
    pub fn write(&self, buf: &mut BytesMut, max_body: usize) -> Result<(), ProtocolError> {
        let body_len = self.body_len();
        if body_len > max_body {
            return Err(ProtocolError::FrameTooLarge {
                len: body_len,
                max: max_body,
            });
        }

        buf.reserve(HEADER_LEN + body_len);
        if self.framing_extras.is_empty() {
            buf.put_u8(MAGIC_REQUEST_VALUE);
            buf.put_u8(self.opcode);
            buf.put_u16(self.key.len() as u16);
        } else {
            buf.put_u8(MAGIC_ALT_REQUEST_VALUE);
            buf.put_u8(self.opcode);
            buf.put_u8(self.framing_extras.len() as u8);
            buf.put_u8(self.key.len() as u8);
        }
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.data_type);
        buf.put_u16(self.vbucket);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(self.framing_extras);
        buf.put_slice(self.extras);
        buf.put_slice(self.key);
        buf.put_slice(self.value);
        Ok(())
    }
}

/// The parsed 24-byte header of a response frame. Status replaces the
/// request's vbucket field; the body follows as framing extras, extras,
/// key, then value.
#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub struct ResponseHeader {
    pub magic: u8,
    pub opcode: u8,
    pub framing_length: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub raw_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::PacketTooSmall);
        }
        let magic = bytes[0];
        let (framing_length, key_length) = match magic {
            MAGIC_RESPONSE_VALUE => (0u8, u16::from_be_bytes(bytes[2..4].try_into().unwrap())),
            MAGIC_ALT_RESPONSE_VALUE => (bytes[2], bytes[3] as u16),
            other => return Err(ProtocolError::InvalidMagic(other)),
        };
        Ok(ResponseHeader {
            magic,
            opcode: bytes[1],
            framing_length,
            key_length,
            extras_length: bytes[4],
            data_type: bytes[5],
            raw_status: u16::from_be_bytes(bytes[6..8].try_into().unwrap()),
            body_len: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            opaque: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            cas: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
        })
    }

    pub fn status(&self) -> Status {
        Status::from(self.raw_status)
    }
}
