use bytes::{Buf, Bytes};
use std::convert::TryInto;

use crate::protocol::{ProtocolError, ResponseHeader, Status};

/// The mutation sequencing token returned by mutations when the server
/// reports it: the vbucket's uuid and the mutation's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    pub vbucket_uuid: u64,
    pub seqno: u64,
}

/// Per-key state reported by an Observe response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyState {
    FoundNotPersisted = 0x00,
    FoundPersisted = 0x01,
    NotFound = 0x80,
    LogicallyDeleted = 0x81,
}

impl KeyState {
    fn parse(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(KeyState::FoundNotPersisted),
            0x01 => Ok(KeyState::FoundPersisted),
            0x80 => Ok(KeyState::NotFound),
            0x81 => Ok(KeyState::LogicallyDeleted),
            _ => Err(ProtocolError::TruncatedField("observe key state")),
        }
    }

    /// Whether the key exists from a caller's point of view.
    pub fn exists(self) -> bool {
        matches!(self, KeyState::FoundNotPersisted | KeyState::FoundPersisted)
    }
}

/// A decoded response frame split into its sections. Typed accessors
/// interpret the payload per opcode.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub opcode: u8,
    pub status: Status,
    pub raw_status: u16,
    pub data_type: u8,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl RawResponse {
    /// Split a response body according to its header. Framing extras (alt
    /// response magic) are skipped; nothing in this layer consumes them.
    pub fn from_parts(header: &ResponseHeader, body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() != header.body_len as usize {
            return Err(ProtocolError::BodySizeMismatch);
        }
        let framing = header.framing_length as usize;
        let extras = header.extras_length as usize;
        let key = header.key_length as usize;
        if framing + extras + key > body.len() {
            return Err(ProtocolError::BodySizeMismatch);
        }
        let mut rest = body;
        rest.advance(framing);
        let extras = rest.split_to(extras);
        let key = rest.split_to(key);
        Ok(RawResponse {
            opcode: header.opcode,
            status: header.status(),
            raw_status: header.raw_status,
            data_type: header.data_type,
            cas: header.cas,
            extras,
            key,
            value: rest,
        })
    }

    pub fn error_for_status(&self) -> Result<(), Status> {
        if self.status.is_success() {
            Ok(())
        } else {
            Err(self.status)
        }
    }

    /// Document flags from a Get-family response's 4-byte extras.
    pub fn content_flags(&self) -> u32 {
        if self.extras.len() >= 4 {
            u32::from_be_bytes(self.extras[0..4].try_into().unwrap())
        } else {
            0
        }
    }

    /// Counter responses carry the post-operation value as 8 big-endian
    /// bytes.
    pub fn counter_value(&self) -> Result<u64, ProtocolError> {
        if self.value.len() < 8 {
            return Err(ProtocolError::TruncatedField("counter value"));
        }
        Ok(u64::from_be_bytes(self.value[0..8].try_into().unwrap()))
    }

    /// GetCidByName responses carry a 12-byte extras section: the manifest
    /// uid followed by the 4-byte big-endian collection id.
    pub fn collection_id(&self) -> Result<u32, ProtocolError> {
        if self.extras.len() < 12 {
            return Err(ProtocolError::TruncatedField("collection id extras"));
        }
        Ok(u32::from_be_bytes(self.extras[8..12].try_into().unwrap()))
    }

    /// Mutations report a token when the 16-byte extras are present.
    pub fn mutation_token(&self) -> Option<MutationToken> {
        if self.extras.len() < 16 {
            return None;
        }
        Some(MutationToken {
            vbucket_uuid: u64::from_be_bytes(self.extras[0..8].try_into().unwrap()),
            seqno: u64::from_be_bytes(self.extras[8..16].try_into().unwrap()),
        })
    }

    /// Parse a single-key Observe response: vbucket, key length, key,
    /// key state, then the observed cas.
    pub fn observe_state(&self) -> Result<(KeyState, u64), ProtocolError> {
        let mut rest = self.value.clone();
        if rest.len() < 4 {
            return Err(ProtocolError::TruncatedField("observe header"));
        }
        rest.advance(2); // vbucket
        let key_len = rest.get_u16() as usize;
        if rest.len() < key_len + 9 {
            return Err(ProtocolError::TruncatedField("observe entry"));
        }
        rest.advance(key_len);
        let state = KeyState::parse(rest.get_u8())?;
        let cas = rest.get_u64();
        Ok((state, cas))
    }
}
