mod error;
mod packet;

pub use error::{ProtocolError, Status};
pub use packet::{
    uleb128_len, write_uleb128, RequestFrame, ResponseHeader, DEFAULT_MAX_BODY, HEADER_LEN,
};

pub(crate) const MAGIC_REQUEST_VALUE: u8 = 0x80;
pub(crate) const MAGIC_ALT_REQUEST_VALUE: u8 = 0x08;
pub(crate) const MAGIC_RESPONSE_VALUE: u8 = 0x81;

/// Framing extra id carrying the durability level (and optional timeout).
pub(crate) const FRAMING_DURABILITY_ID: u8 = 0x01;

/// What the connection initializer negotiated with the server. Encoding
/// consults this for collection-id key prefixing and the frame size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerFeatures {
    pub collections: bool,
    pub max_body: usize,
}

impl Default for ServerFeatures {
    fn default() -> Self {
        ServerFeatures {
            collections: true,
            max_body: packet::DEFAULT_MAX_BODY,
        }
    }
}

/// The closed set of request opcodes this engine emits, with their wire
/// discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    GetReplica = 0x83,
    Observe = 0x92,
    GetAndLock = 0x94,
    Unlock = 0x95,
    GetCidByName = 0xbb,
    SubDocMultiLookup = 0xd0,
    SubDocMultiMutation = 0xd1,
}

impl OpCode {
    /// True for operations that can be retried without changing server
    /// state: pure reads and collection-id lookups.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            OpCode::Get
                | OpCode::GetReplica
                | OpCode::Observe
                | OpCode::GetCidByName
                | OpCode::SubDocMultiLookup
                | OpCode::Noop
        )
    }

    /// True when the opcode mutates the document and may carry a
    /// durability requirement.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            OpCode::Set
                | OpCode::Add
                | OpCode::Replace
                | OpCode::Delete
                | OpCode::Increment
                | OpCode::Decrement
                | OpCode::Append
                | OpCode::Prepend
                | OpCode::SubDocMultiMutation
        )
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

#[cfg(test)]
mod tests {
    use super::OpCode;

    #[test]
    fn test_idempotence() {
        assert!(OpCode::Get.is_idempotent());
        assert!(OpCode::GetCidByName.is_idempotent());
        assert!(OpCode::SubDocMultiLookup.is_idempotent());
        assert!(!OpCode::Set.is_idempotent());
        assert!(!OpCode::SubDocMultiMutation.is_idempotent());
    }

    #[test]
    fn test_wire_values() {
        assert_eq!(0x00, u8::from(OpCode::Get));
        assert_eq!(0x1d, u8::from(OpCode::GetAndTouch));
        assert_eq!(0xbb, u8::from(OpCode::GetCidByName));
        assert_eq!(0xd1, u8::from(OpCode::SubDocMultiMutation));
    }
}
