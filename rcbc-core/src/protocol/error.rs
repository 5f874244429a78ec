use thiserror::Error;

/// Status codes a server (or, for the 0x0408+ range, this client) can
/// attach to a response. The numeric values are the wire values; the
/// client-side pseudo-statuses live above every server-assigned range so
/// they can never collide with a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    IncrDecrOnNonNumericValue,
    VBucketBelongsToAnotherServer,
    BucketNotConnected,
    Locked,
    AuthStale,
    AuthenticationError,
    AuthenticationContinue,
    InvalidRange,
    Rollback,
    Eaccess,
    NotInitialized,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    UnknownCollection,
    NoCollectionsManifest,
    UnknownScope,
    DurabilityInvalidLevel,
    DurabilityImpossible,
    SyncWriteInProgress,
    SyncWriteAmbiguous,
    SyncWriteReCommitInProgress,
    SubDocPathNotFound,
    SubDocPathMismatch,
    SubDocPathInvalid,
    SubDocPathTooBig,
    SubDocDocTooDeep,
    SubDocCannotInsert,
    SubDocDocNotJson,
    SubDocNumRange,
    SubDocDeltaRange,
    SubDocPathExists,
    SubDocValueTooDeep,
    SubDocInvalidCombo,
    SubDocMultiPathFailure,
    SubDocSuccessDeleted,
    SubDocXattrInvalidFlagCombo,
    SubDocXattrInvalidKeyCombo,
    SubDocXattrUnknownMacro,
    SubDocMultiPathFailureDeleted,
    // Client-side pseudo-statuses; never produced by frame decoding.
    ClientFailure,
    OperationTimeout,
    NoReplicasFound,
    DocumentMutationLost,
    DocumentMutationDetected,
    UnknownStatus,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success | Status::SubDocSuccessDeleted)
    }
}

impl From<u16> for Status {
    fn from(val: u16) -> Self {
        match val {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::ValueTooLarge,
            0x04 => Status::InvalidArguments,
            0x05 => Status::ItemNotStored,
            0x06 => Status::IncrDecrOnNonNumericValue,
            0x07 => Status::VBucketBelongsToAnotherServer,
            0x08 => Status::BucketNotConnected,
            0x09 => Status::Locked,
            0x1f => Status::AuthStale,
            0x20 => Status::AuthenticationError,
            0x21 => Status::AuthenticationContinue,
            0x22 => Status::InvalidRange,
            0x23 => Status::Rollback,
            0x24 => Status::Eaccess,
            0x25 => Status::NotInitialized,
            0x81 => Status::UnknownCommand,
            0x82 => Status::OutOfMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::InternalError,
            0x85 => Status::Busy,
            0x86 => Status::TemporaryFailure,
            0x88 => Status::UnknownCollection,
            0x89 => Status::NoCollectionsManifest,
            0x8c => Status::UnknownScope,
            0xa0 => Status::DurabilityInvalidLevel,
            0xa1 => Status::DurabilityImpossible,
            0xa2 => Status::SyncWriteInProgress,
            0xa3 => Status::SyncWriteAmbiguous,
            0xa4 => Status::SyncWriteReCommitInProgress,
            0xc0 => Status::SubDocPathNotFound,
            0xc1 => Status::SubDocPathMismatch,
            0xc2 => Status::SubDocPathInvalid,
            0xc3 => Status::SubDocPathTooBig,
            0xc4 => Status::SubDocDocTooDeep,
            0xc5 => Status::SubDocCannotInsert,
            0xc6 => Status::SubDocDocNotJson,
            0xc7 => Status::SubDocNumRange,
            0xc8 => Status::SubDocDeltaRange,
            0xc9 => Status::SubDocPathExists,
            0xca => Status::SubDocValueTooDeep,
            0xcb => Status::SubDocInvalidCombo,
            0xcc => Status::SubDocMultiPathFailure,
            0xcd => Status::SubDocSuccessDeleted,
            0xce => Status::SubDocXattrInvalidFlagCombo,
            0xcf => Status::SubDocXattrInvalidKeyCombo,
            0xd0 => Status::SubDocXattrUnknownMacro,
            0xd3 => Status::SubDocMultiPathFailureDeleted,
            0x0408 => Status::ClientFailure,
            0x0409 => Status::OperationTimeout,
            0x040a => Status::NoReplicasFound,
            0x040b => Status::DocumentMutationLost,
            0x040c => Status::DocumentMutationDetected,
            _ => Status::UnknownStatus,
        }
    }
}

/// An error caused by a frame this client could not produce or accept.
/// Always a client-side failure, distinct from any server [`Status`].
#[derive(Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid magic byte: {0}")]
    InvalidMagic(u8),
    #[error("frame shorter than the 24-byte header")]
    PacketTooSmall,
    #[error("declared body length does not match the frame")]
    BodySizeMismatch,
    #[error("frame body of {len} bytes exceeds the negotiated maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("sub-document request carries {0} specs, limit is 16")]
    TooManySpecs(usize),
    #[error("response payload truncated while reading {0}")]
    TruncatedField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::{ProtocolError, Status};

    #[test]
    fn test_status_from_wire() {
        assert_eq!(Status::Success, Status::from(0x00));
        assert_eq!(Status::KeyNotFound, Status::from(0x01));
        assert_eq!(Status::VBucketBelongsToAnotherServer, Status::from(0x07));
        assert_eq!(Status::SyncWriteAmbiguous, Status::from(0xa3));
        assert_eq!(Status::SubDocPathNotFound, Status::from(0xc0));
        assert_eq!(Status::UnknownStatus, Status::from(0xfffe));
    }

    #[test]
    fn test_pseudo_statuses_outside_server_ranges() {
        // The client range must stay disjoint from anything a frame decode
        // can produce for foreseeable server status assignments.
        for raw in 0x0000..0x0100u16 {
            assert_ne!(Status::OperationTimeout, Status::from(raw));
            assert_ne!(Status::ClientFailure, Status::from(raw));
        }
    }

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(
            "invalid magic byte: 8",
            format!("{}", ProtocolError::InvalidMagic(8))
        );
        assert_eq!(
            "sub-document request carries 17 specs, limit is 16",
            format!("{}", ProtocolError::TooManySpecs(17))
        );
    }
}
