//! The error surface of the engine. Every failure carries a semantic
//! [`ErrorKind`] plus, where they exist, the raw server status, the
//! originating opcode, and the redacted document key.

use thiserror::Error;

use crate::protocol::{OpCode, ProtocolError, Status};
use crate::redact::redact_user;

/// Semantic grouping of failures surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArgument,
    TemporaryFailure,
    Timeout,
    /// Caller-initiated cancellation; deliberately distinct from Timeout.
    Cancelled,
    Locked,
    Durability,
    Auth,
    InternalOrRetryable,
    PathNotFound,
    PathMismatch,
    PathInvalid,
    PathTooBig,
    SubdocGeneric,
    CollectionUnknown,
    /// Connection death or I/O failure; the server may or may not have
    /// applied the operation.
    Transport,
    /// Client-side failure: malformed frame, transcoding, bad input.
    Client,
    /// The target pool was disposed before the request could be sent.
    Disposed,
}

impl ErrorKind {
    /// The status → kind table. Unrecognised statuses group with the
    /// retryable internal failures.
    pub fn from_status(status: Status) -> ErrorKind {
        use Status::*;
        match status {
            KeyNotFound => ErrorKind::KeyNotFound,
            KeyExists => ErrorKind::KeyExists,
            ValueTooLarge => ErrorKind::ValueTooLarge,
            InvalidArguments => ErrorKind::InvalidArgument,
            TemporaryFailure | OutOfMemory | Busy => ErrorKind::TemporaryFailure,
            OperationTimeout => ErrorKind::Timeout,
            Locked => ErrorKind::Locked,
            DocumentMutationLost
            | DocumentMutationDetected
            | NoReplicasFound
            | DurabilityInvalidLevel
            | DurabilityImpossible
            | SyncWriteInProgress
            | SyncWriteAmbiguous
            | SyncWriteReCommitInProgress => ErrorKind::Durability,
            Eaccess | AuthStale | AuthenticationError | AuthenticationContinue => ErrorKind::Auth,
            SubDocPathNotFound => ErrorKind::PathNotFound,
            SubDocPathMismatch => ErrorKind::PathMismatch,
            SubDocPathInvalid => ErrorKind::PathInvalid,
            SubDocPathTooBig => ErrorKind::PathTooBig,
            SubDocInvalidCombo
            | SubDocXattrInvalidFlagCombo
            | SubDocXattrInvalidKeyCombo
            | SubDocXattrUnknownMacro => ErrorKind::InternalOrRetryable,
            SubDocDocTooDeep | SubDocCannotInsert | SubDocDocNotJson | SubDocNumRange
            | SubDocDeltaRange | SubDocPathExists | SubDocValueTooDeep | SubDocMultiPathFailure
            | SubDocMultiPathFailureDeleted => ErrorKind::SubdocGeneric,
            UnknownCollection | NoCollectionsManifest | UnknownScope => {
                ErrorKind::CollectionUnknown
            }
            ClientFailure => ErrorKind::Client,
            _ => ErrorKind::InternalOrRetryable,
        }
    }
}

/// An error raised while executing a KV operation.
#[derive(Debug, Error)]
pub struct Error {
    kind: ErrorKind,
    status: Option<Status>,
    raw_status: Option<u16>,
    op: Option<OpCode>,
    key: Option<String>,
    detail: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            status: None,
            raw_status: None,
            op: None,
            key: None,
            detail: None,
            source: None,
        }
    }

    /// A failure reported by the server via a response status.
    pub fn from_status(status: Status, raw_status: u16, op: OpCode, key: &[u8]) -> Self {
        Error {
            status: Some(status),
            raw_status: Some(raw_status),
            op: Some(op),
            key: Some(redact_user(key)),
            ..Error::new(ErrorKind::from_status(status))
        }
    }

    pub fn timeout(op: OpCode, key: &[u8]) -> Self {
        Error {
            status: Some(Status::OperationTimeout),
            op: Some(op),
            key: Some(redact_user(key)),
            ..Error::new(ErrorKind::Timeout)
        }
    }

    pub fn cancelled() -> Self {
        Error::new(ErrorKind::Cancelled)
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Error {
            detail: Some(detail.into()),
            ..Error::new(ErrorKind::Transport)
        }
    }

    pub fn disposed() -> Self {
        Error {
            detail: Some("connection pool already disposed".into()),
            ..Error::new(ErrorKind::Disposed)
        }
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Error {
            detail: Some(detail.into()),
            ..Error::new(ErrorKind::InvalidArgument)
        }
    }

    pub fn with_context(mut self, op: OpCode, key: &[u8]) -> Self {
        self.op = Some(op);
        self.key = Some(redact_user(key));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// The raw wire status, when the failure originated in a response.
    pub fn raw_status(&self) -> Option<u16> {
        self.raw_status
    }

    pub fn op(&self) -> Option<OpCode> {
        self.op
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::TemporaryFailure | ErrorKind::InternalOrRetryable
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kv operation failed: {:?}", self.kind)?;
        if let Some(op) = self.op {
            write!(f, " op={:?}", op)?;
        }
        if let Some(key) = &self.key {
            write!(f, " key={}", key)?;
        }
        if let (Some(status), Some(raw)) = (self.status, self.raw_status) {
            write!(f, " status={:?}(0x{:04x})", status, raw)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            ..Error::new(ErrorKind::Transport)
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error {
            source: Some(Box::new(err)),
            ..Error::new(ErrorKind::Client)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            ..Error::new(ErrorKind::Client)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};
    use crate::protocol::{OpCode, ProtocolError, Status};

    #[test]
    fn test_status_kind_mapping() {
        assert_eq!(
            ErrorKind::KeyNotFound,
            ErrorKind::from_status(Status::KeyNotFound)
        );
        assert_eq!(
            ErrorKind::TemporaryFailure,
            ErrorKind::from_status(Status::OutOfMemory)
        );
        assert_eq!(
            ErrorKind::Durability,
            ErrorKind::from_status(Status::SyncWriteAmbiguous)
        );
        assert_eq!(ErrorKind::Auth, ErrorKind::from_status(Status::Eaccess));
        assert_eq!(
            ErrorKind::InternalOrRetryable,
            ErrorKind::from_status(Status::VBucketBelongsToAnotherServer)
        );
        assert_eq!(
            ErrorKind::PathNotFound,
            ErrorKind::from_status(Status::SubDocPathNotFound)
        );
        assert_eq!(
            ErrorKind::SubdocGeneric,
            ErrorKind::from_status(Status::SubDocDocNotJson)
        );
        assert_eq!(
            ErrorKind::CollectionUnknown,
            ErrorKind::from_status(Status::UnknownCollection)
        );
        assert_eq!(
            ErrorKind::InternalOrRetryable,
            ErrorKind::from_status(Status::UnknownStatus)
        );
    }

    #[test]
    fn test_display_redacts_key() {
        let err = Error::from_status(Status::KeyNotFound, 0x01, OpCode::Get, b"secret-key");
        let rendered = format!("{}", err);
        assert!(rendered.contains("<ud>secret-key</ud>"));
        assert!(rendered.contains("status=KeyNotFound(0x0001)"));
    }

    #[test]
    fn test_timeout_distinct_from_cancelled() {
        assert_eq!(ErrorKind::Timeout, Error::timeout(OpCode::Get, b"k").kind());
        assert_eq!(ErrorKind::Cancelled, Error::cancelled().kind());
    }

    #[test]
    fn test_protocol_error_is_client_kind() {
        let err = Error::from(ProtocolError::InvalidMagic(0x42));
        assert_eq!(ErrorKind::Client, err.kind());
    }
}
