//! Runtime-agnostic core of an async Couchbase key/value client: the
//! binary-protocol operation model, per-node connection pools with
//! bounded, self-healing dispatch, and the collection-level KV API that
//! routes requests by vBucket. Bind a transport (see the tokio crate) to
//! get a working client.

pub mod bucket;
pub mod collection;
pub mod config;
pub mod connection;
pub mod error;
pub mod keymap;
pub mod operation;
pub mod pool;
pub mod protocol;
pub(crate) mod redact;
pub mod transcoder;

pub use bucket::Bucket;
pub use collection::Collection;
pub use config::KvConfig;
pub use connection::{
    BoxedTransport, Connection, ConnectionFactory, ConnectionInitializer, Endpoint,
    NoopInitializer, Transport,
};
pub use error::{Error, ErrorKind};
pub use keymap::{
    ConfigListener, KeyMapper, NodeLocator, NoopConfigListener, StaticNodeLocator, VBucket,
    VBucketKeyMapper, VBucketMap,
};
pub use operation::{DurabilityLevel, DurabilityRequirement, Operation};
pub use pool::{ConnectionPool, SendRequest};
pub use protocol::{OpCode, ProtocolError, ServerFeatures, Status};
pub use transcoder::{JsonTranscoder, Transcoder};
