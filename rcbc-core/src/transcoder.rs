//! Value transcoding. A [`Transcoder`] turns typed values into wire bytes
//! plus the flags/datatype metadata that travel with them, and back. The
//! default treats documents as JSON; implement the trait yourself for
//! other formats and pass it to the collection.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

/// Common-flags format marker for JSON documents (upper byte 0x02).
pub const JSON_COMMON_FLAGS: u32 = 0x0200_0000;

/// Datatype bit telling the server the payload is JSON.
pub const DATATYPE_JSON: u8 = 0x01;

pub trait Transcoder: Clone + Send + Sync + 'static {
    /// Serialise a value, returning (bytes, flags, datatype).
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<(Vec<u8>, u32, u8), Error>;

    /// Interpret a payload using the flags it was stored with.
    fn decode<V: DeserializeOwned>(&self, bytes: &[u8], flags: u32) -> Result<V, Error>;
}

/// The default transcoder: documents are JSON, marked as such in both the
/// common flags and the datatype byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTranscoder;

impl Transcoder for JsonTranscoder {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<(Vec<u8>, u32, u8), Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok((bytes, JSON_COMMON_FLAGS, DATATYPE_JSON))
    }

    fn decode<V: DeserializeOwned>(&self, bytes: &[u8], _flags: u32) -> Result<V, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
