//! The operation model: one [`Operation`] value per request, carrying
//! everything needed to frame it on the wire. The connection assigns the
//! opaque at dispatch time; completions travel in a separate one-shot
//! channel owned by the caller.

pub mod response;
pub mod subdoc;

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

use crate::protocol::{
    uleb128_len, write_uleb128, OpCode, ProtocolError, RequestFrame, ServerFeatures,
    FRAMING_DURABILITY_ID,
};
use subdoc::{LookupInSpec, MutateInSpec};

/// Server-enforced durability levels for mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DurabilityLevel {
    Majority = 0x01,
    MajorityAndPersistActive = 0x02,
    PersistToMajority = 0x03,
}

/// A durability hint attached to a mutation: level plus an optional
/// server-side deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityRequirement {
    pub level: DurabilityLevel,
    pub timeout: Option<Duration>,
}

/// The unit of work dispatched to a node. Constructed per call by the
/// dispatcher, encoded by the connection that finally sends it.
#[derive(Debug, Clone)]
pub struct Operation {
    pub op_code: OpCode,
    pub key: Vec<u8>,
    /// Collection id; `None` targets the default collection.
    pub cid: Option<u32>,
    pub vbucket: u16,
    /// Compare-and-swap token; 0 means "any".
    pub cas: u64,
    /// TTL in the memcached convention: 0 never expires, values up to 30
    /// days are relative seconds, anything larger is absolute unix time.
    pub expiry: u32,
    pub flags: u32,
    pub data_type: u8,
    pub content: Vec<u8>,
    pub delta: u64,
    pub initial: u64,
    pub lock_time: u32,
    pub durability: Option<DurabilityRequirement>,
    pub lookup_specs: Vec<LookupInSpec>,
    pub mutate_specs: Vec<MutateInSpec>,
    pub sub_doc_flags: u8,
}

impl Operation {
    fn new(op_code: OpCode, key: impl Into<Vec<u8>>) -> Self {
        Operation {
            op_code,
            key: key.into(),
            cid: None,
            vbucket: 0,
            cas: 0,
            expiry: 0,
            flags: 0,
            data_type: 0,
            content: Vec::new(),
            delta: 0,
            initial: 0,
            lock_time: 0,
            durability: None,
            lookup_specs: Vec::new(),
            mutate_specs: Vec::new(),
            sub_doc_flags: 0,
        }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Operation::new(OpCode::Get, key)
    }

    pub fn get_replica(key: impl Into<Vec<u8>>) -> Self {
        Operation::new(OpCode::GetReplica, key)
    }

    pub fn get_and_touch(key: impl Into<Vec<u8>>, expiry: u32) -> Self {
        let mut op = Operation::new(OpCode::GetAndTouch, key);
        op.expiry = expiry;
        op
    }

    pub fn get_and_lock(key: impl Into<Vec<u8>>, lock_time: u32) -> Self {
        let mut op = Operation::new(OpCode::GetAndLock, key);
        op.lock_time = lock_time;
        op
    }

    pub fn touch(key: impl Into<Vec<u8>>, expiry: u32) -> Self {
        let mut op = Operation::new(OpCode::Touch, key);
        op.expiry = expiry;
        op
    }

    pub fn unlock(key: impl Into<Vec<u8>>, cas: u64) -> Self {
        let mut op = Operation::new(OpCode::Unlock, key);
        op.cas = cas;
        op
    }

    pub fn set(key: impl Into<Vec<u8>>, content: Vec<u8>, flags: u32, expiry: u32) -> Self {
        let mut op = Operation::new(OpCode::Set, key);
        op.content = content;
        op.flags = flags;
        op.expiry = expiry;
        op
    }

    pub fn add(key: impl Into<Vec<u8>>, content: Vec<u8>, flags: u32, expiry: u32) -> Self {
        let mut op = Operation::new(OpCode::Add, key);
        op.content = content;
        op.flags = flags;
        op.expiry = expiry;
        op
    }

    pub fn replace(key: impl Into<Vec<u8>>, content: Vec<u8>, flags: u32, expiry: u32) -> Self {
        let mut op = Operation::new(OpCode::Replace, key);
        op.content = content;
        op.flags = flags;
        op.expiry = expiry;
        op
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Operation::new(OpCode::Delete, key)
    }

    pub fn increment(key: impl Into<Vec<u8>>, delta: u64, initial: u64, expiry: u32) -> Self {
        let mut op = Operation::new(OpCode::Increment, key);
        op.delta = delta;
        op.initial = initial;
        op.expiry = expiry;
        op
    }

    pub fn decrement(key: impl Into<Vec<u8>>, delta: u64, initial: u64, expiry: u32) -> Self {
        let mut op = Operation::new(OpCode::Decrement, key);
        op.delta = delta;
        op.initial = initial;
        op.expiry = expiry;
        op
    }

    pub fn append(key: impl Into<Vec<u8>>, content: Vec<u8>) -> Self {
        let mut op = Operation::new(OpCode::Append, key);
        op.content = content;
        op
    }

    pub fn prepend(key: impl Into<Vec<u8>>, content: Vec<u8>) -> Self {
        let mut op = Operation::new(OpCode::Prepend, key);
        op.content = content;
        op
    }

    pub fn observe(key: impl Into<Vec<u8>>) -> Self {
        Operation::new(OpCode::Observe, key)
    }

    /// Resolve `scope.collection` to a collection id. The qualified name
    /// travels in the value, not the key.
    pub fn get_cid_by_name(qualified_name: &str) -> Self {
        let mut op = Operation::new(OpCode::GetCidByName, Vec::new());
        op.content = qualified_name.as_bytes().to_vec();
        op
    }

    pub fn lookup_in(key: impl Into<Vec<u8>>, specs: Vec<LookupInSpec>, doc_flags: u8) -> Self {
        let mut op = Operation::new(OpCode::SubDocMultiLookup, key);
        op.lookup_specs = specs;
        op.sub_doc_flags = doc_flags;
        op
    }

    pub fn mutate_in(
        key: impl Into<Vec<u8>>,
        specs: Vec<MutateInSpec>,
        doc_flags: u8,
        expiry: u32,
    ) -> Self {
        let mut op = Operation::new(OpCode::SubDocMultiMutation, key);
        op.mutate_specs = specs;
        op.sub_doc_flags = doc_flags;
        op.expiry = expiry;
        op
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_cid(mut self, cid: Option<u32>) -> Self {
        self.cid = cid;
        self
    }

    pub fn with_durability(mut self, durability: Option<DurabilityRequirement>) -> Self {
        self.durability = durability;
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.op_code.is_idempotent()
    }

    fn write_extras(&self, buf: &mut BytesMut) {
        match self.op_code {
            OpCode::Set | OpCode::Add | OpCode::Replace => {
                buf.put_u32(self.flags);
                buf.put_u32(self.expiry);
            }
            OpCode::Increment | OpCode::Decrement => {
                buf.put_u64(self.delta);
                buf.put_u64(self.initial);
                buf.put_u32(self.expiry);
            }
            OpCode::Touch | OpCode::GetAndTouch => {
                buf.put_u32(self.expiry);
            }
            OpCode::GetAndLock => {
                buf.put_u32(self.lock_time);
            }
            OpCode::SubDocMultiLookup => {
                if self.sub_doc_flags != 0 {
                    buf.put_u8(self.sub_doc_flags);
                }
            }
            OpCode::SubDocMultiMutation => {
                if self.expiry != 0 {
                    buf.put_u32(self.expiry);
                }
                if self.sub_doc_flags != 0 {
                    buf.put_u8(self.sub_doc_flags);
                }
            }
            _ => {}
        }
    }

    /// The key as it appears on the wire: collection-qualified by a
    /// uLEB128 cid prefix when the connection negotiated collections.
    fn write_key(&self, buf: &mut BytesMut, features: &ServerFeatures) {
        if self.key.is_empty() {
            return;
        }
        if features.collections {
            write_uleb128(buf, self.cid.unwrap_or(0));
        }
        buf.put_slice(&self.key);
    }

    fn write_body(&self, buf: &mut BytesMut, wire_key: &[u8]) -> Result<(), ProtocolError> {
        match self.op_code {
            OpCode::SubDocMultiLookup => subdoc::write_lookup_specs(&self.lookup_specs, buf),
            OpCode::SubDocMultiMutation => subdoc::write_mutate_specs(&self.mutate_specs, buf),
            OpCode::Observe => {
                // Observe carries its key inside the value: vbucket,
                // key length, then the wire key.
                buf.put_u16(self.vbucket);
                buf.put_u16(wire_key.len() as u16);
                buf.put_slice(wire_key);
                Ok(())
            }
            _ => {
                buf.put_slice(&self.content);
                Ok(())
            }
        }
    }

    fn write_framing_extras(&self, buf: &mut BytesMut) {
        let durability = match self.durability {
            Some(d) if self.op_code.is_mutation() => d,
            _ => return,
        };
        match durability.timeout {
            Some(timeout) => {
                buf.put_u8(FRAMING_DURABILITY_ID << 4 | 0x03);
                buf.put_u8(durability.level as u8);
                buf.put_u16(timeout.as_millis().min(u16::MAX as u128) as u16);
            }
            None => {
                buf.put_u8(FRAMING_DURABILITY_ID << 4 | 0x01);
                buf.put_u8(durability.level as u8);
            }
        }
    }

    /// Frame the operation with the connection-assigned opaque. Fails only
    /// on client-side conditions: oversized frames, too many specs.
    pub fn encode(&self, opaque: u32, features: &ServerFeatures) -> Result<Bytes, ProtocolError> {
        let mut framing = BytesMut::new();
        self.write_framing_extras(&mut framing);

        let mut extras = BytesMut::new();
        self.write_extras(&mut extras);

        let mut key = BytesMut::with_capacity(self.key.len() + uleb128_len(self.cid.unwrap_or(0)));
        self.write_key(&mut key, features);

        let observe_key;
        let (header_key, body_key): (&[u8], &[u8]) = if self.op_code == OpCode::Observe {
            observe_key = key.split().freeze();
            (&[], &observe_key[..])
        } else {
            (&key[..], &[])
        };

        let mut value = BytesMut::new();
        self.write_body(&mut value, body_key)?;

        let frame = RequestFrame {
            opcode: self.op_code.into(),
            vbucket: self.vbucket,
            data_type: self.data_type,
            opaque,
            cas: self.cas,
            framing_extras: &framing,
            extras: &extras,
            key: header_key,
            value: &value,
        };
        let mut buf = BytesMut::new();
        frame.write(&mut buf, features.max_body)?;
        Ok(buf.freeze())
    }
}
