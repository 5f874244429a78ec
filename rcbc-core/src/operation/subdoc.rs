//! Sub-document composition: path-addressed lookups and mutations packed
//! into a single multi-spec request, with per-path results on the way back.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{ProtocolError, Status};

/// A multi-spec request carries at most this many paths; callers wanting
/// more fall back to a whole-document fetch.
pub const MAX_SPECS: usize = 16;

/// Per-spec opcodes of the sub-document extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubDocOpCode {
    Get = 0xc5,
    Exists = 0xc6,
    DictAdd = 0xc7,
    DictUpsert = 0xc8,
    Delete = 0xc9,
    Replace = 0xca,
    ArrayPushLast = 0xcb,
    ArrayPushFirst = 0xcc,
    ArrayInsert = 0xcd,
    ArrayAddUnique = 0xce,
    Counter = 0xcf,
    GetCount = 0xd2,
}

/// Per-path flags.
pub mod path_flags {
    pub const NONE: u8 = 0x00;
    /// Create intermediate paths as needed.
    pub const CREATE_PATH: u8 = 0x01;
    /// The path addresses an extended attribute rather than the document.
    pub const XATTR: u8 = 0x04;
}

/// Whole-document flags carried in the request extras.
pub mod doc_flags {
    pub const NONE: u8 = 0x00;
    /// Create the document if it does not exist.
    pub const MKDOC: u8 = 0x01;
    /// Fail if the document already exists.
    pub const ADD: u8 = 0x02;
    pub const ACCESS_DELETED: u8 = 0x04;
}

/// One path in a lookup-in request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInSpec {
    pub op: SubDocOpCode,
    pub flags: u8,
    pub path: String,
}

impl LookupInSpec {
    pub fn get(path: impl Into<String>) -> Self {
        LookupInSpec {
            op: SubDocOpCode::Get,
            flags: path_flags::NONE,
            path: path.into(),
        }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        LookupInSpec {
            op: SubDocOpCode::Exists,
            flags: path_flags::NONE,
            path: path.into(),
        }
    }

    pub fn count(path: impl Into<String>) -> Self {
        LookupInSpec {
            op: SubDocOpCode::GetCount,
            flags: path_flags::NONE,
            path: path.into(),
        }
    }

    /// Address an extended attribute. Xattr specs must precede document
    /// specs in a multi-spec request; the dispatcher keeps that order.
    pub fn xattr(mut self) -> Self {
        self.flags |= path_flags::XATTR;
        self
    }
}

/// One path in a mutate-in request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInSpec {
    pub op: SubDocOpCode,
    pub flags: u8,
    pub path: String,
    pub value: Vec<u8>,
}

impl MutateInSpec {
    pub fn upsert(path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInSpec {
            op: SubDocOpCode::DictUpsert,
            flags: path_flags::NONE,
            path: path.into(),
            value,
        }
    }

    pub fn insert(path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInSpec {
            op: SubDocOpCode::DictAdd,
            flags: path_flags::NONE,
            path: path.into(),
            value,
        }
    }

    pub fn replace(path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInSpec {
            op: SubDocOpCode::Replace,
            flags: path_flags::NONE,
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        MutateInSpec {
            op: SubDocOpCode::Delete,
            flags: path_flags::NONE,
            path: path.into(),
            value: Vec::new(),
        }
    }

    pub fn array_append(path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInSpec {
            op: SubDocOpCode::ArrayPushLast,
            flags: path_flags::NONE,
            path: path.into(),
            value,
        }
    }

    pub fn array_prepend(path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInSpec {
            op: SubDocOpCode::ArrayPushFirst,
            flags: path_flags::NONE,
            path: path.into(),
            value,
        }
    }

    pub fn array_add_unique(path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInSpec {
            op: SubDocOpCode::ArrayAddUnique,
            flags: path_flags::NONE,
            path: path.into(),
            value,
        }
    }

    pub fn counter(path: impl Into<String>, delta: i64) -> Self {
        MutateInSpec {
            op: SubDocOpCode::Counter,
            flags: path_flags::NONE,
            path: path.into(),
            value: delta.to_string().into_bytes(),
        }
    }

    pub fn create_path(mut self) -> Self {
        self.flags |= path_flags::CREATE_PATH;
        self
    }

    pub fn xattr(mut self) -> Self {
        self.flags |= path_flags::XATTR;
        self
    }
}

/// Serialise lookup specs in order: (op, flags, path-length, path) each.
pub fn write_lookup_specs(specs: &[LookupInSpec], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if specs.len() > MAX_SPECS {
        return Err(ProtocolError::TooManySpecs(specs.len()));
    }
    for spec in specs {
        buf.put_u8(spec.op as u8);
        buf.put_u8(spec.flags);
        buf.put_u16(spec.path.len() as u16);
        buf.put_slice(spec.path.as_bytes());
    }
    Ok(())
}

/// Serialise mutation specs in order: (op, flags, path-length,
/// value-length, path, value) each.
pub fn write_mutate_specs(specs: &[MutateInSpec], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if specs.len() > MAX_SPECS {
        return Err(ProtocolError::TooManySpecs(specs.len()));
    }
    for spec in specs {
        buf.put_u8(spec.op as u8);
        buf.put_u8(spec.flags);
        buf.put_u16(spec.path.len() as u16);
        buf.put_u32(spec.value.len() as u32);
        buf.put_slice(spec.path.as_bytes());
        buf.put_slice(&spec.value);
    }
    Ok(())
}

/// One path's outcome in a multi-spec response. Partial failure lives
/// here, not in the envelope status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDocField {
    pub status: Status,
    pub value: Bytes,
}

impl SubDocField {
    pub fn exists(&self) -> bool {
        self.status.is_success()
    }
}

/// Parse a lookup-in response body: a parallel sequence of
/// (status, length, payload) triples, one per request spec.
pub fn parse_lookup_fields(value: &Bytes, count: usize) -> Result<Vec<SubDocField>, ProtocolError> {
    let mut rest = value.clone();
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        if rest.len() < 6 {
            return Err(ProtocolError::TruncatedField("sub-doc lookup result"));
        }
        let status = Status::from(rest.get_u16());
        let len = rest.get_u32() as usize;
        if rest.len() < len {
            return Err(ProtocolError::TruncatedField("sub-doc lookup payload"));
        }
        let value = rest.split_to(len);
        fields.push(SubDocField { status, value });
    }
    Ok(fields)
}

/// Parse a mutate-in response body. On success the body holds entries only
/// for specs that produce a value (counters); on a multi-path failure it
/// holds the first failing spec's index and status. Specs without an entry
/// report envelope success and an empty payload.
pub fn parse_mutate_fields(value: &Bytes, count: usize) -> Result<Vec<SubDocField>, ProtocolError> {
    let mut fields = vec![
        SubDocField {
            status: Status::Success,
            value: Bytes::new(),
        };
        count
    ];
    let mut rest = value.clone();
    while rest.remaining() >= 3 {
        let index = rest.get_u8() as usize;
        let status = Status::from(rest.get_u16());
        let value = if status.is_success() {
            if rest.remaining() < 4 {
                return Err(ProtocolError::TruncatedField("sub-doc mutation length"));
            }
            let len = rest.get_u32() as usize;
            if rest.len() < len {
                return Err(ProtocolError::TruncatedField("sub-doc mutation payload"));
            }
            rest.split_to(len)
        } else {
            Bytes::new()
        };
        if index >= count {
            return Err(ProtocolError::TruncatedField("sub-doc mutation index"));
        }
        fields[index] = SubDocField { status, value };
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_spec_wire_layout() {
        let specs = vec![
            LookupInSpec::get("name"),
            LookupInSpec::get("$document.exptime").xattr(),
        ];
        let mut buf = BytesMut::new();
        write_lookup_specs(&specs, &mut buf).unwrap();

        let mut expect = vec![0xc5, 0x00, 0x00, 0x04];
        expect.extend_from_slice(b"name");
        expect.extend_from_slice(&[0xc5, 0x04, 0x00, 0x11]);
        expect.extend_from_slice(b"$document.exptime");
        assert_eq!(expect, buf.to_vec());
    }

    #[test]
    fn test_mutate_spec_wire_layout() {
        let specs = vec![MutateInSpec::upsert("v", b"1".to_vec())];
        let mut buf = BytesMut::new();
        write_mutate_specs(&specs, &mut buf).unwrap();
        assert_eq!(
            vec![0xc8, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'v', b'1'],
            buf.to_vec()
        );
    }

    #[test]
    fn test_spec_cap_enforced() {
        let specs: Vec<_> = (0..17).map(|i| LookupInSpec::get(format!("p{}", i))).collect();
        let mut buf = BytesMut::new();
        assert_eq!(
            Err(ProtocolError::TooManySpecs(17)),
            write_lookup_specs(&specs, &mut buf)
        );
    }

    #[test]
    fn test_parse_lookup_fields_partial_failure() {
        let mut body = BytesMut::new();
        body.put_u16(0x0000);
        body.put_u32(2);
        body.put_slice(b"42");
        body.put_u16(0x00c0); // path not found
        body.put_u32(0);
        let fields = parse_lookup_fields(&body.freeze(), 2).unwrap();
        assert_eq!(Status::Success, fields[0].status);
        assert_eq!(&b"42"[..], &fields[0].value[..]);
        assert_eq!(Status::SubDocPathNotFound, fields[1].status);
        assert!(!fields[1].exists());
    }

    #[test]
    fn test_parse_lookup_fields_truncated() {
        let body = Bytes::from_static(&[0x00, 0x00, 0x00]);
        assert_eq!(
            Err(ProtocolError::TruncatedField("sub-doc lookup result")),
            parse_lookup_fields(&body, 1)
        );
    }

    #[test]
    fn test_parse_mutate_fields_counter_value() {
        let mut body = BytesMut::new();
        body.put_u8(1);
        body.put_u16(0x0000);
        body.put_u32(1);
        body.put_slice(b"5");
        let fields = parse_mutate_fields(&body.freeze(), 2).unwrap();
        assert_eq!(Status::Success, fields[0].status);
        assert!(fields[0].value.is_empty());
        assert_eq!(&b"5"[..], &fields[1].value[..]);
    }

    #[test]
    fn test_parse_mutate_fields_failure_entry() {
        let mut body = BytesMut::new();
        body.put_u8(0);
        body.put_u16(0x00c1); // path mismatch
        let fields = parse_mutate_fields(&body.freeze(), 1).unwrap();
        assert_eq!(Status::SubDocPathMismatch, fields[0].status);
    }
}
