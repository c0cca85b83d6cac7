//! Typed datum values and their byte codec.
//!
//! Payloads are opaque bytes on the wire; typing lives in the data store.
//! Each type encodes to a length-prefixed byte string it decodes itself.

use crate::vint;
use crate::{DatumId, Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The eight core datum types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Float,
    String,
    Blob,
    Ref,
    Container,
    Multiset,
    Struct,
}

impl DataType {
    fn tag(self) -> u8 {
        match self {
            DataType::Integer => 0,
            DataType::Float => 1,
            DataType::String => 2,
            DataType::Blob => 3,
            DataType::Ref => 4,
            DataType::Container => 5,
            DataType::Multiset => 6,
            DataType::Struct => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<DataType> {
        Ok(match tag {
            0 => DataType::Integer,
            1 => DataType::Float,
            2 => DataType::String,
            3 => DataType::Blob,
            4 => DataType::Ref,
            5 => DataType::Container,
            6 => DataType::Multiset,
            7 => DataType::Struct,
            _ => return Err(Error::Corrupted),
        })
    }
}

/// Value is a decoded datum: the tagged union over the core types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Bytes),
    /// A reference to another datum.
    Ref(DatumId),
    /// Subscript bytes to member datum id.
    Container(BTreeMap<Vec<u8>, DatumId>),
    /// An ordered sequence of typed values.
    Multiset(Vec<Value>),
    /// Named, typed fields.
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Integer(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::String(_) => DataType::String,
            Value::Blob(_) => DataType::Blob,
            Value::Ref(_) => DataType::Ref,
            Value::Container(_) => DataType::Container,
            Value::Multiset(_) => DataType::Multiset,
            Value::Struct(_) => DataType::Struct,
        }
    }

    /// Encode to the wire form for this value's type.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out.into()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut vbuf = [0u8; vint::MAX_BYTES];
        match self {
            Value::Integer(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Blob(b) => out.extend_from_slice(b),
            Value::Ref(id) => out.extend_from_slice(&id.to_le_bytes()),
            Value::Container(members) => {
                let n = vint::encode(members.len() as i64, &mut vbuf);
                out.extend_from_slice(&vbuf[..n]);
                for (subscript, id) in members {
                    let n = vint::encode(subscript.len() as i64, &mut vbuf);
                    out.extend_from_slice(&vbuf[..n]);
                    out.extend_from_slice(subscript);
                    out.extend_from_slice(&id.to_le_bytes());
                }
            }
            Value::Multiset(elems) => {
                let n = vint::encode(elems.len() as i64, &mut vbuf);
                out.extend_from_slice(&vbuf[..n]);
                for elem in elems {
                    out.push(elem.data_type().tag());
                    let body = elem.encode();
                    let n = vint::encode(body.len() as i64, &mut vbuf);
                    out.extend_from_slice(&vbuf[..n]);
                    out.extend_from_slice(&body);
                }
            }
            Value::Struct(fields) => {
                let n = vint::encode(fields.len() as i64, &mut vbuf);
                out.extend_from_slice(&vbuf[..n]);
                for (name, field) in fields {
                    let n = vint::encode(name.len() as i64, &mut vbuf);
                    out.extend_from_slice(&vbuf[..n]);
                    out.extend_from_slice(name.as_bytes());
                    out.push(field.data_type().tag());
                    let body = field.encode();
                    let n = vint::encode(body.len() as i64, &mut vbuf);
                    out.extend_from_slice(&vbuf[..n]);
                    out.extend_from_slice(&body);
                }
            }
        }
    }

    /// Decode the wire form of `data_type`.
    pub fn decode(data_type: DataType, bytes: &[u8]) -> Result<Value> {
        let mut r = Cursor { buf: bytes, at: 0 };
        let value = r.value(data_type)?;
        if r.at != bytes.len() {
            return Err(Error::Corrupted);
        }
        Ok(value)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.at < n {
            return Err(Error::Corrupted);
        }
        let s = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(s)
    }

    fn vint(&mut self) -> Result<i64> {
        let (v, n) = vint::decode(&self.buf[self.at..]).map_err(|_| Error::Corrupted)?;
        self.at += n;
        Ok(v)
    }

    fn len(&mut self) -> Result<usize> {
        let v = self.vint()?;
        if v < 0 || v as usize > self.buf.len() - self.at {
            return Err(Error::Corrupted);
        }
        Ok(v as usize)
    }

    fn count(&mut self) -> Result<usize> {
        let v = self.vint()?;
        // Each entry takes at least one byte.
        if v < 0 || v as usize > self.buf.len() - self.at {
            return Err(Error::Corrupted);
        }
        Ok(v as usize)
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn value(&mut self, data_type: DataType) -> Result<Value> {
        Ok(match data_type {
            DataType::Integer => {
                let rest = self.take(self.buf.len() - self.at)?;
                if rest.len() != 8 {
                    return Err(Error::Corrupted);
                }
                Value::Integer(i64::from_le_bytes(rest.try_into().unwrap()))
            }
            DataType::Float => {
                let rest = self.take(self.buf.len() - self.at)?;
                if rest.len() != 8 {
                    return Err(Error::Corrupted);
                }
                Value::Float(f64::from_le_bytes(rest.try_into().unwrap()))
            }
            DataType::String => {
                let rest = self.take(self.buf.len() - self.at)?;
                Value::String(
                    std::str::from_utf8(rest)
                        .map_err(|_| Error::Corrupted)?
                        .to_owned(),
                )
            }
            DataType::Blob => {
                let rest = self.take(self.buf.len() - self.at)?;
                Value::Blob(Bytes::copy_from_slice(rest))
            }
            DataType::Ref => {
                let rest = self.take(self.buf.len() - self.at)?;
                if rest.len() != 8 {
                    return Err(Error::Corrupted);
                }
                Value::Ref(i64::from_le_bytes(rest.try_into().unwrap()))
            }
            DataType::Container => {
                let count = self.count()?;
                let mut members = BTreeMap::new();
                for _ in 0..count {
                    let sub_len = self.len()?;
                    let subscript = self.take(sub_len)?.to_vec();
                    let id = self.i64()?;
                    members.insert(subscript, id);
                }
                Value::Container(members)
            }
            DataType::Multiset => {
                let count = self.count()?;
                let mut elems = Vec::with_capacity(count);
                for _ in 0..count {
                    let tag = self.take(1)?[0];
                    let elem_type = DataType::from_tag(tag)?;
                    let body_len = self.len()?;
                    let body = self.take(body_len)?;
                    elems.push(Value::decode(elem_type, body)?);
                }
                Value::Multiset(elems)
            }
            DataType::Struct => {
                let count = self.count()?;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let name_len = self.len()?;
                    let name = std::str::from_utf8(self.take(name_len)?)
                        .map_err(|_| Error::Corrupted)?
                        .to_owned();
                    let tag = self.take(1)?[0];
                    let field_type = DataType::from_tag(tag)?;
                    let body_len = self.len()?;
                    let body = self.take(body_len)?;
                    fields.push((name, Value::decode(field_type, body)?));
                }
                Value::Struct(fields)
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(v: Value) {
        let bytes = v.encode();
        let got = Value::decode(v.data_type(), &bytes).unwrap();
        assert_eq!(v, got);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(Value::Integer(42));
        round_trip(Value::Integer(i64::MIN));
        round_trip(Value::Float(3.25));
        round_trip(Value::String("hello".to_owned()));
        round_trip(Value::String(String::new()));
        round_trip(Value::Blob(Bytes::from_static(b"\x00\xff\x7f")));
        round_trip(Value::Ref(-17));
    }

    #[test]
    fn aggregates_round_trip() {
        let mut members = BTreeMap::new();
        members.insert(b"alpha".to_vec(), 11);
        members.insert(b"".to_vec(), 12);
        round_trip(Value::Container(members));

        round_trip(Value::Multiset(vec![
            Value::Integer(1),
            Value::String("two".to_owned()),
            Value::Multiset(vec![Value::Float(3.0)]),
        ]));

        round_trip(Value::Struct(vec![
            ("x".to_owned(), Value::Integer(7)),
            ("y".to_owned(), Value::Blob(Bytes::from_static(b"zz"))),
        ]));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Value::decode(DataType::Integer, b"short").is_err());
        assert!(Value::decode(DataType::String, b"\xff\xfe").is_err());
        // Container count claiming more entries than bytes remain.
        assert!(Value::decode(DataType::Container, &[0x14]).is_err());
        // Trailing garbage after a complete value.
        let mut bytes = Value::Integer(1).encode().to_vec();
        bytes.push(0);
        assert!(Value::decode(DataType::Integer, &bytes).is_err());
    }
}
