// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Typed field values held by objects, their binary encoding, and the keys they contribute to
//! namespaces.

use crate::encode::{BinaryRead, BinaryWrite, DecodingError, EncodingError};
use crate::invid::Invid;
use crate::perm::PermEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use strum::{Display as StrumDisplay, FromRepr};

/// The closed catalogue of field types. The discriminants are the on-disk type codes.
#[repr(i16)]
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, FromRepr, StrumDisplay, Serialize, Deserialize,
)]
pub enum FieldType {
    Boolean = 0,
    Numeric = 1,
    Date = 2,
    String = 3,
    Invid = 4,
    PermissionMatrix = 5,
    Password = 6,
    Ip = 7,
    Float = 8,
}

impl FieldType {
    pub fn code(&self) -> i16 {
        *self as i16
    }

    pub fn from_code(code: i16) -> Result<Self, DecodingError> {
        Self::from_repr(code).ok_or(DecodingError::InvalidFieldType(code))
    }

    /// Whether values of this type can be bound to a namespace.
    pub fn is_namespace_capable(&self) -> bool {
        !matches!(self, FieldType::PermissionMatrix | FieldType::Password)
    }
}

/// A single (scalar) value of one of the catalogue types.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Boolean(bool),
    Numeric(i32),
    Float(f64),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    String(String),
    Invid(Invid),
    PermissionMatrix(BTreeMap<String, PermEntry>),
    /// Already-hashed password text; the store never sees plaintext.
    Password(String),
    Ip(IpAddr),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Boolean(_) => FieldType::Boolean,
            Value::Numeric(_) => FieldType::Numeric,
            Value::Float(_) => FieldType::Float,
            Value::Date(_) => FieldType::Date,
            Value::String(_) => FieldType::String,
            Value::Invid(_) => FieldType::Invid,
            Value::PermissionMatrix(_) => FieldType::PermissionMatrix,
            Value::Password(_) => FieldType::Password,
            Value::Ip(_) => FieldType::Ip,
        }
    }

    pub fn as_invid(&self) -> Option<Invid> {
        match self {
            Value::Invid(invid) => Some(*invid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The key this value occupies in a namespace, if its type can be bound to one.
    pub fn name_key(&self, case_insensitive: bool) -> Option<NameKey> {
        let key = match self {
            Value::Boolean(b) => NameKey::Boolean(*b),
            Value::Numeric(n) => NameKey::Numeric(*n),
            Value::Float(f) => NameKey::Float(f.to_bits()),
            Value::Date(d) => NameKey::Date(*d),
            Value::String(s) if case_insensitive => NameKey::String(s.to_lowercase()),
            Value::String(s) => NameKey::String(s.clone()),
            Value::Invid(i) => NameKey::Invid(*i),
            Value::Ip(ip) => NameKey::Ip(*ip),
            Value::PermissionMatrix(_) | Value::Password(_) => return None,
        };
        Some(key)
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        match self {
            Value::Boolean(b) => out.write_bool(*b),
            Value::Numeric(n) => out.write_i32(*n),
            Value::Float(f) => out.write_f64(*f),
            Value::Date(d) => out.write_i64(*d),
            Value::String(s) | Value::Password(s) => out.write_utf(s),
            Value::Invid(i) => i.emit(out),
            Value::PermissionMatrix(matrix) => {
                out.write_count16(matrix.len())?;
                for (key, entry) in matrix {
                    out.write_utf(key)?;
                    entry.emit(out)?;
                }
                Ok(())
            }
            Value::Ip(IpAddr::V4(v4)) => {
                out.write_u8(4)?;
                out.write_all(&v4.octets())?;
                Ok(())
            }
            Value::Ip(IpAddr::V6(v6)) => {
                out.write_u8(16)?;
                out.write_all(&v6.octets())?;
                Ok(())
            }
        }
    }

    pub fn receive<R: Read + ?Sized>(
        field_type: FieldType,
        input: &mut R,
    ) -> Result<Self, DecodingError> {
        let value = match field_type {
            FieldType::Boolean => Value::Boolean(input.read_bool()?),
            FieldType::Numeric => Value::Numeric(input.read_i32()?),
            FieldType::Float => Value::Float(input.read_f64()?),
            FieldType::Date => Value::Date(input.read_i64()?),
            FieldType::String => Value::String(input.read_utf()?),
            FieldType::Password => Value::Password(input.read_utf()?),
            FieldType::Invid => Value::Invid(Invid::receive(input)?),
            FieldType::PermissionMatrix => {
                let count = input.read_u16()?;
                let mut matrix = BTreeMap::new();
                for _ in 0..count {
                    let key = input.read_utf()?;
                    let entry = PermEntry::receive(input)?;
                    matrix.insert(key, entry);
                }
                Value::PermissionMatrix(matrix)
            }
            FieldType::Ip => match input.read_u8()? {
                4 => {
                    let mut octets = [0u8; 4];
                    input.read_exact(&mut octets)?;
                    Value::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
                }
                16 => {
                    let mut octets = [0u8; 16];
                    input.read_exact(&mut octets)?;
                    Value::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
                }
                other => return Err(DecodingError::InvalidIpLength(other)),
            },
        };
        Ok(value)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Numeric(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Date(d) => write!(f, "@{d}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Invid(i) => write!(f, "<{i}>"),
            Value::PermissionMatrix(m) => write!(f, "<matrix of {} entries>", m.len()),
            Value::Password(_) => write!(f, "<password>"),
            Value::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// The contents of one field slot in an object: either a single value, or an ordered vector of
/// values of the same type.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Scalar(Value),
    Vector(Vec<Value>),
}

impl FieldValue {
    pub fn is_vector(&self) -> bool {
        matches!(self, FieldValue::Vector(_))
    }

    pub fn values(&self) -> &[Value] {
        match self {
            FieldValue::Scalar(v) => std::slice::from_ref(v),
            FieldValue::Vector(vs) => vs,
        }
    }

    /// Every namespace key this field contributes, in element order.
    pub fn name_keys(&self, case_insensitive: bool) -> Vec<NameKey> {
        self.values()
            .iter()
            .filter_map(|v| v.name_key(case_insensitive))
            .collect()
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        match self {
            FieldValue::Scalar(v) => v.emit(out),
            FieldValue::Vector(values) => {
                out.write_count32(values.len())?;
                for v in values {
                    v.emit(out)?;
                }
                Ok(())
            }
        }
    }

    pub fn receive<R: Read + ?Sized>(
        field_type: FieldType,
        vector: bool,
        input: &mut R,
    ) -> Result<Self, DecodingError> {
        if !vector {
            return Ok(FieldValue::Scalar(Value::receive(field_type, input)?));
        }
        let count = input.read_count32()?;
        let mut values = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            values.push(Value::receive(field_type, input)?);
        }
        Ok(FieldValue::Vector(values))
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Scalar(value)
    }
}

/// A hashable projection of a value, used as the key of a namespace.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum NameKey {
    Boolean(bool),
    Numeric(i32),
    Float(u64),
    Date(i64),
    String(String),
    Invid(Invid),
    Ip(IpAddr),
}

impl Display for NameKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NameKey::Boolean(b) => write!(f, "{b}"),
            NameKey::Numeric(n) => write!(f, "{n}"),
            NameKey::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            NameKey::Date(d) => write!(f, "@{d}"),
            NameKey::String(s) => write!(f, "{s:?}"),
            NameKey::Invid(i) => write!(f, "<{i}>"),
            NameKey::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reencode(value: &FieldValue, field_type: FieldType) -> FieldValue {
        let mut buf = Vec::new();
        value.emit(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = FieldValue::receive(field_type, value.is_vector(), &mut cursor).unwrap();
        assert_eq!(cursor.position() as usize, cursor.get_ref().len());
        decoded
    }

    #[test]
    fn test_permission_matrix_survives_encoding() {
        let mut matrix = BTreeMap::new();
        matrix.insert("3".to_string(), PermEntry::FULL);
        matrix.insert("3:4".to_string(), PermEntry::new(true, false, false, false));
        let value = FieldValue::Scalar(Value::PermissionMatrix(matrix));
        assert_eq!(reencode(&value, FieldType::PermissionMatrix), value);
    }

    #[test]
    fn test_ip_vector_survives_encoding() {
        let value = FieldValue::Vector(vec![
            Value::Ip("10.0.0.1".parse().unwrap()),
            Value::Ip("fe80::1".parse().unwrap()),
        ]);
        assert_eq!(reencode(&value, FieldType::Ip), value);
    }

    #[test]
    fn test_vector_is_count_prefixed() {
        let value = FieldValue::Vector(vec![Value::Numeric(7), Value::Numeric(9)]);
        let mut buf = Vec::new();
        value.emit(&mut buf).unwrap();
        assert_eq!(&buf[0..4], &[0, 0, 0, 2]);
        assert_eq!(buf.len(), 4 + 4 + 4);
    }

    #[test]
    fn test_case_insensitive_keys_fold() {
        let v = Value::String("Alice".into());
        assert_eq!(v.name_key(true), Some(NameKey::String("alice".into())));
        assert_eq!(v.name_key(false), Some(NameKey::String("Alice".into())));
        assert_eq!(Value::Password("x".into()).name_key(false), None);
    }

    #[test]
    fn test_unknown_type_code() {
        assert!(matches!(
            FieldType::from_code(42),
            Err(DecodingError::InvalidFieldType(42))
        ));
        assert_eq!(FieldType::from_code(8).unwrap(), FieldType::Float);
    }
}
