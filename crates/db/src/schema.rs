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

//! Field and object-base definitions: the schema an object base enforces on its objects.

use crate::encode::{BinaryRead, BinaryWrite, DecodingError, EncodingError};
use crate::error::RejectReason;
use crate::fields::{FieldType, FieldValue, Value};
use crate::invid::{BaseId, FieldId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const NO_TARGET: i16 = -1;

/// The definition of one field within an object base.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: FieldId,
    pub name: String,
    pub field_type: FieldType,
    pub vector: bool,
    pub required: bool,
    /// Invid fields only: values delete-lock their targets while the field is being edited.
    pub asymmetric: bool,
    pub min_length: u16,
    pub max_length: u16,
    /// Upper bound on the number of elements of a vector field.
    pub max_array: u32,
    pub range: Option<(i32, i32)>,
    /// Name of the namespace values of this field must be unique within.
    pub namespace: Option<String>,
    /// Invid fields only: the base every target must belong to.
    pub target_base: Option<BaseId>,
}

impl FieldDef {
    pub fn new(id: FieldId, name: &str, field_type: FieldType) -> Self {
        Self {
            id,
            name: name.to_string(),
            field_type,
            vector: false,
            required: false,
            asymmetric: false,
            min_length: 0,
            max_length: u16::MAX,
            max_array: u32::MAX,
            range: None,
            namespace: None,
            target_base: None,
        }
    }

    #[must_use]
    pub fn vector(mut self, max_array: u32) -> Self {
        self.vector = true;
        self.max_array = max_array;
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn asymmetric(mut self) -> Self {
        self.asymmetric = true;
        self
    }

    #[must_use]
    pub fn length(mut self, min: u16, max: u16) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    #[must_use]
    pub fn range(mut self, min: i32, max: i32) -> Self {
        self.range = Some((min, max));
        self
    }

    #[must_use]
    pub fn unique_in(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    #[must_use]
    pub fn targets(mut self, base: BaseId) -> Self {
        self.target_base = Some(base);
        self
    }

    /// Check a proposed value against this definition's type and constraints. Namespace and
    /// link checks need transaction context and are done by the edit object.
    pub fn validate(&self, value: &FieldValue) -> Result<(), RejectReason> {
        match (self.vector, value) {
            (true, FieldValue::Scalar(_)) => return Err(RejectReason::ExpectedVector),
            (false, FieldValue::Vector(_)) => return Err(RejectReason::ExpectedScalar),
            (true, FieldValue::Vector(values)) if values.len() as u64 > self.max_array as u64 => {
                return Err(RejectReason::VectorTooLarge {
                    len: values.len(),
                    max: self.max_array,
                });
            }
            _ => {}
        }
        value
            .values()
            .iter()
            .try_for_each(|element| self.validate_element(element))
    }

    fn validate_element(&self, value: &Value) -> Result<(), RejectReason> {
        if value.field_type() != self.field_type {
            return Err(RejectReason::WrongType {
                expected: self.field_type,
                found: value.field_type(),
            });
        }
        match value {
            Value::String(s) | Value::Password(s) => check_encoded_len(s)?,
            Value::PermissionMatrix(matrix) => {
                matrix.keys().try_for_each(|key| check_encoded_len(key))?;
            }
            _ => {}
        }
        match value {
            Value::String(s) => {
                let len = s.chars().count();
                if len < self.min_length as usize {
                    return Err(RejectReason::TooShort {
                        len,
                        min: self.min_length,
                    });
                }
                if len > self.max_length as usize {
                    return Err(RejectReason::TooLong {
                        len,
                        max: self.max_length,
                    });
                }
            }
            Value::Numeric(n) => {
                if let Some((min, max)) = self.range
                    && !(min..=max).contains(n)
                {
                    return Err(RejectReason::OutOfRange {
                        value: *n,
                        min,
                        max,
                    });
                }
            }
            Value::Invid(target) => {
                if let Some(expected) = self.target_base
                    && target.type_id() != expected
                {
                    return Err(RejectReason::WrongTargetBase {
                        target: *target,
                        expected,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        out.write_i16(self.id)?;
        out.write_utf(&self.name)?;
        out.write_i16(self.field_type.code())?;
        out.write_bool(self.vector)?;
        out.write_bool(self.required)?;
        out.write_bool(self.asymmetric)?;
        out.write_u16(self.min_length)?;
        out.write_u16(self.max_length)?;
        out.write_i64(self.max_array as i64)?;
        match self.range {
            Some((min, max)) => {
                out.write_bool(true)?;
                out.write_i32(min)?;
                out.write_i32(max)?;
            }
            None => out.write_bool(false)?,
        }
        out.write_utf(self.namespace.as_deref().unwrap_or(""))?;
        out.write_i16(self.target_base.unwrap_or(NO_TARGET))
    }

    pub fn receive<R: Read + ?Sized>(input: &mut R) -> Result<Self, DecodingError> {
        let id = input.read_i16()?;
        let name = input.read_utf()?;
        let field_type = FieldType::from_code(input.read_i16()?)?;
        let vector = input.read_bool()?;
        let required = input.read_bool()?;
        let asymmetric = input.read_bool()?;
        let min_length = input.read_u16()?;
        let max_length = input.read_u16()?;
        let max_array = input.read_i64()?;
        let max_array = u32::try_from(max_array).map_err(|_| {
            DecodingError::CouldNotDecode(format!("field {name}: bad vector limit {max_array}"))
        })?;
        let range = if input.read_bool()? {
            Some((input.read_i32()?, input.read_i32()?))
        } else {
            None
        };
        let namespace = Some(input.read_utf()?).filter(|ns| !ns.is_empty());
        let target_base = Some(input.read_i16()?).filter(|t| *t != NO_TARGET);
        Ok(Self {
            id,
            name,
            field_type,
            vector,
            required,
            asymmetric,
            min_length,
            max_length,
            max_array,
            range,
            namespace,
            target_base,
        })
    }
}

/// The definition of an object base: its type code, name and field dictionary.
#[derive(Clone, Debug, PartialEq)]
pub struct BaseDef {
    pub type_id: BaseId,
    pub name: String,
    fields: IndexMap<FieldId, FieldDef>,
}

impl BaseDef {
    pub fn new(type_id: BaseId, name: &str) -> Self {
        Self {
            type_id,
            name: name.to_string(),
            fields: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, def: FieldDef) -> Self {
        self.fields.insert(def.id, def);
        self
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldDef> {
        self.fields.get(&id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.fields.values().find(|f| f.name == name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        out.write_utf(&self.name)?;
        out.write_i16(self.type_id)?;
        out.write_count16(self.fields.len())?;
        for def in self.fields.values() {
            def.emit(out)?;
        }
        Ok(())
    }

    pub fn receive<R: Read + ?Sized>(input: &mut R) -> Result<Self, DecodingError> {
        let name = input.read_utf()?;
        let type_id = input.read_i16()?;
        let count = input.read_u16()?;
        let mut fields = IndexMap::with_capacity(count as usize);
        for _ in 0..count {
            let def = FieldDef::receive(input)?;
            if fields.insert(def.id, def).is_some() {
                return Err(DecodingError::CouldNotDecode(format!(
                    "base {name}: duplicate field definition"
                )));
            }
        }
        Ok(Self {
            type_id,
            name,
            fields,
        })
    }
}

/// Strings are stored with a `u16` byte-length prefix.
fn check_encoded_len(s: &str) -> Result<(), RejectReason> {
    if s.len() > u16::MAX as usize {
        return Err(RejectReason::EncodedTooLong {
            bytes: s.len(),
            max: u16::MAX,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invid::Invid;
    use test_case::test_case;

    fn user_name() -> FieldDef {
        FieldDef::new(1, "name", FieldType::String).length(2, 8)
    }

    #[test_case("al", true ; "at minimum")]
    #[test_case("a", false ; "below minimum")]
    #[test_case("abcdefgh", true ; "at maximum")]
    #[test_case("abcdefghi", false ; "above maximum")]
    fn test_string_length(name: &str, ok: bool) {
        let value = FieldValue::Scalar(Value::String(name.into()));
        assert_eq!(user_name().validate(&value).is_ok(), ok);
    }

    #[test_case(FieldType::String, Value::String("€".repeat(30000)), 90000 ; "multibyte string")]
    #[test_case(FieldType::Password, Value::Password("x".repeat(70000)), 70000 ; "password")]
    fn test_encoded_length_limit(field_type: FieldType, value: Value, bytes: usize) {
        let def = FieldDef::new(3, "secret", field_type);
        assert_eq!(
            def.validate(&FieldValue::Scalar(value)).err(),
            Some(RejectReason::EncodedTooLong {
                bytes,
                max: u16::MAX
            })
        );
    }

    #[test]
    fn test_longest_encodable_string_accepted() {
        let def = FieldDef::new(3, "note", FieldType::String);
        let value = FieldValue::Scalar(Value::String("x".repeat(u16::MAX as usize)));
        assert!(def.validate(&value).is_ok());
        let mut buf = Vec::new();
        value.emit(&mut buf).unwrap();
    }

    #[test_case(FieldValue::Scalar(Value::Numeric(5)), None ; "in range")]
    #[test_case(FieldValue::Scalar(Value::Numeric(11)),
        Some(RejectReason::OutOfRange { value: 11, min: 0, max: 10 }) ; "out of range")]
    #[test_case(FieldValue::Vector(vec![Value::Numeric(1)]),
        Some(RejectReason::ExpectedScalar) ; "vector into scalar")]
    #[test_case(FieldValue::Scalar(Value::String("5".into())),
        Some(RejectReason::WrongType { expected: FieldType::Numeric, found: FieldType::String })
        ; "wrong type")]
    fn test_numeric_validation(value: FieldValue, expected: Option<RejectReason>) {
        let def = FieldDef::new(2, "uid", FieldType::Numeric).range(0, 10);
        assert_eq!(def.validate(&value).err(), expected);
    }

    #[test]
    fn test_vector_limit_and_target_base() {
        let def = FieldDef::new(3, "members", FieldType::Invid)
            .vector(2)
            .targets(3);
        let ok = FieldValue::Vector(vec![Value::Invid(Invid::new(3, 1))]);
        assert!(def.validate(&ok).is_ok());

        let too_many = FieldValue::Vector(vec![Value::Invid(Invid::new(3, 1)); 3]);
        assert_eq!(
            def.validate(&too_many),
            Err(RejectReason::VectorTooLarge { len: 3, max: 2 })
        );

        let wrong = FieldValue::Vector(vec![Value::Invid(Invid::new(4, 1))]);
        assert!(matches!(
            def.validate(&wrong),
            Err(RejectReason::WrongTargetBase { expected: 3, .. })
        ));
    }

    #[test]
    fn test_base_def_encoding() {
        let base = BaseDef::new(3, "user")
            .with_field(user_name().unique_in("username").required())
            .with_field(FieldDef::new(2, "groups", FieldType::Invid).vector(64).targets(4).asymmetric());
        let mut buf = Vec::new();
        base.emit(&mut buf).unwrap();
        let decoded = BaseDef::receive(&mut std::io::Cursor::new(buf)).unwrap();
        pretty_assertions::assert_eq!(decoded, base);
    }
}
