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

use crate::encode::{BinaryRead, BinaryWrite, DecodingError, EncodingError};
use crate::fields::FieldValue;
use crate::invid::{BaseId, FieldId, Invid};
use crate::schema::BaseDef;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};

/// Identifies a transaction for the lifetime of the store process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TxId(pub u64);

impl Display for TxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Identifies a logged-in session. Used as the key for lock and deletion-lock attribution.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId(pub u64);

impl SessionId {
    /// The store's own internal session, used for dumps and schema work.
    pub const SYSTEM: SessionId = SessionId(0);
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// The transaction (and its session) holding an object checked out.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EditHandle {
    pub tx: TxId,
    pub session: SessionId,
}

/// Checkout bookkeeping kept beside each committed object in its base.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CheckoutState {
    Committed,
    CheckedOutBy(EditHandle),
    PendingDeletion(EditHandle),
}

impl CheckoutState {
    pub fn holder(&self) -> Option<EditHandle> {
        match self {
            CheckoutState::Committed => None,
            CheckoutState::CheckedOutBy(h) | CheckoutState::PendingDeletion(h) => Some(*h),
        }
    }
}

/// An immutable, committed object. Edits happen on a `DBEditObject` copy and replace the whole
/// object at commit.
#[derive(Clone, Debug, PartialEq)]
pub struct DBObject {
    invid: Invid,
    fields: BTreeMap<FieldId, FieldValue>,
}

impl DBObject {
    pub fn new(invid: Invid, fields: BTreeMap<FieldId, FieldValue>) -> Self {
        Self { invid, fields }
    }

    pub fn invid(&self) -> Invid {
        self.invid
    }

    pub fn id(&self) -> i32 {
        self.invid.num()
    }

    pub fn type_id(&self) -> BaseId {
        self.invid.type_id()
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldValue> {
        self.fields.get(&id)
    }

    pub fn fields(&self) -> &BTreeMap<FieldId, FieldValue> {
        &self.fields
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        out.write_i32(self.invid.num())?;
        emit_fields(&self.fields, out)
    }

    pub fn receive<R: Read + ?Sized>(def: &BaseDef, input: &mut R) -> Result<Self, DecodingError> {
        let num = input.read_i32()?;
        let fields = receive_fields(def, input)?;
        Ok(Self {
            invid: Invid::new(def.type_id, num),
            fields,
        })
    }
}

fn emit_fields<W: Write + ?Sized>(
    fields: &BTreeMap<FieldId, FieldValue>,
    out: &mut W,
) -> Result<(), EncodingError> {
    out.write_count16(fields.len())?;
    for (id, value) in fields {
        out.write_i16(*id)?;
        value.emit(out)?;
    }
    Ok(())
}

fn receive_fields<R: Read + ?Sized>(
    def: &BaseDef,
    input: &mut R,
) -> Result<BTreeMap<FieldId, FieldValue>, DecodingError> {
    let count = input.read_u16()?;
    let mut fields = BTreeMap::new();
    for _ in 0..count {
        let code = input.read_i16()?;
        let field_def = def.field(code).ok_or_else(|| {
            DecodingError::CouldNotDecode(format!("base {}: unknown field {code}", def.name))
        })?;
        let value = FieldValue::receive(field_def.field_type, field_def.vector, input)?;
        fields.insert(code, value);
    }
    Ok(fields)
}

/// The difference between an object's committed state and its edited replacement, as written
/// to the journal for edited objects.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectDelta {
    pub changed: BTreeMap<FieldId, FieldValue>,
    pub removed: Vec<FieldId>,
}

impl ObjectDelta {
    pub fn between(original: &DBObject, edited: &BTreeMap<FieldId, FieldValue>) -> Self {
        let changed = edited
            .iter()
            .filter(|(id, value)| original.field(**id) != Some(*value))
            .map(|(id, value)| (*id, value.clone()))
            .collect();
        let removed = original
            .fields
            .keys()
            .filter(|id| !edited.contains_key(id))
            .copied()
            .collect();
        Self { changed, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn apply(&self, original: &DBObject) -> DBObject {
        let mut fields = original.fields.clone();
        for id in &self.removed {
            fields.remove(id);
        }
        fields.extend(self.changed.iter().map(|(id, v)| (*id, v.clone())));
        DBObject::new(original.invid, fields)
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        emit_fields(&self.changed, out)?;
        out.write_count16(self.removed.len())?;
        for id in &self.removed {
            out.write_i16(*id)?;
        }
        Ok(())
    }

    pub fn receive<R: Read + ?Sized>(def: &BaseDef, input: &mut R) -> Result<Self, DecodingError> {
        let changed = receive_fields(def, input)?;
        let count = input.read_u16()?;
        let mut removed = Vec::with_capacity(count as usize);
        for _ in 0..count {
            removed.push(input.read_i16()?);
        }
        Ok(Self { changed, removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldType, Value};
    use crate::schema::FieldDef;

    fn base() -> BaseDef {
        BaseDef::new(3, "user")
            .with_field(FieldDef::new(1, "name", FieldType::String))
            .with_field(FieldDef::new(2, "uid", FieldType::Numeric))
            .with_field(FieldDef::new(3, "shell", FieldType::String))
    }

    fn fields(pairs: &[(FieldId, Value)]) -> BTreeMap<FieldId, FieldValue> {
        pairs
            .iter()
            .map(|(id, v)| (*id, FieldValue::Scalar(v.clone())))
            .collect()
    }

    #[test]
    fn test_delta_tracks_changes_and_removals() {
        let original = DBObject::new(
            Invid::new(3, 1),
            fields(&[
                (1, Value::String("alice".into())),
                (2, Value::Numeric(1000)),
                (3, Value::String("/bin/sh".into())),
            ]),
        );
        let edited = fields(&[
            (1, Value::String("alice".into())),
            (2, Value::Numeric(1001)),
        ]);
        let delta = ObjectDelta::between(&original, &edited);
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.removed, vec![3]);

        let mut buf = Vec::new();
        delta.emit(&mut buf).unwrap();
        let decoded = ObjectDelta::receive(&base(), &mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(decoded.apply(&original).fields(), &edited);
    }

    #[test]
    fn test_receive_rejects_unknown_field() {
        let object = DBObject::new(Invid::new(3, 7), fields(&[(9, Value::Numeric(1))]));
        let mut buf = Vec::new();
        object.emit(&mut buf).unwrap();
        assert!(DBObject::receive(&base(), &mut std::io::Cursor::new(buf)).is_err());
    }
}
