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
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};

/// Number of flag bytes that follow the length prefix of an emitted entry.
const PERM_ENTRY_WIDTH: u16 = 4;

/// The set of rights granted over an object type or field, as stored in a permission matrix.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct PermEntry {
    visible: bool,
    editable: bool,
    create: bool,
    delete: bool,
}

impl PermEntry {
    pub const NONE: PermEntry = PermEntry::new(false, false, false, false);
    pub const FULL: PermEntry = PermEntry::new(true, true, true, true);

    #[must_use]
    pub const fn new(visible: bool, editable: bool, create: bool, delete: bool) -> Self {
        Self {
            visible,
            editable,
            create,
            delete,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_editable(&self) -> bool {
        self.editable
    }

    pub fn is_creatable(&self) -> bool {
        self.create
    }

    pub fn is_deletable(&self) -> bool {
        self.delete
    }

    /// The union of two entries: any right granted by either is granted by the result.
    #[must_use]
    pub fn union(&self, other: &PermEntry) -> PermEntry {
        PermEntry {
            visible: self.visible || other.visible,
            editable: self.editable || other.editable,
            create: self.create || other.create,
            delete: self.delete || other.delete,
        }
    }

    /// The intersection of two entries.
    #[must_use]
    pub fn intersection(&self, other: &PermEntry) -> PermEntry {
        PermEntry {
            visible: self.visible && other.visible,
            editable: self.editable && other.editable,
            create: self.create && other.create,
            delete: self.delete && other.delete,
        }
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        out.write_u16(PERM_ENTRY_WIDTH)?;
        out.write_bool(self.visible)?;
        out.write_bool(self.editable)?;
        out.write_bool(self.create)?;
        out.write_bool(self.delete)
    }

    pub fn receive<R: Read + ?Sized>(input: &mut R) -> Result<Self, DecodingError> {
        let width = input.read_u16()?;
        if width != PERM_ENTRY_WIDTH {
            return Err(DecodingError::CouldNotDecode(format!(
                "permission entry width {width}, expected {PERM_ENTRY_WIDTH}"
            )));
        }
        Ok(Self {
            visible: input.read_bool()?,
            editable: input.read_bool()?,
            create: input.read_bool()?,
            delete: input.read_bool()?,
        })
    }
}

impl Display for PermEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(self.visible, 'v'),
            flag(self.editable, 'e'),
            flag(self.create, 'c'),
            flag(self.delete, 'd')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_and_intersection() {
        let read_only = PermEntry::new(true, false, false, false);
        let editor = PermEntry::new(true, true, false, false);
        assert_eq!(read_only.union(&editor), editor);
        assert_eq!(read_only.intersection(&editor), read_only);
        assert_eq!(PermEntry::FULL.intersection(&PermEntry::NONE), PermEntry::NONE);
    }

    #[test]
    fn test_display() {
        assert_eq!(PermEntry::new(true, false, true, false).to_string(), "v-c-");
    }

    #[test]
    fn test_receive_rejects_wrong_width() {
        let bytes = vec![0u8, 3, 1, 1, 1];
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(PermEntry::receive(&mut cursor).is_err());
    }
}
