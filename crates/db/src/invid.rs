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
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::str::FromStr;

/// The type code of an object base.
pub type BaseId = i16;

/// The numeric id of a field within an object base.
pub type FieldId = i16;

/// A reference to an object: the object base it lives in, and its number within that base.
/// Invids are never reused; numbers are handed out monotonically by the owning base.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Invid {
    type_id: BaseId,
    num: i32,
}

impl Invid {
    pub const fn new(type_id: BaseId, num: i32) -> Self {
        Self { type_id, num }
    }

    pub fn type_id(&self) -> BaseId {
        self.type_id
    }

    pub fn num(&self) -> i32 {
        self.num
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        out.write_i16(self.type_id)?;
        out.write_i32(self.num)
    }

    pub fn receive<R: Read + ?Sized>(input: &mut R) -> Result<Self, DecodingError> {
        let type_id = input.read_i16()?;
        let num = input.read_i32()?;
        Ok(Self { type_id, num })
    }
}

impl Display for Invid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.type_id, self.num))
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid invid literal: {0:?}; expected <type>:<number>")]
pub struct InvidParseError(String);

impl FromStr for Invid {
    type Err = InvidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (type_id, num) = s
            .split_once(':')
            .ok_or_else(|| InvidParseError(s.to_string()))?;
        let type_id = type_id
            .trim()
            .parse()
            .map_err(|_| InvidParseError(s.to_string()))?;
        let num = num
            .trim()
            .parse()
            .map_err(|_| InvidParseError(s.to_string()))?;
        Ok(Self { type_id, num })
    }
}
