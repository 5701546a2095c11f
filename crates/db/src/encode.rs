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

//! Big-endian, length-prefixed primitives shared by the snapshot and journal formats.

use std::io::{self, Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Could not encode: {0}")]
    CouldNotEncode(String),
    #[error("String too long for u16 length prefix: {0} bytes")]
    StringTooLong(usize),
    #[error("I/O error while encoding: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    #[error("Could not decode: {0}")]
    CouldNotDecode(String),
    #[error("Invalid field type code: {0}")]
    InvalidFieldType(i16),
    #[error("Invalid UTF-8 in string record")]
    InvalidUtf8,
    #[error("Invalid IP address length: {0}")]
    InvalidIpLength(u8),
    #[error("Negative count in length-prefixed collection: {0}")]
    NegativeCount(i32),
    #[error("I/O error while decoding: {0}")]
    Io(#[from] io::Error),
}

/// Writer side of the binary format. Every multi-byte value is big-endian; strings are a `u16`
/// byte length followed by UTF-8.
pub trait BinaryWrite: Write {
    fn write_u8(&mut self, v: u8) -> Result<(), EncodingError> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<(), EncodingError> {
        self.write_u8(u8::from(v))
    }

    fn write_i16(&mut self, v: i16) -> Result<(), EncodingError> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<(), EncodingError> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_i32(&mut self, v: i32) -> Result<(), EncodingError> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_i64(&mut self, v: i64) -> Result<(), EncodingError> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_f64(&mut self, v: f64) -> Result<(), EncodingError> {
        self.write_all(&v.to_bits().to_be_bytes())?;
        Ok(())
    }

    fn write_utf(&mut self, s: &str) -> Result<(), EncodingError> {
        let len = u16::try_from(s.len()).map_err(|_| EncodingError::StringTooLong(s.len()))?;
        self.write_u16(len)?;
        self.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Write a collection count as a `u16`, failing rather than truncating.
    fn write_count16(&mut self, count: usize) -> Result<(), EncodingError> {
        let count = u16::try_from(count).map_err(|_| {
            EncodingError::CouldNotEncode(format!("count {count} does not fit in u16"))
        })?;
        self.write_u16(count)
    }

    fn write_count32(&mut self, count: usize) -> Result<(), EncodingError> {
        let count = i32::try_from(count).map_err(|_| {
            EncodingError::CouldNotEncode(format!("count {count} does not fit in i32"))
        })?;
        self.write_i32(count)
    }
}

impl<W: Write + ?Sized> BinaryWrite for W {}

pub trait BinaryRead: Read {
    fn read_u8(&mut self) -> Result<u8, DecodingError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> Result<bool, DecodingError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_i16(&mut self) -> Result<i16, DecodingError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }

    fn read_u16(&mut self) -> Result<u16, DecodingError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_i32(&mut self) -> Result<i32, DecodingError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    fn read_i64(&mut self) -> Result<i64, DecodingError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    fn read_f64(&mut self) -> Result<f64, DecodingError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(f64::from_bits(u64::from_be_bytes(buf)))
    }

    fn read_utf(&mut self) -> Result<String, DecodingError> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| DecodingError::InvalidUtf8)
    }

    fn read_count32(&mut self) -> Result<usize, DecodingError> {
        let count = self.read_i32()?;
        usize::try_from(count).map_err(|_| DecodingError::NegativeCount(count))
    }
}

impl<R: Read + ?Sized> BinaryRead for R {}
