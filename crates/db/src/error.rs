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

use crate::encode::{DecodingError, EncodingError};
use crate::fields::FieldType;
use crate::invid::{BaseId, FieldId, Invid};
use crate::locks::LockKind;
use std::io;
use std::time::Duration;

/// Errors raised while loading, dumping or reshaping the store as a whole.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Not a store snapshot (magic {0:?})")]
    BadMagic(String),
    #[error("Unsupported snapshot version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("Could not decode snapshot: {0}")]
    Decoding(#[from] DecodingError),
    #[error("Could not encode snapshot: {0}")]
    Encoding(#[from] EncodingError),
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Unknown object base {0}")]
    UnknownBase(BaseId),
    #[error("Unknown object base {0:?}")]
    UnknownBaseName(String),
    #[error("Unknown namespace {0:?}")]
    UnknownNamespace(String),
    #[error("Object base {0} is already defined")]
    DuplicateBase(BaseId),
    #[error("Namespace {0:?} is already defined")]
    DuplicateNamespace(String),
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
    #[error("Schema cannot change while locks are held")]
    SchemaBusy,
    #[error("Duplicate value {value} in namespace {namespace:?} while loading {invid}")]
    DuplicateNamespaceValue {
        namespace: String,
        value: String,
        invid: Invid,
    },
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LockError {
    #[error("Lock establish was aborted")]
    Aborted,
    #[error("Lock not granted within {0:?}")]
    Timeout(Duration),
    #[error("Lock is already established")]
    AlreadyLocked,
    #[error("Lock has been released")]
    Released,
    #[error("Writers are refused while the schema is being edited")]
    SchemaEditInProgress,
    #[error("Key already holds a {0} lock")]
    KeyConflict(LockKind),
    #[error("Unknown object base {0}")]
    UnknownBase(BaseId),
}

/// Why a proposed field value was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("no such field in this object base")]
    UnknownField,
    #[error("expected {expected}, got {found}")]
    WrongType {
        expected: FieldType,
        found: FieldType,
    },
    #[error("field holds a vector of values")]
    ExpectedVector,
    #[error("field holds a single value")]
    ExpectedScalar,
    #[error("string length {len} is below the minimum of {min}")]
    TooShort { len: usize, min: u16 },
    #[error("string length {len} exceeds the maximum of {max}")]
    TooLong { len: usize, max: u16 },
    #[error("encoded length of {bytes} bytes exceeds the maximum of {max}")]
    EncodedTooLong { bytes: usize, max: u16 },
    #[error("vector of {len} elements exceeds the maximum of {max}")]
    VectorTooLarge { len: usize, max: u32 },
    #[error("{value} is outside the range {min}..={max}")]
    OutOfRange { value: i32, min: i32, max: i32 },
    #[error("{target} does not point into object base {expected}")]
    WrongTargetBase { target: Invid, expected: BaseId },
    #[error("value {value} is already taken in namespace {namespace:?}")]
    NamespaceConflict { namespace: String, value: String },
    #[error("linked object {0} is being deleted")]
    TargetBeingDeleted(Invid),
    #[error("linked object {0} does not exist")]
    NoSuchTarget(Invid),
    #[error("required field is not set")]
    Required,
    #[error("object is being deleted")]
    ObjectDeleted,
}

/// A recoverable validation failure for a single field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("field {field}: {reason}")]
pub struct FieldRejection {
    pub field: FieldId,
    pub reason: RejectReason,
}

impl FieldRejection {
    pub fn new(field: FieldId, reason: RejectReason) -> Self {
        Self { field, reason }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DeletionDenied {
    #[error("Object {0} does not exist")]
    NoSuchObject(Invid),
    #[error("Object {0} is checked out by another transaction")]
    CheckedOut(Invid),
    #[error("Object {0} is delete-locked by another session")]
    DeleteLocked(Invid),
    #[error("Object {0} is being deleted by another session")]
    BeingDeleted(Invid),
    #[error("Object {0} was created in this transaction and is already dropped")]
    AlreadyDropped(Invid),
}

/// Why a commit was refused. The transaction has been rolled back in every case.
#[derive(Debug, thiserror::Error)]
pub enum CommitFailure {
    #[error("Could not acquire write lock: {0}")]
    Lock(#[from] LockError),
    #[error("Object {invid} rejected: {rejection}")]
    Rejected {
        invid: Invid,
        rejection: FieldRejection,
    },
    #[error("Object {invid} vetoed commit: {reason}")]
    Vetoed { invid: Invid, reason: String },
    #[error("Journal write failed: {0}")]
    Journal(#[from] JournalError),
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Session already has an open transaction")]
    TransactionOpen,
    #[error("Session already holds a {0} lock")]
    LockClassConflict(LockKind),
    #[error("Read lock overlaps a write lock held by this session")]
    OverlapsWriteLock,
    #[error("Session has logged out")]
    LoggedOut,
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Could not encode journal record: {0}")]
    Encoding(#[from] EncodingError),
    #[error("Could not decode journal record: {0}")]
    Decoding(#[from] DecodingError),
    #[error("Not a journal (magic {0:?})")]
    BadMagic(String),
    #[error("Unsupported journal version {major}.{minor}")]
    UnsupportedVersion { major: i16, minor: i16 },
    #[error("Journal entry references unknown object base {0}")]
    UnknownBase(BaseId),
    #[error("Journal is closed")]
    Closed,
}
