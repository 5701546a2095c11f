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

//! An in-memory, schema-driven object store. Objects live in typed bases, are edited through
//! transactions that check them out, and are persisted as a snapshot plus an append-only
//! journal of committed transactions.

mod checkpoint;
mod config;
mod deletion;
mod edit_object;
mod edit_set;
mod encode;
mod error;
mod fields;
mod invid;
mod journal;
pub mod locks;
mod namespace;
mod object;
mod object_base;
mod perm;
mod schema;
mod session;
mod store;

#[cfg(test)]
mod lock_tests;

pub use checkpoint::{DBCheckPoint, DBCheckPointObj, LogEvent};
pub use config::DatabaseConfig;
pub use deletion::DBDeletionManager;
pub use edit_object::{DBEditObject, EditHooks, ObjectStatus};
pub use edit_set::{CommitSummary, DBEditSet};
pub use encode::{BinaryRead, BinaryWrite, DecodingError, EncodingError};
pub use error::{
    CommitFailure, DeletionDenied, FieldRejection, JournalError, LockError, RejectReason,
    SessionError, StoreError,
};
pub use fields::{FieldType, FieldValue, NameKey, Value};
pub use invid::{BaseId, FieldId, Invid, InvidParseError};
pub use journal::{DBJournal, JournalEntry, JournalTransaction};
pub use locks::{DBDumpLock, DBLock, DBReadLock, DBWriteLock, LockKind};
pub use namespace::{DBNameSpace, DBNameSpaceHandle, FieldLocation};
pub use object::{CheckoutState, DBObject, EditHandle, ObjectDelta, SessionId, TxId};
pub use object_base::DBObjectBase;
pub use perm::PermEntry;
pub use schema::{BaseDef, FieldDef};
pub use session::DBSession;
pub use store::{DBStore, STORE_MAJOR, STORE_MINOR, sibling_path};
