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

//! Append-only log of committed transactions since the last snapshot.
//!
//! Each transaction is written as an `open` record, its object entries and a `close` record,
//! followed by a separate `finalize` record once the commit is past the point of no return.
//! Replay only applies transactions that carry both; anything after the last complete
//! transaction is cut off.

use crate::encode::{BinaryRead, BinaryWrite, DecodingError};
use crate::error::JournalError;
use crate::invid::{BaseId, Invid};
use crate::object::{DBObject, ObjectDelta};
use crate::schema::BaseDef;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const JOURNAL_MAGIC: &str = "GJournal";
pub const JOURNAL_MAJOR: i16 = 1;
pub const JOURNAL_MINOR: i16 = 0;

const OPEN: &str = "open";
const CLOSE: &str = "close";
const FINALIZE: &str = "finalize";

const OP_CREATE: u8 = 1;
const OP_EDIT: u8 = 2;
const OP_DELETE: u8 = 3;

#[derive(Clone, Debug, PartialEq)]
pub enum JournalEntry {
    Create(DBObject),
    Edit { invid: Invid, delta: ObjectDelta },
    Delete(Invid),
}

impl JournalEntry {
    fn type_id(&self) -> BaseId {
        match self {
            JournalEntry::Create(object) => object.type_id(),
            JournalEntry::Edit { invid, .. } | JournalEntry::Delete(invid) => invid.type_id(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JournalTransaction {
    pub tx_number: i32,
    pub time: i64,
    pub entries: Vec<JournalEntry>,
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub struct DBJournal {
    path: PathBuf,
    file: File,
    fsync: bool,
    store_version: (i16, i16),
    transactions: usize,
}

impl DBJournal {
    /// Open the journal at `path`, writing a fresh header if it is empty or missing.
    pub fn open(path: &Path, fsync: bool, store_version: (i16, i16)) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut journal = Self {
            path: path.to_path_buf(),
            file,
            fsync,
            store_version,
            transactions: 0,
        };
        if journal.file.metadata()?.len() == 0 {
            journal.write_header()?;
        } else {
            journal.file.seek(SeekFrom::Start(0))?;
            let mut header = std::io::BufReader::new(&journal.file);
            Self::read_header(&mut header)?;
        }
        journal.file.seek(SeekFrom::End(0))?;
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self) -> Result<(), JournalError> {
        let mut header = Vec::new();
        header.write_utf(JOURNAL_MAGIC)?;
        header.write_i16(JOURNAL_MAJOR)?;
        header.write_i16(JOURNAL_MINOR)?;
        header.write_i16(self.store_version.0)?;
        header.write_i16(self.store_version.1)?;
        header.write_i64(now_millis())?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn read_header<R: Read + ?Sized>(input: &mut R) -> Result<(), JournalError> {
        let magic = input.read_utf()?;
        if magic != JOURNAL_MAGIC {
            return Err(JournalError::BadMagic(magic));
        }
        let major = input.read_i16()?;
        let minor = input.read_i16()?;
        if major != JOURNAL_MAJOR {
            return Err(JournalError::UnsupportedVersion { major, minor });
        }
        let (_store_major, _store_minor) = (input.read_i16()?, input.read_i16()?);
        let _created = input.read_i64()?;
        Ok(())
    }

    /// True if no transaction has been written since the journal was last reset.
    pub fn is_clean(&self) -> bool {
        self.transactions == 0
    }

    pub fn transactions(&self) -> usize {
        self.transactions
    }

    /// Read back every complete transaction, cutting off any incomplete tail. `def_for`
    /// supplies the field dictionary needed to decode each base's objects.
    pub fn replay(
        &mut self,
        def_for: impl Fn(BaseId) -> Option<BaseDef>,
    ) -> Result<Vec<JournalTransaction>, JournalError> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        let total = bytes.len() as u64;
        let mut cursor = Cursor::new(bytes);
        Self::read_header(&mut cursor)?;

        let mut transactions = vec![];
        let mut good = cursor.position();
        while cursor.position() < total {
            match Self::read_transaction(&mut cursor, &def_for) {
                Ok(tx) => {
                    transactions.push(tx);
                    good = cursor.position();
                }
                Err(JournalError::UnknownBase(base)) => return Err(JournalError::UnknownBase(base)),
                Err(e) => {
                    warn!(
                        path = ?self.path,
                        offset = good,
                        error = %e,
                        "discarding incomplete journal tail"
                    );
                    break;
                }
            }
        }
        if good < total {
            self.file.set_len(good)?;
            self.file.sync_all()?;
        }
        self.file.seek(SeekFrom::End(0))?;
        self.transactions = transactions.len();
        info!(
            path = ?self.path,
            transactions = transactions.len(),
            "journal read"
        );
        Ok(transactions)
    }

    fn expect_token<R: Read + ?Sized>(input: &mut R, token: &str) -> Result<(), JournalError> {
        let found = input.read_utf()?;
        if found != token {
            return Err(DecodingError::CouldNotDecode(format!(
                "expected journal record {token:?}, found {found:?}"
            ))
            .into());
        }
        Ok(())
    }

    fn read_transaction<R: Read + ?Sized>(
        input: &mut R,
        def_for: &impl Fn(BaseId) -> Option<BaseDef>,
    ) -> Result<JournalTransaction, JournalError> {
        Self::expect_token(input, OPEN)?;
        let time = input.read_i64()?;
        let tx_number = input.read_i32()?;
        let count = input.read_count32()?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let op = input.read_u8()?;
            let type_id = input.read_i16()?;
            let def = def_for(type_id).ok_or(JournalError::UnknownBase(type_id))?;
            let entry = match op {
                OP_CREATE => JournalEntry::Create(DBObject::receive(&def, input)?),
                OP_EDIT => {
                    let num = input.read_i32()?;
                    JournalEntry::Edit {
                        invid: Invid::new(type_id, num),
                        delta: ObjectDelta::receive(&def, input)?,
                    }
                }
                OP_DELETE => JournalEntry::Delete(Invid::new(type_id, input.read_i32()?)),
                other => {
                    return Err(DecodingError::CouldNotDecode(format!(
                        "unknown journal op {other}"
                    ))
                    .into());
                }
            };
            entries.push(entry);
        }
        Self::expect_token(input, CLOSE)?;
        let _closed = input.read_i64()?;
        Self::expect_token(input, FINALIZE)?;
        let _finalized = input.read_i64()?;
        let finalized_number = input.read_i32()?;
        if finalized_number != tx_number {
            return Err(DecodingError::CouldNotDecode(format!(
                "transaction {tx_number} finalized as {finalized_number}"
            ))
            .into());
        }
        Ok(JournalTransaction {
            tx_number,
            time,
            entries,
        })
    }

    /// Append a transaction's body, returning the offset it starts at. The transaction does
    /// not count until `finalize` is written.
    pub fn write_transaction(
        &mut self,
        tx_number: i32,
        entries: &[JournalEntry],
    ) -> Result<u64, JournalError> {
        let mut record = Vec::new();
        record.write_utf(OPEN)?;
        record.write_i64(now_millis())?;
        record.write_i32(tx_number)?;
        record.write_count32(entries.len())?;
        for entry in entries {
            match entry {
                JournalEntry::Create(object) => {
                    record.write_u8(OP_CREATE)?;
                    record.write_i16(entry.type_id())?;
                    object.emit(&mut record)?;
                }
                JournalEntry::Edit { invid, delta } => {
                    record.write_u8(OP_EDIT)?;
                    record.write_i16(entry.type_id())?;
                    record.write_i32(invid.num())?;
                    delta.emit(&mut record)?;
                }
                JournalEntry::Delete(invid) => {
                    record.write_u8(OP_DELETE)?;
                    record.write_i16(entry.type_id())?;
                    record.write_i32(invid.num())?;
                }
            }
        }
        record.write_utf(CLOSE)?;
        record.write_i64(now_millis())?;

        let start = self.file.seek(SeekFrom::End(0))?;
        if let Err(e) = self.file.write_all(&record) {
            self.undo(start);
            return Err(e.into());
        }
        debug!(tx_number, entries = entries.len(), offset = start, "journal transaction written");
        Ok(start)
    }

    /// Mark the transaction starting at `start` as complete.
    pub fn finalize(&mut self, start: u64, tx_number: i32) -> Result<(), JournalError> {
        let mut record = Vec::new();
        record.write_utf(FINALIZE)?;
        record.write_i64(now_millis())?;
        record.write_i32(tx_number)?;
        let result = self.file.write_all(&record).and_then(|_| {
            if self.fsync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            self.undo(start);
            return Err(e.into());
        }
        self.transactions += 1;
        Ok(())
    }

    /// Cut the journal back to `offset`, discarding a partially written transaction.
    pub fn undo(&mut self, offset: u64) {
        if let Err(e) = self
            .file
            .set_len(offset)
            .and_then(|_| self.file.seek(SeekFrom::Start(offset)).map(|_| ()))
        {
            warn!(path = ?self.path, offset, error = %e, "could not truncate journal");
        }
    }

    /// Swap the writable handle for a read-only one, so every later write fails.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&mut self) -> Result<(), JournalError> {
        self.file = File::open(&self.path)?;
        Ok(())
    }

    /// Empty the journal after its contents have been consolidated into a snapshot.
    pub fn reset(&mut self) -> Result<(), JournalError> {
        self.file.set_len(0)?;
        self.write_header()?;
        self.file.seek(SeekFrom::End(0))?;
        self.transactions = 0;
        info!(path = ?self.path, "journal reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldType, FieldValue, Value};
    use crate::schema::FieldDef;
    use std::collections::BTreeMap;

    fn def() -> BaseDef {
        BaseDef::new(3, "user").with_field(FieldDef::new(1, "name", FieldType::String))
    }

    fn object(num: i32, name: &str) -> DBObject {
        let mut fields = BTreeMap::new();
        fields.insert(1, FieldValue::Scalar(Value::String(name.into())));
        DBObject::new(Invid::new(3, num), fields)
    }

    fn def_for(base: BaseId) -> Option<BaseDef> {
        (base == 3).then(def)
    }

    #[test]
    fn test_replay_returns_finalized_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.journal");
        let mut journal = DBJournal::open(&path, false, (2, 0)).unwrap();
        assert!(journal.is_clean());

        let entries = vec![JournalEntry::Create(object(1, "alice"))];
        let start = journal.write_transaction(1, &entries).unwrap();
        journal.finalize(start, 1).unwrap();
        let delta = ObjectDelta::between(&object(1, "alice"), object(1, "bob").fields());
        let entries = vec![
            JournalEntry::Edit {
                invid: Invid::new(3, 1),
                delta,
            },
            JournalEntry::Delete(Invid::new(3, 2)),
        ];
        let start = journal.write_transaction(2, &entries).unwrap();
        journal.finalize(start, 2).unwrap();
        assert!(!journal.is_clean());
        drop(journal);

        let mut journal = DBJournal::open(&path, false, (2, 0)).unwrap();
        let transactions = journal.replay(def_for).unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[1].entries, entries);
        assert_eq!(journal.transactions(), 2);
    }

    #[test]
    fn test_unfinalized_tail_is_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.journal");
        let mut journal = DBJournal::open(&path, false, (2, 0)).unwrap();
        let start = journal
            .write_transaction(1, &[JournalEntry::Create(object(1, "alice"))])
            .unwrap();
        journal.finalize(start, 1).unwrap();
        let complete_len = std::fs::metadata(&path).unwrap().len();
        journal
            .write_transaction(2, &[JournalEntry::Create(object(2, "carol"))])
            .unwrap();
        drop(journal);

        let mut journal = DBJournal::open(&path, false, (2, 0)).unwrap();
        let transactions = journal.replay(def_for).unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), complete_len);
    }

    #[test]
    fn test_reset_and_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.journal");
        let mut journal = DBJournal::open(&path, false, (2, 0)).unwrap();
        let start = journal.write_transaction(1, &[]).unwrap();
        journal.finalize(start, 1).unwrap();
        journal.reset().unwrap();
        assert!(journal.is_clean());
        assert!(journal.replay(def_for).unwrap().is_empty());

        let bogus = dir.path().join("bogus.journal");
        let mut bytes = Vec::new();
        bytes.write_utf("NotAJournal").unwrap();
        std::fs::write(&bogus, bytes).unwrap();
        assert!(matches!(
            DBJournal::open(&bogus, false, (2, 0)),
            Err(JournalError::BadMagic(_))
        ));
    }
}
