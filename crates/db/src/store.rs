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

use crate::config::DatabaseConfig;
use crate::deletion::DBDeletionManager;
use crate::encode::{BinaryRead, BinaryWrite};
use crate::error::{JournalError, StoreError};
use crate::fields::FieldType;
use crate::invid::{BaseId, Invid};
use crate::journal::{DBJournal, JournalEntry, JournalTransaction};
use crate::locks::{DBDumpLock, DBLock, LockManager};
use crate::namespace::{DBNameSpace, FieldLocation};
use crate::object::{DBObject, SessionId, TxId};
use crate::object_base::DBObjectBase;
use crate::schema::BaseDef;
use crate::session::DBSession;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use tracing::{error, info, warn};

pub const STORE_MAGIC: &str = "Gstore";
pub const STORE_MAJOR: u8 = 2;
pub const STORE_MINOR: u8 = 0;

#[derive(Default)]
struct Schema {
    bases: IndexMap<BaseId, Arc<DBObjectBase>>,
    namespaces: IndexMap<String, Arc<DBNameSpace>>,
}

/// `<path><suffix>`, e.g. `ganymede.db` -> `ganymede.db.journal`.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// The root of the object store: schema, committed objects, namespaces, lock and deletion
/// managers, and the journal.
pub struct DBStore {
    config: DatabaseConfig,
    path: Option<PathBuf>,
    schema: RwLock<Schema>,
    deletion: DBDeletionManager,
    locks: Arc<LockManager>,
    journal: Mutex<Option<DBJournal>>,
    tx_number: AtomicI32,
    next_tx: AtomicU64,
    next_session: AtomicU64,
}

/// Ends a schema edit when dropped.
struct SchemaEdit<'a>(&'a LockManager);

impl Drop for SchemaEdit<'_> {
    fn drop(&mut self) {
        self.0.end_schema_edit();
    }
}

impl DBStore {
    fn empty(config: DatabaseConfig, path: Option<PathBuf>) -> Self {
        let locks = Arc::new(LockManager::new(config.lock_poll_interval));
        Self {
            config,
            path,
            schema: RwLock::new(Schema::default()),
            deletion: DBDeletionManager::new(),
            locks,
            journal: Mutex::new(None),
            tx_number: AtomicI32::new(0),
            next_tx: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
        }
    }

    /// An empty store with no backing file or journal.
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        Arc::new(Self::empty(config, None))
    }

    /// Open the store at `path`: read the snapshot if there is one, replay its journal
    /// (`<path>.journal`), and if the journal held anything, consolidate it into a fresh
    /// snapshot.
    pub fn load(path: &Path, config: DatabaseConfig) -> Result<Arc<Self>, StoreError> {
        let store = Self::empty(config, Some(path.to_path_buf()));
        if path.exists() {
            let mut input = BufReader::new(File::open(path)?);
            store.receive(&mut input)?;
            info!(
                ?path,
                bases = store.schema.read().bases.len(),
                tx_number = store.transaction_number(),
                "snapshot loaded"
            );
        } else {
            info!(?path, "no snapshot; starting with an empty store");
        }

        let mut journal = DBJournal::open(
            &sibling_path(path, ".journal"),
            store.config.journal_fsync,
            (STORE_MAJOR as i16, STORE_MINOR as i16),
        )?;
        let transactions = journal.replay(|type_id| store.base(type_id).map(|b| b.def().clone()))?;
        let pending = !journal.is_clean();
        let replayed = store.apply_journal(transactions);
        store.rebuild_namespaces()?;
        *store.journal.lock() = Some(journal);

        let store = Arc::new(store);
        if pending {
            info!(replayed, "consolidating journal into snapshot");
            store.dump(path, true)?;
        }
        Ok(store)
    }

    fn receive<R: Read + ?Sized>(&self, input: &mut R) -> Result<(), StoreError> {
        let magic = input
            .read_utf()
            .map_err(|_| StoreError::BadMagic(String::new()))?;
        if magic != STORE_MAGIC {
            return Err(StoreError::BadMagic(magic));
        }
        let major = input.read_u8()?;
        let minor = input.read_u8()?;
        if major != STORE_MAJOR {
            return Err(StoreError::UnsupportedVersion { major, minor });
        }
        self.tx_number.store(input.read_i32()?, Ordering::SeqCst);

        let mut schema = self.schema.write();
        let namespaces = input.read_u16()?;
        for _ in 0..namespaces {
            let name = input.read_utf()?;
            let case_insensitive = input.read_bool()?;
            let namespace = Arc::new(DBNameSpace::new(&name, case_insensitive));
            if schema.namespaces.insert(name.clone(), namespace).is_some() {
                return Err(StoreError::DuplicateNamespace(name));
            }
        }
        let bases = input.read_u16()?;
        for _ in 0..bases {
            let base = DBObjectBase::receive(input)?;
            Self::check_base_def(&schema, base.def())?;
            let type_id = base.type_id();
            if schema.bases.insert(type_id, Arc::new(base)).is_some() {
                return Err(StoreError::DuplicateBase(type_id));
            }
            self.locks.add_base(type_id);
        }
        Ok(())
    }

    fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), StoreError> {
        out.write_utf(STORE_MAGIC)?;
        out.write_u8(STORE_MAJOR)?;
        out.write_u8(STORE_MINOR)?;
        out.write_i32(self.transaction_number())?;
        let schema = self.schema.read();
        out.write_count16(schema.namespaces.len())?;
        for namespace in schema.namespaces.values() {
            out.write_utf(namespace.name())?;
            out.write_bool(namespace.is_case_insensitive())?;
        }
        out.write_count16(schema.bases.len())?;
        for base in schema.bases.values() {
            base.emit(out)?;
        }
        Ok(())
    }

    /// Apply replayed transactions newer than the snapshot, returning how many were applied.
    fn apply_journal(&self, transactions: Vec<JournalTransaction>) -> usize {
        let snapshot_tx = self.transaction_number();
        let mut applied = 0;
        for tx in transactions {
            if tx.tx_number <= snapshot_tx {
                continue;
            }
            for entry in tx.entries {
                self.apply_entry(tx.tx_number, entry);
            }
            self.tx_number.store(tx.tx_number, Ordering::SeqCst);
            applied += 1;
        }
        applied
    }

    fn apply_entry(&self, tx_number: i32, entry: JournalEntry) {
        let invid = match &entry {
            JournalEntry::Create(object) => object.invid(),
            JournalEntry::Edit { invid, .. } | JournalEntry::Delete(invid) => *invid,
        };
        let Some(base) = self.base(invid.type_id()) else {
            warn!(tx_number, %invid, "journal entry for unknown base");
            return;
        };
        match entry {
            JournalEntry::Create(object) => base.install(object),
            JournalEntry::Edit { delta, .. } => match base.get(invid.num()) {
                Some(original) => base.install(delta.apply(&original)),
                None => warn!(tx_number, %invid, "journal edits a missing object"),
            },
            JournalEntry::Delete(_) => {
                if base.remove(invid.num()).is_none() {
                    warn!(tx_number, %invid, "journal deletes a missing object");
                }
            }
        }
    }

    /// Rebuild every namespace index from committed objects.
    fn rebuild_namespaces(&self) -> Result<(), StoreError> {
        let schema = self.schema.read();
        for namespace in schema.namespaces.values() {
            namespace.clear();
        }
        for base in schema.bases.values() {
            for def in base.def().fields() {
                let Some(namespace) = def
                    .namespace
                    .as_deref()
                    .and_then(|n| schema.namespaces.get(n))
                else {
                    continue;
                };
                for object in base.objects() {
                    let Some(value) = object.field(def.id) else {
                        continue;
                    };
                    for key in value.name_keys(namespace.is_case_insensitive()) {
                        let location = FieldLocation::new(object.invid(), def.id);
                        if !namespace.register(key.clone(), location) {
                            return Err(StoreError::DuplicateNamespaceValue {
                                namespace: namespace.name().to_string(),
                                value: key.to_string(),
                                invid: object.invid(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Write a snapshot to `path` under a dump lock: write `<path>.new`, move any existing
    /// file aside to `<path>.bak`, then move the new file into place. Dumping to the store's
    /// own path also resets the journal. Unless `release_lock_after`, the dump lock is handed
    /// back still held, keeping writers out (e.g. for shutdown).
    pub fn dump(
        &self,
        path: &Path,
        release_lock_after: bool,
    ) -> Result<Option<DBDumpLock>, StoreError> {
        let mut lock = DBDumpLock::new(&self.locks, self.next_session_id())?;
        lock.establish()?;

        let new_path = sibling_path(path, ".new");
        {
            let mut out = BufWriter::new(File::create(&new_path)?);
            self.emit(&mut out)?;
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        if path.exists() {
            if self.config.keep_backup {
                fs::rename(path, sibling_path(path, ".bak"))?;
            } else {
                fs::remove_file(path)?;
            }
        }
        fs::rename(&new_path, path)?;

        if self.path.as_deref() == Some(path)
            && let Some(journal) = self.journal.lock().as_mut()
        {
            journal.reset()?;
        }
        info!(?path, tx_number = self.transaction_number(), "store dumped");

        if release_lock_after {
            lock.release();
            Ok(None)
        } else {
            Ok(Some(lock))
        }
    }

    /// Dump to the store's own path, folding the journal into the snapshot.
    pub fn consolidate(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.dump(&path, true)?;
        Ok(())
    }

    pub fn login(self: &Arc<Self>, key: &str) -> DBSession {
        let id = self.next_session_id();
        info!(%id, key, "session login");
        DBSession::new(self.clone(), id, key)
    }

    /// Add a namespace. Refused while any lock is held. A path-backed store is dumped once
    /// the schema edit ends, so the snapshot always carries the schema the journal refers to.
    pub fn define_namespace(
        &self,
        name: &str,
        case_insensitive: bool,
    ) -> Result<Arc<DBNameSpace>, StoreError> {
        let namespace = {
            let _edit = self.begin_schema_edit()?;
            let mut schema = self.schema.write();
            if schema.namespaces.contains_key(name) {
                return Err(StoreError::DuplicateNamespace(name.to_string()));
            }
            let namespace = Arc::new(DBNameSpace::new(name, case_insensitive));
            schema
                .namespaces
                .insert(name.to_string(), namespace.clone());
            info!(name, case_insensitive, "namespace defined");
            namespace
        };
        self.consolidate()?;
        Ok(namespace)
    }

    /// Add an object base. Refused while any lock is held. Dumps like `define_namespace`.
    pub fn define_base(&self, def: BaseDef) -> Result<Arc<DBObjectBase>, StoreError> {
        let base = {
            let _edit = self.begin_schema_edit()?;
            let mut schema = self.schema.write();
            if schema.bases.contains_key(&def.type_id) {
                return Err(StoreError::DuplicateBase(def.type_id));
            }
            Self::check_base_def(&schema, &def)?;
            let type_id = def.type_id;
            let name = def.name.clone();
            let base = Arc::new(DBObjectBase::new(def));
            schema.bases.insert(type_id, base.clone());
            self.locks.add_base(type_id);
            info!(type_id, name, "object base defined");
            base
        };
        self.consolidate()?;
        Ok(base)
    }

    fn begin_schema_edit(&self) -> Result<SchemaEdit<'_>, StoreError> {
        if !self.locks.try_begin_schema_edit() {
            return Err(StoreError::SchemaBusy);
        }
        Ok(SchemaEdit(&self.locks))
    }

    fn check_base_def(schema: &Schema, def: &BaseDef) -> Result<(), StoreError> {
        for field in def.fields() {
            if let Some(namespace) = &field.namespace {
                if !schema.namespaces.contains_key(namespace) {
                    return Err(StoreError::UnknownNamespace(namespace.clone()));
                }
                if !field.field_type.is_namespace_capable() {
                    return Err(StoreError::InvalidSchema(format!(
                        "{}.{}: {} fields cannot be unique",
                        def.name, field.name, field.field_type
                    )));
                }
            }
            let links = field.asymmetric || field.target_base.is_some();
            if links && field.field_type != FieldType::Invid {
                return Err(StoreError::InvalidSchema(format!(
                    "{}.{}: only invid fields can link to objects",
                    def.name, field.name
                )));
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn base(&self, type_id: BaseId) -> Option<Arc<DBObjectBase>> {
        self.schema.read().bases.get(&type_id).cloned()
    }

    pub fn base_by_name(&self, name: &str) -> Option<Arc<DBObjectBase>> {
        self.schema
            .read()
            .bases
            .values()
            .find(|b| b.name() == name)
            .cloned()
    }

    pub fn bases(&self) -> Vec<Arc<DBObjectBase>> {
        self.schema.read().bases.values().cloned().collect()
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<DBNameSpace>> {
        self.schema.read().namespaces.get(name).cloned()
    }

    pub fn namespaces(&self) -> Vec<Arc<DBNameSpace>> {
        self.schema.read().namespaces.values().cloned().collect()
    }

    /// The committed version of an object.
    pub fn view_object(&self, invid: Invid) -> Option<Arc<DBObject>> {
        self.base(invid.type_id())?.get(invid.num())
    }

    pub fn deletion_manager(&self) -> &DBDeletionManager {
        &self.deletion
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Number of the most recently committed transaction.
    pub fn transaction_number(&self) -> i32 {
        self.tx_number.load(Ordering::SeqCst)
    }

    /// Transactions in the journal since the last snapshot, or `None` for an in-memory store.
    pub fn journal_transactions(&self) -> Option<usize> {
        self.journal.lock().as_ref().map(|j| j.transactions())
    }

    pub(crate) fn next_tx_id(&self) -> TxId {
        TxId(self.next_tx.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Durably record a committing transaction, returning its transaction number.
    pub(crate) fn journal_commit(&self, entries: &[JournalEntry]) -> Result<i32, JournalError> {
        let mut journal = self.journal.lock();
        let tx_number = self.transaction_number() + 1;
        if let Some(journal) = journal.as_mut() {
            let start = journal.write_transaction(tx_number, entries)?;
            journal.finalize(start, tx_number)?;
        }
        self.tx_number.store(tx_number, Ordering::SeqCst);
        Ok(tx_number)
    }

    #[cfg(test)]
    pub(crate) fn break_journal(&self) {
        if let Some(journal) = self.journal.lock().as_mut() {
            journal.reopen_read_only().unwrap();
        }
    }

    /// Cross-check committed objects against the namespace indexes and link targets,
    /// returning a description of each inconsistency found.
    pub fn verify(&self) -> Vec<String> {
        let mut problems = vec![];
        for base in self.bases() {
            for object in base.objects() {
                for def in base.def().fields() {
                    let Some(value) = object.field(def.id) else {
                        continue;
                    };
                    let location = FieldLocation::new(object.invid(), def.id);
                    if let Some(namespace) = def.namespace.as_deref().and_then(|n| self.namespace(n))
                    {
                        for key in value.name_keys(namespace.is_case_insensitive()) {
                            let bound = namespace.lookup_persistent(&key);
                            if bound != Some(location) {
                                problems.push(format!(
                                    "{location}: value {key} in namespace {:?} is bound to {}",
                                    namespace.name(),
                                    bound.map_or("nothing".to_string(), |l| l.to_string())
                                ));
                            }
                        }
                    }
                    for target in value.values().iter().filter_map(|v| v.as_invid()) {
                        if self.view_object(target).is_none() {
                            problems.push(format!("{location}: link to missing object {target}"));
                        }
                    }
                }
            }
        }
        if !problems.is_empty() {
            error!(count = problems.len(), "store verification found problems");
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldValue, Value};
    use crate::schema::FieldDef;

    fn user_base() -> BaseDef {
        BaseDef::new(3, "user")
            .with_field(FieldDef::new(1, "name", FieldType::String).unique_in("username"))
            .with_field(FieldDef::new(2, "uid", FieldType::Numeric))
    }

    fn populated(path: &Path) -> Arc<DBStore> {
        let store = DBStore::load(path, DatabaseConfig::default()).unwrap();
        store.define_namespace("username", true).unwrap();
        let base = store.define_base(user_base()).unwrap();
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(1, FieldValue::Scalar(Value::String("Alice".into())));
        let object = DBObject::new(Invid::new(3, base.get_next_id()), fields);
        base.install(object);
        store
    }

    #[test]
    fn test_dump_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ganymede.db");
        let store = populated(&path);
        assert!(store.dump(&path, true).unwrap().is_none());
        drop(store);

        let loaded = DBStore::load(&path, DatabaseConfig::default()).unwrap();
        let base = loaded.base_by_name("user").unwrap();
        assert_eq!(base.len(), 1);
        assert_eq!(base.max_id(), 1);
        let namespace = loaded.namespace("username").unwrap();
        assert!(namespace.is_case_insensitive());
        assert_eq!(
            namespace.lookup_persistent(&crate::fields::NameKey::String("alice".into())),
            Some(FieldLocation::new(Invid::new(3, 1), 1))
        );
        assert!(loaded.verify().is_empty());
    }

    #[test]
    fn test_second_dump_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ganymede.db");
        let store = populated(&path);
        store.dump(&path, true).unwrap();
        store.dump(&path, true).unwrap();
        assert!(sibling_path(&path, ".bak").exists());
        assert!(!sibling_path(&path, ".new").exists());
    }

    #[test]
    fn test_schema_edit_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ganymede.db");
        let store = DBStore::load(&path, DatabaseConfig::default()).unwrap();
        store.define_namespace("username", true).unwrap();
        assert!(path.exists());
        store.define_base(user_base()).unwrap();
        drop(store);

        let loaded = DBStore::load(&path, DatabaseConfig::default()).unwrap();
        assert!(loaded.base(3).is_some());
        assert!(loaded.namespace("username").is_some());
    }

    #[test]
    fn test_bad_magic_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.db");
        let mut bytes = Vec::new();
        bytes.write_utf("NotGanymede").unwrap();
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            DBStore::load(&path, DatabaseConfig::default()),
            Err(StoreError::BadMagic(m)) if m == "NotGanymede"
        ));

        let mut bytes = Vec::new();
        bytes.write_utf(STORE_MAGIC).unwrap();
        bytes.write_u8(STORE_MAJOR + 1).unwrap();
        bytes.write_u8(0).unwrap();
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            DBStore::load(&path, DatabaseConfig::default()),
            Err(StoreError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_schema_validation() {
        let store = DBStore::new(DatabaseConfig::default());
        assert!(matches!(
            store.define_base(user_base()),
            Err(StoreError::UnknownNamespace(_))
        ));
        store.define_namespace("username", false).unwrap();
        store.define_base(user_base()).unwrap();
        assert!(matches!(
            store.define_base(user_base()),
            Err(StoreError::DuplicateBase(3))
        ));
        let bad = BaseDef::new(4, "group")
            .with_field(FieldDef::new(1, "owner", FieldType::String).asymmetric());
        assert!(matches!(
            store.define_base(bad),
            Err(StoreError::InvalidSchema(_))
        ));
    }
}
