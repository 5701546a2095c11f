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

//! Transactions. A `DBEditSet` collects the objects a session creates, edits and deletes,
//! and either commits them all or unwinds them all.

use crate::checkpoint::{CheckpointStack, DBCheckPoint, DBCheckPointObj, LogEvent};
use crate::edit_object::{Creations, DBEditObject, ObjectStatus};
use crate::error::{CommitFailure, DeletionDenied, StoreError};
use crate::fields::Value;
use crate::invid::{BaseId, Invid};
use crate::journal::JournalEntry;
use crate::locks::{DBLock, DBWriteLock};
use crate::object::{DBObject, EditHandle, ObjectDelta, SessionId, TxId};
use crate::store::DBStore;
use indexmap::IndexMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// What a successful commit did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitSummary {
    pub tx_number: i32,
    pub created: usize,
    pub edited: usize,
    pub deleted: usize,
}

pub struct DBEditSet {
    store: Arc<DBStore>,
    handle: EditHandle,
    description: String,
    objects: IndexMap<Invid, DBEditObject>,
    creations: Creations,
    log_events: Vec<LogEvent>,
    checkpoints: CheckpointStack,
    open: Arc<AtomicBool>,
    spent: bool,
}

impl DBEditSet {
    pub(crate) fn new(
        store: Arc<DBStore>,
        session: SessionId,
        description: &str,
        open: Arc<AtomicBool>,
    ) -> Self {
        let handle = EditHandle {
            tx: store.next_tx_id(),
            session,
        };
        debug!(tx = %handle.tx, %session, description, "transaction opened");
        Self {
            store,
            handle,
            description: description.to_string(),
            objects: IndexMap::new(),
            creations: Creations::default(),
            log_events: vec![],
            checkpoints: CheckpointStack::default(),
            open,
            spent: false,
        }
    }

    pub fn tx(&self) -> TxId {
        self.handle.tx
    }

    pub fn session(&self) -> SessionId {
        self.handle.session
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn objects(&self) -> impl Iterator<Item = &DBEditObject> {
        self.objects.values()
    }

    pub fn get(&self, invid: Invid) -> Option<&DBEditObject> {
        self.objects.get(&invid)
    }

    /// The object as this transaction sees it: its own edits if it has any, otherwise the
    /// committed state.
    pub fn view_object(&self, invid: Invid) -> Option<DBObject> {
        match self.objects.get(&invid) {
            Some(object) => match object.status() {
                ObjectStatus::Creating | ObjectStatus::Editing => Some(object.to_object()),
                ObjectStatus::Deleting | ObjectStatus::Dropping => None,
            },
            None => self.store.view_object(invid).map(|o| o.as_ref().clone()),
        }
    }

    /// Allocate a new object in base `type_id`.
    pub fn create_object(&mut self, type_id: BaseId) -> Result<&mut DBEditObject, StoreError> {
        let base = self
            .store
            .base(type_id)
            .ok_or(StoreError::UnknownBase(type_id))?;
        let invid = Invid::new(type_id, base.get_next_id());
        debug!(tx = %self.handle.tx, %invid, "creating object");
        let object = DBEditObject::creating(
            self.store.clone(),
            base,
            invid,
            self.handle,
            self.creations.clone(),
        );
        self.creations.lock().insert(invid);
        Ok(self.objects.entry(invid).or_insert(object))
    }

    /// Check `invid` out for editing. `None` if it doesn't exist, is being deleted, or is
    /// checked out by another transaction.
    pub fn edit_object(&mut self, invid: Invid) -> Option<&mut DBEditObject> {
        match self.objects.get(&invid).map(|o| o.status()) {
            Some(ObjectStatus::Creating | ObjectStatus::Editing) => {}
            Some(ObjectStatus::Deleting | ObjectStatus::Dropping) => return None,
            None => {
                let base = self.store.base(invid.type_id())?;
                let Some(original) = base.create_shadow(invid.num(), self.handle) else {
                    debug!(tx = %self.handle.tx, %invid, "object unavailable for editing");
                    return None;
                };
                let object = DBEditObject::checked_out(
                    self.store.clone(),
                    base,
                    original,
                    self.handle,
                    self.creations.clone(),
                    ObjectStatus::Editing,
                );
                self.objects.insert(invid, object);
            }
        }
        self.objects.get_mut(&invid)
    }

    /// Mark `invid` for deletion at commit. Refused if another session holds a delete-lock on
    /// it or another transaction has it checked out.
    pub fn delete_object(&mut self, invid: Invid) -> Result<(), DeletionDenied> {
        let store = self.store.clone();
        let deletion = store.deletion_manager();
        match self.objects.get(&invid).map(|o| o.status()) {
            Some(ObjectStatus::Deleting | ObjectStatus::Dropping) => Ok(()),
            Some(status) => {
                let Some(object) = self.objects.get_mut(&invid) else {
                    return Err(DeletionDenied::NoSuchObject(invid));
                };
                let next = match status {
                    ObjectStatus::Creating => {
                        deletion.set_drop_status(invid, self.handle)?;
                        self.creations.lock().remove(&invid);
                        ObjectStatus::Dropping
                    }
                    _ => {
                        deletion.set_delete_status(object.base(), invid, self.handle)?;
                        ObjectStatus::Deleting
                    }
                };
                object.unmark_all();
                object.set_status(next);
                debug!(tx = %self.handle.tx, %invid, %next, "object deleted");
                Ok(())
            }
            None => {
                let base = store
                    .base(invid.type_id())
                    .ok_or(DeletionDenied::NoSuchObject(invid))?;
                let original = deletion.set_delete_status(&base, invid, self.handle)?;
                let object = DBEditObject::checked_out(
                    store.clone(),
                    base,
                    original,
                    self.handle,
                    self.creations.clone(),
                    ObjectStatus::Deleting,
                );
                object.unmark_all();
                self.objects.insert(invid, object);
                debug!(tx = %self.handle.tx, %invid, "object deleted");
                Ok(())
            }
        }
    }

    /// Register this session's interest in keeping `invid` from being deleted.
    pub fn delete_lock_object(&self, invid: Invid) -> bool {
        let Some(base) = self.store.base(invid.type_id()) else {
            return false;
        };
        self.store
            .deletion_manager()
            .delete_lock_object(&base, invid, self.handle.session)
    }

    /// Claim `value` in `namespace` for this transaction without binding it to a field.
    pub fn reserve(&self, namespace: &str, value: &Value) -> bool {
        let Some(namespace) = self.store.namespace(namespace) else {
            return false;
        };
        let Some(key) = value.name_key(namespace.is_case_insensitive()) else {
            return false;
        };
        namespace.reserve(self.handle.tx, &key)
    }

    pub fn log_event(&mut self, kind: &str, description: &str, objects: Vec<Invid>) {
        self.log_events.push(LogEvent {
            kind: kind.to_string(),
            description: description.to_string(),
            objects,
        });
    }

    pub fn log_events(&self) -> &[LogEvent] {
        &self.log_events
    }

    pub fn checkpoint(&mut self, name: &str) {
        let checkpoint = DBCheckPoint {
            name: name.to_string(),
            objects: self.objects.values().map(DBCheckPointObj::from).collect(),
            log_events: self.log_events.clone(),
            delete_locks: self
                .store
                .deletion_manager()
                .get_session_checkpoint(self.handle.session),
        };
        self.checkpoints.push(checkpoint);
        for namespace in self.store.namespaces() {
            namespace.checkpoint(self.handle.tx, name);
        }
        debug!(tx = %self.handle.tx, name, "checkpoint");
    }

    /// Outstanding checkpoint names, oldest first.
    pub fn checkpoints(&self) -> Vec<String> {
        self.checkpoints.names().map(str::to_string).collect()
    }

    /// Forget the named checkpoint, and any taken after it, keeping the current state.
    pub fn pop_checkpoint(&mut self, name: &str) -> bool {
        if self.checkpoints.take(name).is_none() {
            return false;
        }
        for namespace in self.store.namespaces() {
            namespace.pop_checkpoint(self.handle.tx, name);
        }
        true
    }

    /// Return to the state at the named checkpoint. Objects first touched after it go back to
    /// their committed state, and checkpoints taken after it are discarded.
    pub fn rollback(&mut self, name: &str) -> bool {
        let Some(checkpoint) = self.checkpoints.take(name) else {
            warn!(tx = %self.handle.tx, name, "rollback to unknown checkpoint");
            return false;
        };
        let touched: Vec<Invid> = self.objects.keys().rev().copied().collect();
        for invid in touched {
            match checkpoint.get(invid) {
                Some(saved) => {
                    let Some(object) = self.objects.get_mut(&invid) else {
                        continue;
                    };
                    if object.status() == ObjectStatus::Deleting
                        && saved.status == ObjectStatus::Editing
                    {
                        object.base().revert_deletion_mark(invid.num(), self.handle);
                    }
                    object.restore(saved.status, saved.fields.clone());
                }
                None => {
                    if let Some(object) = self.objects.shift_remove(&invid) {
                        object.release();
                    }
                }
            }
        }
        self.log_events = checkpoint.log_events;
        self.sync_creations();
        self.store
            .deletion_manager()
            .revert_session_checkpoint(self.handle.session, &checkpoint.delete_locks);
        for namespace in self.store.namespaces() {
            namespace.rollback(self.handle.tx, name);
        }
        debug!(tx = %self.handle.tx, name, "rolled back");
        true
    }

    fn sync_creations(&self) {
        *self.creations.lock() = self
            .objects
            .values()
            .filter(|o| o.status() == ObjectStatus::Creating)
            .map(|o| o.invid())
            .collect();
    }

    fn journal_entries(&self) -> Vec<JournalEntry> {
        self.objects
            .values()
            .filter_map(|object| match object.status() {
                ObjectStatus::Creating => Some(JournalEntry::Create(object.to_object())),
                ObjectStatus::Editing => {
                    let original = object.original()?;
                    let delta = ObjectDelta::between(original, object.fields());
                    (!delta.is_empty()).then_some(JournalEntry::Edit {
                        invid: object.invid(),
                        delta,
                    })
                }
                ObjectStatus::Deleting => Some(JournalEntry::Delete(object.invid())),
                ObjectStatus::Dropping => None,
            })
            .collect()
    }

    /// Commit every change in this transaction, or none of them. On failure everything has
    /// been rolled back; either way the transaction is spent.
    pub fn commit(mut self) -> Result<CommitSummary, CommitFailure> {
        let result = self.try_commit();
        match &result {
            Ok(summary) => {
                self.store
                    .deletion_manager()
                    .release_session(self.handle.session);
                self.objects.clear();
                self.creations.lock().clear();
                self.spent = true;
                debug!(tx = %self.handle.tx, ?summary, "transaction committed");
            }
            Err(e) => {
                warn!(tx = %self.handle.tx, error = %e, "commit failed; rolling back");
                self.abort();
            }
        }
        result
    }

    fn try_commit(&mut self) -> Result<CommitSummary, CommitFailure> {
        let mut bases: Vec<BaseId> = self.objects.keys().map(|i| i.type_id()).collect();
        bases.sort();
        bases.dedup();
        let mut lock = DBWriteLock::new(self.store.lock_manager(), self.handle.session, bases)?;
        lock.establish()?;

        for object in self.objects.values() {
            object.commit_phase1()?;
        }
        let pending = |invid: Invid| self.objects.get(&invid).map(|o| o.status());
        for object in self.objects.values() {
            object.check_links(pending)?;
        }

        let entries = self.journal_entries();
        let tx_number = if entries.is_empty() {
            self.store.transaction_number()
        } else {
            self.store.journal_commit(&entries)?
        };

        for object in self.objects.values() {
            object.commit_phase2();
        }

        let mut summary = CommitSummary {
            tx_number,
            ..Default::default()
        };
        for object in self.objects.values() {
            let base = object.base();
            match object.status() {
                ObjectStatus::Creating => {
                    base.install(object.to_object());
                    summary.created += 1;
                }
                ObjectStatus::Editing => {
                    base.install(object.to_object());
                    summary.edited += 1;
                }
                ObjectStatus::Deleting => {
                    base.remove(object.invid().num());
                    summary.deleted += 1;
                }
                ObjectStatus::Dropping => {}
            }
        }

        for namespace in self.store.namespaces() {
            namespace.commit(self.handle.tx);
        }
        lock.release();

        for event in &self.log_events {
            info!(
                target: "ganymede::txlog",
                tx_number,
                kind = %event.kind,
                objects = ?event.objects,
                "{}",
                event.description
            );
        }
        Ok(summary)
    }

    /// Abandon the transaction, returning every touched object to its committed state.
    pub fn release(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        for object in self.objects.values().rev() {
            object.release();
        }
        self.objects.clear();
        self.creations.lock().clear();
        for namespace in self.store.namespaces() {
            namespace.abort(self.handle.tx);
        }
        self.store
            .deletion_manager()
            .release_session(self.handle.session);
        self.checkpoints.clear();
        self.log_events.clear();
        self.spent = true;
        debug!(tx = %self.handle.tx, "transaction released");
    }
}

impl Drop for DBEditSet {
    fn drop(&mut self) {
        if !self.spent {
            self.abort();
        }
        self.open.store(false, Ordering::SeqCst);
    }
}
