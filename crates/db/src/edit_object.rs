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

use crate::error::{CommitFailure, FieldRejection, RejectReason};
use crate::fields::{FieldValue, NameKey};
use crate::invid::{FieldId, Invid};
use crate::namespace::{DBNameSpace, FieldLocation};
use crate::object::{DBObject, EditHandle};
use crate::object_base::DBObjectBase;
use crate::schema::FieldDef;
use crate::store::DBStore;
use ahash::AHashSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::Display;
use tracing::trace;

/// Where an edited object is headed at commit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ObjectStatus {
    /// New in this transaction; inserted at commit.
    Creating,
    /// Checked out from committed state; replaces it at commit.
    Editing,
    /// Committed object marked for deletion; removed at commit.
    Deleting,
    /// Created and then deleted in this transaction; nothing happens at commit.
    Dropping,
}

/// Per-base customization of the commit protocol.
pub trait EditHooks: Send + Sync {
    /// Final validation before anything is written. An error aborts the whole transaction.
    fn commit_phase1(&self, object: &DBEditObject) -> Result<(), String> {
        let _ = object;
        Ok(())
    }

    /// Side effects once the transaction is durable. Cannot fail.
    fn commit_phase2(&self, object: &DBEditObject) {
        let _ = object;
    }
}

/// The objects a transaction is creating, shared with each of its edit objects so a link can
/// name a new object before it is committed.
pub(crate) type Creations = Arc<Mutex<AHashSet<Invid>>>;

/// A transaction's private, mutable copy of an object.
pub struct DBEditObject {
    store: Arc<DBStore>,
    base: Arc<DBObjectBase>,
    invid: Invid,
    handle: EditHandle,
    creations: Creations,
    status: ObjectStatus,
    original: Option<Arc<DBObject>>,
    fields: BTreeMap<FieldId, FieldValue>,
}

impl DBEditObject {
    pub(crate) fn creating(
        store: Arc<DBStore>,
        base: Arc<DBObjectBase>,
        invid: Invid,
        handle: EditHandle,
        creations: Creations,
    ) -> Self {
        Self {
            store,
            base,
            invid,
            handle,
            creations,
            status: ObjectStatus::Creating,
            original: None,
            fields: BTreeMap::new(),
        }
    }

    pub(crate) fn checked_out(
        store: Arc<DBStore>,
        base: Arc<DBObjectBase>,
        original: Arc<DBObject>,
        handle: EditHandle,
        creations: Creations,
        status: ObjectStatus,
    ) -> Self {
        Self {
            store,
            base,
            invid: original.invid(),
            handle,
            creations,
            status,
            fields: original.fields().clone(),
            original: Some(original),
        }
    }

    pub fn invid(&self) -> Invid {
        self.invid
    }

    pub fn status(&self) -> ObjectStatus {
        self.status
    }

    pub fn original(&self) -> Option<&Arc<DBObject>> {
        self.original.as_ref()
    }

    pub fn handle(&self) -> EditHandle {
        self.handle
    }

    pub fn base(&self) -> &Arc<DBObjectBase> {
        &self.base
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldValue> {
        self.fields.get(&id)
    }

    pub fn fields(&self) -> &BTreeMap<FieldId, FieldValue> {
        &self.fields
    }

    pub(crate) fn set_status(&mut self, status: ObjectStatus) {
        self.status = status;
    }

    pub(crate) fn restore(&mut self, status: ObjectStatus, fields: BTreeMap<FieldId, FieldValue>) {
        self.status = status;
        self.fields = fields;
    }

    fn writable_def(&self, id: FieldId) -> Result<FieldDef, FieldRejection> {
        if matches!(self.status, ObjectStatus::Deleting | ObjectStatus::Dropping) {
            return Err(FieldRejection::new(id, RejectReason::ObjectDeleted));
        }
        self.base
            .def()
            .field(id)
            .cloned()
            .ok_or(FieldRejection::new(id, RejectReason::UnknownField))
    }

    /// Set field `id`, checking the value against the field definition, claiming it in the
    /// field's namespace, and delete-locking link targets of asymmetric fields.
    pub fn set_field(
        &mut self,
        id: FieldId,
        value: impl Into<FieldValue>,
    ) -> Result<(), FieldRejection> {
        let value = value.into();
        let def = self.writable_def(id)?;
        def.validate(&value)
            .map_err(|reason| FieldRejection::new(id, reason))?;

        let rebind = self.rebind_namespace(&def, Some(&value))?;
        if let Err(rejection) = self.lock_link_targets(&def, &value) {
            if let Some(rebind) = rebind {
                rebind.undo(self.handle, self.location(id));
            }
            return Err(rejection);
        }
        trace!(invid = %self.invid, field = id, value = %summarize(&value), "field set");
        self.fields.insert(id, value);
        Ok(())
    }

    /// Remove field `id`, releasing any namespace values it held.
    pub fn clear_field(&mut self, id: FieldId) -> Result<(), FieldRejection> {
        let def = self.writable_def(id)?;
        self.rebind_namespace(&def, None)?;
        self.fields.remove(&id);
        Ok(())
    }

    fn location(&self, id: FieldId) -> FieldLocation {
        FieldLocation::new(self.invid, id)
    }

    fn namespace_for(&self, def: &FieldDef) -> Option<Arc<DBNameSpace>> {
        def.namespace
            .as_deref()
            .and_then(|name| self.store.namespace(name))
    }

    /// Move this field's namespace claims from its current value to `next`.
    fn rebind_namespace(
        &self,
        def: &FieldDef,
        next: Option<&FieldValue>,
    ) -> Result<Option<Rebind>, FieldRejection> {
        let Some(namespace) = self.namespace_for(def) else {
            return Ok(None);
        };
        let ci = namespace.is_case_insensitive();
        let old = self
            .fields
            .get(&def.id)
            .map(|v| v.name_keys(ci))
            .unwrap_or_default();
        let new = next.map(|v| v.name_keys(ci)).unwrap_or_default();

        let conflict = |key: &NameKey| {
            FieldRejection::new(
                def.id,
                RejectReason::NamespaceConflict {
                    namespace: namespace.name().to_string(),
                    value: key.to_string(),
                },
            )
        };
        if let Some(dup) = new
            .iter()
            .enumerate()
            .find(|(i, k)| new[..*i].contains(k))
            .map(|(_, k)| k)
        {
            return Err(conflict(dup));
        }

        let mut rebind = Rebind {
            namespace: namespace.clone(),
            unmarked: vec![],
            marked: vec![],
        };
        let tx = self.handle.tx;
        for key in old.iter().filter(|k| !new.contains(k)) {
            if namespace.unmark(tx, key) {
                rebind.unmarked.push(key.clone());
            }
        }
        for key in new.iter().filter(|k| !old.contains(k)) {
            if !namespace.mark(tx, key, self.location(def.id)) {
                rebind.undo(self.handle, self.location(def.id));
                return Err(conflict(key));
            }
            rebind.marked.push(key.clone());
        }
        Ok(Some(rebind))
    }

    fn lock_link_targets(&self, def: &FieldDef, value: &FieldValue) -> Result<(), FieldRejection> {
        if !def.asymmetric {
            return Ok(());
        }
        let current: Vec<Invid> = self
            .fields
            .get(&def.id)
            .map(|v| v.values().iter().filter_map(|v| v.as_invid()).collect())
            .unwrap_or_default();
        for target in value.values().iter().filter_map(|v| v.as_invid()) {
            if current.contains(&target) {
                continue;
            }
            let reject = |reason| FieldRejection::new(def.id, reason);
            let Some(base) = self.store.base(target.type_id()) else {
                return Err(reject(RejectReason::NoSuchTarget(target)));
            };
            if base.get(target.num()).is_none() {
                // Not committed: acceptable only if this transaction is creating it.
                if !self.creations.lock().contains(&target) {
                    return Err(reject(RejectReason::NoSuchTarget(target)));
                }
                continue;
            }
            if !self
                .store
                .deletion_manager()
                .delete_lock_object(&base, target, self.handle.session)
            {
                return Err(reject(RejectReason::TargetBeingDeleted(target)));
            }
        }
        Ok(())
    }

    /// Release every namespace value this object's fields hold. Used when the object is
    /// deleted, so the values are free for reuse once the deletion commits.
    pub(crate) fn unmark_all(&self) {
        for def in self.base.def().fields() {
            let Some(namespace) = self.namespace_for(def) else {
                continue;
            };
            let Some(value) = self.fields.get(&def.id) else {
                continue;
            };
            for key in value.name_keys(namespace.is_case_insensitive()) {
                namespace.unmark(self.handle.tx, &key);
            }
        }
    }

    pub fn commit_phase1(&self) -> Result<(), CommitFailure> {
        if matches!(self.status, ObjectStatus::Creating | ObjectStatus::Editing) {
            if let Some(missing) = self
                .base
                .def()
                .fields()
                .find(|def| def.required && !self.fields.contains_key(&def.id))
            {
                return Err(CommitFailure::Rejected {
                    invid: self.invid,
                    rejection: FieldRejection::new(missing.id, RejectReason::Required),
                });
            }
        }
        if let Some(hooks) = self.base.hooks() {
            hooks
                .commit_phase1(self)
                .map_err(|reason| CommitFailure::Vetoed {
                    invid: self.invid,
                    reason,
                })?;
        }
        Ok(())
    }

    /// Check, under the commit's write lock, that every link this object holds lands on an
    /// object that will exist once the transaction commits. `pending` gives the status of
    /// objects this transaction touches.
    pub(crate) fn check_links(
        &self,
        pending: impl Fn(Invid) -> Option<ObjectStatus>,
    ) -> Result<(), CommitFailure> {
        if !matches!(self.status, ObjectStatus::Creating | ObjectStatus::Editing) {
            return Ok(());
        }
        for def in self.base.def().fields().filter(|def| def.asymmetric) {
            let Some(value) = self.fields.get(&def.id) else {
                continue;
            };
            for target in value.values().iter().filter_map(|v| v.as_invid()) {
                let reason = match pending(target) {
                    Some(ObjectStatus::Creating | ObjectStatus::Editing) => continue,
                    Some(ObjectStatus::Deleting) => RejectReason::TargetBeingDeleted(target),
                    Some(ObjectStatus::Dropping) => RejectReason::NoSuchTarget(target),
                    None if self.store.view_object(target).is_some() => continue,
                    None => RejectReason::NoSuchTarget(target),
                };
                return Err(CommitFailure::Rejected {
                    invid: self.invid,
                    rejection: FieldRejection::new(def.id, reason),
                });
            }
        }
        Ok(())
    }

    pub fn commit_phase2(&self) {
        if let Some(hooks) = self.base.hooks() {
            hooks.commit_phase2(self);
        }
    }

    /// The committed object this edit becomes.
    pub fn to_object(&self) -> DBObject {
        DBObject::new(self.invid, self.fields.clone())
    }

    /// Undo this object's checkout. Namespace claims are released separately, per transaction.
    pub(crate) fn release(&self) {
        let num = self.invid.num();
        match self.status {
            ObjectStatus::Editing => {
                self.base.clear_shadow(num, self.handle);
            }
            ObjectStatus::Deleting => {
                self.base.clear_deletion_mark(num, self.handle);
            }
            ObjectStatus::Creating | ObjectStatus::Dropping => self.base.release_id(num),
        }
    }
}

impl std::fmt::Debug for DBEditObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBEditObject")
            .field("invid", &self.invid)
            .field("status", &self.status)
            .field("handle", &self.handle)
            .field("fields", &self.fields)
            .finish()
    }
}

fn summarize(value: &FieldValue) -> String {
    match value {
        FieldValue::Scalar(v) => v.to_string(),
        FieldValue::Vector(vs) => format!("[{} values]", vs.len()),
    }
}

/// Namespace changes made by one `set_field`, kept so they can be reversed if a later check
/// rejects the value.
struct Rebind {
    namespace: Arc<DBNameSpace>,
    unmarked: Vec<NameKey>,
    marked: Vec<NameKey>,
}

impl Rebind {
    fn undo(&self, handle: EditHandle, location: FieldLocation) {
        for key in &self.marked {
            self.namespace.unmark(handle.tx, key);
        }
        for key in &self.unmarked {
            self.namespace.mark(handle.tx, key, location);
        }
    }
}
