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

use crate::edit_object::EditHooks;
use crate::encode::{BinaryRead, BinaryWrite, DecodingError, EncodingError};
use crate::invid::{BaseId, Invid};
use crate::object::{CheckoutState, DBObject, EditHandle};
use crate::schema::BaseDef;
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::warn;

struct ObjectSlot {
    object: Arc<DBObject>,
    state: CheckoutState,
}

/// The live objects of one type, along with that type's field dictionary and id allocator.
pub struct DBObjectBase {
    def: BaseDef,
    max_id: Mutex<i32>,
    objects: RwLock<AHashMap<i32, ObjectSlot>>,
    hooks: RwLock<Option<Arc<dyn EditHooks>>>,
}

impl DBObjectBase {
    pub fn new(def: BaseDef) -> Self {
        Self {
            def,
            max_id: Mutex::new(0),
            objects: RwLock::new(AHashMap::new()),
            hooks: RwLock::new(None),
        }
    }

    pub fn def(&self) -> &BaseDef {
        &self.def
    }

    pub fn type_id(&self) -> BaseId {
        self.def.type_id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn set_hooks(&self, hooks: Arc<dyn EditHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    pub fn hooks(&self) -> Option<Arc<dyn EditHooks>> {
        self.hooks.read().clone()
    }

    pub fn get_next_id(&self) -> i32 {
        let mut max_id = self.max_id.lock();
        *max_id += 1;
        *max_id
    }

    /// Give back an id allocated by `get_next_id`. Only the most recent allocation can be
    /// undone; any other id stays consumed.
    pub fn release_id(&self, id: i32) {
        let mut max_id = self.max_id.lock();
        if *max_id == id {
            *max_id -= 1;
        }
    }

    pub fn max_id(&self) -> i32 {
        *self.max_id.lock()
    }

    pub fn get(&self, num: i32) -> Option<Arc<DBObject>> {
        self.objects.read().get(&num).map(|s| s.object.clone())
    }

    pub fn checkout_state(&self, num: i32) -> Option<CheckoutState> {
        self.objects.read().get(&num).map(|s| s.state)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Every committed object, in id order.
    pub fn objects(&self) -> Vec<Arc<DBObject>> {
        let objects = self.objects.read();
        let mut all: Vec<_> = objects.values().map(|s| s.object.clone()).collect();
        all.sort_by_key(|o| o.id());
        all
    }

    /// Check the object out for editing by `handle`. `None` if it doesn't exist or someone
    /// already has it.
    pub fn create_shadow(&self, num: i32, handle: EditHandle) -> Option<Arc<DBObject>> {
        let mut objects = self.objects.write();
        let slot = objects.get_mut(&num)?;
        if slot.state != CheckoutState::Committed {
            return None;
        }
        slot.state = CheckoutState::CheckedOutBy(handle);
        Some(slot.object.clone())
    }

    pub fn clear_shadow(&self, num: i32, handle: EditHandle) -> bool {
        self.transition(num, handle, CheckoutState::Committed)
    }

    /// Mark the object for deletion by `handle`, either from the committed state or from a
    /// checkout the same transaction already holds. Returns the committed version that was
    /// marked.
    pub fn mark_as_deleted(&self, num: i32, handle: EditHandle) -> Option<Arc<DBObject>> {
        let mut objects = self.objects.write();
        let slot = objects.get_mut(&num)?;
        match slot.state {
            CheckoutState::Committed => {}
            CheckoutState::CheckedOutBy(h) if h.tx == handle.tx => {}
            _ => return None,
        }
        slot.state = CheckoutState::PendingDeletion(handle);
        Some(slot.object.clone())
    }

    pub fn clear_deletion_mark(&self, num: i32, handle: EditHandle) -> bool {
        self.transition(num, handle, CheckoutState::Committed)
    }

    /// Return an object marked for deletion to a plain checkout by the same transaction.
    pub fn revert_deletion_mark(&self, num: i32, handle: EditHandle) -> bool {
        self.transition(num, handle, CheckoutState::CheckedOutBy(handle))
    }

    fn transition(&self, num: i32, handle: EditHandle, next: CheckoutState) -> bool {
        let mut objects = self.objects.write();
        let Some(slot) = objects.get_mut(&num) else {
            return false;
        };
        match slot.state.holder() {
            Some(h) if h.tx == handle.tx => {
                slot.state = next;
                true
            }
            _ => {
                warn!(base = self.name(), num, ?handle, state = ?slot.state, "checkout state mismatch");
                false
            }
        }
    }

    /// Put a committed object in place, replacing any previous version and clearing its checkout.
    pub fn install(&self, object: DBObject) {
        let num = object.id();
        {
            let mut max_id = self.max_id.lock();
            if num > *max_id {
                *max_id = num;
            }
        }
        self.objects.write().insert(
            num,
            ObjectSlot {
                object: Arc::new(object),
                state: CheckoutState::Committed,
            },
        );
    }

    pub fn remove(&self, num: i32) -> Option<Arc<DBObject>> {
        self.objects.write().remove(&num).map(|s| s.object)
    }

    pub fn contains(&self, invid: Invid) -> bool {
        invid.type_id() == self.type_id() && self.objects.read().contains_key(&invid.num())
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W) -> Result<(), EncodingError> {
        self.def.emit(out)?;
        out.write_i32(self.max_id())?;
        let objects = self.objects();
        out.write_count32(objects.len())?;
        for object in objects {
            object.emit(out)?;
        }
        Ok(())
    }

    pub fn receive<R: Read + ?Sized>(input: &mut R) -> Result<Self, DecodingError> {
        let def = BaseDef::receive(input)?;
        let max_id = input.read_i32()?;
        let count = input.read_count32()?;
        let base = DBObjectBase::new(def);
        for _ in 0..count {
            let object = DBObject::receive(&base.def, input)?;
            base.install(object);
        }
        let mut current = base.max_id.lock();
        *current = (*current).max(max_id);
        drop(current);
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{SessionId, TxId};
    use std::collections::BTreeMap;

    fn handle(tx: u64) -> EditHandle {
        EditHandle {
            tx: TxId(tx),
            session: SessionId(tx),
        }
    }

    fn base_with_object() -> DBObjectBase {
        let base = DBObjectBase::new(BaseDef::new(3, "user"));
        let id = base.get_next_id();
        base.install(DBObject::new(Invid::new(3, id), BTreeMap::new()));
        base
    }

    #[test]
    fn test_release_id_only_undoes_last() {
        let base = DBObjectBase::new(BaseDef::new(3, "user"));
        let a = base.get_next_id();
        let b = base.get_next_id();
        base.release_id(a);
        assert_eq!(base.max_id(), b);
        base.release_id(b);
        assert_eq!(base.max_id(), a);
        assert_eq!(base.get_next_id(), b);
    }

    #[test]
    fn test_no_double_checkout() {
        let base = base_with_object();
        assert!(base.create_shadow(1, handle(1)).is_some());
        assert!(base.create_shadow(1, handle(2)).is_none());
        assert!(base.mark_as_deleted(1, handle(2)).is_none());
        assert!(!base.clear_shadow(1, handle(2)));
        assert!(base.clear_shadow(1, handle(1)));
        assert!(base.create_shadow(1, handle(2)).is_some());
    }

    #[test]
    fn test_checked_out_object_can_be_marked_by_owner() {
        let base = base_with_object();
        base.create_shadow(1, handle(1)).unwrap();
        assert!(base.mark_as_deleted(1, handle(1)).is_some());
        assert_eq!(
            base.checkout_state(1),
            Some(CheckoutState::PendingDeletion(handle(1)))
        );
        assert!(base.revert_deletion_mark(1, handle(1)));
        assert_eq!(
            base.checkout_state(1),
            Some(CheckoutState::CheckedOutBy(handle(1)))
        );
    }

    #[test]
    fn test_receive_restores_objects_and_max_id() {
        let base = base_with_object();
        base.get_next_id();
        let mut buf = Vec::new();
        base.emit(&mut buf).unwrap();
        let loaded = DBObjectBase::receive(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.max_id(), 2);
        assert_eq!(loaded.checkout_state(1), Some(CheckoutState::Committed));
    }
}
