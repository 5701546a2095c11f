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

//! Unique-value registries. A namespace maps each value bound by some field to a handle
//! recording which committed field holds it, and which transaction (if any) is currently
//! claiming or releasing it.
//!
//! A value is owned by at most one transaction at a time. The owning transaction sees its own
//! shadow binding; everyone else sees the committed binding until the owner commits or aborts.

use crate::fields::NameKey;
use crate::invid::{FieldId, Invid};
use crate::object::TxId;
use ahash::AHashMap;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};

/// A field on a particular object: where a namespace value is bound.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FieldLocation {
    pub invid: Invid,
    pub field: FieldId,
}

impl FieldLocation {
    pub fn new(invid: Invid, field: FieldId) -> Self {
        Self { invid, field }
    }
}

impl Display for FieldLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.invid, self.field)
    }
}

/// The state of one value in a namespace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DBNameSpaceHandle {
    owner: Option<TxId>,
    original: bool,
    inuse: bool,
    reserved: bool,
    persistent: Option<FieldLocation>,
    shadow: Option<FieldLocation>,
}

impl DBNameSpaceHandle {
    fn committed(location: FieldLocation) -> Self {
        Self {
            owner: None,
            original: true,
            inuse: true,
            reserved: false,
            persistent: Some(location),
            shadow: None,
        }
    }

    fn fresh(tx: TxId) -> Self {
        Self {
            owner: Some(tx),
            original: false,
            inuse: false,
            reserved: false,
            persistent: None,
            shadow: None,
        }
    }

    /// The transaction currently claiming or releasing this value.
    pub fn owner(&self) -> Option<TxId> {
        self.owner
    }

    /// Whether the value was in use before its owning transaction touched it.
    pub fn is_original(&self) -> bool {
        self.original
    }

    pub fn is_in_use(&self) -> bool {
        self.inuse
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// The committed field this value is bound to.
    pub fn persistent(&self) -> Option<FieldLocation> {
        self.persistent
    }

    /// The field the owning transaction has bound this value to.
    pub fn shadow(&self) -> Option<FieldLocation> {
        self.shadow
    }

    fn owned_by_other(&self, tx: TxId) -> bool {
        matches!(self.owner, Some(owner) if owner != tx)
    }
}

#[derive(Default)]
struct TxRecord {
    touched: IndexSet<NameKey>,
    checkpoints: Vec<(String, Vec<(NameKey, DBNameSpaceHandle)>)>,
}

#[derive(Default)]
struct NameSpaceState {
    handles: AHashMap<NameKey, DBNameSpaceHandle>,
    transactions: AHashMap<TxId, TxRecord>,
}

impl NameSpaceState {
    /// Take ownership of the handle for `key` on behalf of `tx`, creating it if necessary.
    /// Fails if another transaction already owns it.
    fn claim(&mut self, tx: TxId, key: &NameKey) -> Option<&mut DBNameSpaceHandle> {
        let handle = self
            .handles
            .entry(key.clone())
            .or_insert_with(|| DBNameSpaceHandle::fresh(tx));
        if handle.owned_by_other(tx) {
            return None;
        }
        if handle.owner.is_none() {
            handle.owner = Some(tx);
            handle.original = handle.inuse;
        }
        self.transactions
            .entry(tx)
            .or_default()
            .touched
            .insert(key.clone());
        self.handles.get_mut(key)
    }

    /// Put `key` back the way it was before `tx` touched it.
    fn revert(&mut self, key: &NameKey) {
        let Some(handle) = self.handles.get_mut(key) else {
            return;
        };
        if handle.original {
            handle.owner = None;
            handle.inuse = true;
            handle.reserved = false;
            handle.shadow = None;
        } else {
            self.handles.remove(key);
        }
    }
}

pub struct DBNameSpace {
    name: String,
    case_insensitive: bool,
    state: Mutex<NameSpaceState>,
}

impl DBNameSpace {
    pub fn new(name: &str, case_insensitive: bool) -> Self {
        Self {
            name: name.to_string(),
            case_insensitive,
            state: Mutex::new(NameSpaceState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn len(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().handles.is_empty()
    }

    /// A copy of the handle for `key`, if the value is known to the namespace.
    pub fn handle(&self, key: &NameKey) -> Option<DBNameSpaceHandle> {
        self.state.lock().handles.get(key).cloned()
    }

    /// Bind a committed value at load time. False if the value is already bound.
    pub fn register(&self, key: NameKey, location: FieldLocation) -> bool {
        let mut state = self.state.lock();
        if state.handles.contains_key(&key) {
            return false;
        }
        state
            .handles
            .insert(key, DBNameSpaceHandle::committed(location));
        true
    }

    /// Forget every binding and every transaction record.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.handles.clear();
        state.transactions.clear();
    }

    /// Whether `tx` could mark `key` right now.
    pub fn testmark(&self, tx: TxId, key: &NameKey) -> bool {
        Self::can_mark(&self.state.lock(), tx, key)
    }

    /// Bind `key` to `location` on behalf of `tx`. Fails if the value is in use (by this
    /// transaction or in committed state) or claimed by another transaction.
    pub fn mark(&self, tx: TxId, key: &NameKey, location: FieldLocation) -> bool {
        let mut state = self.state.lock();
        if !Self::can_mark(&state, tx, key) {
            return false;
        }
        let Some(handle) = state.claim(tx, key) else {
            return false;
        };
        handle.inuse = true;
        handle.shadow = Some(location);
        true
    }

    fn can_mark(state: &NameSpaceState, tx: TxId, key: &NameKey) -> bool {
        match state.handles.get(key) {
            None => true,
            Some(handle) => !handle.owned_by_other(tx) && !handle.inuse,
        }
    }

    /// Release `key` on behalf of `tx`. The value stays claimed by `tx` until commit, so no
    /// other transaction can take it in the meantime.
    pub fn unmark(&self, tx: TxId, key: &NameKey) -> bool {
        let mut state = self.state.lock();
        if !state.handles.contains_key(key) {
            return false;
        }
        let Some(handle) = state.claim(tx, key) else {
            return false;
        };
        handle.inuse = false;
        handle.shadow = None;
        true
    }

    /// Claim `key` for `tx` without binding it to a field.
    pub fn reserve(&self, tx: TxId, key: &NameKey) -> bool {
        let mut state = self.state.lock();
        if let Some(handle) = state.handles.get(key)
            && handle.owner.is_none()
            && handle.inuse
        {
            return false;
        }
        let Some(handle) = state.claim(tx, key) else {
            return false;
        };
        handle.reserved = true;
        true
    }

    /// The committed field bound to `key`.
    pub fn lookup_persistent(&self, key: &NameKey) -> Option<FieldLocation> {
        self.state
            .lock()
            .handles
            .get(key)
            .and_then(|h| h.persistent)
    }

    /// The field a transaction has bound `key` to, if any transaction has.
    pub fn lookup_shadow(&self, key: &NameKey) -> Option<FieldLocation> {
        self.state
            .lock()
            .handles
            .get(key)
            .filter(|h| h.owner.is_some() && h.inuse)
            .and_then(|h| h.shadow)
    }

    pub fn checkpoint(&self, tx: TxId, name: &str) {
        let mut state = self.state.lock();
        let snapshot: Vec<_> = state
            .transactions
            .get(&tx)
            .map(|record| {
                record
                    .touched
                    .iter()
                    .filter_map(|key| state.handles.get(key).map(|h| (key.clone(), h.clone())))
                    .collect()
            })
            .unwrap_or_default();
        state
            .transactions
            .entry(tx)
            .or_default()
            .checkpoints
            .push((name.to_string(), snapshot));
    }

    /// Drop the named checkpoint, and every checkpoint after it, without restoring anything.
    pub fn pop_checkpoint(&self, tx: TxId, name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.transactions.get_mut(&tx) else {
            return false;
        };
        match record.checkpoints.iter().rposition(|(n, _)| n == name) {
            Some(pos) => {
                record.checkpoints.truncate(pos);
                true
            }
            None => false,
        }
    }

    /// Restore every value `tx` has touched to its state at the named checkpoint. Values first
    /// touched after the checkpoint are released.
    pub fn rollback(&self, tx: TxId, name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.transactions.get_mut(&tx) else {
            return false;
        };
        let Some(pos) = record.checkpoints.iter().rposition(|(n, _)| n == name) else {
            return false;
        };
        let Some((_, snapshot)) = record.checkpoints.drain(pos..).next() else {
            return false;
        };
        let touched = std::mem::take(&mut record.touched);

        let restored: AHashMap<_, _> = snapshot.into_iter().collect();
        for key in &touched {
            match restored.get(key) {
                Some(handle) => {
                    state.handles.insert(key.clone(), handle.clone());
                }
                None => state.revert(key),
            }
        }
        if let Some(record) = state.transactions.get_mut(&tx) {
            record.touched = touched
                .into_iter()
                .filter(|k| restored.contains_key(k))
                .collect();
        }
        true
    }

    /// Make `tx`'s bindings the committed ones.
    pub fn commit(&self, tx: TxId) {
        let mut state = self.state.lock();
        let Some(record) = state.transactions.remove(&tx) else {
            return;
        };
        for key in record.touched {
            let Some(handle) = state.handles.get_mut(&key) else {
                continue;
            };
            assert_eq!(
                handle.owner,
                Some(tx),
                "namespace {}: {key} touched by {tx} but owned by {:?}",
                self.name,
                handle.owner
            );
            if handle.inuse {
                handle.persistent = handle.shadow.take();
                handle.owner = None;
                handle.original = true;
                handle.reserved = false;
            } else {
                state.handles.remove(&key);
            }
        }
    }

    /// Undo everything `tx` did to this namespace.
    pub fn abort(&self, tx: TxId) {
        let mut state = self.state.lock();
        let Some(record) = state.transactions.remove(&tx) else {
            return;
        };
        for key in &record.touched {
            state.revert(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> NameKey {
        NameKey::String(s.to_string())
    }

    fn loc(num: i32) -> FieldLocation {
        FieldLocation::new(Invid::new(3, num), 1)
    }

    #[test]
    fn test_one_claimant_per_value() {
        let ns = DBNameSpace::new("username", false);
        assert!(ns.mark(TxId(1), &key("alice"), loc(1)));
        assert!(!ns.testmark(TxId(2), &key("alice")));
        assert!(!ns.mark(TxId(2), &key("alice"), loc(2)));
        // Not even the owner may bind a value twice.
        assert!(!ns.mark(TxId(1), &key("alice"), loc(3)));

        ns.commit(TxId(1));
        let handle = ns.handle(&key("alice")).unwrap();
        assert_eq!(handle.owner(), None);
        assert!(handle.is_in_use());
        assert_eq!(ns.lookup_persistent(&key("alice")), Some(loc(1)));
    }

    #[test]
    fn test_released_value_is_held_until_commit() {
        let ns = DBNameSpace::new("username", false);
        assert!(ns.register(key("alice"), loc(1)));
        assert!(ns.unmark(TxId(1), &key("alice")));
        assert!(!ns.mark(TxId(2), &key("alice"), loc(2)));
        assert_eq!(ns.lookup_persistent(&key("alice")), Some(loc(1)));

        ns.commit(TxId(1));
        assert!(ns.handle(&key("alice")).is_none());
        assert!(ns.mark(TxId(2), &key("alice"), loc(2)));
    }

    #[test]
    fn test_abort_restores_original_binding() {
        let ns = DBNameSpace::new("username", false);
        ns.register(key("alice"), loc(1));
        ns.unmark(TxId(1), &key("alice"));
        ns.mark(TxId(1), &key("bob"), loc(1));
        ns.abort(TxId(1));

        let alice = ns.handle(&key("alice")).unwrap();
        assert!(alice.is_in_use());
        assert_eq!(alice.owner(), None);
        assert_eq!(alice.persistent(), Some(loc(1)));
        assert!(ns.handle(&key("bob")).is_none());
    }

    #[test]
    fn test_rollback_releases_later_claims() {
        let ns = DBNameSpace::new("username", false);
        ns.mark(TxId(1), &key("alice"), loc(1));
        ns.checkpoint(TxId(1), "a");
        ns.mark(TxId(1), &key("bob"), loc(2));
        ns.checkpoint(TxId(1), "b");
        ns.unmark(TxId(1), &key("alice"));

        assert!(ns.rollback(TxId(1), "a"));
        assert!(ns.handle(&key("bob")).is_none());
        assert!(ns.handle(&key("alice")).unwrap().is_in_use());
        // "b" was discarded along with "a".
        assert!(!ns.rollback(TxId(1), "b"));

        ns.commit(TxId(1));
        assert_eq!(ns.lookup_persistent(&key("alice")), Some(loc(1)));
        assert_eq!(ns.len(), 1);
    }

    #[test]
    fn test_reserve_blocks_other_transactions() {
        let ns = DBNameSpace::new("uid", false);
        assert!(ns.reserve(TxId(1), &NameKey::Numeric(1000)));
        assert!(!ns.reserve(TxId(2), &NameKey::Numeric(1000)));
        assert!(ns.testmark(TxId(1), &NameKey::Numeric(1000)));
        ns.abort(TxId(1));
        assert!(ns.reserve(TxId(2), &NameKey::Numeric(1000)));
    }

    #[test]
    fn test_pop_keeps_state() {
        let ns = DBNameSpace::new("username", false);
        ns.checkpoint(TxId(1), "a");
        ns.mark(TxId(1), &key("carol"), loc(4));
        assert!(ns.pop_checkpoint(TxId(1), "a"));
        assert!(!ns.rollback(TxId(1), "a"));
        assert_eq!(ns.lookup_shadow(&key("carol")), Some(loc(4)));
    }
}
