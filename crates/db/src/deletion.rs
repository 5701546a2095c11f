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

//! Advisory delete-locks. A session that links to an object registers an interest in it, and
//! while any other session holds an interest nobody may start deleting it. Interests never
//! retroactively block a deletion already in progress.
//!
//! Lock order: the deletion manager's mutex is always taken before any object base's.

use crate::error::DeletionDenied;
use crate::invid::Invid;
use crate::object::{CheckoutState, DBObject, EditHandle, SessionId};
use crate::object_base::DBObjectBase;
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

#[derive(Default)]
struct Registry {
    by_session: AHashMap<SessionId, AHashSet<Invid>>,
    by_object: AHashMap<Invid, AHashSet<SessionId>>,
}

impl Registry {
    fn insert(&mut self, session: SessionId, invid: Invid) {
        self.by_session.entry(session).or_default().insert(invid);
        self.by_object.entry(invid).or_default().insert(session);
    }

    fn remove(&mut self, session: SessionId, invid: Invid) {
        if let Some(set) = self.by_session.get_mut(&session) {
            set.remove(&invid);
            if set.is_empty() {
                self.by_session.remove(&session);
            }
        }
        let Some(sessions) = self.by_object.get_mut(&invid) else {
            panic!("deletion registry desync: {session} holds {invid} with no reverse entry");
        };
        sessions.remove(&session);
        if sessions.is_empty() {
            self.by_object.remove(&invid);
        }
    }
}

#[derive(Default)]
pub struct DBDeletionManager {
    registry: Mutex<Registry>,
}

impl DBDeletionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`'s interest in keeping `invid` alive. Refused only if another session
    /// already has the object marked for deletion. Registering twice is harmless.
    pub fn delete_lock_object(
        &self,
        base: &DBObjectBase,
        invid: Invid,
        session: SessionId,
    ) -> bool {
        let mut registry = self.registry.lock();
        if let Some(CheckoutState::PendingDeletion(h)) = base.checkout_state(invid.num())
            && h.session != session
        {
            trace!(%invid, %session, deleter = %h.session, "delete-lock refused");
            return false;
        }
        registry.insert(session, invid);
        true
    }

    /// Move a committed object into deletion on behalf of `handle`. Refused if any other
    /// session holds an interest in it. Returns the committed version that was marked.
    pub fn set_delete_status(
        &self,
        base: &DBObjectBase,
        invid: Invid,
        handle: EditHandle,
    ) -> Result<Arc<DBObject>, DeletionDenied> {
        let registry = self.registry.lock();
        Self::check_interest(&registry, invid, handle)?;
        if let Some(original) = base.mark_as_deleted(invid.num(), handle) {
            return Ok(original);
        }
        match base.checkout_state(invid.num()) {
            None => Err(DeletionDenied::NoSuchObject(invid)),
            Some(CheckoutState::PendingDeletion(_)) => Err(DeletionDenied::BeingDeleted(invid)),
            Some(_) => Err(DeletionDenied::CheckedOut(invid)),
        }
    }

    /// Drop an object created in the same transaction, which has no committed state to mark.
    pub fn set_drop_status(&self, invid: Invid, handle: EditHandle) -> Result<(), DeletionDenied> {
        Self::check_interest(&self.registry.lock(), invid, handle)
    }

    fn check_interest(
        registry: &Registry,
        invid: Invid,
        handle: EditHandle,
    ) -> Result<(), DeletionDenied> {
        match registry.by_object.get(&invid) {
            Some(sessions) if sessions.iter().any(|s| *s != handle.session) => {
                Err(DeletionDenied::DeleteLocked(invid))
            }
            _ => Ok(()),
        }
    }

    pub fn is_delete_locked(&self, invid: Invid) -> bool {
        self.registry.lock().by_object.contains_key(&invid)
    }

    /// The sessions holding an interest in `invid`.
    pub fn lockers(&self, invid: Invid) -> Vec<SessionId> {
        let registry = self.registry.lock();
        let mut sessions: Vec<_> = registry
            .by_object
            .get(&invid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sessions.sort();
        sessions
    }

    /// Drop every interest `session` holds.
    pub fn release_session(&self, session: SessionId) {
        let mut registry = self.registry.lock();
        let Some(held) = registry.by_session.remove(&session) else {
            return;
        };
        for invid in held {
            if let Some(sessions) = registry.by_object.get_mut(&invid) {
                sessions.remove(&session);
                if sessions.is_empty() {
                    registry.by_object.remove(&invid);
                }
            }
        }
    }

    pub fn get_session_checkpoint(&self, session: SessionId) -> AHashSet<Invid> {
        self.registry
            .lock()
            .by_session
            .get(&session)
            .cloned()
            .unwrap_or_default()
    }

    /// Shrink `session`'s interests back to `checkpoint`. Interests can only be dropped here;
    /// a checkpoint naming an object the session no longer holds means the registry has lost
    /// track of it.
    pub fn revert_session_checkpoint(&self, session: SessionId, checkpoint: &AHashSet<Invid>) {
        let mut registry = self.registry.lock();
        let current = registry.by_session.get(&session).cloned().unwrap_or_default();
        if let Some(missing) = checkpoint.iter().find(|i| !current.contains(i)) {
            panic!("{session} reverting to a delete-lock checkpoint holding {missing}, which it no longer holds");
        }
        for invid in current.difference(checkpoint) {
            registry.remove(session, *invid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{DBObject, TxId};
    use crate::schema::BaseDef;
    use std::collections::BTreeMap;

    fn handle(n: u64) -> EditHandle {
        EditHandle {
            tx: TxId(n),
            session: SessionId(n),
        }
    }

    fn base() -> DBObjectBase {
        let base = DBObjectBase::new(BaseDef::new(3, "user"));
        base.install(DBObject::new(Invid::new(3, 1), BTreeMap::new()));
        base
    }

    #[test]
    fn test_interest_blocks_new_deletions() {
        let dm = DBDeletionManager::new();
        let base = base();
        let x = Invid::new(3, 1);
        assert!(dm.delete_lock_object(&base, x, SessionId(2)));
        assert!(dm.delete_lock_object(&base, x, SessionId(2)));
        assert_eq!(
            dm.set_delete_status(&base, x, handle(3)),
            Err(DeletionDenied::DeleteLocked(x))
        );
        assert_eq!(
            dm.set_drop_status(x, handle(3)),
            Err(DeletionDenied::DeleteLocked(x))
        );
        // The interested session itself may delete.
        let marked = dm.set_delete_status(&base, x, handle(2)).unwrap();
        assert_eq!(marked.invid(), x);
        assert_eq!(
            base.checkout_state(1),
            Some(CheckoutState::PendingDeletion(handle(2)))
        );
    }

    #[test]
    fn test_missing_object_cannot_be_marked() {
        let dm = DBDeletionManager::new();
        let base = base();
        let missing = Invid::new(3, 9);
        assert_eq!(
            dm.set_delete_status(&base, missing, handle(1)),
            Err(DeletionDenied::NoSuchObject(missing))
        );
        assert_eq!(base.checkout_state(9), None);
    }

    #[test]
    fn test_interest_refused_once_deleting() {
        let dm = DBDeletionManager::new();
        let base = base();
        let x = Invid::new(3, 1);
        dm.set_delete_status(&base, x, handle(1)).unwrap();
        assert!(!dm.delete_lock_object(&base, x, SessionId(2)));
        assert!(dm.delete_lock_object(&base, x, SessionId(1)));
    }

    #[test]
    fn test_checkpoint_shrinks() {
        let dm = DBDeletionManager::new();
        let base = base();
        let x = Invid::new(3, 1);
        let y = Invid::new(3, 2);
        dm.delete_lock_object(&base, x, SessionId(1));
        let checkpoint = dm.get_session_checkpoint(SessionId(1));
        dm.delete_lock_object(&base, y, SessionId(1));
        dm.revert_session_checkpoint(SessionId(1), &checkpoint);
        assert!(dm.is_delete_locked(x));
        assert!(!dm.is_delete_locked(y));

        dm.release_session(SessionId(1));
        assert!(!dm.is_delete_locked(x));
        assert!(dm.get_session_checkpoint(SessionId(1)).is_empty());
    }

    #[test]
    #[should_panic]
    fn test_checkpoint_cannot_grow() {
        let dm = DBDeletionManager::new();
        let mut checkpoint = AHashSet::new();
        checkpoint.insert(Invid::new(3, 9));
        dm.revert_session_checkpoint(SessionId(1), &checkpoint);
    }
}
