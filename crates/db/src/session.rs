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

use crate::edit_set::DBEditSet;
use crate::error::SessionError;
use crate::invid::{BaseId, Invid};
use crate::locks::{DBDumpLock, DBReadLock, DBSessionLockManager};
use crate::object::{DBObject, SessionId};
use crate::store::DBStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// A client's handle on the store. Holds its locks and at most one open transaction.
pub struct DBSession {
    store: Arc<DBStore>,
    id: SessionId,
    key: String,
    locks: DBSessionLockManager,
    tx_open: Arc<AtomicBool>,
}

impl DBSession {
    pub(crate) fn new(store: Arc<DBStore>, id: SessionId, key: &str) -> Self {
        let locks = DBSessionLockManager::new(store.lock_manager().clone(), id);
        Self {
            store,
            id,
            key: key.to_string(),
            locks,
            tx_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &Arc<DBStore> {
        &self.store
    }

    pub fn locks(&self) -> &DBSessionLockManager {
        &self.locks
    }

    pub fn is_transaction_open(&self) -> bool {
        self.tx_open.load(Ordering::SeqCst)
    }

    pub fn open_transaction(&self, description: &str) -> Result<DBEditSet, SessionError> {
        if self.tx_open.swap(true, Ordering::SeqCst) {
            return Err(SessionError::TransactionOpen);
        }
        Ok(DBEditSet::new(
            self.store.clone(),
            self.id,
            description,
            self.tx_open.clone(),
        ))
    }

    /// The committed state of `invid`, ignoring any uncommitted edits.
    pub fn view_object(&self, invid: Invid) -> Option<Arc<DBObject>> {
        self.store.view_object(invid)
    }

    pub fn open_read_lock(&self, bases: Vec<BaseId>) -> Result<DBReadLock, SessionError> {
        self.locks.open_read_lock(bases)
    }

    pub fn open_dump_lock(&self) -> Result<DBDumpLock, SessionError> {
        self.locks.open_dump_lock()
    }

    /// Give up every lock and delete-lock the session holds. An open transaction is
    /// released when its `DBEditSet` is dropped.
    pub fn logout(self) {
        self.locks.release_all();
        self.store.deletion_manager().release_session(self.id);
        info!(id = %self.id, key = %self.key, "session logout");
    }
}
