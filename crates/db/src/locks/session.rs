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

use crate::error::SessionError;
use crate::invid::BaseId;
use crate::locks::{DBDumpLock, DBLock, DBReadLock, DBWriteLock, LockKind, LockManager};
use crate::object::SessionId;
use std::sync::Arc;

/// Per-session front end to the lock manager. A session holds locks of a single kind at a
/// time, and its read locks may not overlap its write lock; requests breaking either rule fail
/// at once instead of deadlocking against the session's own locks.
pub struct DBSessionLockManager {
    manager: Arc<LockManager>,
    key: SessionId,
}

impl DBSessionLockManager {
    pub fn new(manager: Arc<LockManager>, key: SessionId) -> Self {
        Self { manager, key }
    }

    fn check(&self, kind: LockKind, bases: &[BaseId]) -> Result<(), SessionError> {
        let held = self.manager.locks_for_key(self.key);
        if kind == LockKind::Read
            && held
                .iter()
                .any(|l| l.kind == LockKind::Write && l.bases.iter().any(|b| bases.contains(b)))
        {
            return Err(SessionError::OverlapsWriteLock);
        }
        match held.iter().find(|l| l.kind != kind || kind != LockKind::Read) {
            Some(conflict) => Err(SessionError::LockClassConflict(conflict.kind)),
            None => Ok(()),
        }
    }

    pub fn open_read_lock(&self, bases: Vec<BaseId>) -> Result<DBReadLock, SessionError> {
        self.check(LockKind::Read, &bases)?;
        let mut lock = DBReadLock::new(&self.manager, self.key, bases)?;
        lock.establish()?;
        Ok(lock)
    }

    pub fn open_write_lock(&self, bases: Vec<BaseId>) -> Result<DBWriteLock, SessionError> {
        self.check(LockKind::Write, &bases)?;
        let mut lock = DBWriteLock::new(&self.manager, self.key, bases)?;
        lock.establish()?;
        Ok(lock)
    }

    pub fn open_dump_lock(&self) -> Result<DBDumpLock, SessionError> {
        self.check(LockKind::Dump, &[])?;
        let mut lock = DBDumpLock::new(&self.manager, self.key)?;
        lock.establish()?;
        Ok(lock)
    }

    /// Whether this session holds any lock covering `base`.
    pub fn is_locked(&self, base: BaseId) -> bool {
        self.manager
            .locks_for_key(self.key)
            .iter()
            .any(|l| l.locked && l.bases.contains(&base))
    }

    pub fn held(&self) -> usize {
        self.manager
            .locks_for_key(self.key)
            .iter()
            .filter(|l| l.locked)
            .count()
    }

    /// Abort every lock this session holds or is waiting on.
    pub fn release_all(&self) {
        self.manager.abort_key(self.key);
    }
}
