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

mod manager;
mod session;

pub use manager::{BaseQueue, DEFAULT_POLL_INTERVAL, LockId, LockInfo, LockManager};
pub use session::DBSessionLockManager;

use crate::error::LockError;
use crate::invid::BaseId;
use crate::object::SessionId;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LockKind {
    Read,
    Write,
    Dump,
}

/// The contract shared by read, write and dump locks. Locks are not reentrant: a lock is
/// established at most once, and once aborted can never be established.
pub trait DBLock {
    fn kind(&self) -> LockKind;

    fn key(&self) -> SessionId;

    /// Block until the lock is granted. Fails if the lock is aborted while waiting.
    fn establish(&mut self) -> Result<(), LockError>;

    /// As `establish`, giving up after `timeout`.
    fn establish_timeout(&mut self, timeout: Duration) -> Result<(), LockError>;

    /// Give the lock up. Always safe, even if it was never established.
    fn release(&mut self);

    /// Wake a blocked `establish` with failure and poison the lock.
    fn abort(&self);

    fn is_locked(&self) -> bool;

    /// Whether this lock is held and covers `base`.
    fn is_locked_on(&self, base: BaseId) -> bool;

    /// A handle another thread can use to abort this lock.
    fn abort_handle(&self) -> AbortHandle;
}

/// Aborts a lock from another thread, e.g. when its session is being shut down.
#[derive(Clone)]
pub struct AbortHandle {
    manager: Arc<LockManager>,
    id: LockId,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.manager.abort(self.id);
    }
}

struct LockCore {
    manager: Arc<LockManager>,
    id: LockId,
    key: SessionId,
    kind: LockKind,
    bases: Vec<BaseId>,
}

impl LockCore {
    fn new(
        manager: &Arc<LockManager>,
        key: SessionId,
        kind: LockKind,
        bases: Vec<BaseId>,
    ) -> Result<Self, LockError> {
        let id = manager.register(key, kind, bases.clone())?;
        Ok(Self {
            manager: manager.clone(),
            id,
            key,
            kind,
            bases,
        })
    }
}

impl Drop for LockCore {
    fn drop(&mut self) {
        self.manager.forget(self.id);
    }
}

macro_rules! db_lock {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        pub struct $name {
            core: LockCore,
        }

        impl $name {
            pub fn bases(&self) -> &[BaseId] {
                &self.core.bases
            }
        }

        impl DBLock for $name {
            fn kind(&self) -> LockKind {
                self.core.kind
            }

            fn key(&self) -> SessionId {
                self.core.key
            }

            fn establish(&mut self) -> Result<(), LockError> {
                self.core.manager.establish(self.core.id, None)
            }

            fn establish_timeout(&mut self, timeout: Duration) -> Result<(), LockError> {
                self.core.manager.establish(self.core.id, Some(timeout))
            }

            fn release(&mut self) {
                self.core.manager.release(self.core.id);
            }

            fn abort(&self) {
                self.core.manager.abort(self.core.id);
            }

            fn is_locked(&self) -> bool {
                self.core.manager.is_locked(self.core.id)
            }

            fn is_locked_on(&self, base: BaseId) -> bool {
                self.core.bases.contains(&base) && self.is_locked()
            }

            fn abort_handle(&self) -> AbortHandle {
                AbortHandle {
                    manager: self.core.manager.clone(),
                    id: self.core.id,
                }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.core.id)
                    .field("key", &self.core.key)
                    .field("bases", &self.core.bases)
                    .finish()
            }
        }
    };
}

db_lock!(
    DBReadLock,
    "Shared access to a set of bases. Any number of readers may hold a base at once."
);
db_lock!(
    DBWriteLock,
    "Exclusive access to a set of bases, taken by a committing transaction."
);
db_lock!(
    DBDumpLock,
    "Holds back writers on every base while the store is written to disk."
);

impl DBReadLock {
    pub fn new(
        manager: &Arc<LockManager>,
        key: SessionId,
        bases: Vec<BaseId>,
    ) -> Result<Self, LockError> {
        Ok(Self {
            core: LockCore::new(manager, key, LockKind::Read, bases)?,
        })
    }
}

impl DBWriteLock {
    pub fn new(
        manager: &Arc<LockManager>,
        key: SessionId,
        bases: Vec<BaseId>,
    ) -> Result<Self, LockError> {
        Ok(Self {
            core: LockCore::new(manager, key, LockKind::Write, bases)?,
        })
    }
}

impl DBDumpLock {
    /// A dump lock always covers every base known to the manager.
    pub fn new(manager: &Arc<LockManager>, key: SessionId) -> Result<Self, LockError> {
        let bases = manager.bases();
        Ok(Self {
            core: LockCore::new(manager, key, LockKind::Dump, bases)?,
        })
    }
}
