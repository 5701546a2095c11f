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

//! Admission control for read, write and dump locks.
//!
//! All queue state, lock records and the per-key registry live behind one mutex, with one
//! condition variable that every state change broadcasts on. Waiters re-check their admission
//! predicate on every wakeup, and also poll at a fixed interval so that an abort can never be
//! missed.
//!
//! Ordering:
//! - a writer first waits for queued dumpers on its bases to drain, then queues itself (which
//!   holds back new readers and new dumpers), then waits for readers, held dumps and any
//!   active writer to clear;
//! - a dumper queues itself first (which holds back new writers), then waits for queued and
//!   active writers and any other held dump to clear;
//! - a reader waits only for writers, queued or active, and for schema edits.

use crate::error::LockError;
use crate::invid::BaseId;
use crate::locks::LockKind;
use crate::object::SessionId;
use ahash::{AHashMap, AHashSet};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2500);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LockId(u64);

/// Admission state of a single object base.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BaseQueue {
    readers: usize,
    writers_queued: usize,
    write_in_progress: bool,
    dumpers_queued: usize,
    dumps_held: usize,
}

impl BaseQueue {
    pub fn readers(&self) -> usize {
        self.readers
    }

    pub fn writers_queued(&self) -> usize {
        self.writers_queued
    }

    pub fn write_in_progress(&self) -> bool {
        self.write_in_progress
    }

    pub fn dumpers_queued(&self) -> usize {
        self.dumpers_queued
    }

    pub fn dumps_held(&self) -> usize {
        self.dumps_held
    }

    fn reader_blocked(&self) -> bool {
        self.writers_queued > 0 || self.write_in_progress
    }

    fn admit_reader(&mut self) {
        self.readers += 1;
    }

    fn release_reader(&mut self) {
        self.readers = self.readers.saturating_sub(1);
    }

    fn writer_may_queue(&self) -> bool {
        self.dumpers_queued == 0
    }

    fn queue_writer(&mut self) {
        self.writers_queued += 1;
    }

    fn dequeue_writer(&mut self) {
        self.writers_queued = self.writers_queued.saturating_sub(1);
    }

    fn writer_may_proceed(&self) -> bool {
        self.readers == 0 && self.dumps_held == 0 && !self.write_in_progress
    }

    fn admit_writer(&mut self) {
        self.dequeue_writer();
        self.write_in_progress = true;
    }

    fn release_writer(&mut self) {
        self.write_in_progress = false;
    }

    fn queue_dumper(&mut self) {
        self.dumpers_queued += 1;
    }

    fn dequeue_dumper(&mut self) {
        self.dumpers_queued = self.dumpers_queued.saturating_sub(1);
    }

    fn dumper_may_proceed(&self) -> bool {
        self.writers_queued == 0 && !self.write_in_progress && self.dumps_held == 0
    }

    fn admit_dumper(&mut self) {
        self.dequeue_dumper();
        self.dumps_held += 1;
    }

    fn release_dumper(&mut self) {
        self.dumps_held = self.dumps_held.saturating_sub(1);
    }
}

/// What a key currently holds, or is trying to establish.
#[derive(Clone, Debug, Eq, PartialEq)]
enum KeyClaim {
    Readers(AHashSet<LockId>),
    Writer(LockId),
    Dumper(LockId),
}

impl KeyClaim {
    fn kind(&self) -> LockKind {
        match self {
            KeyClaim::Readers(_) => LockKind::Read,
            KeyClaim::Writer(_) => LockKind::Write,
            KeyClaim::Dumper(_) => LockKind::Dump,
        }
    }
}

#[derive(Debug)]
struct LockRecord {
    key: SessionId,
    kind: LockKind,
    bases: Vec<BaseId>,
    locked: bool,
    in_establish: bool,
    aborted: bool,
}

/// How far an establish got before it has to be unwound.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Stage {
    Claimed,
    Queued,
}

#[derive(Default)]
struct LockState {
    queues: AHashMap<BaseId, BaseQueue>,
    records: AHashMap<LockId, LockRecord>,
    keys: AHashMap<SessionId, KeyClaim>,
    schema_edit: bool,
}

impl LockState {
    fn queues_for<'a>(&'a self, bases: &'a [BaseId]) -> impl Iterator<Item = &'a BaseQueue> {
        bases.iter().filter_map(|b| self.queues.get(b))
    }

    fn each_queue(&mut self, bases: &[BaseId], f: impl Fn(&mut BaseQueue)) {
        for base in bases {
            if let Some(queue) = self.queues.get_mut(base) {
                f(queue);
            }
        }
    }

    fn claim_key(&mut self, id: LockId, key: SessionId, kind: LockKind) -> Result<(), LockError> {
        match self.keys.get_mut(&key) {
            Some(KeyClaim::Readers(ids)) if kind == LockKind::Read => {
                ids.insert(id);
            }
            Some(existing) => return Err(LockError::KeyConflict(existing.kind())),
            None => {
                let claim = match kind {
                    LockKind::Read => KeyClaim::Readers(AHashSet::from_iter([id])),
                    LockKind::Write => KeyClaim::Writer(id),
                    LockKind::Dump => KeyClaim::Dumper(id),
                };
                self.keys.insert(key, claim);
            }
        }
        Ok(())
    }

    fn unclaim_key(&mut self, id: LockId, key: SessionId) {
        let remove = match self.keys.get_mut(&key) {
            Some(KeyClaim::Readers(ids)) => {
                ids.remove(&id);
                ids.is_empty()
            }
            Some(KeyClaim::Writer(held)) | Some(KeyClaim::Dumper(held)) => *held == id,
            None => false,
        };
        if remove {
            self.keys.remove(&key);
        }
    }

    /// Back out a failed or aborted establish.
    fn unwind(&mut self, id: LockId, stage: Stage) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        record.in_establish = false;
        let (key, kind, bases) = (record.key, record.kind, record.bases.clone());
        if stage == Stage::Queued {
            match kind {
                LockKind::Write => self.each_queue(&bases, BaseQueue::dequeue_writer),
                LockKind::Dump => self.each_queue(&bases, BaseQueue::dequeue_dumper),
                LockKind::Read => {}
            }
        }
        self.unclaim_key(id, key);
    }

    /// Give up an established lock.
    fn release(&mut self, id: LockId) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        if !record.locked {
            return false;
        }
        record.locked = false;
        let (key, kind, bases) = (record.key, record.kind, record.bases.clone());
        match kind {
            LockKind::Read => self.each_queue(&bases, BaseQueue::release_reader),
            LockKind::Write => self.each_queue(&bases, BaseQueue::release_writer),
            LockKind::Dump => self.each_queue(&bases, BaseQueue::release_dumper),
        }
        self.unclaim_key(id, key);
        true
    }
}

/// Snapshot of a lock for diagnostics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockInfo {
    pub id: LockId,
    pub key: SessionId,
    pub kind: LockKind,
    pub bases: Vec<BaseId>,
    pub locked: bool,
}

pub struct LockManager {
    state: Mutex<LockState>,
    cond: Condvar,
    poll_interval: Duration,
    next_id: AtomicU64,
}

impl LockManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            poll_interval,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_base(&self, base: BaseId) {
        self.state.lock().queues.entry(base).or_default();
    }

    pub fn bases(&self) -> Vec<BaseId> {
        let mut bases: Vec<_> = self.state.lock().queues.keys().copied().collect();
        bases.sort();
        bases
    }

    /// Create an unestablished lock record.
    pub(crate) fn register(
        &self,
        key: SessionId,
        kind: LockKind,
        mut bases: Vec<BaseId>,
    ) -> Result<LockId, LockError> {
        bases.sort();
        bases.dedup();
        let mut state = self.state.lock();
        if let Some(unknown) = bases.iter().find(|b| !state.queues.contains_key(b)) {
            return Err(LockError::UnknownBase(*unknown));
        }
        let id = LockId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.records.insert(
            id,
            LockRecord {
                key,
                kind,
                bases,
                locked: false,
                in_establish: false,
                aborted: false,
            },
        );
        Ok(id)
    }

    /// Block until `id` is granted, `timeout` elapses, or the lock is aborted.
    pub(crate) fn establish(&self, id: LockId, timeout: Option<Duration>) -> Result<(), LockError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        let record = state.records.get_mut(&id).ok_or(LockError::Released)?;
        if record.aborted {
            return Err(LockError::Aborted);
        }
        if record.locked || record.in_establish {
            return Err(LockError::AlreadyLocked);
        }
        let (key, kind, bases) = (record.key, record.kind, record.bases.clone());
        if kind == LockKind::Write && state.schema_edit {
            return Err(LockError::SchemaEditInProgress);
        }
        state.claim_key(id, key, kind)?;
        if let Some(record) = state.records.get_mut(&id) {
            record.in_establish = true;
        }

        let result = match kind {
            LockKind::Read => self.admit_reader(&mut state, id, &bases, deadline, timeout),
            LockKind::Write => self.admit_writer(&mut state, id, &bases, deadline, timeout),
            LockKind::Dump => self.admit_dumper(&mut state, id, &bases, deadline, timeout),
        };
        match result {
            Ok(()) => {
                if let Some(record) = state.records.get_mut(&id) {
                    record.in_establish = false;
                    record.locked = true;
                }
                trace!(?id, %key, %kind, ?bases, "lock established");
                Ok(())
            }
            Err((stage, e)) => {
                state.unwind(id, stage);
                self.cond.notify_all();
                debug!(?id, %key, %kind, error = %e, "lock establish failed");
                Err(e)
            }
        }
    }

    fn admit_reader(
        &self,
        state: &mut MutexGuard<LockState>,
        id: LockId,
        bases: &[BaseId],
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<(), (Stage, LockError)> {
        self.wait_until(state, id, deadline, timeout, Stage::Claimed, |s| {
            !s.schema_edit && s.queues_for(bases).all(|q| !q.reader_blocked())
        })?;
        state.each_queue(bases, BaseQueue::admit_reader);
        Ok(())
    }

    fn admit_writer(
        &self,
        state: &mut MutexGuard<LockState>,
        id: LockId,
        bases: &[BaseId],
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<(), (Stage, LockError)> {
        self.wait_until(state, id, deadline, timeout, Stage::Claimed, |s| {
            s.queues_for(bases).all(BaseQueue::writer_may_queue)
        })?;
        state.each_queue(bases, BaseQueue::queue_writer);
        self.wait_until(state, id, deadline, timeout, Stage::Queued, |s| {
            s.queues_for(bases).all(BaseQueue::writer_may_proceed)
        })?;
        state.each_queue(bases, BaseQueue::admit_writer);
        Ok(())
    }

    fn admit_dumper(
        &self,
        state: &mut MutexGuard<LockState>,
        id: LockId,
        bases: &[BaseId],
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<(), (Stage, LockError)> {
        state.each_queue(bases, BaseQueue::queue_dumper);
        self.wait_until(state, id, deadline, timeout, Stage::Queued, |s| {
            !s.schema_edit && s.queues_for(bases).all(BaseQueue::dumper_may_proceed)
        })?;
        state.each_queue(bases, BaseQueue::admit_dumper);
        Ok(())
    }

    fn wait_until(
        &self,
        state: &mut MutexGuard<LockState>,
        id: LockId,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
        stage: Stage,
        ready: impl Fn(&LockState) -> bool,
    ) -> Result<(), (Stage, LockError)> {
        loop {
            let aborted = state.records.get(&id).is_none_or(|r| r.aborted);
            if aborted {
                return Err((stage, LockError::Aborted));
            }
            if ready(&**state) {
                return Ok(());
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let waited = timeout.unwrap_or_default();
                        return Err((stage, LockError::Timeout(waited)));
                    }
                    (deadline - now).min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            self.cond.wait_for(state, wait);
        }
    }

    /// Release an established lock. Safe to call on a lock that isn't held.
    pub(crate) fn release(&self, id: LockId) {
        let mut state = self.state.lock();
        if state.release(id) {
            trace!(?id, "lock released");
            self.cond.notify_all();
        }
    }

    /// Poison `id`: a blocked establish fails, later establishes fail, and a held lock is
    /// released.
    pub(crate) fn abort(&self, id: LockId) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(&id) else {
            return;
        };
        record.aborted = true;
        let held = record.locked;
        debug!(?id, key = %record.key, kind = %record.kind, "lock aborted");
        if held {
            state.release(id);
        }
        self.cond.notify_all();
    }

    /// Release and discard `id`'s record.
    pub(crate) fn forget(&self, id: LockId) {
        let mut state = self.state.lock();
        state.release(id);
        if let Some(record) = state.records.remove(&id)
            && record.in_establish
        {
            warn!(?id, "lock record dropped mid-establish");
        }
        self.cond.notify_all();
    }

    /// Abort every lock belonging to `key`.
    pub fn abort_key(&self, key: SessionId) {
        let ids: Vec<_> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter(|(_, r)| r.key == key)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.abort(id);
        }
    }

    pub(crate) fn is_locked(&self, id: LockId) -> bool {
        self.state
            .lock()
            .records
            .get(&id)
            .is_some_and(|r| r.locked)
    }

    /// Locks belonging to `key` that are held or being established.
    pub fn locks_for_key(&self, key: SessionId) -> Vec<LockInfo> {
        let state = self.state.lock();
        let mut locks: Vec<_> = state
            .records
            .iter()
            .filter(|(_, r)| r.key == key && (r.locked || r.in_establish))
            .map(|(id, r)| LockInfo {
                id: *id,
                key: r.key,
                kind: r.kind,
                bases: r.bases.clone(),
                locked: r.locked,
            })
            .collect();
        locks.sort_by_key(|l| l.id);
        locks
    }

    pub fn held_count(&self) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| r.locked)
            .count()
    }

    pub fn queue_snapshot(&self, base: BaseId) -> Option<BaseQueue> {
        self.state.lock().queues.get(&base).cloned()
    }

    /// Start a schema edit. Fails if any lock is held or being established; while the edit is
    /// in progress writers are refused and readers and dumpers wait.
    pub fn try_begin_schema_edit(&self) -> bool {
        let mut state = self.state.lock();
        if state.schema_edit || state.records.values().any(|r| r.locked || r.in_establish) {
            return false;
        }
        state.schema_edit = true;
        true
    }

    pub fn end_schema_edit(&self) {
        self.state.lock().schema_edit = false;
        self.cond.notify_all();
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}
