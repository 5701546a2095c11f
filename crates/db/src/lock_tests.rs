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

#[cfg(test)]
mod tests {
    use crate::error::{LockError, SessionError};
    use crate::invid::BaseId;
    use crate::locks::{
        DBDumpLock, DBLock, DBReadLock, DBSessionLockManager, DBWriteLock, LockKind, LockManager,
    };
    use crate::object::SessionId;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const BRIEF: Duration = Duration::from_millis(50);

    fn manager(bases: &[BaseId]) -> Arc<LockManager> {
        let manager = Arc::new(LockManager::new(Duration::from_millis(10)));
        for base in bases {
            manager.add_base(*base);
        }
        manager
    }

    fn reader(manager: &Arc<LockManager>, key: u64, bases: &[BaseId]) -> DBReadLock {
        DBReadLock::new(manager, SessionId(key), bases.to_vec()).unwrap()
    }

    fn writer(manager: &Arc<LockManager>, key: u64, bases: &[BaseId]) -> DBWriteLock {
        DBWriteLock::new(manager, SessionId(key), bases.to_vec()).unwrap()
    }

    /// Spin until `f` holds, failing the test after a few seconds.
    fn eventually(f: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_readers_share() {
        let manager = manager(&[1]);
        let mut r1 = reader(&manager, 1, &[1]);
        let mut r2 = reader(&manager, 2, &[1]);
        r1.establish().unwrap();
        r2.establish_timeout(BRIEF).unwrap();
        assert_eq!(manager.queue_snapshot(1).unwrap().readers(), 2);
        assert!(r1.is_locked_on(1));
        assert!(!r1.is_locked_on(2));
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let manager = manager(&[1, 2]);
        let mut r = reader(&manager, 1, &[1]);
        r.establish().unwrap();

        let mut w = writer(&manager, 2, &[1, 2]);
        assert_eq!(w.establish_timeout(BRIEF), Err(LockError::Timeout(BRIEF)));
        let queue = manager.queue_snapshot(1).unwrap();
        assert_eq!(queue.writers_queued(), 0);
        assert!(!queue.write_in_progress());

        // A writer on an unrelated base is unaffected.
        let mut other = writer(&manager, 3, &[2]);
        other.establish_timeout(BRIEF).unwrap();
        other.release();

        r.release();
        w.establish_timeout(BRIEF).unwrap();
        assert!(manager.queue_snapshot(1).unwrap().write_in_progress());
    }

    #[test]
    fn test_queued_writer_holds_off_new_readers() {
        let manager = manager(&[1]);
        let mut r1 = reader(&manager, 1, &[1]);
        r1.establish().unwrap();

        let mut w = writer(&manager, 2, &[1]);
        let waiting = thread::spawn(move || {
            w.establish()?;
            w.release();
            Ok::<_, LockError>(())
        });
        eventually(|| manager.queue_snapshot(1).unwrap().writers_queued() == 1);

        let mut r2 = reader(&manager, 3, &[1]);
        assert_eq!(r2.establish_timeout(BRIEF), Err(LockError::Timeout(BRIEF)));

        r1.release();
        waiting.join().unwrap().unwrap();
        r2.establish_timeout(BRIEF).unwrap();
    }

    #[test]
    fn test_abort_wakes_blocked_establish() {
        let manager = manager(&[1]);
        let mut r = reader(&manager, 1, &[1]);
        r.establish().unwrap();

        let mut w = writer(&manager, 2, &[1]);
        let abort = w.abort_handle();
        let waiting = thread::spawn(move || w.establish());
        eventually(|| manager.queue_snapshot(1).unwrap().writers_queued() == 1);

        abort.abort();
        assert_eq!(waiting.join().unwrap(), Err(LockError::Aborted));
        let queue = manager.queue_snapshot(1).unwrap();
        assert_eq!(queue.writers_queued(), 0);
        assert_eq!(queue.readers(), 1);
    }

    #[test]
    fn test_aborted_lock_cannot_be_established() {
        let manager = manager(&[1]);
        let mut r = reader(&manager, 1, &[1]);
        r.establish().unwrap();
        r.abort();
        assert!(!r.is_locked());
        assert_eq!(manager.queue_snapshot(1).unwrap().readers(), 0);
        assert_eq!(r.establish(), Err(LockError::Aborted));
    }

    #[test]
    fn test_locks_are_not_reentrant() {
        let manager = manager(&[1]);
        let mut r = reader(&manager, 1, &[1]);
        r.establish().unwrap();
        assert_eq!(r.establish(), Err(LockError::AlreadyLocked));
    }

    #[test]
    fn test_dump_waits_for_writer_and_holds_off_new_writers() {
        let manager = manager(&[1, 2]);
        let mut w = writer(&manager, 1, &[1]);
        w.establish().unwrap();

        let mut dump = DBDumpLock::new(&manager, SessionId(2)).unwrap();
        assert_eq!(dump.bases(), &[1, 2]);
        let dumping = thread::spawn(move || {
            dump.establish()?;
            Ok::<_, LockError>(dump)
        });
        eventually(|| manager.queue_snapshot(2).unwrap().dumpers_queued() == 1);

        // Writers may not queue behind a waiting dumper.
        let mut late = writer(&manager, 3, &[2]);
        assert_eq!(late.establish_timeout(BRIEF), Err(LockError::Timeout(BRIEF)));

        w.release();
        let mut dump = dumping.join().unwrap().unwrap();
        assert!(dump.is_locked());
        assert_eq!(manager.queue_snapshot(1).unwrap().dumps_held(), 1);

        // Readers are compatible with a dump.
        let mut r = reader(&manager, 4, &[1, 2]);
        r.establish_timeout(BRIEF).unwrap();

        dump.release();
        r.release();
        late.establish_timeout(BRIEF).unwrap();
    }

    #[test]
    fn test_key_holds_one_lock_class() {
        let manager = manager(&[1, 2]);
        let mut r1 = reader(&manager, 1, &[1]);
        let mut r2 = reader(&manager, 1, &[2]);
        r1.establish().unwrap();
        r2.establish().unwrap();

        let mut w = writer(&manager, 1, &[2]);
        assert_eq!(
            w.establish_timeout(BRIEF),
            Err(LockError::KeyConflict(LockKind::Read))
        );
        assert_eq!(manager.locks_for_key(SessionId(1)).len(), 2);

        // Aborting the key poisons every lock it owns, including the unestablished writer.
        manager.abort_key(SessionId(1));
        assert_eq!(manager.held_count(), 0);
        assert_eq!(w.establish(), Err(LockError::Aborted));
        let mut w = writer(&manager, 1, &[2]);
        w.establish_timeout(BRIEF).unwrap();
    }

    #[test]
    fn test_unknown_base_refused() {
        let manager = manager(&[1]);
        assert_eq!(
            DBReadLock::new(&manager, SessionId(1), vec![1, 9]).unwrap_err(),
            LockError::UnknownBase(9)
        );
    }

    #[test]
    fn test_schema_edit_excludes_locks() {
        let manager = manager(&[1]);
        assert!(manager.try_begin_schema_edit());
        assert!(!manager.try_begin_schema_edit());

        let mut w = writer(&manager, 1, &[1]);
        assert_eq!(w.establish(), Err(LockError::SchemaEditInProgress));
        let mut r = reader(&manager, 2, &[1]);
        assert_eq!(r.establish_timeout(BRIEF), Err(LockError::Timeout(BRIEF)));

        manager.end_schema_edit();
        r.establish_timeout(BRIEF).unwrap();
        assert!(!manager.try_begin_schema_edit());
    }

    #[test]
    fn test_dropping_lock_releases_it() {
        let manager = manager(&[1]);
        {
            let mut w = writer(&manager, 1, &[1]);
            w.establish().unwrap();
            assert_eq!(manager.held_count(), 1);
        }
        assert_eq!(manager.held_count(), 0);
        assert!(!manager.queue_snapshot(1).unwrap().write_in_progress());
    }

    #[test]
    fn test_session_lock_rules() {
        let manager = manager(&[1, 2]);
        let session = DBSessionLockManager::new(manager.clone(), SessionId(7));

        let read = session.open_read_lock(vec![1]).unwrap();
        let also_read = session.open_read_lock(vec![2]).unwrap();
        assert!(session.is_locked(1) && session.is_locked(2));
        assert_eq!(session.held(), 2);
        assert!(matches!(
            session.open_write_lock(vec![2]),
            Err(SessionError::LockClassConflict(LockKind::Read))
        ));
        assert!(matches!(
            session.open_dump_lock(),
            Err(SessionError::LockClassConflict(LockKind::Read))
        ));
        drop(read);
        drop(also_read);

        let write = session.open_write_lock(vec![1]).unwrap();
        assert!(matches!(
            session.open_read_lock(vec![1]),
            Err(SessionError::OverlapsWriteLock)
        ));
        assert!(matches!(
            session.open_read_lock(vec![2]),
            Err(SessionError::LockClassConflict(LockKind::Write))
        ));
        session.release_all();
        assert!(!write.is_locked());
        assert_eq!(session.held(), 0);
    }
}
