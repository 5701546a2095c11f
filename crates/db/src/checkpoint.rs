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

use crate::edit_object::{DBEditObject, ObjectStatus};
use crate::fields::FieldValue;
use crate::invid::{FieldId, Invid};
use ahash::AHashSet;
use std::collections::BTreeMap;

/// A human-readable event recorded by a transaction and emitted when it commits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEvent {
    pub kind: String,
    pub description: String,
    pub objects: Vec<Invid>,
}

/// The saved state of one object at a checkpoint.
#[derive(Clone, Debug)]
pub struct DBCheckPointObj {
    pub invid: Invid,
    pub status: ObjectStatus,
    pub fields: BTreeMap<FieldId, FieldValue>,
}

impl From<&DBEditObject> for DBCheckPointObj {
    fn from(object: &DBEditObject) -> Self {
        Self {
            invid: object.invid(),
            status: object.status(),
            fields: object.fields().clone(),
        }
    }
}

/// Everything a transaction needs to return to a named point: its objects, its log events,
/// and its session's delete-locks. Namespaces checkpoint themselves under the same name.
#[derive(Clone, Debug)]
pub struct DBCheckPoint {
    pub name: String,
    pub objects: Vec<DBCheckPointObj>,
    pub log_events: Vec<LogEvent>,
    pub delete_locks: AHashSet<Invid>,
}

impl DBCheckPoint {
    pub fn get(&self, invid: Invid) -> Option<&DBCheckPointObj> {
        self.objects.iter().find(|o| o.invid == invid)
    }
}

/// Named checkpoints in the order they were taken. Names may repeat; lookups find the most
/// recent. Going back to (or popping) a checkpoint discards every checkpoint taken after it.
#[derive(Default)]
pub(crate) struct CheckpointStack {
    entries: Vec<DBCheckPoint>,
}

impl CheckpointStack {
    pub fn push(&mut self, checkpoint: DBCheckPoint) {
        self.entries.push(checkpoint);
    }

    /// Remove the named checkpoint and all later ones, returning the named one.
    pub fn take(&mut self, name: &str) -> Option<DBCheckPoint> {
        let pos = self.entries.iter().rposition(|c| c.name == name)?;
        self.entries.drain(pos..).next()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|c| c.name.as_str())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(name: &str) -> DBCheckPoint {
        DBCheckPoint {
            name: name.to_string(),
            objects: vec![],
            log_events: vec![],
            delete_locks: AHashSet::new(),
        }
    }

    #[test]
    fn test_take_discards_later_checkpoints() {
        let mut stack = CheckpointStack::default();
        for name in ["a", "b", "c"] {
            stack.push(checkpoint(name));
        }
        assert_eq!(stack.take("b").unwrap().name, "b");
        assert_eq!(stack.names().collect::<Vec<_>>(), vec!["a"]);
        assert!(stack.take("c").is_none());
    }

    #[test]
    fn test_repeated_names_find_latest() {
        let mut stack = CheckpointStack::default();
        stack.push(checkpoint("x"));
        stack.push(checkpoint("y"));
        stack.push(checkpoint("x"));
        stack.take("x");
        assert_eq!(stack.names().collect::<Vec<_>>(), vec!["x", "y"]);
    }
}
