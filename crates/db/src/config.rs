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

use crate::locks::DEFAULT_POLL_INTERVAL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Sync the journal to disk after every finalized transaction. Without this a crash can
    /// lose recently committed transactions, though never corrupt the store.
    pub journal_fsync: bool,
    /// Keep the previous snapshot as `<path>.bak` when dumping.
    pub keep_backup: bool,
    /// How often blocked lock requests wake up to re-check for aborts, even if nothing has
    /// signalled them.
    pub lock_poll_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            journal_fsync: true,
            keep_backup: true,
            lock_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}
