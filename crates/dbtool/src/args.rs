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

use clap::builder::ValueHint;
use clap_derive::{Parser, Subcommand};
use eyre::eyre;
use figment::Figment;
use figment::providers::{Format as ProviderFormat, Serialized, Yaml};
use ganymede_db::DatabaseConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about = "Inspect and maintain a Ganymede object store")]
pub struct Args {
    #[arg(
        value_name = "data-dir",
        help = "Directory holding the store, its journal and its backups",
        value_hint = ValueHint::DirPath,
        default_value = "./ganymede-data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long,
        value_name = "db",
        help = "Path to the store file (relative to data-dir if not absolute)",
        value_hint = ValueHint::FilePath,
        default_value = "ganymede.db"
    )]
    pub db: PathBuf,

    #[arg(
        long,
        value_name = "config",
        help = "Path to configuration (YAML) file to use, if any. If not specified, defaults are used.\
                Configuration file values can be overridden by command line arguments.",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[arg(long, help = "Sync the journal to disk after every transaction")]
    pub journal_fsync: Option<bool>,

    #[arg(long, help = "Keep the previous snapshot as a .bak file when dumping")]
    pub keep_backup: Option<bool>,

    #[arg(
        long,
        value_name = "millis",
        help = "How often blocked lock requests re-check for aborts"
    )]
    pub lock_poll_ms: Option<u64>,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print object counts per base and namespace sizes.
    Stats,
    /// Cross-check namespaces and links against committed objects.
    Verify,
    /// Fold the journal into a fresh snapshot.
    Consolidate,
    /// Write a snapshot of the store to another file.
    Dump {
        #[arg(value_hint = ValueHint::FilePath)]
        output: PathBuf,
    },
}

impl Args {
    /// Load the configuration file if we have it, then apply command line overrides.
    pub fn load_config(&self) -> Result<DatabaseConfig, eyre::Report> {
        let config = match &self.config_file {
            Some(config_path) => Figment::new()
                .merge(Serialized::defaults(DatabaseConfig::default()))
                .merge(Yaml::file(config_path))
                .extract::<DatabaseConfig>()
                .map_err(|e| {
                    eyre!(
                        "Failed to parse configuration from {:?}: {}",
                        config_path,
                        e
                    )
                })?,
            None => DatabaseConfig::default(),
        };
        Ok(self.merge_config(config))
    }

    fn merge_config(&self, mut config: DatabaseConfig) -> DatabaseConfig {
        if let Some(journal_fsync) = self.journal_fsync {
            config.journal_fsync = journal_fsync;
        }
        if let Some(keep_backup) = self.keep_backup {
            config.keep_backup = keep_backup;
        }
        if let Some(millis) = self.lock_poll_ms {
            config.lock_poll_interval = Duration::from_millis(millis);
        }
        config
    }

    pub(crate) fn resolved_db_path(&self) -> PathBuf {
        if self.db.is_absolute() {
            self.db.clone()
        } else {
            self.data_dir.join(&self.db)
        }
    }
}
