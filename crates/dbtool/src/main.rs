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

use crate::args::{Args, Command};
use clap::Parser;
use eyre::{Report, bail, eyre};
use fs2::FileExt;
use ganymede_db::DBStore;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

mod args;

fn init_tracing(debug: bool) -> Result<(), Report> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(if debug { "debug" } else { "info" }),
    };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_thread_names(true),
        )
        .with(filter)
        .try_init()
        .map_err(|e| eyre!("Unable to configure logging: {}", e))
}

/// Hold an exclusive lock on the data directory for as long as the returned file lives, so
/// two processes never open the same store.
fn lock_data_dir(data_dir: &Path) -> Result<File, Report> {
    std::fs::create_dir_all(data_dir)?;
    let lock_file_path = data_dir.join(".ganymede.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&lock_file_path)?;
    match lock_file.try_lock_exclusive() {
        Ok(()) => {
            info!(?data_dir, "acquired exclusive lock on data directory");
            Ok(lock_file)
        }
        Err(e) => {
            error!(
                ?data_dir,
                "failed to lock data directory; is another process using this store?"
            );
            bail!("Directory lock acquisition failed: {}", e);
        }
    }
}

fn print_stats(store: &DBStore) {
    println!("transaction number: {}", store.transaction_number());
    if let Some(pending) = store.journal_transactions() {
        println!("journaled transactions: {pending}");
    }
    println!("bases:");
    for base in store.bases() {
        println!(
            "  {:>4} {:<24} {:>8} objects, max id {}",
            base.type_id(),
            base.name(),
            base.len(),
            base.max_id()
        );
    }
    println!("namespaces:");
    for namespace in store.namespaces() {
        println!(
            "  {:<29} {:>8} values{}",
            namespace.name(),
            namespace.len(),
            if namespace.is_case_insensitive() {
                " (case-insensitive)"
            } else {
                ""
            }
        );
    }
}

fn main() -> Result<(), Report> {
    let args = Args::parse();
    init_tracing(args.debug)?;
    let config = args.load_config()?;
    let _lock = lock_data_dir(&args.data_dir)?;

    let path = args.resolved_db_path();
    let store = DBStore::load(&path, config)
        .map_err(|e| eyre!("Unable to open store at {:?}: {}", path, e))?;
    info!(?path, "opened store");

    match &args.command {
        Command::Stats => print_stats(&store),
        Command::Verify => {
            let problems = store.verify();
            for problem in &problems {
                println!("{problem}");
            }
            if !problems.is_empty() {
                bail!("{} problems found", problems.len());
            }
            info!("store is consistent");
        }
        Command::Consolidate => store.consolidate()?,
        Command::Dump { output } => {
            store.dump(output, true)?;
            info!(?output, "dump complete");
        }
    }
    Ok(())
}
