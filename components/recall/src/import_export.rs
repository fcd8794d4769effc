/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Import and export. Export is either a streamed JSON array of live
//! entries (embeddings base64-encoded) or a byte-faithful copy of the
//! database via SQLite's online backup. Import reads the JSON form back
//! with a per-entry conflict strategy; `dry_run` runs the whole thing and
//! rolls the transaction back.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use rusqlite::backup::Backup;

use crate::error::*;
use crate::store::LoreStore;
use crate::types::{LoreEntry, LoreQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Keep the existing row when ids collide.
    Skip,
    /// The imported row wins wholesale.
    Replace,
    /// The row with the newer `updated_at` wins; ties prefer the import.
    Merge,
}

impl std::str::FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip" => Ok(MergeStrategy::Skip),
            "replace" => Ok(MergeStrategy::Replace),
            "merge" => Ok(MergeStrategy::Merge),
            other => Err(Error::InvalidMergeStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImportReport {
    pub imported: u64,
    pub skipped: u64,
    pub replaced: u64,
    pub merged: u64,
    pub invalid: u64,
    pub dry_run: bool,
}

/// Stream every live entry as one JSON array element after another.
/// Returns the number of entries written.
pub fn export_json<W: Write>(store: &LoreStore, writer: &mut W) -> Result<u64> {
    let entries = store.query_lore(&LoreQuery::default())?;
    writer.write_all(b"[")?;
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            writer.write_all(b",")?;
        }
        writer.write_all(b"\n  ")?;
        serde_json::to_writer(&mut *writer, entry)?;
    }
    writer.write_all(b"\n]\n")?;
    writer.flush()?;
    log::info!("exported {} entries", entries.len());
    Ok(entries.len() as u64)
}

/// Copy the whole database file to `dest` with the online backup API, so a
/// concurrent writer can't tear the copy.
pub fn export_sqlite(store: &LoreStore, dest: &Path) -> Result<()> {
    store.with_db(|db| {
        let mut dst = rusqlite::Connection::open(dest)?;
        let backup = Backup::new(&db.db, &mut dst)?;
        backup.run_to_completion(64, Duration::from_millis(5), None)?;
        Ok(())
    })?;
    log::info!("exported store to {}", dest.display());
    Ok(())
}

/// Import a JSON export. All row writes happen in one transaction; with
/// `dry_run` the transaction is rolled back after counting. Entries that
/// fail validation are counted and skipped, matching how bulk imports
/// behave elsewhere rather than poisoning the whole batch.
pub fn import_json<R: Read>(
    store: &LoreStore,
    reader: R,
    strategy: MergeStrategy,
    dry_run: bool,
) -> Result<ImportReport> {
    let entries: Vec<LoreEntry> = serde_json::from_reader(reader)?;
    store.with_db_mut(|db| db.import_lore(&entries, strategy, dry_run))
}
