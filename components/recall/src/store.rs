/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The public face of one open store. `LoreStore` wraps the `LoreDb` in a
//! read-write lock: mutations take the write lock, queries and stats share
//! the read lock, and WAL mode keeps readers from blocking on a writer's
//! commit. Closing the store drops the database handle; every later call
//! reports `StoreClosed` instead of panicking or reopening.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use interrupt_support::{Interruptee, SqlInterruptHandle};
use parking_lot::RwLock;

use crate::changelog::ChangeRecord;
use crate::db::LoreDb;
use crate::error::*;
use crate::types::{DetailedStats, FeedbackKind, LoreEntry, LoreQuery, StoreStats};

pub struct LoreStore {
    db: RwLock<Option<LoreDb>>,
    interrupt_handle: Arc<SqlInterruptHandle>,
    path: Option<PathBuf>,
}

impl LoreStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_source_id(path, None)
    }

    pub fn open_with_source_id(path: impl AsRef<Path>, source_id: Option<&str>) -> Result<Self> {
        let db = LoreDb::open_with_source_id(path.as_ref(), source_id)?;
        Ok(Self {
            interrupt_handle: db.interrupt_handle(),
            db: RwLock::new(Some(db)),
            path: Some(path.as_ref().to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = LoreDb::open_in_memory()?;
        Ok(Self {
            interrupt_handle: db.interrupt_handle(),
            db: RwLock::new(Some(db)),
            path: None,
        })
    }

    /// The database file backing this store, if it is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the store. Later operations fail with `StoreClosed`; closing
    /// twice is fine.
    pub fn close(&self) {
        self.interrupt_handle.interrupt();
        let mut guard = self.db.write();
        *guard = None;
    }

    /// Ask any in-flight operation to stop at its next check.
    pub fn interrupt(&self) {
        self.interrupt_handle.interrupt();
    }

    pub fn begin_interrupt_scope(&self) -> interrupt_support::SqlInterruptScope {
        self.interrupt_handle.begin_interrupt_scope()
    }

    fn with_read<T>(&self, f: impl FnOnce(&LoreDb) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(Error::StoreClosed),
        }
    }

    fn with_write<T>(&self, f: impl FnOnce(&LoreDb) -> Result<T>) -> Result<T> {
        let guard = self.db.write();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(Error::StoreClosed),
        }
    }

    pub fn source_id(&self) -> Result<String> {
        self.with_read(|db| Ok(db.source_id().to_string()))
    }

    // Mutations: exclusive lock.

    pub fn insert_lore(&self, entry: &LoreEntry) -> Result<()> {
        self.with_write(|db| db.insert_lore(entry))
    }

    pub fn upsert_lore(&self, entry: &LoreEntry) -> Result<()> {
        self.with_write(|db| db.upsert_lore(entry))
    }

    pub fn delete_lore(&self, id: &str) -> Result<()> {
        self.with_write(|db| db.delete_lore(id))
    }

    pub fn apply_remote_delete(&self, id: &str) -> Result<()> {
        self.with_write(|db| db.apply_remote_delete(id))
    }

    pub fn apply_feedback(&self, id: &str, kind: FeedbackKind) -> Result<LoreEntry> {
        self.with_write(|db| db.apply_feedback(id, kind))
    }

    pub fn mark_synced(&self, ids: &[String], at: DateTime<Utc>) -> Result<()> {
        self.with_write(|db| db.mark_synced(ids, at))
    }

    pub fn clear_all_lore(&self) -> Result<()> {
        self.with_write(|db| db.clear_all_lore())
    }

    pub fn wipe_for_reinit(&self) -> Result<()> {
        self.with_write(|db| db.wipe_for_reinit())
    }

    pub fn set_description(&self, description: Option<&str>) -> Result<()> {
        self.with_write(|db| db.set_description(description))
    }

    pub fn set_last_push_seq(&self, seq: i64) -> Result<()> {
        self.with_write(|db| db.set_last_push_seq(seq))
    }

    pub fn set_last_pull_seq(&self, seq: i64) -> Result<()> {
        self.with_write(|db| db.set_last_pull_seq(seq))
    }

    pub fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.with_write(|db| db.set_last_sync(at))
    }

    /// Stream a snapshot database into place, replacing all local content.
    /// The bytes land in a temp file beside the store first; the swap is one
    /// local transaction, and the temp file is removed on every path out.
    pub fn replace_from_snapshot(
        &self,
        reader: &mut dyn Read,
        declared_seq: i64,
        scope: &dyn Interruptee,
    ) -> Result<u64> {
        let dir = match &self.path {
            Some(path) => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            None => std::env::temp_dir(),
        };
        // NamedTempFile unlinks on drop, which covers the failure paths.
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;

        let mut buf = [0u8; 64 * 1024];
        loop {
            scope.err_if_interrupted()?;
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            std::io::Write::write_all(&mut temp, &buf[..n])?;
        }
        std::io::Write::flush(&mut temp)?;

        scope.err_if_interrupted()?;
        self.with_write(|db| db.replace_from_snapshot(temp.path(), declared_seq))
    }

    // Reads: shared lock.

    pub fn get_lore(&self, id: &str) -> Result<LoreEntry> {
        self.with_read(|db| db.get_lore(id))
    }

    pub fn get_lore_by_ids(&self, ids: &[String]) -> Result<Vec<LoreEntry>> {
        self.with_read(|db| db.get_lore_by_ids(ids))
    }

    pub fn query_lore(&self, query: &LoreQuery) -> Result<Vec<LoreEntry>> {
        self.with_read(|db| db.query_lore(query))
    }

    pub fn find_lore_by_id_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_read(|db| db.find_lore_by_id_prefix(prefix))
    }

    pub fn unpushed_changes(
        &self,
        source_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        self.with_read(|db| db.unpushed_changes(source_id, after_seq, limit))
    }

    pub fn has_pending_sync(&self) -> Result<bool> {
        self.with_read(|db| db.has_pending_sync())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.with_read(|db| db.stats())
    }

    pub fn detailed_stats(&self) -> Result<DetailedStats> {
        self.with_read(|db| db.detailed_stats())
    }

    pub fn description(&self) -> Result<Option<String>> {
        self.with_read(|db| db.description())
    }

    pub fn last_push_seq(&self) -> Result<i64> {
        self.with_read(|db| db.last_push_seq())
    }

    pub fn last_pull_seq(&self) -> Result<i64> {
        self.with_read(|db| db.last_pull_seq())
    }

    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_read(|db| db.last_sync())
    }

    /// Run `f` against the raw db under the read lock. Internal plumbing
    /// for export.
    pub(crate) fn with_db<T>(&self, f: impl FnOnce(&LoreDb) -> Result<T>) -> Result<T> {
        self.with_read(f)
    }

    /// As `with_db` but exclusive, for import.
    pub(crate) fn with_db_mut<T>(&self, f: impl FnOnce(&LoreDb) -> Result<T>) -> Result<T> {
        self.with_write(f)
    }
}
