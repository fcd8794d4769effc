/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Lore DB handling
///
/// `LoreDb` owns the SQLite connection for one store. The rules that keep
/// sync sound all live here:
///
///   - Every local mutation (insert, delete, feedback) writes the row *and*
///     appends its change-log entry inside one transaction. A crash can
///     never leave a mutation without its log row or vice versa.
///   - The pull path applies remote changes through `upsert_lore` /
///     `apply_remote_delete`, which skip the change log entirely. Combined
///     with the `source_id` filter in `unpushed_changes`, nothing a remote
///     peer told us is ever echoed back to it.
///   - Change-log payloads are full post-images, so applying one twice is
///     harmless.
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use interrupt_support::SqlInterruptHandle;
use lazy_static::lazy_static;
use rusqlite::{named_params, params_from_iter, types::ToSql, Connection, OpenFlags, Row};
use sql_support::open_database::{open_database_with_flags, open_memory_database};
use sql_support::{repeat_sql_vars, ConnExt, UncheckedTransaction};

use crate::changelog::{ChangeOperation, ChangeRecord, LORE_TABLE};
use crate::error::*;
use crate::import_export::{ImportReport, MergeStrategy};
use crate::schema::{self, RecallConnectionInitializer};
use crate::types::{
    CategoryCount, DetailedStats, EmbeddingStatus, FeedbackKind, LoreCategory, LoreEntry,
    LoreQuery, StoreStats,
};
use crate::util;

pub(crate) const COMMON_COLS: &str = "
    id,
    content,
    context,
    category,
    confidence,
    embedding,
    embedding_status,
    source_id,
    sources,
    validation_count,
    last_validated_at,
    created_at,
    updated_at,
    deleted_at,
    synced_at
";

lazy_static! {
    static ref GET_LIVE_BY_ID_SQL: String = format!(
        "SELECT {common_cols} FROM lore_entries
         WHERE id = :id AND deleted_at IS NULL",
        common_cols = COMMON_COLS,
    );
    static ref GET_ANY_BY_ID_SQL: String = format!(
        "SELECT {common_cols} FROM lore_entries WHERE id = :id",
        common_cols = COMMON_COLS,
    );
    static ref INSERT_SQL: String = format!(
        "INSERT INTO lore_entries ({common_cols})
         VALUES (:id, :content, :context, :category, :confidence, :embedding,
                 :embedding_status, :source_id, :sources, :validation_count,
                 :last_validated_at, :created_at, :updated_at, :deleted_at, :synced_at)",
        common_cols = COMMON_COLS,
    );
    static ref UPSERT_SQL: String = format!(
        "{insert_sql}
         ON CONFLICT(id) DO UPDATE SET
             content           = excluded.content,
             context           = excluded.context,
             category          = excluded.category,
             confidence        = excluded.confidence,
             embedding         = excluded.embedding,
             embedding_status  = excluded.embedding_status,
             source_id         = excluded.source_id,
             sources           = excluded.sources,
             validation_count  = excluded.validation_count,
             last_validated_at = excluded.last_validated_at,
             created_at        = excluded.created_at,
             updated_at        = excluded.updated_at,
             deleted_at        = excluded.deleted_at,
             synced_at         = excluded.synced_at",
        insert_sql = &*INSERT_SQL,
    );
}

pub struct LoreDb {
    pub(crate) db: Connection,
    interrupt_handle: Arc<SqlInterruptHandle>,
    source_id: String,
}

impl LoreDb {
    /// Open (creating and migrating as needed) the store at `path`. The
    /// parent directory is created if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_source_id(path, None)
    }

    /// As `open`, but forcing the persisted `source_id` to `requested`.
    /// Only useful for controlled fleets where the client identity is
    /// assigned externally.
    pub fn open_with_source_id(
        path: impl AsRef<Path>,
        requested: Option<&str>,
    ) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = open_database_with_flags(path, flags, &RecallConnectionInitializer)?;
        Self::with_connection(conn, requested)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = open_memory_database(&RecallConnectionInitializer)?;
        Self::with_connection(conn, None)
    }

    fn with_connection(conn: Connection, requested_source_id: Option<&str>) -> Result<Self> {
        #[cfg(test)]
        {
            util::init_test_logging();
        }
        let stored: Option<String> = conn.try_query_row(
            "SELECT value FROM sync_meta WHERE key = :key",
            named_params! { ":key": schema::SOURCE_ID_META_KEY },
            |row| Ok::<_, Error>(row.get(0)?),
        )?;
        let source_id = match (stored, requested_source_id) {
            (Some(stored), None) => stored,
            (Some(stored), Some(requested)) if stored == requested => stored,
            (_, Some(requested)) => {
                log::warn!("Overriding persisted source_id for this store");
                conn.execute_cached(
                    "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (:key, :value)",
                    named_params! { ":key": schema::SOURCE_ID_META_KEY, ":value": requested },
                )?;
                requested.to_string()
            }
            (None, None) => {
                // The initializer seeds this; hitting here means the file
                // predates us and skipped migration somehow.
                return Err(Error::Corrupt("store has no source_id".into()));
            }
        };
        Ok(Self {
            interrupt_handle: Arc::new(SqlInterruptHandle::new(&conn)),
            db: conn,
            source_id,
        })
    }

    /// The persistent identity of this client, generated on first open.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn interrupt_handle(&self) -> Arc<SqlInterruptHandle> {
        Arc::clone(&self.interrupt_handle)
    }
}

impl ConnExt for LoreDb {
    #[inline]
    fn conn(&self) -> &Connection {
        &self.db
    }
}

impl std::ops::Deref for LoreDb {
    type Target = Connection;
    #[inline]
    fn deref(&self) -> &Connection {
        &self.db
    }
}

// lore CRUD + the change log.
impl LoreDb {
    /// Insert a brand new entry and log it, atomically. Validation runs
    /// first so a rejected entry leaves no trace at all.
    pub fn insert_lore(&self, entry: &LoreEntry) -> Result<()> {
        entry.validate()?;
        let tx = self.unchecked_transaction_imm()?;
        insert_row(&tx, entry)?;
        append_change(
            &tx,
            &entry.id,
            ChangeOperation::Upsert,
            Some(entry),
            &self.source_id,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Idempotent insert-or-replace used by the pull path. Takes the
    /// incoming row wholesale (including its origin `source_id` and a NULL
    /// `deleted_at`, which revives a locally-deleted row) and appends
    /// nothing to the change log.
    pub fn upsert_lore(&self, entry: &LoreEntry) -> Result<()> {
        let tx = self.unchecked_transaction_imm()?;
        upsert_row(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }

    /// Soft-delete a live entry and log it. Deleting an already-deleted
    /// entry is a no-op (and appends nothing); an unknown id is `NotFound`.
    pub fn delete_lore(&self, id: &str) -> Result<()> {
        let tx = self.unchecked_transaction_imm()?;
        let deleted_at: Option<Option<String>> = tx.try_query_row(
            "SELECT deleted_at FROM lore_entries WHERE id = :id",
            named_params! { ":id": id },
            |row| Ok::<_, Error>(row.get(0)?),
        )?;
        match deleted_at {
            None => Err(Error::NotFound(id.to_string())),
            Some(Some(_)) => {
                tx.commit()?;
                Ok(())
            }
            Some(None) => {
                let now = util::format_timestamp(util::now());
                tx.execute_cached(
                    "UPDATE lore_entries
                     SET deleted_at = :now, updated_at = :now
                     WHERE id = :id",
                    named_params! { ":now": now, ":id": id },
                )?;
                append_change(&tx, id, ChangeOperation::Delete, None, &self.source_id)?;
                tx.commit()?;
                Ok(())
            }
        }
    }

    /// The pull-path twin of `delete_lore`: soft-delete without logging, so
    /// a remote tombstone is not pushed back to its origin. Unknown ids are
    /// tolerated.
    pub fn apply_remote_delete(&self, id: &str) -> Result<()> {
        let now = util::format_timestamp(util::now());
        self.execute_cached(
            "UPDATE lore_entries
             SET deleted_at = :now, updated_at = :now
             WHERE id = :id AND deleted_at IS NULL",
            named_params! { ":now": now, ":id": id },
        )?;
        Ok(())
    }

    pub fn get_lore(&self, id: &str) -> Result<LoreEntry> {
        self.try_query_row(&GET_LIVE_BY_ID_SQL, named_params! { ":id": id }, lore_from_row)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Batch get; ids with no live row are silently omitted.
    pub fn get_lore_by_ids(&self, ids: &[String]) -> Result<Vec<LoreEntry>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {common_cols} FROM lore_entries
             WHERE deleted_at IS NULL AND id IN ({vars})",
            common_cols = COMMON_COLS,
            vars = repeat_sql_vars(ids.len()),
        );
        self.query_rows_and_then(&sql, params_from_iter(ids), lore_from_row)
    }

    /// Live rows matching the query filters, in storage order. Ranking is
    /// the client's job.
    pub fn query_lore(&self, query: &LoreQuery) -> Result<Vec<LoreEntry>> {
        let mut sql = format!(
            "SELECT {common_cols} FROM lore_entries WHERE deleted_at IS NULL",
            common_cols = COMMON_COLS,
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(min_confidence) = query.min_confidence {
            sql.push_str(" AND confidence >= ?");
            params.push(Box::new(min_confidence));
        }
        if let Some(categories) = &query.categories {
            if categories.is_empty() {
                return Ok(vec![]);
            }
            sql.push_str(&format!(" AND category IN ({})", repeat_sql_vars(categories.len())));
            for category in categories {
                params.push(Box::new(category.as_str()));
            }
        }
        if query.require_embedding {
            sql.push_str(" AND embedding IS NOT NULL");
        }
        self.query_rows_and_then(
            &sql,
            params_from_iter(params.iter().map(|p| p.as_ref())),
            lore_from_row,
        )
    }

    /// Atomically apply feedback to a live entry and return the updated
    /// row. `not_relevant` has a zero delta and takes the read-only path:
    /// no row update, no change-log append.
    pub fn apply_feedback(&self, id: &str, kind: FeedbackKind) -> Result<LoreEntry> {
        if kind == FeedbackKind::NotRelevant {
            return self.get_lore(id);
        }
        let tx = self.unchecked_transaction_imm()?;
        let mut entry = tx
            .try_query_row(&GET_LIVE_BY_ID_SQL, named_params! { ":id": id }, lore_from_row)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let now = util::now();
        // Two decimals of fidelity survive the float arithmetic.
        entry.confidence =
            ((entry.confidence + kind.confidence_delta()).clamp(0.0, 1.0) * 100.0).round() / 100.0;
        if kind == FeedbackKind::Helpful {
            entry.validation_count += 1;
            entry.last_validated_at = Some(now);
        }
        entry.updated_at = now;

        tx.execute_cached(
            "UPDATE lore_entries
             SET confidence = :confidence,
                 validation_count = :validation_count,
                 last_validated_at = :last_validated_at,
                 updated_at = :updated_at
             WHERE id = :id",
            named_params! {
                ":confidence": entry.confidence,
                ":validation_count": entry.validation_count,
                ":last_validated_at": entry.last_validated_at.map(util::format_timestamp),
                ":updated_at": util::format_timestamp(entry.updated_at),
                ":id": id,
            },
        )?;
        append_change(&tx, id, ChangeOperation::Upsert, Some(&entry), &self.source_id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Stamp `synced_at` on entries whose changes Engram has acknowledged.
    pub fn mark_synced(&self, ids: &[String], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE lore_entries SET synced_at = ? WHERE id IN ({})",
            repeat_sql_vars(ids.len()),
        );
        let ts = util::format_timestamp(at);
        let mut params: Vec<&dyn ToSql> = vec![&ts];
        for id in ids {
            params.push(id);
        }
        self.execute_cached(&sql, params_from_iter(params))?;
        Ok(())
    }

    /// Change-log rows after `after_seq` that originated from `source_id`,
    /// oldest first. The origin filter is what keeps pull-applied remote
    /// changes out of our own pushes.
    pub fn unpushed_changes(
        &self,
        source_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        self.query_rows_and_then(
            "SELECT sequence, table_name, entity_id, operation, payload, source_id, created_at
             FROM change_log
             WHERE sequence > :after AND source_id = :source_id
             ORDER BY sequence ASC
             LIMIT :limit",
            named_params! {
                ":after": after_seq,
                ":source_id": source_id,
                ":limit": limit as i64,
            },
            change_from_row,
        )
    }

    /// Live lore ids starting with `prefix` (used for feedback by id
    /// prefix). Capped: the caller only needs to distinguish zero, one and
    /// many.
    pub fn find_lore_by_id_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.query_rows_and_then(
            "SELECT id FROM lore_entries
             WHERE deleted_at IS NULL AND substr(id, 1, :n) = :prefix
             ORDER BY id LIMIT 3",
            named_params! { ":n": prefix.len() as i64, ":prefix": prefix },
            |row| Ok::<_, Error>(row.get(0)?),
        )
    }

    /// True if anything still needs pushing: change-log rows past the push
    /// cursor, or rows in the legacy v1 queue.
    pub fn has_pending_sync(&self) -> Result<bool> {
        let unpushed = self.unpushed_count()?;
        let queued: i64 = self.conn_ext_query_one("SELECT COUNT(*) FROM sync_queue")?;
        Ok(unpushed > 0 || queued > 0)
    }

    fn unpushed_count(&self) -> Result<u64> {
        let last_push = self.last_push_seq()?;
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM change_log WHERE sequence > :after AND source_id = :source_id",
            named_params! { ":after": last_push, ":source_id": self.source_id },
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete all lore and any legacy queued work. The change log is left
    /// alone; this is an administrative wipe of content, not of history.
    pub fn clear_all_lore(&self) -> Result<()> {
        let tx = self.unchecked_transaction_imm()?;
        tx.execute_all(&["DELETE FROM lore_entries", "DELETE FROM sync_queue"])?;
        tx.commit()?;
        Ok(())
    }

    /// Reset to factory-fresh for `reinitialize`: content, history and both
    /// sync cursors all go.
    pub fn wipe_for_reinit(&self) -> Result<()> {
        let tx = self.unchecked_transaction_imm()?;
        tx.execute_all(&[
            "DELETE FROM lore_entries",
            "DELETE FROM change_log",
            "DELETE FROM sync_queue",
        ])?;
        put_sync_meta(&tx, schema::LAST_PUSH_SEQ_META_KEY, &0i64)?;
        put_sync_meta(&tx, schema::LAST_PULL_SEQ_META_KEY, &0i64)?;
        tx.commit()?;
        Ok(())
    }

    /// Swap this store's content for the rows of a snapshot database.
    /// Everything local-only is gone afterwards by design; the caller is
    /// responsible for having confirmed that. Failure anywhere leaves the
    /// store untouched.
    pub fn replace_from_snapshot(&self, snapshot_path: &Path, declared_seq: i64) -> Result<u64> {
        let src = Connection::open_with_flags(
            snapshot_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::Corrupt(format!("cannot open snapshot: {e}")))?;

        let has_lore: i64 = src
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'lore_entries'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::Corrupt(format!("unreadable snapshot: {e}")))?;
        if has_lore == 0 {
            return Err(Error::Corrupt("snapshot has no lore_entries table".into()));
        }

        let sql = format!(
            "SELECT {common_cols} FROM lore_entries WHERE deleted_at IS NULL",
            common_cols = COMMON_COLS,
        );
        let rows: Vec<LoreEntry> = src
            .query_rows_and_then(&sql, [], lore_from_row)
            .map_err(|e: Error| Error::Corrupt(format!("unreadable snapshot rows: {e}")))?;

        let tx = self.unchecked_transaction_imm()?;
        tx.execute_all(&["DELETE FROM lore_entries", "DELETE FROM sync_queue"])?;
        for mut entry in rows.iter().cloned() {
            // Snapshot rows have server-side embeddings; anything unset is
            // treated as complete rather than queued for recomputation.
            if entry.embedding.is_some() {
                entry.embedding_status = EmbeddingStatus::Complete;
            }
            upsert_row(&tx, &entry)?;
        }
        put_sync_meta(&tx, schema::LAST_PULL_SEQ_META_KEY, &declared_seq)?;
        tx.commit()?;
        log::info!("replaced store from snapshot: {} entries", rows.len());
        Ok(rows.len() as u64)
    }
}

// import.
impl LoreDb {
    /// Bulk import with a per-entry conflict strategy, all inside one
    /// transaction. Collisions are decided against *any* existing row,
    /// tombstones included. Import writes deliberately skip the change
    /// log, the same as the pull path: an import is replication, not
    /// authorship.
    pub(crate) fn import_lore(
        &self,
        entries: &[LoreEntry],
        strategy: MergeStrategy,
        dry_run: bool,
    ) -> Result<ImportReport> {
        let tx = self.unchecked_transaction_imm()?;
        let mut report = ImportReport {
            dry_run,
            ..Default::default()
        };
        for entry in entries {
            if let Err(e) = entry.validate() {
                log::warn!("skipping invalid imported entry {:?}: {}", entry.id, e);
                report.invalid += 1;
                continue;
            }
            let existing: Option<LoreEntry> = tx.try_query_row(
                &GET_ANY_BY_ID_SQL,
                named_params! { ":id": entry.id },
                lore_from_row,
            )?;
            match (existing, strategy) {
                (None, _) => {
                    upsert_row(&tx, entry)?;
                    report.imported += 1;
                }
                (Some(_), MergeStrategy::Skip) => report.skipped += 1,
                (Some(_), MergeStrategy::Replace) => {
                    upsert_row(&tx, entry)?;
                    report.replaced += 1;
                }
                (Some(existing), MergeStrategy::Merge) => {
                    if entry.updated_at >= existing.updated_at {
                        upsert_row(&tx, entry)?;
                    }
                    report.merged += 1;
                }
            }
        }
        if dry_run {
            tx.rollback()?;
        } else {
            tx.commit()?;
        }
        Ok(report)
    }
}

// metadata + sync metadata accessors.
impl LoreDb {
    pub(crate) fn put_meta(&self, key: &str, value: &dyn ToSql) -> Result<()> {
        self.execute_cached(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (:key, :value)",
            named_params! { ":key": key, ":value": value },
        )?;
        Ok(())
    }

    pub(crate) fn get_meta<T: rusqlite::types::FromSql>(&self, key: &str) -> Result<Option<T>> {
        self.try_query_row(
            "SELECT value FROM metadata WHERE key = :key",
            named_params! { ":key": key },
            |row| Ok::<_, Error>(row.get(0)?),
        )
    }

    pub(crate) fn delete_meta(&self, key: &str) -> Result<()> {
        self.execute_cached(
            "DELETE FROM metadata WHERE key = :key",
            named_params! { ":key": key },
        )?;
        Ok(())
    }

    pub fn description(&self) -> Result<Option<String>> {
        self.get_meta(schema::DESCRIPTION_META_KEY)
    }

    pub fn set_description(&self, description: Option<&str>) -> Result<()> {
        match description {
            Some(text) => self.put_meta(schema::DESCRIPTION_META_KEY, &text),
            None => self.delete_meta(schema::DESCRIPTION_META_KEY),
        }
    }

    pub(crate) fn get_sync_meta<T: rusqlite::types::FromSql>(
        &self,
        key: &str,
    ) -> Result<Option<T>> {
        self.try_query_row(
            "SELECT value FROM sync_meta WHERE key = :key",
            named_params! { ":key": key },
            |row| Ok::<_, Error>(row.get(0)?),
        )
    }

    pub(crate) fn put_sync_meta(&self, key: &str, value: &dyn ToSql) -> Result<()> {
        put_sync_meta(&self.db, key, value)
    }

    pub fn last_push_seq(&self) -> Result<i64> {
        Ok(self.get_sync_meta(schema::LAST_PUSH_SEQ_META_KEY)?.unwrap_or(0))
    }

    pub fn set_last_push_seq(&self, seq: i64) -> Result<()> {
        self.put_sync_meta(schema::LAST_PUSH_SEQ_META_KEY, &seq)
    }

    pub fn last_pull_seq(&self) -> Result<i64> {
        Ok(self.get_sync_meta(schema::LAST_PULL_SEQ_META_KEY)?.unwrap_or(0))
    }

    pub fn set_last_pull_seq(&self, seq: i64) -> Result<()> {
        self.put_sync_meta(schema::LAST_PULL_SEQ_META_KEY, &seq)
    }

    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let text: Option<String> = self.get_sync_meta(schema::LAST_SYNC_META_KEY)?;
        Ok(text.as_deref().and_then(util::parse_timestamp))
    }

    pub fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.put_sync_meta(schema::LAST_SYNC_META_KEY, &util::format_timestamp(at))
    }
}

// stats.
impl LoreDb {
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            lore_count: self
                .conn_ext_query_one::<i64>(
                    "SELECT COUNT(*) FROM lore_entries WHERE deleted_at IS NULL",
                )? as u64,
            deleted_count: self.conn_ext_query_one::<i64>(
                "SELECT COUNT(*) FROM lore_entries WHERE deleted_at IS NOT NULL",
            )? as u64,
            change_log_count: self.conn_ext_query_one::<i64>("SELECT COUNT(*) FROM change_log")?
                as u64,
            unpushed_count: self.unpushed_count()?,
            last_push_seq: self.last_push_seq()?,
            last_pull_seq: self.last_pull_seq()?,
            last_sync: self.last_sync()?,
        })
    }

    pub fn detailed_stats(&self) -> Result<DetailedStats> {
        let stats = self.stats()?;
        let by_category = self.query_rows_and_then(
            "SELECT category, COUNT(*) FROM lore_entries
             WHERE deleted_at IS NULL
             GROUP BY category ORDER BY category",
            [],
            |row| -> Result<CategoryCount> {
                let name: String = row.get(0)?;
                Ok(CategoryCount {
                    category: name
                        .parse::<LoreCategory>()
                        .map_err(|_| Error::Corrupt(format!("unknown stored category {name:?}")))?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            },
        )?;
        let average_confidence: f64 = self
            .db
            .query_row(
                "SELECT AVG(confidence) FROM lore_entries WHERE deleted_at IS NULL",
                [],
                |row| row.get::<_, Option<f64>>(0),
            )?
            .unwrap_or(0.0);
        let total_validations: i64 = self
            .db
            .query_row(
                "SELECT COALESCE(SUM(validation_count), 0) FROM lore_entries
                 WHERE deleted_at IS NULL",
                [],
                |row| row.get(0),
            )?;
        let mut pending = 0u64;
        let mut complete = 0u64;
        let mut failed = 0u64;
        let status_counts: Vec<(String, i64)> = self.query_rows_and_then(
            "SELECT embedding_status, COUNT(*) FROM lore_entries
             WHERE deleted_at IS NULL GROUP BY embedding_status",
            [],
            |row| Ok::<_, Error>((row.get(0)?, row.get(1)?)),
        )?;
        for (status, count) in status_counts {
            match EmbeddingStatus::from_column(&status) {
                EmbeddingStatus::Pending => pending = count as u64,
                EmbeddingStatus::Complete => complete = count as u64,
                EmbeddingStatus::Failed => failed = count as u64,
            }
        }
        Ok(DetailedStats {
            stats,
            by_category,
            average_confidence,
            total_validations: total_validations as u64,
            embeddings_pending: pending,
            embeddings_complete: complete,
            embeddings_failed: failed,
        })
    }
}

/// Insert the full row; fails on a duplicate id.
fn insert_row(tx: &UncheckedTransaction<'_>, entry: &LoreEntry) -> Result<()> {
    write_row(tx, entry, &INSERT_SQL)
}

/// Write the full row, insert-or-replace keyed by id.
fn upsert_row(tx: &UncheckedTransaction<'_>, entry: &LoreEntry) -> Result<()> {
    write_row(tx, entry, &UPSERT_SQL)
}

fn write_row(tx: &UncheckedTransaction<'_>, entry: &LoreEntry, sql: &str) -> Result<()> {
    let sources = if entry.sources.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&entry.sources)?)
    };
    tx.execute_cached(
        sql,
        named_params! {
            ":id": entry.id,
            ":content": entry.content,
            ":context": entry.context,
            ":category": entry.category.as_str(),
            ":confidence": entry.confidence,
            ":embedding": entry.embedding,
            ":embedding_status": entry.embedding_status.as_str(),
            ":source_id": entry.source_id,
            ":sources": sources,
            ":validation_count": entry.validation_count,
            ":last_validated_at": entry.last_validated_at.map(util::format_timestamp),
            ":created_at": util::format_timestamp(entry.created_at),
            ":updated_at": util::format_timestamp(entry.updated_at),
            ":deleted_at": entry.deleted_at.map(util::format_timestamp),
            ":synced_at": entry.synced_at.map(util::format_timestamp),
        },
    )?;
    Ok(())
}

/// Append one change-log row. Runs inside the mutation's transaction; the
/// AUTOINCREMENT sequence provides the strict total order.
fn append_change(
    tx: &UncheckedTransaction<'_>,
    entity_id: &str,
    operation: ChangeOperation,
    payload: Option<&LoreEntry>,
    source_id: &str,
) -> Result<()> {
    let payload_json = payload.map(serde_json::to_string).transpose()?;
    tx.execute_cached(
        "INSERT INTO change_log (table_name, entity_id, operation, payload, source_id, created_at)
         VALUES (:table_name, :entity_id, :operation, :payload, :source_id, :created_at)",
        named_params! {
            ":table_name": LORE_TABLE,
            ":entity_id": entity_id,
            ":operation": operation.as_str(),
            ":payload": payload_json,
            ":source_id": source_id,
            ":created_at": util::format_timestamp(util::now()),
        },
    )?;
    Ok(())
}

fn put_sync_meta(conn: &Connection, key: &str, value: &dyn ToSql) -> Result<()> {
    conn.execute_cached(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (:key, :value)",
        named_params! { ":key": key, ":value": value },
    )?;
    Ok(())
}

fn get_timestamp(row: &Row<'_>, col: &str) -> Result<DateTime<Utc>> {
    let text: String = row.get(col)?;
    util::parse_timestamp(&text)
        .ok_or_else(|| Error::Corrupt(format!("bad timestamp in column {col}: {text:?}")))
}

fn get_opt_timestamp(row: &Row<'_>, col: &str) -> Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(col)?;
    match text {
        None => Ok(None),
        Some(text) => util::parse_timestamp(&text)
            .map(Some)
            .ok_or_else(|| Error::Corrupt(format!("bad timestamp in column {col}: {text:?}"))),
    }
}

pub(crate) fn lore_from_row(row: &Row<'_>) -> Result<LoreEntry> {
    let category: String = row.get("category")?;
    let status: String = row.get("embedding_status")?;
    let sources: Option<String> = row.get("sources")?;
    Ok(LoreEntry {
        id: row.get("id")?,
        content: row.get("content")?,
        context: row.get("context")?,
        category: category
            .parse::<LoreCategory>()
            .map_err(|_| Error::Corrupt(format!("unknown stored category {category:?}")))?,
        confidence: row.get("confidence")?,
        embedding: row.get("embedding")?,
        embedding_status: EmbeddingStatus::from_column(&status),
        source_id: row.get("source_id")?,
        sources: match sources {
            None => vec![],
            Some(json) => serde_json::from_str(&json)?,
        },
        validation_count: row.get::<_, i64>("validation_count")? as u32,
        last_validated_at: get_opt_timestamp(row, "last_validated_at")?,
        created_at: get_timestamp(row, "created_at")?,
        updated_at: get_timestamp(row, "updated_at")?,
        deleted_at: get_opt_timestamp(row, "deleted_at")?,
        synced_at: get_opt_timestamp(row, "synced_at")?,
    })
}

fn change_from_row(row: &Row<'_>) -> Result<ChangeRecord> {
    let operation: String = row.get("operation")?;
    let payload: Option<String> = row.get("payload")?;
    Ok(ChangeRecord {
        sequence: row.get("sequence")?,
        table_name: row.get("table_name")?,
        entity_id: row.get("entity_id")?,
        operation: ChangeOperation::from_column(&operation),
        payload: payload.as_deref().map(serde_json::from_str).transpose()?,
        source_id: row.get("source_id")?,
        created_at: get_timestamp(row, "created_at")?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::DEFAULT_CONFIDENCE;

    pub(crate) fn sample_entry(content: &str) -> LoreEntry {
        let now = util::now();
        LoreEntry {
            id: util::new_lore_id(),
            content: content.to_string(),
            context: None,
            category: LoreCategory::PatternOutcome,
            confidence: DEFAULT_CONFIDENCE,
            embedding: None,
            embedding_status: EmbeddingStatus::Pending,
            source_id: "test-source".to_string(),
            sources: vec![],
            validation_count: 0,
            last_validated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            synced_at: None,
        }
    }

    /// A sample entry whose `source_id` matches the db's own, the way
    /// locally-recorded lore looks.
    pub(crate) fn local_entry(db: &LoreDb, content: &str) -> LoreEntry {
        let mut entry = sample_entry(content);
        entry.source_id = db.source_id().to_string();
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{local_entry, sample_entry};
    use super::*;

    fn max_sequence(db: &LoreDb) -> i64 {
        db.conn_ext_query_one::<Option<i64>>("SELECT MAX(sequence) FROM change_log")
            .unwrap()
            .unwrap_or(0)
    }

    #[test]
    fn test_insert_appends_exactly_one_change() {
        let db = LoreDb::open_in_memory().unwrap();
        let before = max_sequence(&db);

        let entry = local_entry(&db, "queue consumers benefit from idempotency checks");
        db.insert_lore(&entry).unwrap();

        let changes = db.unpushed_changes(db.source_id(), before, 10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entity_id, entry.id);
        assert_eq!(changes[0].operation, ChangeOperation::Upsert);
        assert!(changes[0].sequence > before);

        // the payload is the full post-image
        let payload = changes[0].payload.as_ref().unwrap();
        assert_eq!(payload, &entry);
    }

    #[test]
    fn test_insert_validation_prevents_all_writes() {
        let db = LoreDb::open_in_memory().unwrap();
        let mut entry = local_entry(&db, "fine");
        entry.confidence = 7.0;
        assert!(matches!(
            db.insert_lore(&entry),
            Err(Error::InvalidLore(InvalidLore::InvalidConfidence(_)))
        ));
        assert_eq!(db.stats().unwrap().lore_count, 0);
        assert_eq!(max_sequence(&db), 0);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let db = LoreDb::open_in_memory().unwrap();
        let entry = local_entry(&db, "only one of me");
        db.insert_lore(&entry).unwrap();
        assert!(db.insert_lore(&entry).is_err());
        // the failed attempt logged nothing
        assert_eq!(db.unpushed_changes(db.source_id(), 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_then_get_is_not_found() {
        let db = LoreDb::open_in_memory().unwrap();
        let entry = local_entry(&db, "short-lived");
        db.insert_lore(&entry).unwrap();

        db.delete_lore(&entry.id).unwrap();
        assert!(matches!(db.get_lore(&entry.id), Err(Error::NotFound(_))));
        assert!(db.query_lore(&LoreQuery::default()).unwrap().is_empty());

        // insert + delete
        let changes = db.unpushed_changes(db.source_id(), 0, 10).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].operation, ChangeOperation::Delete);
        assert!(changes[1].payload.is_none());

        // repeated delete: no error, no extra log row
        db.delete_lore(&entry.id).unwrap();
        assert_eq!(db.unpushed_changes(db.source_id(), 0, 10).unwrap().len(), 2);

        assert!(matches!(
            db.delete_lore("no-such-id"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_upsert_is_idempotent_and_silent() {
        let db = LoreDb::open_in_memory().unwrap();
        let mut remote = sample_entry("from another client");
        remote.source_id = "remote-client".to_string();

        db.upsert_lore(&remote).unwrap();
        db.upsert_lore(&remote).unwrap();

        let got = db.get_lore(&remote.id).unwrap();
        assert_eq!(got, remote);
        // remote origin preserved, nothing logged
        assert_eq!(got.source_id, "remote-client");
        assert_eq!(max_sequence(&db), 0);
    }

    #[test]
    fn test_upsert_revives_deleted_row() {
        let db = LoreDb::open_in_memory().unwrap();
        let entry = local_entry(&db, "deleted then revived");
        db.insert_lore(&entry).unwrap();
        db.delete_lore(&entry.id).unwrap();

        let mut revived = entry.clone();
        revived.updated_at = util::now();
        db.upsert_lore(&revived).unwrap();
        assert!(db.get_lore(&entry.id).is_ok());
    }

    #[test]
    fn test_apply_remote_delete_never_logs() {
        let db = LoreDb::open_in_memory().unwrap();
        let mut remote = sample_entry("remote row");
        remote.source_id = "remote-client".to_string();
        db.upsert_lore(&remote).unwrap();

        db.apply_remote_delete(&remote.id).unwrap();
        assert!(matches!(db.get_lore(&remote.id), Err(Error::NotFound(_))));
        assert_eq!(max_sequence(&db), 0);

        // unknown ids are fine
        db.apply_remote_delete("never-heard-of-it").unwrap();
    }

    #[test]
    fn test_query_filters() {
        let db = LoreDb::open_in_memory().unwrap();
        let mut a = local_entry(&db, "high confidence pattern");
        a.confidence = 0.9;
        let mut b = local_entry(&db, "shaky dependency note");
        b.category = LoreCategory::DependencyBehavior;
        b.confidence = 0.3;
        let mut c = local_entry(&db, "embedded entry");
        c.embedding = Some(vec![0, 0, 128, 63]);
        db.insert_lore(&a).unwrap();
        db.insert_lore(&b).unwrap();
        db.insert_lore(&c).unwrap();

        let all = db.query_lore(&LoreQuery::default()).unwrap();
        assert_eq!(all.len(), 3);

        let confident = db
            .query_lore(&LoreQuery {
                min_confidence: Some(0.5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(confident.len(), 2);

        let deps = db
            .query_lore(&LoreQuery {
                categories: Some(vec![LoreCategory::DependencyBehavior]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, b.id);

        let embedded = db
            .query_lore(&LoreQuery {
                require_embedding: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].id, c.id);
    }

    #[test]
    fn test_get_lore_by_ids_omits_missing() {
        let db = LoreDb::open_in_memory().unwrap();
        let a = local_entry(&db, "first");
        let b = local_entry(&db, "second");
        db.insert_lore(&a).unwrap();
        db.insert_lore(&b).unwrap();

        let got = db
            .get_lore_by_ids(&[a.id.clone(), "missing".to_string(), b.id.clone()])
            .unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_feedback_clamps_and_counts() {
        let db = LoreDb::open_in_memory().unwrap();
        let mut entry = local_entry(&db, "nearly certain");
        entry.confidence = 0.95;
        db.insert_lore(&entry).unwrap();

        for _ in 0..5 {
            db.apply_feedback(&entry.id, FeedbackKind::Helpful).unwrap();
        }
        let got = db.get_lore(&entry.id).unwrap();
        assert_eq!(got.confidence, 1.0);
        assert_eq!(got.validation_count, 5);
        assert!(got.last_validated_at.is_some());

        // each helpful feedback logged one upsert
        let changes = db.unpushed_changes(db.source_id(), 0, 100).unwrap();
        assert_eq!(changes.len(), 6);
    }

    #[test]
    fn test_feedback_incorrect_floors_at_zero() {
        let db = LoreDb::open_in_memory().unwrap();
        let mut entry = local_entry(&db, "doubtful");
        entry.confidence = 0.3;
        db.insert_lore(&entry).unwrap();

        db.apply_feedback(&entry.id, FeedbackKind::Incorrect).unwrap();
        let got = db.apply_feedback(&entry.id, FeedbackKind::Incorrect).unwrap();
        assert_eq!(got.confidence, 0.0);
        assert_eq!(got.validation_count, 0);
    }

    #[test]
    fn test_feedback_not_relevant_writes_nothing() {
        let db = LoreDb::open_in_memory().unwrap();
        let entry = local_entry(&db, "meh");
        db.insert_lore(&entry).unwrap();
        let before_updated = db.get_lore(&entry.id).unwrap().updated_at;

        let got = db
            .apply_feedback(&entry.id, FeedbackKind::NotRelevant)
            .unwrap();
        assert_eq!(got.updated_at, before_updated);
        assert_eq!(db.unpushed_changes(db.source_id(), 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_feedback_missing_is_not_found() {
        let db = LoreDb::open_in_memory().unwrap();
        assert!(matches!(
            db.apply_feedback("nope", FeedbackKind::Helpful),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_unpushed_changes_filters_remote_origin() {
        let db = LoreDb::open_in_memory().unwrap();
        let local = local_entry(&db, "ours");
        db.insert_lore(&local).unwrap();

        // Simulate a pulled remote change that was (incorrectly) logged by
        // inserting a log row with a remote source directly.
        db.execute_cached(
            "INSERT INTO change_log (table_name, entity_id, operation, payload, source_id, created_at)
             VALUES ('lore_entries', 'their-id', 'upsert', NULL, 'remote-client', :now)",
            named_params! { ":now": util::format_timestamp(util::now()) },
        )
        .unwrap();

        let ours = db.unpushed_changes(db.source_id(), 0, 10).unwrap();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].entity_id, local.id);
    }

    #[test]
    fn test_unpushed_changes_respects_after_and_limit() {
        let db = LoreDb::open_in_memory().unwrap();
        for i in 0..5 {
            db.insert_lore(&local_entry(&db, &format!("entry {i}"))).unwrap();
        }
        let first_two = db.unpushed_changes(db.source_id(), 0, 2).unwrap();
        assert_eq!(first_two.len(), 2);
        let rest = db
            .unpushed_changes(db.source_id(), first_two[1].sequence, 10)
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest[0].sequence > first_two[1].sequence);
    }

    #[test]
    fn test_mark_synced() {
        let db = LoreDb::open_in_memory().unwrap();
        let entry = local_entry(&db, "pushed");
        db.insert_lore(&entry).unwrap();
        assert!(db.get_lore(&entry.id).unwrap().synced_at.is_none());

        db.mark_synced(&[entry.id.clone()], util::now()).unwrap();
        assert!(db.get_lore(&entry.id).unwrap().synced_at.is_some());
    }

    #[test]
    fn test_sync_cursors_default_to_zero() {
        let db = LoreDb::open_in_memory().unwrap();
        assert_eq!(db.last_push_seq().unwrap(), 0);
        assert_eq!(db.last_pull_seq().unwrap(), 0);
        db.set_last_push_seq(41).unwrap();
        db.set_last_pull_seq(7).unwrap();
        assert_eq!(db.last_push_seq().unwrap(), 41);
        assert_eq!(db.last_pull_seq().unwrap(), 7);
    }

    #[test]
    fn test_description_round_trip() {
        let db = LoreDb::open_in_memory().unwrap();
        assert_eq!(db.description().unwrap(), None);
        db.set_description(Some("team lore for the billing service")).unwrap();
        assert_eq!(
            db.description().unwrap().as_deref(),
            Some("team lore for the billing service")
        );
        db.set_description(None).unwrap();
        assert_eq!(db.description().unwrap(), None);
    }

    #[test]
    fn test_stats_and_detailed_stats() {
        let db = LoreDb::open_in_memory().unwrap();
        let mut a = local_entry(&db, "one");
        a.confidence = 0.5;
        let mut b = local_entry(&db, "two");
        b.category = LoreCategory::DomainKnowledge;
        b.confidence = 0.9;
        db.insert_lore(&a).unwrap();
        db.insert_lore(&b).unwrap();
        db.delete_lore(&a.id).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.lore_count, 1);
        assert_eq!(stats.deleted_count, 1);
        assert_eq!(stats.change_log_count, 3);
        assert_eq!(stats.unpushed_count, 3);

        let detailed = db.detailed_stats().unwrap();
        assert_eq!(detailed.by_category.len(), 1);
        assert_eq!(detailed.by_category[0].category, LoreCategory::DomainKnowledge);
        assert_eq!(detailed.average_confidence, 0.9);
        assert_eq!(detailed.embeddings_pending, 1);
    }

    #[test]
    fn test_has_pending_sync_counts_legacy_queue() {
        let db = LoreDb::open_in_memory().unwrap();
        assert!(!db.has_pending_sync().unwrap());

        db.execute_cached(
            "INSERT INTO sync_queue (lore_id, operation, payload, created_at)
             VALUES ('legacy', 'upsert', NULL, :now)",
            named_params! { ":now": util::format_timestamp(util::now()) },
        )
        .unwrap();
        assert!(db.has_pending_sync().unwrap());
    }

    #[test]
    fn test_clear_all_lore() {
        let db = LoreDb::open_in_memory().unwrap();
        db.insert_lore(&local_entry(&db, "going away")).unwrap();
        db.clear_all_lore().unwrap();
        assert_eq!(db.stats().unwrap().lore_count, 0);
    }

    #[test]
    fn test_wipe_for_reinit_resets_cursors() {
        let db = LoreDb::open_in_memory().unwrap();
        db.insert_lore(&local_entry(&db, "gone soon")).unwrap();
        db.set_last_push_seq(10).unwrap();
        db.set_last_pull_seq(20).unwrap();

        db.wipe_for_reinit().unwrap();
        assert_eq!(db.stats().unwrap().lore_count, 0);
        assert_eq!(db.stats().unwrap().change_log_count, 0);
        assert_eq!(db.last_push_seq().unwrap(), 0);
        assert_eq!(db.last_pull_seq().unwrap(), 0);
    }

    #[test]
    fn test_find_lore_by_id_prefix() {
        let db = LoreDb::open_in_memory().unwrap();
        let mut a = local_entry(&db, "prefixed");
        a.id = "abcd1234-rest-of-id".to_string();
        db.insert_lore(&a).unwrap();

        assert_eq!(db.find_lore_by_id_prefix("abcd1234").unwrap(), vec![a.id.clone()]);
        assert!(db.find_lore_by_id_prefix("zzzz9999").unwrap().is_empty());
    }

    #[test]
    fn test_replace_from_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot_path = tmp.path().join("snapshot.db");
        // Build a snapshot db with two live rows and one tombstone.
        {
            let snapshot = LoreDb::open(&snapshot_path).unwrap();
            let mut kept = sample_entry("kept one");
            kept.source_id = "server".to_string();
            let mut also = sample_entry("kept two");
            also.source_id = "server".to_string();
            let dead = local_entry(&snapshot, "tombstone");
            snapshot.upsert_lore(&kept).unwrap();
            snapshot.upsert_lore(&also).unwrap();
            snapshot.insert_lore(&dead).unwrap();
            snapshot.delete_lore(&dead.id).unwrap();
        }

        let db = LoreDb::open_in_memory().unwrap();
        db.insert_lore(&local_entry(&db, "local-only, replaced")).unwrap();
        db.set_last_push_seq(5).unwrap();

        let imported = db.replace_from_snapshot(&snapshot_path, 99).unwrap();
        assert_eq!(imported, 2);
        assert_eq!(db.stats().unwrap().lore_count, 2);
        assert_eq!(db.last_pull_seq().unwrap(), 99);
        // push cursor untouched
        assert_eq!(db.last_push_seq().unwrap(), 5);
    }

    #[test]
    fn test_replace_from_bad_snapshot_leaves_store_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let bogus = tmp.path().join("bogus.db");
        std::fs::write(&bogus, b"definitely not sqlite").unwrap();

        let db = LoreDb::open_in_memory().unwrap();
        db.insert_lore(&local_entry(&db, "survivor")).unwrap();

        assert!(matches!(
            db.replace_from_snapshot(&bogus, 10),
            Err(Error::Corrupt(_))
        ));
        assert_eq!(db.stats().unwrap().lore_count, 1);
        assert_eq!(db.last_pull_seq().unwrap(), 0);
    }
}
