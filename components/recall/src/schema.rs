/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Recall storage schema
//! =====================
//!
//! Five tables:
//!
//! - `lore_entries`: the primary records, soft-deleted via `deleted_at`.
//! - `change_log`: append-only record of local mutations. `sequence` is the
//!   AUTOINCREMENT rowid, which gives the strict per-store total order the
//!   sync protocol relies on.
//! - `sync_queue`: the v1 outbound queue. Retained (empty) for backward
//!   compatibility; the v1 -> v2 upgrade drains it into `change_log`.
//! - `sync_meta`: key/value sync state (`source_id`, push/pull cursors).
//! - `metadata`: key/value store descriptors (`description`, `created_at`,
//!   `migrated_from`).
//!
//! All timestamps are RFC 3339 UTC TEXT. Confidence bounds are enforced by
//! CHECK constraints as a last line of defence behind the validation layer.

use rusqlite::{Connection, Transaction};
use sql_support::open_database::{ConnectionInitializer, Error as OpenError, Result as OpenResult};
use sql_support::ConnExt;

use crate::util;

pub(crate) const VERSION: u32 = 2;

pub(crate) const CREATE_LORE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS lore_entries (
        id                TEXT NOT NULL PRIMARY KEY,
        content           TEXT NOT NULL,
        context           TEXT,
        category          TEXT NOT NULL,
        confidence        REAL NOT NULL DEFAULT 0.7
                          CHECK (confidence >= 0.0 AND confidence <= 1.0),
        embedding         BLOB,
        embedding_status  TEXT NOT NULL DEFAULT 'pending'
                          CHECK (embedding_status IN ('pending', 'complete', 'failed')),
        source_id         TEXT NOT NULL,
        sources           TEXT,
        validation_count  INTEGER NOT NULL DEFAULT 0 CHECK (validation_count >= 0),
        last_validated_at TEXT,
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL,
        deleted_at        TEXT,
        synced_at         TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_lore_entries_live
        ON lore_entries (deleted_at, category);
    CREATE INDEX IF NOT EXISTS idx_lore_entries_updated
        ON lore_entries (updated_at);
";

pub(crate) const CREATE_CHANGE_LOG_SQL: &str = "
    CREATE TABLE IF NOT EXISTS change_log (
        sequence   INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL DEFAULT 'lore_entries',
        entity_id  TEXT NOT NULL,
        operation  TEXT NOT NULL CHECK (operation IN ('upsert', 'delete')),
        payload    TEXT,
        source_id  TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_change_log_source
        ON change_log (source_id, sequence);
";

// The legacy outbound queue. New writes never touch it, but an old client
// may leave rows here that `has_pending_sync` must still count.
pub(crate) const CREATE_SYNC_QUEUE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_queue (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        lore_id    TEXT NOT NULL,
        operation  TEXT NOT NULL,
        payload    TEXT,
        created_at TEXT NOT NULL
    );
";

pub(crate) const CREATE_SYNC_META_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_meta (
        key    TEXT PRIMARY KEY,
        value  NOT NULL
    );
";

pub(crate) const CREATE_METADATA_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS metadata (
        key    TEXT PRIMARY KEY,
        value  NOT NULL
    );
";

// sync_meta keys
pub(crate) static SOURCE_ID_META_KEY: &str = "source_id";
pub(crate) static LAST_PUSH_SEQ_META_KEY: &str = "last_push_seq";
pub(crate) static LAST_PULL_SEQ_META_KEY: &str = "last_pull_seq";
pub(crate) static LAST_SYNC_META_KEY: &str = "last_sync";
pub(crate) static SCHEMA_VERSION_META_KEY: &str = "schema_version";

// metadata keys
pub(crate) static DESCRIPTION_META_KEY: &str = "description";
pub(crate) static CREATED_AT_META_KEY: &str = "created_at";
pub(crate) static MIGRATED_FROM_META_KEY: &str = "migrated_from";

pub(crate) struct RecallConnectionInitializer;

impl ConnectionInitializer for RecallConnectionInitializer {
    const NAME: &'static str = "recall storage db";
    const END_VERSION: u32 = VERSION;

    fn prepare(&self, conn: &Connection, _db_empty: bool) -> OpenResult<()> {
        let initial_pragmas = "
            -- Readers must not block a writer's commit.
            PRAGMA journal_mode = WAL;
            PRAGMA temp_store = 2;
            PRAGMA foreign_keys = ON;
        ";
        conn.execute_batch(initial_pragmas)?;
        conn.set_prepared_statement_cache_capacity(128);
        Ok(())
    }

    fn init(&self, db: &Transaction<'_>) -> OpenResult<()> {
        log::debug!("Creating schema");
        db.execute_all(&[
            CREATE_LORE_TABLE_SQL,
            CREATE_CHANGE_LOG_SQL,
            CREATE_SYNC_QUEUE_SQL,
            CREATE_SYNC_META_TABLE_SQL,
            CREATE_METADATA_TABLE_SQL,
        ])?;
        init_store_identity(db)?;
        Ok(())
    }

    fn upgrade_from(&self, db: &Transaction<'_>, version: u32) -> OpenResult<()> {
        match version {
            1 => upgrade_from_v1(db),
            _ => Err(OpenError::IncompatibleVersion(version)),
        }
    }
}

/// Seed `sync_meta`/`metadata` for a brand new store: a persistent v4
/// `source_id`, the creation stamp, and the informational schema version.
fn init_store_identity(db: &Connection) -> OpenResult<()> {
    let now = util::format_timestamp(util::now());
    db.execute_cached(
        "INSERT OR IGNORE INTO sync_meta (key, value) VALUES (:key, :value)",
        rusqlite::named_params! { ":key": SOURCE_ID_META_KEY, ":value": util::new_source_id() },
    )?;
    db.execute_cached(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (:key, :value)",
        rusqlite::named_params! { ":key": SCHEMA_VERSION_META_KEY, ":value": VERSION },
    )?;
    db.execute_cached(
        "INSERT OR IGNORE INTO metadata (key, value) VALUES (:key, :value)",
        rusqlite::named_params! { ":key": CREATED_AT_META_KEY, ":value": now },
    )?;
    Ok(())
}

/// v1 kept a flat `lore` table and queued outbound work in `sync_queue`.
/// Bring the rows across, then replay anything still queued into the new
/// change log so no unsynced work is lost. The queue table itself survives,
/// empty, because old tooling still looks for it.
fn upgrade_from_v1(db: &Transaction<'_>) -> OpenResult<()> {
    db.execute_all(&[
        CREATE_LORE_TABLE_SQL,
        CREATE_CHANGE_LOG_SQL,
        CREATE_SYNC_META_TABLE_SQL,
        CREATE_METADATA_TABLE_SQL,
    ])?;
    init_store_identity(db)?;

    let source_id: String = db.conn_ext_query_one(&format!(
        "SELECT value FROM sync_meta WHERE key = '{}'",
        SOURCE_ID_META_KEY
    ))?;

    db.execute_cached(
        "INSERT INTO lore_entries
            (id, content, context, category, confidence, embedding_status,
             source_id, validation_count, created_at, updated_at)
         SELECT id, content, context, category, confidence, 'pending',
                :source_id, 0, created_at, updated_at
         FROM lore",
        rusqlite::named_params! { ":source_id": source_id },
    )?;

    // Replay still-queued work in its original order; AUTOINCREMENT assigns
    // fresh monotonic sequences.
    db.execute_cached(
        "INSERT INTO change_log (table_name, entity_id, operation, payload, source_id, created_at)
         SELECT 'lore_entries', lore_id, operation, payload, :source_id, created_at
         FROM sync_queue
         ORDER BY id",
        rusqlite::named_params! { ":source_id": source_id },
    )?;
    db.execute_batch("DELETE FROM sync_queue; DROP TABLE lore;")?;

    db.execute_cached(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (:key, '1')",
        rusqlite::named_params! { ":key": MIGRATED_FROM_META_KEY },
    )?;
    Ok(())
}
