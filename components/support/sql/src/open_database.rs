/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Open a SQLite database and bring it to the current schema version.
//!
//! Components implement [`ConnectionInitializer`] to describe their schema:
//! `init` builds a fresh database at `END_VERSION`, and `upgrade_from(v)`
//! migrates version `v` to `v + 1`. The driver walks versions forward one at
//! a time inside a single transaction, using `PRAGMA user_version` as the
//! source of truth. Downgrades are not supported: a database newer than
//! `END_VERSION` is rejected rather than guessed at.

use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::Path;

use crate::ConnExt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),
    #[error("Database version too new: {0}")]
    VersionTooNew(u32),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    MigrationError(String),
}

impl Error {
    /// A migration can use this to signal that the database contents are
    /// beyond repair for the target version.
    pub fn migration(msg: impl Into<String>) -> Self {
        Self::MigrationError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait ConnectionInitializer {
    /// Name displayed in the logs.
    const NAME: &'static str;

    /// The version `init` creates and `upgrade_from` converges on.
    const END_VERSION: u32;

    /// Runs against every open, before any schema work, outside the
    /// migration transaction. Pragmas go here.
    fn prepare(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
        Ok(())
    }

    /// Create the full schema on an empty database.
    fn init(&self, tx: &Transaction<'_>) -> Result<()>;

    /// Upgrade from `version` to `version + 1`.
    fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()>;

    /// Runs after init/upgrade, inside the same transaction.
    fn finish(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
        Ok(())
    }
}

pub fn open_database<CI: ConnectionInitializer>(
    path: impl AsRef<Path>,
    initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(path, OpenFlags::default(), initializer)
}

pub fn open_memory_database<CI: ConnectionInitializer>(initializer: &CI) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    initialize(&mut conn, initializer, true)?;
    Ok(conn)
}

pub fn open_database_with_flags<CI: ConnectionInitializer>(
    path: impl AsRef<Path>,
    open_flags: OpenFlags,
    initializer: &CI,
) -> Result<Connection> {
    let db_empty = !path.as_ref().exists();
    let mut conn = Connection::open_with_flags(path, open_flags)?;
    initialize(&mut conn, initializer, db_empty)?;
    Ok(conn)
}

fn initialize<CI: ConnectionInitializer>(
    conn: &mut Connection,
    initializer: &CI,
    db_empty: bool,
) -> Result<()> {
    log::debug!("{}: opening database (empty: {})", CI::NAME, db_empty);
    initializer.prepare(conn, db_empty)?;

    let tx = conn.transaction()?;
    if db_empty {
        log::debug!("{}: initializing new database", CI::NAME);
        initializer.init(&tx)?;
    } else {
        let mut current = get_schema_version(&tx)?;
        if current > CI::END_VERSION {
            return Err(Error::VersionTooNew(current));
        }
        if current == 0 {
            // A file created outside the initializer (or an interrupted
            // first open): treat it as brand new.
            initializer.init(&tx)?;
        } else {
            while current < CI::END_VERSION {
                log::debug!("{}: upgrading schema from {}", CI::NAME, current);
                initializer.upgrade_from(&tx, current)?;
                current += 1;
            }
        }
    }
    set_schema_version(&tx, CI::END_VERSION)?;
    initializer.finish(&tx, db_empty)?;
    tx.commit()?;
    log::debug!("{}: database open successful", CI::NAME);
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.conn_ext_query_one::<u32>("PRAGMA user_version")?)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
    Ok(())
}

// Not #[cfg(test)]: other crates use this in their own schema tests.
pub mod test_utils {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A database file seeded with an old schema snapshot, for exercising
    /// upgrades the way they run in the real world: against a fresh
    /// connection each time.
    pub struct MigratedDatabaseFile {
        // Keeps the file alive for the duration of the test.
        _tempdir: TempDir,
        pub path: PathBuf,
    }

    impl MigratedDatabaseFile {
        pub fn new(initial_schema_sql: &str, initial_version: u32) -> Self {
            let tempdir = tempfile::tempdir().unwrap();
            let path = tempdir.path().join("db.sqlite");
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(initial_schema_sql).unwrap();
            set_schema_version(&conn, initial_version).unwrap();
            Self {
                _tempdir: tempdir,
                path,
            }
        }

        pub fn open(&self) -> Connection {
            Connection::open(&self.path).unwrap()
        }

        pub fn schema_version(&self) -> u32 {
            get_schema_version(&self.open()).unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::MigratedDatabaseFile;
    use super::*;

    struct TestInitializer;

    impl ConnectionInitializer for TestInitializer {
        const NAME: &'static str = "test db";
        const END_VERSION: u32 = 3;

        fn init(&self, tx: &Transaction<'_>) -> Result<()> {
            tx.execute_batch("CREATE TABLE items (name TEXT NOT NULL, score INTEGER)")?;
            Ok(())
        }

        fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()> {
            match version {
                1 => {
                    tx.execute_batch("ALTER TABLE things RENAME TO items")?;
                    Ok(())
                }
                2 => {
                    tx.execute_batch("ALTER TABLE items ADD COLUMN score INTEGER")?;
                    Ok(())
                }
                _ => Err(Error::IncompatibleVersion(version)),
            }
        }
    }

    const V1_SCHEMA: &str = "CREATE TABLE things (name TEXT NOT NULL);";

    #[test]
    fn test_init_fresh() {
        let conn = open_memory_database(&TestInitializer).unwrap();
        assert_eq!(conn.conn_ext_query_one::<u32>("PRAGMA user_version").unwrap(), 3);
        conn.execute("INSERT INTO items (name, score) VALUES ('a', 1)", [])
            .unwrap();
    }

    #[test]
    fn test_upgrade_chain() {
        let db_file = MigratedDatabaseFile::new(V1_SCHEMA, 1);
        db_file
            .open()
            .execute("INSERT INTO things (name) VALUES ('kept')", [])
            .unwrap();

        let conn = open_database(&db_file.path, &TestInitializer).unwrap();
        assert_eq!(conn.conn_ext_query_one::<u32>("PRAGMA user_version").unwrap(), 3);
        let name: String = conn.conn_ext_query_one("SELECT name FROM items").unwrap();
        assert_eq!(name, "kept");
    }

    #[test]
    fn test_open_current_is_noop() {
        let db_file = MigratedDatabaseFile::new(V1_SCHEMA, 1);
        drop(open_database(&db_file.path, &TestInitializer).unwrap());
        drop(open_database(&db_file.path, &TestInitializer).unwrap());
        assert_eq!(db_file.schema_version(), 3);
    }

    #[test]
    fn test_version_too_new() {
        let db_file = MigratedDatabaseFile::new(V1_SCHEMA, 99);
        assert!(matches!(
            open_database(&db_file.path, &TestInitializer),
            Err(Error::VersionTooNew(99))
        ));
    }

    #[test]
    fn test_failed_upgrade_rolls_back() {
        struct Buggy;
        impl ConnectionInitializer for Buggy {
            const NAME: &'static str = "buggy db";
            const END_VERSION: u32 = 2;
            fn init(&self, _tx: &Transaction<'_>) -> Result<()> {
                Ok(())
            }
            fn upgrade_from(&self, _tx: &Transaction<'_>, _version: u32) -> Result<()> {
                Err(Error::migration("boom"))
            }
        }

        let db_file = MigratedDatabaseFile::new(V1_SCHEMA, 1);
        assert!(open_database(&db_file.path, &Buggy).is_err());
        // The failed upgrade must not have bumped the version.
        assert_eq!(db_file.schema_version(), 1);
    }
}
