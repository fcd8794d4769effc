/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{
    types::FromSql, Connection, Params, Result as SqlResult, Row, Transaction,
    TransactionBehavior,
};
use std::ops::Deref;

/// Convenience helpers over `rusqlite::{Connection, Transaction}`. Import
/// `ConnExt` to call these on anything holding a connection.
pub trait ConnExt {
    /// The only method an implementor needs to supply.
    fn conn(&self) -> &Connection;

    /// Execute each statement in `stmts`, in order.
    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute_batch(sql)?;
        }
        Ok(())
    }

    /// `Connection::execute` through the prepared-statement cache.
    fn execute_cached<P: Params>(&self, sql: &str, params: P) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Run a query returning a single value in a single row.
    fn conn_ext_query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row(sql, [], |row| row.get(0))
    }

    /// Like `query_row`, but `Ok(None)` when the query returns no rows.
    fn try_query_row<T, E, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Option<T>, E>
    where
        P: Params,
        E: From<rusqlite::Error>,
        F: FnOnce(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(mapper(row)?)),
        }
    }

    /// Run a query and collect every row through `mapper`.
    fn query_rows_and_then<T, E, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Vec<T>, E>
    where
        P: Params,
        E: From<rusqlite::Error>,
        F: FnMut(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_and_then(params, mapper)?;
        rows.collect()
    }

    /// Begin a transaction on a shared connection reference. See
    /// [`UncheckedTransaction`] for the caveats.
    fn unchecked_transaction(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Deferred)
    }

    /// As above, but taking the write lock up front. Use for transactions
    /// that are certain to mutate, to avoid a mid-transaction upgrade.
    fn unchecked_transaction_imm(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Immediate)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Transaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

/// rusqlite's `Transaction` insists on `&mut Connection` to guarantee no
/// nesting. Our connections sit behind locks that hand out shared
/// references, so we provide a transaction over `&Connection` instead; the
/// caller is responsible for not nesting (the surrounding lock enforces
/// this). Rolls back on drop unless committed.
pub struct UncheckedTransaction<'conn> {
    conn: &'conn Connection,
    finished: bool,
}

impl<'conn> UncheckedTransaction<'conn> {
    pub fn new(conn: &'conn Connection, behavior: TransactionBehavior) -> SqlResult<Self> {
        let sql = match behavior {
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
            _ => "BEGIN DEFERRED",
        };
        conn.execute_batch(sql)
            .map(move |_| UncheckedTransaction {
                conn,
                finished: false,
            })
    }

    pub fn commit(mut self) -> SqlResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> SqlResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for UncheckedTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            log::warn!("Error rolling back dropped transaction: {}", e);
        }
    }
}

impl Deref for UncheckedTransaction<'_> {
    type Target = Connection;
    #[inline]
    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl ConnExt for UncheckedTransaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self.conn
    }
}
