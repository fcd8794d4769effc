/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! SQLite plumbing shared by the recall components: connection helpers that
//! cut down on rusqlite boilerplate, and a schema-migration driver for
//! opening databases at the current version.

mod conn_ext;
pub mod open_database;

pub use conn_ext::{ConnExt, UncheckedTransaction};

/// `"?,?,?"` with `count` placeholders, for building `IN (...)` lists.
pub fn repeat_sql_vars(count: usize) -> String {
    let mut s = String::with_capacity(count * 2);
    for i in 0..count {
        if i != 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}
