/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{Interrupted, Interruptee};

/// A handle that can interrupt SQL work happening on another thread.
///
/// One handle is created per database connection and lives as long as the
/// connection does. Calling `interrupt()` does two things:
///
///   - asks SQLite to abort the statement currently running on the
///     connection (if any), and
///   - bumps a generation counter, which marks every currently-live
///     `SqlInterruptScope` as interrupted.
///
/// Operations begin a scope *before* doing any work and check it at loop
/// boundaries; a scope created after `interrupt()` returns is not considered
/// interrupted, so a later operation on the same connection starts clean.
pub struct SqlInterruptHandle {
    db_handle: rusqlite::InterruptHandle,
    generation: Arc<AtomicUsize>,
}

impl SqlInterruptHandle {
    pub fn new(conn: &rusqlite::Connection) -> Self {
        Self {
            db_handle: conn.get_interrupt_handle(),
            generation: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Begin a scope for one logical operation.
    pub fn begin_interrupt_scope(&self) -> SqlInterruptScope {
        SqlInterruptScope {
            start_generation: self.generation.load(Ordering::SeqCst),
            generation: Arc::clone(&self.generation),
        }
    }

    /// Interrupt all scopes started before this call.
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.db_handle.interrupt();
    }
}

impl std::fmt::Debug for SqlInterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SqlInterruptHandle(generation: {})",
            self.generation.load(Ordering::SeqCst)
        )
    }
}

/// Created via `SqlInterruptHandle::begin_interrupt_scope()`.
#[derive(Clone, Debug)]
pub struct SqlInterruptScope {
    start_generation: usize,
    generation: Arc<AtomicUsize>,
}

impl SqlInterruptScope {
    /// Check if scope has been interrupted.
    #[inline]
    pub fn was_interrupted(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.start_generation
    }

    /// Return `Err(Interrupted)` if the scope was interrupted.
    #[inline]
    pub fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

impl Interruptee for SqlInterruptScope {
    #[inline]
    fn was_interrupted(&self) -> bool {
        SqlInterruptScope::was_interrupted(self)
    }
}

/// A free-standing interrupt flag, for cancelling work that doesn't run on a
/// database connection (HTTP requests between batches, retry sleeps).
#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst)
    }
}

impl Interruptee for InterruptFlag {
    #[inline]
    fn was_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
