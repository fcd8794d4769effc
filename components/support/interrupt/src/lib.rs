/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Cancellation support shared by the recall crates.
//!
//! Long-running operations (sync protocols, imports, wipes) take a
//! `&dyn Interruptee` and are expected to call `err_if_interrupted()` at
//! loop boundaries. `SqlInterruptHandle` additionally interrupts any
//! statement currently executing on the database connection it was created
//! from, so a stuck query does not delay cancellation.

mod sql;

pub use sql::{SqlInterruptHandle, SqlInterruptScope};

/// The error returned by `err_if_interrupted`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("The operation was interrupted")]
pub struct Interrupted;

/// Something that can check whether the current operation should stop.
///
/// Decoupled from the interrupt *mechanics* so that code which only wants to
/// bail out early doesn't need to know how the signal is delivered.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

/// An `Interruptee` that never fires. Handy for tests and for callers that
/// genuinely have no cancellation source.
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}
