/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Synchronisation against Engram: the HTTP peer client and the four
//! protocols (push, pull, bootstrap, reinitialize). The protocols share an
//! error taxonomy and the sync-meta cursors but are otherwise independent
//! operations; there is deliberately no trait abstracting over them.

mod engine;
mod http;

pub use engine::{bootstrap, pull, push, reinitialize, PUSH_BATCH_SIZE};
pub use http::{DeltaResponse, EngramClient, PushResponse, RemoteStoreInfo, RemoteStoreList};

use serde::Serialize;

/// What a completed `push` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    pub pushed: u64,
    pub last_push_seq: i64,
}

/// What a completed `pull` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullOutcome {
    pub applied: u64,
    pub skipped: u64,
    pub last_pull_seq: i64,
}

/// What a completed `bootstrap` / `reinitialize` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapOutcome {
    pub imported: u64,
    pub snapshot_sequence: i64,
}
