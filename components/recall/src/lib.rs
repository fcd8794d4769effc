/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! Recall: an offline-first store for "lore" — small categorised notes
//! with confidence scores that evolve via feedback — synchronised with a
//! central Engram service when one is configured.
//!
//! Each store is a single SQLite database holding the entries, an
//! append-only change log of local mutations, and the sync cursors. Local
//! operations are always available; push, pull and bootstrap are
//! incremental, resumable, and cancellable.
//!
//! Embedders hold a [`RecallClient`], which owns one resolved store, the
//! optional Engram peer, and the per-process session of `L1, L2, …`
//! references handed out by queries.

mod changelog;
mod client;
mod config;
mod db;
mod error;
mod import_export;
mod ranking;
mod registry;
mod schema;
mod session;
mod store;
mod sync;
mod types;
mod util;

pub use changelog::{ChangeOperation, ChangeRecord};
pub use client::{QueryHit, QueryOptions, RecallClient};
pub use config::{
    RecallConfig, ENV_API_KEY, ENV_DB_PATH, ENV_ENGRAM_URL, ENV_SOURCE_ID, ENV_STORE_ID,
};
pub use error::{redact_api_key, Error, InvalidLore, Result};
pub use import_export::{export_json, export_sqlite, import_json, ImportReport, MergeStrategy};
pub use ranking::{cosine_similarity, decode_embedding, keyword_score, rank, RankedLore, DEFAULT_TOP_K};
pub use registry::{
    encode_store_id, validate_store_id, StoreListing, StoreRegistry, DEFAULT_STORE_ID,
};
pub use session::SessionEntry;
pub use store::LoreStore;
pub use sync::{
    bootstrap, pull, push, reinitialize, BootstrapOutcome, EngramClient, PullOutcome, PushOutcome,
    RemoteStoreInfo, RemoteStoreList,
};
pub use types::{
    CategoryCount, DetailedStats, EmbeddingStatus, FeedbackKind, LoreCategory, LoreEntry,
    LoreQuery, StoreStats, DEFAULT_CONFIDENCE, MAX_CONTENT_LEN, MAX_CONTEXT_LEN,
};

// Re-exported so embedders can drive cancellation without a direct
// dependency on the support crate.
pub use interrupt_support::{Interrupted, Interruptee, NeverInterrupts, SqlInterruptScope};
