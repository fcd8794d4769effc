/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! `RecallClient` is what embedders hold: one resolved store, an optional
//! Engram peer, and the per-process session. The CLI and the MCP adapter
//! both sit directly on top of this type and add nothing but argument
//! marshalling.

use std::sync::Arc;

use interrupt_support::Interruptee;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::RecallConfig;
use crate::error::*;
use crate::import_export::{self, ImportReport, MergeStrategy};
use crate::ranking::{self, DEFAULT_TOP_K};
use crate::session::{Session, SessionEntry};
use crate::store::LoreStore;
use crate::sync::{
    self, BootstrapOutcome, EngramClient, PullOutcome, PushOutcome, RemoteStoreList,
};
use crate::types::{
    DetailedStats, EmbeddingStatus, FeedbackKind, LoreCategory, LoreEntry, LoreQuery, StoreStats,
    DEFAULT_CONFIDENCE,
};
use crate::util;

/// One entry a query surfaced, with its session reference and score.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub reference: String,
    pub score: f32,
    #[serde(flatten)]
    pub entry: LoreEntry,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub top_k: usize,
    pub min_confidence: Option<f64>,
    pub categories: Option<Vec<LoreCategory>>,
    /// An embedding of the query text, if the embedder produced one. The
    /// core never computes embeddings itself.
    pub query_embedding: Option<Vec<f32>>,
    /// Only consider entries that carry an embedding.
    pub require_embedding: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_confidence: None,
            categories: None,
            query_embedding: None,
            require_embedding: false,
        }
    }
}

pub struct RecallClient {
    store: Arc<LoreStore>,
    engram: Option<EngramClient>,
    session: Mutex<Session>,
    store_id: String,
}

impl RecallClient {
    /// Build a client from config: resolve the store (explicit path beats
    /// registry resolution), open it, and connect the Engram peer when a
    /// URL is configured.
    pub fn new(config: &RecallConfig) -> Result<Self> {
        let registry = config.registry();
        let store_id = registry.resolve(config.store_id.as_deref())?;
        let store = match &config.lore_path {
            Some(path) => LoreStore::open_with_source_id(path, config.source_id.as_deref())?,
            None => registry.open(&store_id, config.source_id.as_deref())?,
        };
        let engram = config
            .engram_url
            .as_deref()
            .map(|url| EngramClient::new(url, config.api_key.clone()))
            .transpose()?;
        log::debug!("client ready for store {store_id:?} (offline: {})", engram.is_none());
        Ok(Self {
            store: Arc::new(store),
            engram,
            session: Mutex::new(Session::new()),
            store_id,
        })
    }

    /// An offline client over an in-memory store. Useful for embedders'
    /// tests and throwaway sessions.
    pub fn new_in_memory() -> Result<Self> {
        Ok(Self {
            store: Arc::new(LoreStore::open_in_memory()?),
            engram: None,
            session: Mutex::new(Session::new()),
            store_id: crate::registry::DEFAULT_STORE_ID.to_string(),
        })
    }

    pub fn store(&self) -> &Arc<LoreStore> {
        &self.store
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn is_offline(&self) -> bool {
        self.engram.is_none()
    }

    fn engram(&self) -> Result<&EngramClient> {
        self.engram.as_ref().ok_or(Error::Offline)
    }

    /// Capture a new piece of lore.
    pub fn record(
        &self,
        content: &str,
        context: Option<&str>,
        category: LoreCategory,
        confidence: Option<f64>,
        sources: Vec<String>,
    ) -> Result<LoreEntry> {
        let now = util::now();
        let entry = LoreEntry {
            id: util::new_lore_id(),
            content: content.to_string(),
            context: context.map(str::to_string),
            category,
            confidence: confidence.unwrap_or(DEFAULT_CONFIDENCE),
            embedding: None,
            embedding_status: EmbeddingStatus::Pending,
            source_id: self.store.source_id()?,
            sources,
            validation_count: 0,
            last_validated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            synced_at: None,
        };
        self.store.insert_lore(&entry)?;
        log::info!("recorded {} ({})", entry.id, entry.category);
        Ok(entry)
    }

    /// Rank matching entries and surface the top-k, assigning each a fresh
    /// session reference.
    pub fn query(&self, text: &str, options: &QueryOptions) -> Result<Vec<QueryHit>> {
        let candidates = self.store.query_lore(&LoreQuery {
            min_confidence: options.min_confidence,
            categories: options.categories.clone(),
            require_embedding: options.require_embedding,
        })?;
        let ranked = ranking::rank(
            candidates,
            text,
            options.query_embedding.as_deref(),
            options.top_k,
        );
        let entries: Vec<LoreEntry> = ranked.iter().map(|r| r.entry.clone()).collect();
        let references = self.session.lock().assign(&entries);
        Ok(ranked
            .into_iter()
            .zip(references)
            .map(|(ranked, reference)| QueryHit {
                reference,
                score: ranked.score,
                entry: ranked.entry,
            })
            .collect())
    }

    /// Apply feedback to an entry named by session reference, id, id
    /// prefix, or content prefix.
    pub fn feedback(&self, reference: &str, kind: FeedbackKind) -> Result<LoreEntry> {
        let id = self.resolve_reference(reference)?;
        self.store.apply_feedback(&id, kind)
    }

    /// Apply a batch of feedback items independently: one bad reference
    /// doesn't stop the rest.
    pub fn feedback_batch(
        &self,
        items: &[(String, FeedbackKind)],
    ) -> Vec<(String, Result<LoreEntry>)> {
        items
            .iter()
            .map(|(reference, kind)| (reference.clone(), self.feedback(reference, *kind)))
            .collect()
    }

    /// Resolution precedence: session reference, exact id, unique 8-char
    /// id prefix, then fuzzy content prefix against sessioned entries.
    fn resolve_reference(&self, reference: &str) -> Result<String> {
        let session = self.session.lock();
        if let Some(entry) = session.resolve_reference(reference) {
            return Ok(entry.id.clone());
        }
        match self.store.get_lore(reference) {
            Ok(entry) => return Ok(entry.id),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if reference.len() == 8 {
            let matches = self.store.find_lore_by_id_prefix(reference)?;
            match matches.len() {
                0 => {}
                1 => return Ok(matches.into_iter().next().unwrap()),
                count => {
                    return Err(Error::AmbiguousRef {
                        reference: reference.to_string(),
                        count,
                    })
                }
            }
        }
        if let Some(entry) = session.resolve_content_prefix(reference)? {
            return Ok(entry.id.clone());
        }
        Err(Error::NotFound(reference.to_string()))
    }

    /// Everything surfaced in this process so far.
    pub fn session_entries(&self) -> Vec<SessionEntry> {
        self.session.lock().entries().to_vec()
    }

    // Sync. All of these fail fast with `Offline` when no Engram URL is
    // configured.

    pub fn sync_push(&self, scope: &dyn Interruptee) -> Result<PushOutcome> {
        sync::push(&self.store, self.engram()?, scope)
    }

    pub fn sync_pull(&self, scope: &dyn Interruptee) -> Result<PullOutcome> {
        sync::pull(&self.store, self.engram()?, scope)
    }

    pub fn sync_bootstrap(&self, scope: &dyn Interruptee) -> Result<BootstrapOutcome> {
        sync::bootstrap(&self.store, self.engram()?, &self.store_id, scope)
    }

    pub fn sync_reinitialize(&self, scope: &dyn Interruptee) -> Result<BootstrapOutcome> {
        sync::reinitialize(&self.store, self.engram()?, &self.store_id, scope)
    }

    pub fn health(&self) -> Result<()> {
        self.engram()?.health()
    }

    pub fn list_remote_stores(&self, scope: &dyn Interruptee) -> Result<RemoteStoreList> {
        self.engram()?.list_stores(scope)
    }

    // Local surfaces.

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    pub fn detailed_stats(&self) -> Result<DetailedStats> {
        self.store.detailed_stats()
    }

    pub fn export_json<W: std::io::Write>(&self, writer: &mut W) -> Result<u64> {
        import_export::export_json(&self.store, writer)
    }

    pub fn export_sqlite(&self, dest: &std::path::Path) -> Result<()> {
        import_export::export_sqlite(&self.store, dest)
    }

    pub fn import_json<R: std::io::Read>(
        &self,
        reader: R,
        strategy: MergeStrategy,
        dry_run: bool,
    ) -> Result<ImportReport> {
        import_export::import_json(&self.store, reader, strategy, dry_run)
    }
}
