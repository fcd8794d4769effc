/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Per-process session state: every entry surfaced by a query gets a short
//! reference (`L1`, `L2`, …) that feedback can use instead of a full id.
//! Nothing here is persisted; a one-shot CLI invocation starts empty, while
//! a long-lived embedding (an MCP server holding one client) accumulates
//! references for its whole connection.

use serde::Serialize;

use crate::error::*;
use crate::types::LoreEntry;

/// How much of the content we keep for fuzzy matching.
const CONTENT_PREFIX_LEN: usize = 80;

/// The minimum prefix length for a fuzzy content match; anything shorter is
/// too likely to hit several entries.
const FUZZY_MIN_LEN: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub reference: String,
    pub id: String,
    pub content_prefix: String,
}

#[derive(Debug, Default)]
pub struct Session {
    entries: Vec<SessionEntry>,
    assigned: usize,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out fresh references for a batch of surfaced entries, in
    /// surfacing order. An entry surfaced twice gets a new reference each
    /// time; the old one keeps resolving.
    pub fn assign(&mut self, entries: &[LoreEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|entry| {
                self.assigned += 1;
                let reference = format!("L{}", self.assigned);
                self.entries.push(SessionEntry {
                    reference: reference.clone(),
                    id: entry.id.clone(),
                    content_prefix: entry
                        .content
                        .chars()
                        .take(CONTENT_PREFIX_LEN)
                        .collect::<String>()
                        .to_lowercase(),
                });
                reference
            })
            .collect()
    }

    /// Everything surfaced so far, oldest first.
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact reference lookup (`L3`), case-insensitive.
    pub fn resolve_reference(&self, reference: &str) -> Option<&SessionEntry> {
        self.entries
            .iter()
            .find(|entry| entry.reference.eq_ignore_ascii_case(reference))
    }

    /// Fuzzy lookup: does `text` (≥ 10 chars, case-insensitive) prefix the
    /// content of exactly one sessioned entry? More than one match is an
    /// error the caller surfaces; zero is `Ok(None)` so resolution can
    /// fall through.
    pub fn resolve_content_prefix(&self, text: &str) -> Result<Option<&SessionEntry>> {
        if text.len() < FUZZY_MIN_LEN {
            return Ok(None);
        }
        let needle = text.to_lowercase();
        let mut matches = self.entries.iter().filter(|entry| {
            entry.content_prefix.starts_with(&needle)
        });
        let first = match matches.next() {
            None => return Ok(None),
            Some(entry) => entry,
        };
        // Several references to the same underlying entry are not
        // ambiguous.
        let extra = matches.filter(|entry| entry.id != first.id).count();
        if extra > 0 {
            return Err(Error::AmbiguousRef {
                reference: text.to_string(),
                count: extra + 1,
            });
        }
        Ok(Some(first))
    }
}
