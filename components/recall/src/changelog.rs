/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The change log is the append-only record of local mutations and the
//! source of truth for outbound sync. Every local write appends exactly one
//! row in the same transaction as the mutation; pull-applied remote changes
//! never do. Rows carry the full post-image of the entry, not a delta, so
//! replaying one is always safe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::LoreEntry;

/// The table every change in this crate touches. Kept as a column (and on
/// the wire) so the log format doesn't need to change when another table
/// learns to sync.
pub const LORE_TABLE: &str = "lore_entries";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Upsert,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Upsert => "upsert",
            ChangeOperation::Delete => "delete",
        }
    }

    pub(crate) fn from_column(s: &str) -> Self {
        match s {
            "delete" => ChangeOperation::Delete,
            _ => ChangeOperation::Upsert,
        }
    }
}

/// One change-log row, used both locally and as the wire shape for push and
/// pull bodies. `table_name` and `source_id` default when a server omits
/// them; the entry-level `source_id` in the payload is the fallback for the
/// pull-path origin check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence: i64,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    pub entity_id: String,
    pub operation: ChangeOperation,
    /// Full post-image for `upsert`, `null` (or absent) for `delete`.
    #[serde(default)]
    pub payload: Option<LoreEntry>,
    #[serde(default)]
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}

fn default_table_name() -> String {
    LORE_TABLE.to_string()
}

impl ChangeRecord {
    /// The origin of this change, preferring the record-level source over
    /// the payload's.
    pub fn origin(&self) -> &str {
        if !self.source_id.is_empty() {
            return &self.source_id;
        }
        self.payload.as_ref().map(|p| p.source_id.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_wire_names() {
        assert_eq!(
            serde_json::to_string(&ChangeOperation::Upsert).unwrap(),
            "\"upsert\""
        );
        assert_eq!(ChangeOperation::from_column("delete"), ChangeOperation::Delete);
        assert_eq!(ChangeOperation::from_column("upsert"), ChangeOperation::Upsert);
    }

    #[test]
    fn test_delete_record_has_null_payload() {
        let record = ChangeRecord {
            sequence: 7,
            table_name: LORE_TABLE.to_string(),
            entity_id: "some-id".to_string(),
            operation: ChangeOperation::Delete,
            payload: None,
            source_id: "client-a".to_string(),
            created_at: crate::util::now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value["payload"].is_null());
        assert_eq!(value["operation"], "delete");

        let back: ChangeRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_origin_falls_back_to_payload() {
        let mut entry = crate::db::test_support::sample_entry("content");
        entry.source_id = "payload-origin".to_string();
        let record = ChangeRecord {
            sequence: 1,
            table_name: LORE_TABLE.to_string(),
            entity_id: entry.id.clone(),
            operation: ChangeOperation::Upsert,
            payload: Some(entry),
            source_id: String::new(),
            created_at: crate::util::now(),
        };
        assert_eq!(record.origin(), "payload-origin");
    }
}
