/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidLore;

pub const MAX_CONTENT_LEN: usize = 4096;
pub const MAX_CONTEXT_LEN: usize = 512;
pub const DEFAULT_CONFIDENCE: f64 = 0.7;

/// The closed set of lore categories. An unknown value fails validation
/// rather than being carried through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoreCategory {
    PatternOutcome,
    ArchitecturalDecision,
    DependencyBehavior,
    ProcessInsight,
    DomainKnowledge,
}

impl LoreCategory {
    pub const ALL: [LoreCategory; 5] = [
        LoreCategory::PatternOutcome,
        LoreCategory::ArchitecturalDecision,
        LoreCategory::DependencyBehavior,
        LoreCategory::ProcessInsight,
        LoreCategory::DomainKnowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoreCategory::PatternOutcome => "PATTERN_OUTCOME",
            LoreCategory::ArchitecturalDecision => "ARCHITECTURAL_DECISION",
            LoreCategory::DependencyBehavior => "DEPENDENCY_BEHAVIOR",
            LoreCategory::ProcessInsight => "PROCESS_INSIGHT",
            LoreCategory::DomainKnowledge => "DOMAIN_KNOWLEDGE",
        }
    }
}

impl std::str::FromStr for LoreCategory {
    type Err = InvalidLore;

    fn from_str(s: &str) -> Result<Self, InvalidLore> {
        Self::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| InvalidLore::InvalidCategory(s.to_string()))
    }
}

impl std::fmt::Display for LoreCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an embedding has been attached to an entry yet. The core never
/// computes embeddings; it only tracks this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Complete,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Complete => "complete",
            EmbeddingStatus::Failed => "failed",
        }
    }

    pub(crate) fn from_column(s: &str) -> Self {
        match s {
            "complete" => EmbeddingStatus::Complete,
            "failed" => EmbeddingStatus::Failed,
            _ => EmbeddingStatus::Pending,
        }
    }
}

/// Feedback on a surfaced entry. The confidence deltas are centralised here;
/// everything else derives from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Helpful,
    Incorrect,
    NotRelevant,
}

impl FeedbackKind {
    pub fn confidence_delta(&self) -> f64 {
        match self {
            FeedbackKind::Helpful => 0.10,
            FeedbackKind::Incorrect => -0.20,
            FeedbackKind::NotRelevant => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Helpful => "helpful",
            FeedbackKind::Incorrect => "incorrect",
            FeedbackKind::NotRelevant => "not_relevant",
        }
    }
}

impl std::str::FromStr for FeedbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "helpful" => Ok(FeedbackKind::Helpful),
            "incorrect" => Ok(FeedbackKind::Incorrect),
            "not_relevant" => Ok(FeedbackKind::NotRelevant),
            other => Err(format!("unknown feedback type: {other:?}")),
        }
    }
}

/// One captured note. This is both the storage row and the wire shape: the
/// change-log payload serialises the full post-image of this struct, with
/// absent optional timestamps as explicit `null`s and the embedding blob as
/// base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoreEntry {
    pub id: String,
    pub content: String,
    pub context: Option<String>,
    pub category: LoreCategory,
    pub confidence: f64,
    #[serde(default, with = "base64_blob")]
    pub embedding: Option<Vec<u8>>,
    pub embedding_status: EmbeddingStatus,
    pub source_id: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub validation_count: u32,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl LoreEntry {
    /// Check the validation rules that gate every local write. Runs before
    /// any row or change-log append, so a failure leaves no trace.
    pub fn validate(&self) -> Result<(), InvalidLore> {
        if self.content.trim().is_empty() {
            return Err(InvalidLore::EmptyContent);
        }
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(InvalidLore::ContentTooLong(self.content.len()));
        }
        if let Some(context) = &self.context {
            if context.len() > MAX_CONTEXT_LEN {
                return Err(InvalidLore::ContextTooLong(context.len()));
            }
        }
        if !(0.0..=1.0).contains(&self.confidence) || !self.confidence.is_finite() {
            return Err(InvalidLore::InvalidConfidence(self.confidence));
        }
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// serde adapter for the opaque embedding blob: base64 on the wire, bytes in
/// memory.
mod base64_blob {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(blob: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match blob {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        match encoded {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Filters for `query_lore`. Ordering and truncation happen in the client
/// after ranking, not here.
#[derive(Debug, Clone, Default)]
pub struct LoreQuery {
    pub min_confidence: Option<f64>,
    pub categories: Option<Vec<LoreCategory>>,
    /// Restrict to rows that carry an embedding blob.
    pub require_embedding: bool,
}

/// Headline numbers for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub lore_count: u64,
    pub deleted_count: u64,
    pub change_log_count: u64,
    pub unpushed_count: u64,
    pub last_push_seq: i64,
    pub last_pull_seq: i64,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub category: LoreCategory,
    pub count: u64,
}

/// `StoreStats` plus the breakdowns the `stats` surface reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedStats {
    #[serde(flatten)]
    pub stats: StoreStats,
    pub by_category: Vec<CategoryCount>,
    pub average_confidence: f64,
    pub total_validations: u64,
    pub embeddings_pending: u64,
    pub embeddings_complete: u64,
    pub embeddings_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util;

    pub(crate) fn entry(content: &str) -> LoreEntry {
        let now = util::now();
        LoreEntry {
            id: util::new_lore_id(),
            content: content.to_string(),
            context: None,
            category: LoreCategory::PatternOutcome,
            confidence: DEFAULT_CONFIDENCE,
            embedding: None,
            embedding_status: EmbeddingStatus::Pending,
            source_id: util::new_source_id(),
            sources: vec![],
            validation_count: 0,
            last_validated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            synced_at: None,
        }
    }

    #[test]
    fn test_category_round_trip() {
        for cat in LoreCategory::ALL {
            assert_eq!(cat.as_str().parse::<LoreCategory>().unwrap(), cat);
        }
        assert!(matches!(
            "INVALID".parse::<LoreCategory>(),
            Err(InvalidLore::InvalidCategory(_))
        ));
        // serde uses the same wire names as as_str
        assert_eq!(
            serde_json::to_string(&LoreCategory::DependencyBehavior).unwrap(),
            "\"DEPENDENCY_BEHAVIOR\""
        );
    }

    #[test]
    fn test_feedback_deltas() {
        assert_eq!(FeedbackKind::Helpful.confidence_delta(), 0.10);
        assert_eq!(FeedbackKind::Incorrect.confidence_delta(), -0.20);
        assert_eq!(FeedbackKind::NotRelevant.confidence_delta(), 0.0);
    }

    #[test]
    fn test_validate() {
        assert!(entry("fine").validate().is_ok());

        assert!(matches!(
            entry("   ").validate(),
            Err(InvalidLore::EmptyContent)
        ));
        assert!(matches!(
            entry(&"x".repeat(MAX_CONTENT_LEN + 1)).validate(),
            Err(InvalidLore::ContentTooLong(_))
        ));

        let mut e = entry("fine");
        e.context = Some("y".repeat(MAX_CONTEXT_LEN + 1));
        assert!(matches!(
            e.validate(),
            Err(InvalidLore::ContextTooLong(_))
        ));

        let mut e = entry("fine");
        e.confidence = 1.2;
        assert!(matches!(
            e.validate(),
            Err(InvalidLore::InvalidConfidence(_))
        ));
        e.confidence = f64::NAN;
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_entry_serialises_nulls_and_base64() {
        let mut e = entry("note");
        e.embedding = Some(vec![1, 2, 3, 4]);
        let value: serde_json::Value = serde_json::to_value(&e).unwrap();
        // absent timestamps appear as explicit nulls
        assert!(value.get("deleted_at").unwrap().is_null());
        assert!(value.get("synced_at").unwrap().is_null());
        assert_eq!(value["embedding"], "AQIDBA==");

        let back: LoreEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, e);
    }
}
