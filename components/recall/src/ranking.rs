/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Query ranking. When the caller supplies an embedding for the query text
//! we score by cosine similarity against each row's stored vector (the
//! blob is little-endian f32s); otherwise a keyword fallback scores by
//! normalised token overlap. Ties break on confidence, then recency.

use std::collections::HashSet;

use crate::types::LoreEntry;

pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone)]
pub struct RankedLore {
    pub score: f32,
    pub entry: LoreEntry,
}

/// Decode a stored embedding blob into a float vector. `None` when the
/// blob is not a whole number of little-endian f32s.
pub fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of the query's tokens that appear in the content, in [0, 1].
pub fn keyword_score(content: &str, query: &str) -> f32 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens = tokenize(content);
    let hits = query_tokens
        .iter()
        .filter(|token| content_tokens.contains(*token))
        .count();
    hits as f32 / query_tokens.len() as f32
}

/// Score, order and truncate the candidate set. Embedding similarity wins
/// when a query vector is available and the row has a decodable blob;
/// keyword overlap covers the rest.
pub fn rank(
    entries: Vec<LoreEntry>,
    query_text: &str,
    query_embedding: Option<&[f32]>,
    top_k: usize,
) -> Vec<RankedLore> {
    let mut ranked: Vec<RankedLore> = entries
        .into_iter()
        .map(|entry| {
            let score = match (query_embedding, &entry.embedding) {
                (Some(query_vec), Some(blob)) => match decode_embedding(blob) {
                    Some(row_vec) => cosine_similarity(query_vec, &row_vec),
                    None => keyword_score(&entry.content, query_text),
                },
                _ => keyword_score(&entry.content, query_text),
            };
            RankedLore { score, entry }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.entry
                    .confidence
                    .partial_cmp(&a.entry.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
    });
    ranked.truncate(top_k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::sample_entry;
    use crate::util;
    use chrono::Duration;

    fn embedding_blob(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_decode_embedding() {
        assert_eq!(decode_embedding(&embedding_blob(&[1.0, -2.5])).unwrap(), vec![1.0, -2.5]);
        assert!(decode_embedding(&[1, 2, 3]).is_none());
        assert!(decode_embedding(&[]).is_none());
    }

    #[test]
    fn test_cosine_similarity() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert_eq!(cosine_similarity(&a, &a), 1.0);
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_keyword_score() {
        assert_eq!(
            keyword_score("Queue consumers benefit from idempotency checks", "idempotency"),
            1.0
        );
        assert_eq!(
            keyword_score("Queue consumers benefit from idempotency checks", "idempotency pigs"),
            0.5
        );
        assert_eq!(keyword_score("anything", ""), 0.0);
    }

    #[test]
    fn test_rank_by_embedding_when_available() {
        let mut close = sample_entry("close in vector space");
        close.embedding = Some(embedding_blob(&[1.0, 0.0]));
        let mut far = sample_entry("far in vector space");
        far.embedding = Some(embedding_blob(&[0.0, 1.0]));

        let query = [1.0f32, 0.1];
        let ranked = rank(
            vec![far.clone(), close.clone()],
            "irrelevant",
            Some(&query),
            5,
        );
        assert_eq!(ranked[0].entry.id, close.id);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_rank_keyword_fallback_and_tie_breaks() {
        let mut older = sample_entry("retry storms overwhelm upstreams");
        older.confidence = 0.9;
        older.updated_at = util::now() - Duration::hours(2);
        let mut newer = sample_entry("retry storms overwhelm upstreams");
        newer.confidence = 0.9;
        let mut weaker = sample_entry("retry storms overwhelm upstreams");
        weaker.confidence = 0.4;

        let ranked = rank(
            vec![weaker.clone(), older.clone(), newer.clone()],
            "retry storms",
            None,
            5,
        );
        // equal scores: higher confidence first, then most recent
        assert_eq!(ranked[0].entry.id, newer.id);
        assert_eq!(ranked[1].entry.id, older.id);
        assert_eq!(ranked[2].entry.id, weaker.id);
    }

    #[test]
    fn test_rank_truncates_to_top_k() {
        let entries: Vec<_> = (0..10)
            .map(|i| sample_entry(&format!("entry number {i} about caching")))
            .collect();
        let ranked = rank(entries, "caching", None, 3);
        assert_eq!(ranked.len(), 3);
    }
}
