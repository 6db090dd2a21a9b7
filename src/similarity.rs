//! Similarity measures shared by deduplication, merging and diversity selection.
//!
//! - [`cosine_similarity`]: embedding similarity, strict about dimensionality
//! - [`jaccard_similarity`]: lexical similarity over normalized word sets

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}_]+").expect("invalid regex"));

/// Split text into lowercase words, dropping punctuation.
///
/// `"use Redis for caching!"` -> `["use", "redis", "for", "caching"]`.
pub fn words(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD_PATTERN
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// The set of normalized words in a text.
pub fn word_set(text: &str) -> HashSet<String> {
    words(text).into_iter().collect()
}

/// Jaccard similarity of the word sets of two texts, in `[0, 1]`.
///
/// Two texts with no words at all are identical (1.0); one empty and one
/// non-empty text share nothing (0.0).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    jaccard_of_sets(&word_set(a), &word_set(b))
}

/// Jaccard similarity of two precomputed word sets.
pub fn jaccard_of_sets(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Cosine similarity between two embeddings, in `[-1, 1]`.
///
/// Vectors of different length are an error, never truncated. A zero vector
/// has similarity 0.0 to everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(Error::dimension_mismatch(a.len(), b.len()));
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

/// Check that every embedding in `vectors` has the same length.
///
/// Returns the shared dimensionality, or `None` when there are no vectors.
pub fn common_dimension<'a, I>(vectors: I) -> Result<Option<usize>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut expected: Option<usize> = None;
    for v in vectors {
        match expected {
            None => expected = Some(v.len()),
            Some(dim) if dim != v.len() => return Err(Error::dimension_mismatch(dim, v.len())),
            Some(_) => {}
        }
    }
    Ok(expected)
}
