//! Relevance and recency scoring.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity over dense vectors
//! - Bag-of-words text similarity (cosine over term frequencies)
//! - Exponential recency decay and the blended query score

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Lowercased alphanumeric terms and their counts.
pub fn term_frequencies(text: &str) -> BTreeMap<String, f32> {
    let mut terms = BTreeMap::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        *terms.entry(token.to_lowercase()).or_insert(0.0) += 1.0;
    }
    terms
}

/// Bag-of-words cosine similarity in [0, 1].
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let ta = term_frequencies(a);
    let tb = term_frequencies(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    // Align both bags on the union of their terms.
    let mut va = Vec::with_capacity(ta.len() + tb.len());
    let mut vb = Vec::with_capacity(ta.len() + tb.len());
    for (term, count) in &ta {
        va.push(*count);
        vb.push(tb.get(term).copied().unwrap_or(0.0));
    }
    for (term, count) in &tb {
        if !ta.contains_key(term) {
            va.push(0.0);
            vb.push(*count);
        }
    }
    cosine_similarity(&va, &vb).clamp(0.0, 1.0)
}

/// `0.5^(age / half_life)`; 1.0 for anything in the future.
pub fn recency(at: DateTime<Utc>, now: DateTime<Utc>, half_life: Duration) -> f32 {
    let age = (now - at).num_milliseconds();
    if age <= 0 {
        return 1.0;
    }
    let half_life_ms = half_life.as_millis().max(1) as f64;
    0.5f64.powf(age as f64 / half_life_ms) as f32
}

/// `relevance * (1 - mix) + recency * mix`; monotonic in both inputs.
pub fn blended_score(relevance: f32, recency: f32, recency_mix: f32) -> f32 {
    let mix = recency_mix.clamp(0.0, 1.0);
    relevance * (1.0 - mix) + recency * mix
}
