//! Brute-force vector similarity shared by both backends.

use crate::models::{MemoryRecord, MemoryResult};

/// Computes cosine similarity between two vectors, normalized to 0.0..=1.0.
///
/// Returns 0.0 for vectors of different lengths or zero norm.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    // Cosine similarity ranges from -1 to 1, normalize to 0 to 1
    f32::midpoint(dot_product / (norm_a * norm_b), 1.0)
}

/// Scores every memory that has an embedding and keeps the best `limit`.
///
/// Ties keep the order in which candidates were supplied.
pub fn rank_by_similarity<I>(candidates: I, query: &[f32], limit: usize) -> Vec<MemoryResult>
where
    I: IntoIterator<Item = MemoryRecord>,
{
    let mut scored: Vec<MemoryResult> = candidates
        .into_iter()
        .filter_map(|memory| {
            let score = cosine_similarity(memory.embedding.as_deref()?, query);
            Some(MemoryResult { memory, score })
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(limit);
    scored
}
