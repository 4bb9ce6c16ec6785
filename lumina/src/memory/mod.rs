//! Hybrid episodic memory: the single source of truth for conversational
//! history (raw) and semantic memory (distilled).
//!
//! Backed by SQLite with the sqlite-vec extension: a vec0 virtual table per
//! embedded table for cosine KNN, substring matching over content for the
//! full-text leg, and Reciprocal Rank Fusion to combine both.

mod batch;
mod embedder;
mod fusion;
mod store;

pub use batch::{BatchManager, BatchStatus, ConsolidationBatch};
pub use embedder::{Embedder, OpenAIEmbedder};
pub use fusion::{rrf_fuse, RRF_K};
pub use store::{
    EpisodicStatus, FactRecord, InsightRecord, LogEntry, MemoryHit, MemoryStore, NewFact,
    SearchParams, TargetTable,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("embedder dimension {got} != expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Storage(e.to_string())
    }
}

/// Cosine similarity of two equal-length vectors; 0.0 when either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.1, 0.4, -0.2];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_mismatched_or_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
