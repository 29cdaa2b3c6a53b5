//! Cosine similarity between embeddings, and the banding the UI applies to it.
//!
//! The score is a plain cosine: `dot(a, b) / (|a| * |b|)`. If either vector
//! has zero magnitude the result is NaN and is returned as-is; deciding what a
//! NaN means on screen is the consumer's call (see [`ScoreBands`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Similarity of two embeddings, nominally in [-1, 1]. NaN for degenerate input.
pub type SimilarityScore = f32;

/// Fixed-length feature vector produced by the embedder for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Both embeddings must come from the same model. Hitting this is a wiring bug.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("embedding dimensions differ ({left} vs {right})")]
pub struct DimensionMismatch {
    pub left: usize,
    pub right: usize,
}

/// Cosine similarity of `a` and `b`.
pub fn cosine_similarity(
    a: &Embedding,
    b: &Embedding,
) -> Result<SimilarityScore, DimensionMismatch> {
    if a.len() != b.len() {
        return Err(DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    // Accumulate in f64; 1000+ dim embeddings lose precision in f32.
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.as_slice().iter().zip(b.as_slice()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
}

/// Coarse similarity bucket shown next to the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreBand {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ScoreBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreBand::Low => write!(f, "low"),
            ScoreBand::Medium => write!(f, "medium"),
            ScoreBand::High => write!(f, "high"),
        }
    }
}

/// Band thresholds. A score equal to a threshold falls in the lower band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBands {
    pub medium_above: f32,
    pub high_above: f32,
}

impl Default for ScoreBands {
    fn default() -> Self {
        Self {
            medium_above: 0.5,
            high_above: 0.7,
        }
    }
}

impl ScoreBands {
    /// NaN bands as `Low`, same as a 0 % score.
    pub fn classify(&self, score: SimilarityScore) -> ScoreBand {
        if score.is_nan() || score <= self.medium_above {
            ScoreBand::Low
        } else if score <= self.high_above {
            ScoreBand::Medium
        } else {
            ScoreBand::High
        }
    }
}

/// Score as a whole percentage for display. NaN and negatives show as 0.
pub fn display_percent(score: SimilarityScore) -> u8 {
    if score.is_nan() {
        return 0;
    }
    (score.clamp(0.0, 1.0) * 100.0).round() as u8
}
