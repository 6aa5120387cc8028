//! Embedding distance and match decisions.
//!
//! Everything here is pure. Distances are symmetric and zero for identical
//! vectors, so candidate ordering does not depend on arrival order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Distance function over embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// 1 - cosine similarity, in [0, 2].
    #[default]
    Cosine,
    /// L2 distance.
    Euclidean,
}

impl Metric {
    /// Distance between two equal-length embeddings.
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_distance(a, b),
            Metric::Euclidean => euclidean_distance(a, b),
        }
    }

    /// True if the metric compares direction only, so representatives
    /// should be kept at unit length.
    pub fn normalizes(self) -> bool {
        matches!(self, Metric::Cosine)
    }
}

/// Returns true if `distance` passes `threshold`.
pub fn is_match(distance: f32, threshold: f32) -> bool {
    distance <= threshold
}

/// Metric plus thresholds, with per camera-pair overrides.
#[derive(Debug, Clone)]
pub struct Matcher {
    metric: Metric,
    threshold: f32,
    pairs: HashMap<(String, String), f32>,
}

impl Matcher {
    pub fn new(metric: Metric, threshold: f32) -> Self {
        Self {
            metric,
            threshold,
            pairs: HashMap::new(),
        }
    }

    /// Overrides the threshold for one unordered camera pair.
    pub fn with_pair_threshold(mut self, a: &str, b: &str, threshold: f32) -> Self {
        self.pairs.insert(pair_key(a, b), threshold);
        self
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        self.metric.score(a, b)
    }

    /// Threshold for matching a detection at `b` against an identity owned
    /// at `a`. Symmetric.
    pub fn threshold_for(&self, a: &str, b: &str) -> f32 {
        self.pairs
            .get(&pair_key(a, b))
            .copied()
            .unwrap_or(self.threshold)
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Cosine distance: 1 - cosine_similarity, clamped to [0, 2].
/// Two zero vectors are identical (distance 0); a zero vector against
/// anything else is orthogonal (distance 1).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot: f64 = 0.0;
    let mut na: f64 = 0.0;
    let mut nb: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 && nb == 0.0 {
        return 0.0;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        return 1.0;
    }
    (1.0 - dot / denom).clamp(0.0, 2.0) as f32
}

/// Euclidean distance with f64 accumulation.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Normalizes a vector to unit length in-place. Zero vectors are left alone.
pub fn l2_normalize(v: &mut [f32]) {
    let sum: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum();
    let norm = sum.sqrt();
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}
