use serde::{Deserialize, Serialize};

/// Face embedding vector, unit-normalized once it leaves the embedding client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Wrap a raw vector, L2-normalizing it.
    ///
    /// Returns `None` for empty, zero-norm or non-finite input. Callers at the
    /// service boundary report that as "no face detected".
    pub fn from_raw(raw: Vec<f32>) -> Option<Self> {
        l2_normalize(&raw).map(|values| Self { values })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1].
    ///
    /// Both sides are re-normalized here, so records stored before
    /// normalization was enforced still compare correctly. A zero vector on
    /// either side yields 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Divide every component by the vector's Euclidean norm.
///
/// `None` when the vector is empty, has zero norm, or contains NaN/inf.
pub fn l2_normalize(values: &[f32]) -> Option<Vec<f32>> {
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(values.iter().map(|v| v / norm).collect())
}

/// A stored embedding eligible for matching, keyed by student regNo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub embedding: Embedding,
}

/// Highest-scoring candidate for a probe, before any threshold is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    pub id: Option<String>,
    /// Cosine similarity of the best candidate, 0 when there was none.
    pub score: f32,
}

impl BestMatch {
    pub fn none() -> Self {
        Self { id: None, score: 0.0 }
    }
}

/// Result of matching a probe against a gallery with a threshold.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate [-1, 1].
    pub similarity: f32,
    /// regNo of the accepted candidate (only set when `matched`).
    pub candidate_id: Option<String>,
    /// Number of candidates in the gallery.
    pub compared: usize,
}

/// Inclusive threshold check: a score equal to the threshold is a match.
pub fn accepts(score: f32, threshold: f32) -> bool {
    score >= threshold
}

/// Strategy for comparing a probe embedding against a gallery of candidates.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &[Candidate]) -> BestMatch;

    fn compare(&self, probe: &Embedding, gallery: &[Candidate], threshold: f32) -> MatchResult {
        let best = self.best_match(probe, gallery);
        let matched = best.id.is_some() && accepts(best.score, threshold);
        MatchResult {
            matched,
            similarity: best.score,
            candidate_id: if matched { best.id } else { None },
            compared: gallery.len(),
        }
    }
}

/// Cosine similarity matcher.
///
/// Iterates the whole gallery in the given order; on equal scores the
/// first candidate wins. Candidates whose dimension differs from the probe
/// are skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &[Candidate]) -> BestMatch {
        if probe.is_empty() {
            return BestMatch::none();
        }

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in gallery.iter().enumerate() {
            if candidate.embedding.dim() != probe.dim() {
                tracing::debug!(
                    id = %candidate.id,
                    dim = candidate.embedding.dim(),
                    probe_dim = probe.dim(),
                    "skipping candidate with mismatched dimension"
                );
                continue;
            }
            let sim = probe.similarity(&candidate.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) => BestMatch {
                id: Some(gallery[idx].id.clone()),
                score: best_sim,
            },
            None => BestMatch::none(),
        }
    }
}
