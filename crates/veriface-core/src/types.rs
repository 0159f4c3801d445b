use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of components in every face embedding.
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding component {index} is not finite")]
    NonFinite { index: usize },
}

/// Face embedding vector, always exactly [`EMBEDDING_DIM`] finite components.
///
/// Deserialization goes through the same validation as [`Embedding::new`], so
/// an embedding read from the wire or from disk can never have the wrong length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance to another embedding. Lower = closer.
    pub fn distance(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        euclidean_distance(&self.values, &other.values)
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

/// Euclidean distance between two raw vectors.
///
/// Vectors of unequal length are never truncated or padded.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, EmbeddingError> {
    if a.len() != b.len() {
        tracing::error!(left = a.len(), right = b.len(), "compared embeddings of unequal length");
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Human-readable confidence for a distance: `1 - distance`, clamped to [0, 1].
pub fn similarity_from_distance(distance: f32) -> f32 {
    if distance.is_finite() {
        (1.0 - distance).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// A registered person: an external identity key bound to one embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredIdentity {
    pub identity_id: String,
    pub embedding: Embedding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
}

/// Result of matching a probe embedding against a population.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub matched: bool,
    /// Identity of the accepted match (if any).
    pub identity_id: Option<String>,
    /// Euclidean distance of the nearest candidate; infinite when nothing was scanned.
    pub distance: f32,
    pub similarity: f32,
    /// Nearest candidate even when it was not accepted.
    pub best_candidate: Option<String>,
    pub candidates_scanned: usize,
}

impl MatchResult {
    fn empty() -> Self {
        Self {
            matched: false,
            identity_id: None,
            distance: f32::INFINITY,
            similarity: 0.0,
            best_candidate: None,
            candidates_scanned: 0,
        }
    }

    /// Compare this result against the identity the caller claims to be.
    pub fn check_claim(&self, claimed_key: &str) -> ClaimCheck {
        match &self.identity_id {
            Some(id) if self.matched && id == claimed_key => ClaimCheck::Confirmed,
            Some(_) if self.matched => ClaimCheck::Mismatch,
            _ => ClaimCheck::NoMatch,
        }
    }
}

/// How a match result relates to a claimed identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimCheck {
    /// Best match is under threshold and is the claimed identity.
    Confirmed,
    /// No candidate under threshold.
    NoMatch,
    /// Best match is under threshold but belongs to someone else.
    Mismatch,
}

/// Strategy for comparing a probe embedding against the registered population.
pub trait Matcher {
    fn best_match(
        &self,
        probe: &Embedding,
        candidates: &[RegisteredIdentity],
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError>;

    /// Match with identity binding: success requires the nearest candidate to
    /// be the claimed identity. On mismatch the returned result is not matched.
    fn match_claimed(
        &self,
        probe: &Embedding,
        candidates: &[RegisteredIdentity],
        threshold: f32,
        claimed_key: &str,
    ) -> Result<(MatchResult, ClaimCheck), EmbeddingError> {
        let mut result = self.best_match(probe, candidates, threshold)?;
        let check = result.check_claim(claimed_key);
        if check == ClaimCheck::Mismatch {
            result.matched = false;
            result.identity_id = None;
        }
        Ok((result, check))
    }

    /// Nearest registered identity closer than `threshold`, if any.
    fn find_duplicate(
        &self,
        probe: &Embedding,
        candidates: &[RegisteredIdentity],
        threshold: f32,
    ) -> Result<Option<MatchResult>, EmbeddingError> {
        let result = self.best_match(probe, candidates, threshold)?;
        Ok(result.matched.then_some(result))
    }
}

/// Euclidean nearest-neighbour matcher over a linear scan.
///
/// Always iterates every candidate, so response time does not leak the
/// position of the match in the population.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        candidates: &[RegisteredIdentity],
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError> {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        // No early exit.
        for (i, candidate) in candidates.iter().enumerate() {
            let distance = probe.distance(&candidate.embedding)?;
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        let Some(idx) = best_idx else {
            return Ok(MatchResult {
                candidates_scanned: candidates.len(),
                ..MatchResult::empty()
            });
        };

        // An exact self-match is accepted even at threshold 0.
        let accepted = best_distance < threshold || best_distance == 0.0;
        let best_id = candidates[idx].identity_id.clone();

        Ok(MatchResult {
            matched: accepted,
            identity_id: accepted.then(|| best_id.clone()),
            distance: best_distance,
            similarity: similarity_from_distance(best_distance),
            best_candidate: Some(best_id),
            candidates_scanned: candidates.len(),
        })
    }
}
