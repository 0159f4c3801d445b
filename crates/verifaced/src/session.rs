//! One verification session: liveness over a leased source, then matching.
//!
//! A session moves `Idle → LivenessRunning → {LivenessFailed | EmbeddingCaptured
//! → Matching → {Accepted | Rejected}}`. Every failure is an explicit verdict;
//! only programming errors surface as [`EngineError`].

use crate::engine::EngineError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use veriface_core::{
    ClaimCheck, Embedding, EmbeddingError, EuclideanMatcher, FailureReason, LivenessChallenge,
    LivenessMachine, LivenessResult, Matcher, Population,
};
use veriface_source::{SourceError, SourceLease};

/// Settings for one login session.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyConfig {
    pub challenge: LivenessChallenge,
    /// Euclidean distance below which a match is accepted.
    pub match_threshold: f32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            challenge: LivenessChallenge::default(),
            match_threshold: 0.5,
        }
    }
}

/// Why a session ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Accepted,
    Timeout,
    FaceLost,
    SourceError,
    NoEmbeddingCaptured,
    NoMatch,
    ClaimMismatch,
    InvalidChallenge,
}

/// What the user should be told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOutcome {
    /// Challenge not completed; the user may try again.
    KeepTrying,
    /// Camera or observation model unavailable.
    SourceUnavailable,
    NotRecognized,
    Verified,
}

impl VerdictReason {
    pub fn outcome(self) -> UserOutcome {
        match self {
            Self::Accepted => UserOutcome::Verified,
            Self::Timeout | Self::FaceLost => UserOutcome::KeepTrying,
            Self::SourceError | Self::NoEmbeddingCaptured | Self::InvalidChallenge => {
                UserOutcome::SourceUnavailable
            }
            Self::NoMatch | Self::ClaimMismatch => UserOutcome::NotRecognized,
        }
    }
}

impl From<&FailureReason> for VerdictReason {
    fn from(reason: &FailureReason) -> Self {
        match reason {
            FailureReason::Timeout => Self::Timeout,
            FailureReason::FaceLost => Self::FaceLost,
            FailureReason::SourceError(_) => Self::SourceError,
            FailureReason::InvalidChallenge(_) => Self::InvalidChallenge,
        }
    }
}

/// Login decision returned to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub accepted: bool,
    pub reason: VerdictReason,
    pub outcome: UserOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_identity_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip)]
    pub liveness: Option<LivenessResult>,
}

impl Verdict {
    pub fn rejected(reason: VerdictReason, detail: Option<String>) -> Self {
        Self {
            accepted: false,
            reason,
            outcome: reason.outcome(),
            matched_identity_key: None,
            similarity: None,
            detail,
            liveness: None,
        }
    }

    /// The source could not be opened for this session.
    pub fn source_unavailable(error: &SourceError) -> Self {
        Self::rejected(VerdictReason::SourceError, Some(error.to_string()))
    }

    fn with_liveness(mut self, liveness: LivenessResult) -> Self {
        self.liveness = Some(liveness);
        self
    }
}

/// Why registration capture produced no embedding.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureFailure {
    Liveness(FailureReason),
    NoEmbeddingCaptured,
}

impl CaptureFailure {
    pub fn reason(&self) -> VerdictReason {
        match self {
            Self::Liveness(reason) => reason.into(),
            Self::NoEmbeddingCaptured => VerdictReason::NoEmbeddingCaptured,
        }
    }
}

/// Short, non-reversible tag for logging identity keys.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Drive the liveness machine over `lease` until it reaches a terminal state.
///
/// The wall-clock deadline covers stalled sources; observation timestamps are
/// checked separately by the machine. The lease is released on return.
pub async fn run_liveness(mut lease: SourceLease, challenge: &LivenessChallenge) -> LivenessResult {
    let mut machine = LivenessMachine::new(challenge);
    let deadline = Instant::now() + challenge.time_budget();

    while !machine.is_terminal() {
        match tokio::time::timeout_at(deadline, lease.next()).await {
            Err(_) => {
                tracing::debug!(source = lease.name(), "liveness deadline elapsed");
                machine.expire();
            }
            Ok(None) => machine.source_failed(SourceError::Closed.to_string()),
            Ok(Some(Err(e))) => {
                tracing::warn!(source = lease.name(), error = %e, "observation source failed");
                machine.source_failed(e.to_string());
            }
            Ok(Some(Ok(observation))) => {
                machine.observe(&observation);
            }
        }
    }

    let result = machine.finish();
    tracing::debug!(
        passed = result.passed,
        observations = result.observations,
        failure = ?result.failure,
        "liveness finished"
    );
    result
}

/// Liveness, then match the captured embedding with the claim constraint.
pub async fn verify_login(
    claimed_key: &str,
    lease: SourceLease,
    population: &Population,
    config: &VerifyConfig,
) -> Result<Verdict, EngineError> {
    let fingerprint = key_fingerprint(claimed_key);
    let liveness = run_liveness(lease, &config.challenge).await;

    if let Some(failure) = &liveness.failure {
        tracing::info!(key = %fingerprint, reason = %failure, "login rejected: liveness failed");
        let detail = match failure {
            FailureReason::SourceError(msg) | FailureReason::InvalidChallenge(msg) => {
                Some(msg.clone())
            }
            _ => None,
        };
        return Ok(Verdict::rejected(failure.into(), detail).with_liveness(liveness));
    }

    let Some(probe) = liveness.captured_embedding.clone() else {
        tracing::warn!(key = %fingerprint, "liveness passed without an embedding");
        return Ok(
            Verdict::rejected(VerdictReason::NoEmbeddingCaptured, None).with_liveness(liveness)
        );
    };

    let (result, check) = match_probe(&probe, population, config.match_threshold, claimed_key)?;

    let verdict = match check {
        ClaimCheck::Confirmed => Verdict {
            accepted: true,
            reason: VerdictReason::Accepted,
            outcome: UserOutcome::Verified,
            matched_identity_key: result.identity_id.clone(),
            similarity: Some(result.similarity),
            detail: None,
            liveness: None,
        },
        ClaimCheck::NoMatch => Verdict::rejected(VerdictReason::NoMatch, None),
        ClaimCheck::Mismatch => Verdict::rejected(VerdictReason::ClaimMismatch, None),
    };

    tracing::info!(
        key = %fingerprint,
        accepted = verdict.accepted,
        reason = ?verdict.reason,
        distance = result.distance,
        candidates = result.candidates_scanned,
        "login verdict"
    );
    Ok(verdict.with_liveness(liveness))
}

fn match_probe(
    probe: &Embedding,
    population: &Population,
    threshold: f32,
    claimed_key: &str,
) -> Result<(veriface_core::MatchResult, ClaimCheck), EngineError> {
    match EuclideanMatcher.match_claimed(probe, population.identities(), threshold, claimed_key) {
        Ok(matched) => Ok(matched),
        Err(e @ EmbeddingError::DimensionMismatch { .. }) => {
            tracing::error!(error = %e, "embedding dimension mismatch during match");
            debug_assert!(false, "embedding dimension mismatch: {e}");
            Err(EngineError::Embedding(e))
        }
        Err(e) => Err(EngineError::Embedding(e)),
    }
}

/// Run the liveness challenge and return the captured embedding.
pub async fn capture_for_registration(
    lease: SourceLease,
    challenge: &LivenessChallenge,
) -> Result<Embedding, CaptureFailure> {
    let liveness = run_liveness(lease, challenge).await;
    if let Some(failure) = liveness.failure {
        return Err(CaptureFailure::Liveness(failure));
    }
    liveness
        .captured_embedding
        .ok_or(CaptureFailure::NoEmbeddingCaptured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use veriface_core::synthetic::SyntheticFace;
    use veriface_core::{Observation, RegisteredIdentity, EMBEDDING_DIM};
    use veriface_source::scripted;

    fn embedding(seed: usize) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[seed % EMBEDDING_DIM] = 1.0;
        Embedding::new(values).unwrap()
    }

    fn passing_script(probe: Embedding) -> Vec<Observation> {
        vec![
            SyntheticFace::new(0).embedding(probe.clone()).build(),
            SyntheticFace::new(100).eyes_closed().build(),
            SyntheticFace::new(200).expression("happy", 0.9).build(),
            SyntheticFace::new(300).nose_at(200.0, 160.0).build(),
            SyntheticFace::new(400).nose_at(220.0, 160.0).embedding(probe).build(),
        ]
    }

    fn population(entries: &[(&str, Embedding)]) -> Population {
        Population::new(
            entries
                .iter()
                .map(|(id, e)| RegisteredIdentity {
                    identity_id: id.to_string(),
                    embedding: e.clone(),
                    registered_at: None,
                })
                .collect(),
        )
    }

    #[test]
    fn test_reason_outcomes() {
        assert_eq!(VerdictReason::Accepted.outcome(), UserOutcome::Verified);
        assert_eq!(VerdictReason::Timeout.outcome(), UserOutcome::KeepTrying);
        assert_eq!(VerdictReason::FaceLost.outcome(), UserOutcome::KeepTrying);
        assert_eq!(VerdictReason::SourceError.outcome(), UserOutcome::SourceUnavailable);
        assert_eq!(
            VerdictReason::NoEmbeddingCaptured.outcome(),
            UserOutcome::SourceUnavailable
        );
        assert_eq!(VerdictReason::ClaimMismatch.outcome(), UserOutcome::NotRecognized);
    }

    #[test]
    fn test_key_fingerprint_is_short_and_stable() {
        let a = key_fingerprint("12345678");
        assert_eq!(a.len(), 8);
        assert_eq!(a, key_fingerprint("12345678"));
        assert_ne!(a, key_fingerprint("12345679"));
    }

    #[test]
    fn test_verdict_json_shape() {
        let verdict = Verdict::rejected(VerdictReason::NoMatch, None);
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "accepted": false,
                "reason": "no_match",
                "outcome": "not_recognized",
            })
        );
    }

    #[tokio::test]
    async fn test_verify_login_accepts_claimed_identity() {
        let probe = embedding(3);
        let lease = scripted("test", passing_script(probe.clone()), Duration::ZERO);
        let population = population(&[("alice", probe), ("bob", embedding(9))]);

        let verdict = verify_login("alice", lease, &population, &VerifyConfig::default())
            .await
            .unwrap();
        assert!(verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::Accepted);
        assert_eq!(verdict.matched_identity_key.as_deref(), Some("alice"));
        assert_eq!(verdict.similarity, Some(1.0));
    }

    #[tokio::test]
    async fn test_verify_login_claim_mismatch() {
        let probe = embedding(3);
        let lease = scripted("test", passing_script(probe.clone()), Duration::ZERO);
        let population = population(&[("alice", probe)]);

        let verdict = verify_login("mallory", lease, &population, &VerifyConfig::default())
            .await
            .unwrap();
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::ClaimMismatch);
        assert!(verdict.matched_identity_key.is_none());
    }

    #[tokio::test]
    async fn test_verify_login_without_embedding() {
        let script = vec![
            SyntheticFace::new(0).eyes_closed().build(),
            SyntheticFace::new(100).expression("happy", 0.9).build(),
            SyntheticFace::new(200).build(),
            SyntheticFace::new(300).nose_at(230.0, 160.0).build(),
        ];
        let lease = scripted("test", script, Duration::ZERO);

        let verdict = verify_login("alice", lease, &Population::default(), &VerifyConfig::default())
            .await
            .unwrap();
        assert_eq!(verdict.reason, VerdictReason::NoEmbeddingCaptured);
        assert!(verdict.liveness.unwrap().passed);
    }

    #[tokio::test]
    async fn test_stream_end_is_source_error() {
        let lease = scripted("test", vec![SyntheticFace::new(0).build()], Duration::ZERO);
        let result = run_liveness(lease, &LivenessChallenge::default()).await;
        assert!(matches!(result.failure, Some(FailureReason::SourceError(_))));
    }

    #[tokio::test]
    async fn test_invalid_challenge_ends_without_reading() {
        // The sender stays open; a session that waited on it would hang.
        let (tx, lease) = veriface_source::channel("idle", 1);
        let config = VerifyConfig {
            challenge: LivenessChallenge {
                steps: vec![],
                ..LivenessChallenge::default()
            },
            ..VerifyConfig::default()
        };

        let verdict = verify_login("alice", lease, &Population::default(), &config)
            .await
            .unwrap();
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::InvalidChallenge);
        assert_eq!(verdict.outcome, UserOutcome::SourceUnavailable);
        assert!(verdict.detail.unwrap().contains("no steps"));
        assert_eq!(verdict.liveness.unwrap().observations, 0);
        drop(tx);
    }

    #[tokio::test]
    async fn test_capture_for_registration() {
        let probe = embedding(5);
        let lease = scripted("test", passing_script(probe.clone()), Duration::ZERO);
        let captured = capture_for_registration(lease, &LivenessChallenge::default())
            .await
            .unwrap();
        assert_eq!(captured, probe);
    }
}
