//! veriface-core — Biometric verification engine.
//!
//! Liveness challenge state machine over per-frame facial observations, and
//! Euclidean matching of 128-dimensional face embeddings against a registered
//! population. Everything here is synchronous and allocation-light; sources,
//! timeouts and sessions live in `veriface-source` and `verifaced`.

pub mod geometry;
pub mod liveness;
pub mod observation;
pub mod population;
pub mod synthetic;
pub mod types;

pub use liveness::{
    ChallengeError, ChallengeStep, FailureReason, LivenessChallenge, LivenessMachine,
    LivenessResult, LivenessState, StepPredicate,
};
pub use observation::{Observation, Point};
pub use population::{Population, PopulationStore, RegisterError};
pub use types::{
    ClaimCheck, Embedding, EmbeddingError, EuclideanMatcher, MatchResult, Matcher,
    RegisteredIdentity, EMBEDDING_DIM,
};
