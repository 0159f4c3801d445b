//! Active liveness challenge: an ordered sequence of natural behaviours
//! (blink, smile, head turn) evaluated one observation at a time.
//!
//! Steps are satisfied strictly in order. Only the current step's predicate is
//! evaluated on each observation, so a later behaviour performed early never
//! advances the machine, and at most one step advances per observation. The
//! only history kept between ticks is the previous nose-tip position.

use crate::geometry;
use crate::observation::{Observation, Point};
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const DEFAULT_BLINK_EAR: f32 = 0.25;
const DEFAULT_SMILE_PROBABILITY: f32 = 0.7;
const DEFAULT_TURN_DISPLACEMENT_PX: f32 = 10.0;
const DEFAULT_TIME_BUDGET_MS: u64 = 10_000;
const DEFAULT_FACE_LOST_TICKS: u32 = 5;
const DEFAULT_MIN_FACE_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChallengeError {
    #[error("liveness challenge has no steps")]
    NoSteps,
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),
    #[error("step {step}: {reason}")]
    InvalidThreshold { step: String, reason: String },
    #[error("time budget must be positive")]
    ZeroTimeBudget,
    #[error("face-lost tick budget must be at least 1")]
    ZeroFaceLostTicks,
    #[error("minimum face confidence {0} is outside [0, 1]")]
    InvalidFaceConfidence(f32),
}

/// Predicate a single challenge step applies to an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepPredicate {
    /// Mean eye aspect ratio drops below the threshold.
    Blink { max_eye_aspect_ratio: f32 },
    /// Probability of `label` exceeds the threshold.
    Expression { label: String, min_probability: f32 },
    /// Nose tip moves more than `min_displacement` pixels since the previous observation.
    HeadTurn {
        min_displacement: f32,
        #[serde(default)]
        horizontal_only: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeStep {
    pub name: String,
    #[serde(flatten)]
    pub predicate: StepPredicate,
}

impl ChallengeStep {
    pub fn blink(max_eye_aspect_ratio: f32) -> Self {
        Self {
            name: "blink".into(),
            predicate: StepPredicate::Blink { max_eye_aspect_ratio },
        }
    }

    pub fn smile(min_probability: f32) -> Self {
        Self::expression("smile", "happy", min_probability)
    }

    pub fn expression(name: &str, label: &str, min_probability: f32) -> Self {
        Self {
            name: name.into(),
            predicate: StepPredicate::Expression {
                label: label.into(),
                min_probability,
            },
        }
    }

    pub fn head_turn(min_displacement: f32) -> Self {
        Self {
            name: "turn".into(),
            predicate: StepPredicate::HeadTurn {
                min_displacement,
                horizontal_only: false,
            },
        }
    }

    fn validate(&self) -> Result<(), ChallengeError> {
        let invalid = |reason: &str| ChallengeError::InvalidThreshold {
            step: self.name.clone(),
            reason: reason.into(),
        };
        match &self.predicate {
            StepPredicate::Blink { max_eye_aspect_ratio } => {
                if !max_eye_aspect_ratio.is_finite() || *max_eye_aspect_ratio <= 0.0 {
                    return Err(invalid("eye aspect ratio threshold must be positive"));
                }
            }
            StepPredicate::Expression { label, min_probability } => {
                if label.is_empty() {
                    return Err(invalid("expression label is empty"));
                }
                if !(0.0..1.0).contains(min_probability) {
                    return Err(invalid("probability threshold must be in [0, 1)"));
                }
            }
            StepPredicate::HeadTurn { min_displacement, .. } => {
                if !min_displacement.is_finite() || *min_displacement < 0.0 {
                    return Err(invalid("displacement threshold must be non-negative"));
                }
            }
        }
        Ok(())
    }
}

/// Ordered challenge plus the budgets that bound one liveness session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessChallenge {
    pub steps: Vec<ChallengeStep>,
    /// Wall-clock and observation-timestamp budget for the whole challenge.
    pub time_budget_ms: u64,
    /// Optional frame budget; exceeding it without passing counts as a timeout.
    pub max_observations: Option<u32>,
    /// Consecutive no-face observations tolerated before failing.
    pub face_lost_ticks: u32,
    pub min_face_confidence: f32,
}

impl Default for LivenessChallenge {
    fn default() -> Self {
        Self {
            steps: vec![
                ChallengeStep::blink(DEFAULT_BLINK_EAR),
                ChallengeStep::smile(DEFAULT_SMILE_PROBABILITY),
                ChallengeStep::head_turn(DEFAULT_TURN_DISPLACEMENT_PX),
            ],
            time_budget_ms: DEFAULT_TIME_BUDGET_MS,
            max_observations: None,
            face_lost_ticks: DEFAULT_FACE_LOST_TICKS,
            min_face_confidence: DEFAULT_MIN_FACE_CONFIDENCE,
        }
    }
}

impl LivenessChallenge {
    pub fn validate(&self) -> Result<(), ChallengeError> {
        if self.steps.is_empty() {
            return Err(ChallengeError::NoSteps);
        }
        for (i, step) in self.steps.iter().enumerate() {
            if self.steps[..i].iter().any(|s| s.name == step.name) {
                return Err(ChallengeError::DuplicateStep(step.name.clone()));
            }
            step.validate()?;
        }
        if self.time_budget_ms == 0 {
            return Err(ChallengeError::ZeroTimeBudget);
        }
        if self.face_lost_ticks == 0 {
            return Err(ChallengeError::ZeroFaceLostTicks);
        }
        if !(0.0..=1.0).contains(&self.min_face_confidence) {
            return Err(ChallengeError::InvalidFaceConfidence(self.min_face_confidence));
        }
        Ok(())
    }

    pub fn time_budget(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.time_budget_ms)
    }
}

/// Why a liveness session ended without passing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    FaceLost,
    SourceError(String),
    /// The challenge failed validation; no observation is evaluated.
    InvalidChallenge(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "challenge not completed in time"),
            Self::FaceLost => write!(f, "face lost"),
            Self::SourceError(msg) => write!(f, "observation source error: {msg}"),
            Self::InvalidChallenge(msg) => write!(f, "invalid liveness challenge: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessState {
    AwaitingStep(usize),
    Passed,
    Failed(FailureReason),
}

/// Terminal outcome of one liveness session.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessResult {
    pub passed: bool,
    /// Step name → satisfied, in challenge order.
    pub per_step_satisfied: Vec<(String, bool)>,
    pub captured_embedding: Option<Embedding>,
    pub failure: Option<FailureReason>,
    /// Observations consumed, including no-face ticks.
    pub observations: u32,
}

impl LivenessResult {
    pub fn step_satisfied(&self, name: &str) -> Option<bool> {
        self.per_step_satisfied
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }
}

/// Liveness state machine for one session.
#[derive(Debug)]
pub struct LivenessMachine<'a> {
    challenge: &'a LivenessChallenge,
    state: LivenessState,
    satisfied: Vec<bool>,
    started_at_ms: Option<u64>,
    previous_nose: Option<Point>,
    consecutive_misses: u32,
    observed: u32,
    last_embedding: Option<Embedding>,
    captured: Option<Embedding>,
}

impl<'a> LivenessMachine<'a> {
    /// An invalid challenge yields a machine that is already
    /// `Failed(InvalidChallenge)`.
    pub fn new(challenge: &'a LivenessChallenge) -> Self {
        let state = match challenge.validate() {
            Ok(()) => LivenessState::AwaitingStep(0),
            Err(e) => {
                tracing::warn!(error = %e, "rejecting invalid liveness challenge");
                LivenessState::Failed(FailureReason::InvalidChallenge(e.to_string()))
            }
        };
        Self {
            challenge,
            state,
            satisfied: vec![false; challenge.steps.len()],
            started_at_ms: None,
            previous_nose: None,
            consecutive_misses: 0,
            observed: 0,
            last_embedding: None,
            captured: None,
        }
    }

    pub fn state(&self) -> &LivenessState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, LivenessState::AwaitingStep(_))
    }

    /// The step currently being waited for, if the machine is still running.
    pub fn current_step(&self) -> Option<&'a ChallengeStep> {
        match self.state {
            LivenessState::AwaitingStep(idx) => self.challenge.steps.get(idx),
            _ => None,
        }
    }

    /// Feed one observation. Terminal machines ignore further input.
    pub fn observe(&mut self, observation: &Observation) -> &LivenessState {
        let LivenessState::AwaitingStep(idx) = self.state else {
            return &self.state;
        };
        self.observed += 1;

        let started = *self.started_at_ms.get_or_insert(observation.timestamp_ms);
        if observation.timestamp_ms.saturating_sub(started) > self.challenge.time_budget_ms {
            self.fail(FailureReason::Timeout);
            return &self.state;
        }

        if !observation.has_face(self.challenge.min_face_confidence) {
            self.previous_nose = None;
            self.consecutive_misses += 1;
            tracing::trace!(misses = self.consecutive_misses, "no face in observation");
            if self.consecutive_misses >= self.challenge.face_lost_ticks {
                self.fail(FailureReason::FaceLost);
            } else {
                self.check_frame_budget();
            }
            return &self.state;
        }
        self.consecutive_misses = 0;

        if let Some(embedding) = &observation.embedding {
            self.last_embedding = Some(embedding.clone());
        }

        let challenge = self.challenge;
        let Some(step) = challenge.steps.get(idx) else {
            self.fail(FailureReason::InvalidChallenge(format!("no step {idx}")));
            return &self.state;
        };
        let satisfied = self.evaluate(&step.predicate, observation);
        self.previous_nose = observation.nose_tip();

        if satisfied {
            self.satisfied[idx] = true;
            tracing::debug!(step = %step.name, index = idx, "liveness step satisfied");
            if idx + 1 == challenge.steps.len() {
                self.captured = self.last_embedding.take();
                self.state = LivenessState::Passed;
                return &self.state;
            }
            self.state = LivenessState::AwaitingStep(idx + 1);
        }

        self.check_frame_budget();
        &self.state
    }

    /// Wall-clock deadline elapsed before the challenge completed.
    pub fn expire(&mut self) {
        if !self.is_terminal() {
            self.fail(FailureReason::Timeout);
        }
    }

    /// The observation source failed or ended.
    pub fn source_failed(&mut self, message: impl Into<String>) {
        if !self.is_terminal() {
            self.fail(FailureReason::SourceError(message.into()));
        }
    }

    pub fn finish(self) -> LivenessResult {
        let per_step_satisfied = self
            .challenge
            .steps
            .iter()
            .zip(&self.satisfied)
            .map(|(step, s)| (step.name.clone(), *s))
            .collect();
        let (passed, failure) = match self.state {
            LivenessState::Passed => (true, None),
            LivenessState::Failed(reason) => (false, Some(reason)),
            LivenessState::AwaitingStep(_) => (false, None),
        };
        LivenessResult {
            passed,
            per_step_satisfied,
            captured_embedding: if passed { self.captured } else { None },
            failure,
            observations: self.observed,
        }
    }

    fn evaluate(&self, predicate: &StepPredicate, observation: &Observation) -> bool {
        match predicate {
            StepPredicate::Blink { max_eye_aspect_ratio } => {
                geometry::mean_eye_aspect_ratio(observation)
                    .is_some_and(|ear| ear < *max_eye_aspect_ratio)
            }
            StepPredicate::Expression { label, min_probability } => {
                observation.expression(label) > *min_probability
            }
            StepPredicate::HeadTurn { min_displacement, horizontal_only } => {
                match (self.previous_nose, observation.nose_tip()) {
                    (Some(prev), Some(curr)) => {
                        geometry::nose_displacement(prev, curr, *horizontal_only)
                            > *min_displacement
                    }
                    _ => false,
                }
            }
        }
    }

    fn check_frame_budget(&mut self) {
        if let Some(max) = self.challenge.max_observations {
            if self.observed >= max && !self.is_terminal() {
                self.fail(FailureReason::Timeout);
            }
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        tracing::debug!(%reason, observed = self.observed, "liveness failed");
        self.state = LivenessState::Failed(reason);
    }
}
