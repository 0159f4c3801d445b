use crate::session::{self, CaptureFailure, Verdict, VerifyConfig};
use crate::store::{IdentityStore, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::AbortHandle;
use veriface_core::{
    EmbeddingError, EuclideanMatcher, FailureReason, Population, PopulationStore, RegisterError,
    RegisteredIdentity,
};
use veriface_source::SourceOpener;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
    #[error("session {0} is already running")]
    SessionBusy(String),
    #[error("session cancelled")]
    Cancelled,
    #[error("session task failed: {0}")]
    TaskFailed(String),
    #[error("invalid identity key: {0:?}")]
    InvalidIdentityKey(String),
}

/// Thresholds and challenge shared by every session.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub verify: VerifyConfig,
    /// Distance below which a new face counts as already registered.
    pub duplicate_threshold: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            verify: VerifyConfig::default(),
            duplicate_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationReason {
    Registered,
    DuplicateKey,
    DuplicateFace,
    Timeout,
    FaceLost,
    SourceError,
    NoEmbeddingCaptured,
    InvalidChallenge,
}

impl From<&CaptureFailure> for RegistrationReason {
    fn from(failure: &CaptureFailure) -> Self {
        match failure {
            CaptureFailure::Liveness(FailureReason::Timeout) => Self::Timeout,
            CaptureFailure::Liveness(FailureReason::FaceLost) => Self::FaceLost,
            CaptureFailure::Liveness(FailureReason::SourceError(_)) => Self::SourceError,
            CaptureFailure::Liveness(FailureReason::InvalidChallenge(_)) => Self::InvalidChallenge,
            CaptureFailure::NoEmbeddingCaptured => Self::NoEmbeddingCaptured,
        }
    }
}

/// Result of a registration attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationReport {
    pub registered: bool,
    pub reason: RegistrationReason,
    pub identity_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RegistrationReport {
    fn rejected(identity_key: &str, reason: RegistrationReason, detail: Option<String>) -> Self {
        Self {
            registered: false,
            reason,
            identity_key: identity_key.to_string(),
            registered_at: None,
            detail,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub version: &'static str,
    pub source: String,
    pub identities: usize,
    pub active_sessions: usize,
    pub match_threshold: f32,
    pub duplicate_threshold: f32,
    pub challenge_steps: Vec<String>,
    pub time_budget_ms: u64,
}

/// Public view of a registered identity; embeddings never leave the daemon.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub identity_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
}

struct Inner {
    opener: Arc<dyn SourceOpener>,
    population: PopulationStore,
    store: Option<IdentityStore>,
    settings: EngineSettings,
    sessions: Mutex<HashMap<String, AbortHandle>>,
}

/// Why a captured identity was not committed.
enum CommitError {
    Rejected(RegisterError),
    Store(StoreError),
}

impl From<RegisterError> for CommitError {
    fn from(e: RegisterError) -> Self {
        Self::Rejected(e)
    }
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the session entry and aborts the task when the caller goes away.
struct SessionGuard<'a> {
    inner: &'a Inner,
    token: String,
    abort: AbortHandle,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.abort.abort();
        let mut sessions = self.inner.sessions();
        // The token may already belong to a newer session.
        if sessions
            .get(&self.token)
            .is_some_and(|handle| handle.id() == self.abort.id())
        {
            sessions.remove(&self.token);
        }
    }
}

/// Clone-safe handle to the verification engine.
///
/// Each session runs as its own tokio task holding its own source lease and
/// population snapshot. Sessions are keyed by caller-supplied token so they
/// can be cancelled.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Inner>,
}

impl EngineHandle {
    /// `opener` must already have been probed; it is the engine's only way to
    /// reach the observation model.
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        population: PopulationStore,
        store: Option<IdentityStore>,
        settings: EngineSettings,
    ) -> Self {
        tracing::info!(
            source = %opener.describe(),
            identities = population.snapshot().len(),
            match_threshold = settings.verify.match_threshold,
            "engine ready"
        );
        Self {
            inner: Arc::new(Inner {
                opener,
                population,
                store,
                settings,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Run a liveness challenge and match against the claimed identity.
    pub async fn verify_login(
        &self,
        claimed_key: &str,
        session_token: &str,
    ) -> Result<Verdict, EngineError> {
        let lease = match self.inner.opener.open() {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open observation source");
                return Ok(Verdict::source_unavailable(&e));
            }
        };
        let population = self.inner.population.snapshot();
        let config = self.inner.settings.verify.clone();
        let claimed = claimed_key.to_string();

        self.run_session(session_token, async move {
            session::verify_login(&claimed, lease, &population, &config).await
        })
        .await?
    }

    /// Capture a live embedding and register it under `identity_key`.
    pub async fn register(
        &self,
        identity_key: &str,
        session_token: &str,
    ) -> Result<RegistrationReport, EngineError> {
        let key = identity_key.trim();
        if key.is_empty() {
            return Err(EngineError::InvalidIdentityKey(identity_key.to_string()));
        }
        let fingerprint = session::key_fingerprint(key);
        if self.inner.population.snapshot().contains_key(key) {
            tracing::info!(key = %fingerprint, "registration rejected: key already registered");
            return Ok(RegistrationReport::rejected(key, RegistrationReason::DuplicateKey, None));
        }

        let lease = match self.inner.opener.open() {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open observation source");
                return Ok(RegistrationReport::rejected(
                    key,
                    RegistrationReason::SourceError,
                    Some(e.to_string()),
                ));
            }
        };
        let challenge = self.inner.settings.verify.challenge.clone();
        let captured = self
            .run_session(session_token, async move {
                session::capture_for_registration(lease, &challenge).await
            })
            .await?;

        let embedding = match captured {
            Ok(embedding) => embedding,
            Err(failure) => {
                tracing::info!(
                    key = %fingerprint,
                    failure = ?failure,
                    "registration capture failed"
                );
                let detail = match &failure {
                    CaptureFailure::Liveness(
                        FailureReason::SourceError(msg) | FailureReason::InvalidChallenge(msg),
                    ) => Some(msg.clone()),
                    _ => None,
                };
                return Ok(RegistrationReport::rejected(key, (&failure).into(), detail));
            }
        };

        let registered_at = chrono::Utc::now().to_rfc3339();
        let identity = RegisteredIdentity {
            identity_id: key.to_string(),
            embedding,
            registered_at: Some(registered_at.clone()),
        };

        match self.commit(identity).await? {
            Ok(population) => {
                tracing::info!(
                    key = %fingerprint,
                    identities = population.len(),
                    "identity registered"
                );
            }
            Err(CommitError::Rejected(RegisterError::DuplicateKey(_))) => {
                return Ok(RegistrationReport::rejected(
                    key,
                    RegistrationReason::DuplicateKey,
                    None,
                ));
            }
            Err(CommitError::Rejected(RegisterError::DuplicateFace { existing, distance })) => {
                tracing::info!(
                    key = %fingerprint,
                    existing = %session::key_fingerprint(&existing),
                    distance,
                    "registration rejected: face already registered"
                );
                return Ok(RegistrationReport::rejected(
                    key,
                    RegistrationReason::DuplicateFace,
                    None,
                ));
            }
            Err(CommitError::Rejected(RegisterError::Embedding(e))) => return Err(e.into()),
            Err(CommitError::Store(e)) => {
                tracing::error!(key = %fingerprint, error = %e, "failed to persist identity");
                return Err(e.into());
            }
        }

        Ok(RegistrationReport {
            registered: true,
            reason: RegistrationReason::Registered,
            identity_key: key.to_string(),
            registered_at: Some(registered_at),
            detail: None,
        })
    }

    /// Abort the session running under `session_token`. Its source is released
    /// as the task unwinds. Returns `false` if no such session is running.
    pub fn cancel(&self, session_token: &str) -> bool {
        let Some(abort) = self.inner.sessions().remove(session_token) else {
            return false;
        };
        abort.abort();
        tracing::info!(token = session_token, "session cancelled");
        true
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions().len()
    }

    pub fn status(&self) -> EngineStatus {
        let settings = &self.inner.settings;
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            source: self.inner.opener.describe(),
            identities: self.inner.population.snapshot().len(),
            active_sessions: self.active_sessions(),
            match_threshold: settings.verify.match_threshold,
            duplicate_threshold: settings.duplicate_threshold,
            challenge_steps: settings
                .verify
                .challenge
                .steps
                .iter()
                .map(|s| s.name.clone())
                .collect(),
            time_budget_ms: settings.verify.challenge.time_budget_ms,
        }
    }

    pub fn identities(&self) -> Vec<IdentitySummary> {
        self.inner
            .population
            .snapshot()
            .identities()
            .iter()
            .map(|i| IdentitySummary {
                identity_key: i.identity_id.clone(),
                registered_at: i.registered_at.clone(),
            })
            .collect()
    }

    async fn run_session<T, F>(&self, session_token: &str, session: F) -> Result<T, EngineError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = if session_token.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            session_token.to_string()
        };

        let task = {
            let mut sessions = self.inner.sessions();
            if sessions.contains_key(&token) {
                return Err(EngineError::SessionBusy(token));
            }
            let task = tokio::spawn(session);
            sessions.insert(token.clone(), task.abort_handle());
            task
        };
        tracing::debug!(token = %token, "session started");

        let _guard = SessionGuard {
            inner: &self.inner,
            abort: task.abort_handle(),
            token,
        };

        match task.await {
            Ok(value) => Ok(value),
            Err(e) if e.is_cancelled() => Err(EngineError::Cancelled),
            Err(e) => Err(EngineError::TaskFailed(e.to_string())),
        }
    }

    /// Check, save and publish `identity` on a blocking thread.
    ///
    /// The population is swapped only after the store has been written, so a
    /// failed save leaves neither memory nor disk changed.
    async fn commit(
        &self,
        identity: RegisteredIdentity,
    ) -> Result<Result<Population, CommitError>, EngineError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner.population.register_with(
                identity,
                &EuclideanMatcher,
                inner.settings.duplicate_threshold,
                |next| match &inner.store {
                    Some(store) => store.save(next).map_err(CommitError::Store),
                    None => Ok(()),
                },
            )
        })
        .await
        .map_err(|e| EngineError::TaskFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::VerdictReason;
    use std::time::Duration;
    use veriface_core::synthetic::SyntheticFace;
    use veriface_core::{Embedding, Observation, EMBEDDING_DIM};
    use veriface_source::{ScriptOpener, SourceError, SourceLease};

    struct Unavailable;

    impl SourceOpener for Unavailable {
        fn describe(&self) -> String {
            "unavailable".into()
        }

        fn open(&self) -> Result<SourceLease, SourceError> {
            Err(SourceError::Unavailable("camera unplugged".into()))
        }
    }

    fn probe() -> Embedding {
        Embedding::new(vec![0.05; EMBEDDING_DIM]).unwrap()
    }

    fn passing_script(embedding: Embedding) -> Vec<Observation> {
        vec![
            SyntheticFace::new(0).eyes_closed().build(),
            SyntheticFace::new(100).expression("happy", 0.9).build(),
            SyntheticFace::new(200).build(),
            SyntheticFace::new(300).nose_at(215.0, 160.0).embedding(embedding).build(),
        ]
    }

    fn engine(opener: impl SourceOpener, identities: Vec<RegisteredIdentity>) -> EngineHandle {
        EngineHandle::new(
            Arc::new(opener),
            PopulationStore::new(identities),
            None,
            EngineSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_register_then_verify() {
        let engine = engine(ScriptOpener::new(passing_script(probe()), Duration::ZERO), vec![]);

        let report = engine.register("alice", "").await.unwrap();
        assert!(report.registered, "{report:?}");
        assert!(report.registered_at.is_some());
        assert_eq!(engine.identities().len(), 1);

        let verdict = engine.verify_login("alice", "").await.unwrap();
        assert!(verdict.accepted);
        assert_eq!(engine.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_register_duplicate_key_skips_capture() {
        let existing = RegisteredIdentity {
            identity_id: "alice".into(),
            embedding: probe(),
            registered_at: None,
        };
        let engine = engine(Unavailable, vec![existing]);
        let report = engine.register("alice", "").await.unwrap();
        assert_eq!(report.reason, RegistrationReason::DuplicateKey);
    }

    #[tokio::test]
    async fn test_register_duplicate_face() {
        let existing = RegisteredIdentity {
            identity_id: "alice".into(),
            embedding: probe(),
            registered_at: None,
        };
        let engine = engine(
            ScriptOpener::new(passing_script(probe()), Duration::ZERO),
            vec![existing],
        );
        let report = engine.register("alice-again", "").await.unwrap();
        assert!(!report.registered);
        assert_eq!(report.reason, RegistrationReason::DuplicateFace);
        assert_eq!(engine.identities().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_does_not_register() {
        // A regular file where the store's parent directory should be.
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let store = IdentityStore::new(blocker.path().join("identities.json"));
        let engine = EngineHandle::new(
            Arc::new(ScriptOpener::new(passing_script(probe()), Duration::ZERO)),
            PopulationStore::default(),
            Some(store),
            EngineSettings::default(),
        );

        assert!(matches!(
            engine.register("alice", "").await,
            Err(EngineError::Store(_))
        ));
        assert!(engine.identities().is_empty());
        assert_eq!(engine.status().identities, 0);

        // The retry fails on the store again rather than as a duplicate.
        assert!(matches!(
            engine.register("alice", "").await,
            Err(EngineError::Store(_))
        ));
        assert!(engine.identities().is_empty());
    }

    #[tokio::test]
    async fn test_register_with_invalid_challenge() {
        let settings = EngineSettings {
            verify: VerifyConfig {
                challenge: veriface_core::LivenessChallenge {
                    steps: vec![],
                    ..Default::default()
                },
                ..VerifyConfig::default()
            },
            ..EngineSettings::default()
        };
        let engine = EngineHandle::new(
            Arc::new(ScriptOpener::new(passing_script(probe()), Duration::ZERO)),
            PopulationStore::default(),
            None,
            settings,
        );
        let report = engine.register("alice", "").await.unwrap();
        assert!(!report.registered);
        assert_eq!(report.reason, RegistrationReason::InvalidChallenge);
        assert!(report.detail.is_some());
        assert!(engine.identities().is_empty());
    }

    #[tokio::test]
    async fn test_stale_guard_keeps_newer_session() {
        let engine = engine(Unavailable, vec![]);
        let old = tokio::spawn(std::future::pending::<()>());
        let new = tokio::spawn(std::future::pending::<()>());
        engine
            .inner
            .sessions()
            .insert("t".into(), new.abort_handle());

        drop(SessionGuard {
            inner: &engine.inner,
            token: "t".into(),
            abort: old.abort_handle(),
        });

        assert!(old.await.unwrap_err().is_cancelled());
        assert_eq!(engine.active_sessions(), 1);
        assert!(engine.cancel("t"));
        assert!(new.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_guard_removes_own_session() {
        let engine = engine(Unavailable, vec![]);
        let task = tokio::spawn(std::future::pending::<()>());
        engine
            .inner
            .sessions()
            .insert("t".into(), task.abort_handle());

        drop(SessionGuard {
            inner: &engine.inner,
            token: "t".into(),
            abort: task.abort_handle(),
        });

        assert_eq!(engine.active_sessions(), 0);
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_blank_key_rejected() {
        let engine = engine(Unavailable, vec![]);
        assert!(matches!(
            engine.register("  ", "").await,
            Err(EngineError::InvalidIdentityKey(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_source_is_a_verdict() {
        let engine = engine(Unavailable, vec![]);
        let verdict = engine.verify_login("alice", "").await.unwrap();
        assert_eq!(verdict.reason, VerdictReason::SourceError);
        assert!(verdict.detail.unwrap().contains("camera unplugged"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_token() {
        let engine = engine(Unavailable, vec![]);
        assert!(!engine.cancel("nope"));
    }

    #[tokio::test]
    async fn test_status_reports_settings() {
        let engine = engine(Unavailable, vec![]);
        let status = engine.status();
        assert_eq!(status.source, "unavailable");
        assert_eq!(status.challenge_steps, vec!["blink", "smile", "turn"]);
        assert_eq!(status.match_threshold, 0.5);
    }
}
