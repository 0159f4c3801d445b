//! Registered population with immutable-snapshot reads.
//!
//! A match always scans one [`Population`] snapshot. Registration builds a new
//! vector and swaps it in, so a concurrent scan never observes a partially
//! updated population.

use crate::types::{EmbeddingError, Matcher, RegisteredIdentity};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegisterError {
    #[error("identity {0} is already registered")]
    DuplicateKey(String),
    #[error("face already registered as {existing} (distance {distance:.3})")]
    DuplicateFace { existing: String, distance: f32 },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Read-only, cheaply clonable view of the registered identities.
#[derive(Debug, Clone, Default)]
pub struct Population {
    identities: Arc<Vec<RegisteredIdentity>>,
}

impl Population {
    pub fn new(identities: Vec<RegisteredIdentity>) -> Self {
        Self {
            identities: Arc::new(identities),
        }
    }

    pub fn identities(&self) -> &[RegisteredIdentity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn contains_key(&self, identity_id: &str) -> bool {
        self.identities.iter().any(|i| i.identity_id == identity_id)
    }
}

/// Shared holder of the current population snapshot.
#[derive(Debug, Default)]
pub struct PopulationStore {
    current: RwLock<Population>,
}

impl PopulationStore {
    pub fn new(identities: Vec<RegisteredIdentity>) -> Self {
        Self {
            current: RwLock::new(Population::new(identities)),
        }
    }

    pub fn snapshot(&self) -> Population {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add an identity after checking key and face uniqueness.
    ///
    /// The check and the swap happen under one write lock, so two concurrent
    /// registrations of the same face cannot both succeed. Returns the new
    /// snapshot.
    pub fn register(
        &self,
        identity: RegisteredIdentity,
        matcher: &impl Matcher,
        duplicate_threshold: f32,
    ) -> Result<Population, RegisterError> {
        self.register_with(identity, matcher, duplicate_threshold, |_| Ok(()))
    }

    /// Like [`register`](Self::register), but hands the would-be population
    /// to `commit` before publishing it. The new snapshot is swapped in only
    /// if `commit` succeeds; on error the current population is untouched.
    ///
    /// `commit` runs under the write lock, which also serializes commits.
    pub fn register_with<E>(
        &self,
        identity: RegisteredIdentity,
        matcher: &impl Matcher,
        duplicate_threshold: f32,
        commit: impl FnOnce(&[RegisteredIdentity]) -> Result<(), E>,
    ) -> Result<Population, E>
    where
        E: From<RegisterError>,
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);

        if current.contains_key(&identity.identity_id) {
            return Err(RegisterError::DuplicateKey(identity.identity_id).into());
        }
        let duplicate = matcher
            .find_duplicate(&identity.embedding, current.identities(), duplicate_threshold)
            .map_err(RegisterError::from)?;
        if let Some(dup) = duplicate {
            return Err(RegisterError::DuplicateFace {
                existing: dup.identity_id.unwrap_or_default(),
                distance: dup.distance,
            }
            .into());
        }

        let mut next = current.identities().to_vec();
        next.push(identity);
        commit(&next)?;
        *current = Population::new(next);
        Ok(current.clone())
    }
}
