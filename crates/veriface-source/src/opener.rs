//! Capabilities that hand out one [`SourceLease`] per verification session.

use crate::lease::{SourceError, SourceLease};
use crate::replay::{self, JsonLinesOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use veriface_core::Observation;

/// Opens a fresh observation source for each session.
///
/// An opener is the engine's only handle on the observation model. Obtaining
/// one is the caller's one-time initialization step.
pub trait SourceOpener: Send + Sync + 'static {
    /// Human-readable description for status output.
    fn describe(&self) -> String;

    /// Lease a source for one session. Must be called within a tokio runtime.
    fn open(&self) -> Result<SourceLease, SourceError>;
}

/// JSON-lines observations read from a file or FIFO written by the model process.
#[derive(Debug, Clone)]
pub struct FileOpener {
    path: PathBuf,
    options: JsonLinesOptions,
}

impl FileOpener {
    /// Fails fast if `path` does not exist.
    pub fn probe(path: impl AsRef<Path>, options: JsonLinesOptions) -> Result<Self, SourceError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SourceError::Unavailable(format!(
                "{} not found (is the observation model running?)",
                path.display()
            )));
        }
        tracing::info!(path = %path.display(), paced = options.paced, "observation source ready");
        Ok(Self {
            path: path.to_path_buf(),
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceOpener for FileOpener {
    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    fn open(&self) -> Result<SourceLease, SourceError> {
        Ok(replay::json_lines_file(self.path.clone(), self.options))
    }
}

/// Replays the same scripted sequence for every session.
#[derive(Debug, Clone)]
pub struct ScriptOpener {
    observations: Arc<Vec<Observation>>,
    interval: Duration,
}

impl ScriptOpener {
    pub fn new(observations: Vec<Observation>, interval: Duration) -> Self {
        Self {
            observations: Arc::new(observations),
            interval,
        }
    }
}

impl SourceOpener for ScriptOpener {
    fn describe(&self) -> String {
        format!("script:{} observations", self.observations.len())
    }

    fn open(&self) -> Result<SourceLease, SourceError> {
        Ok(replay::scripted(
            "script",
            self.observations.as_ref().clone(),
            self.interval,
        ))
    }
}
