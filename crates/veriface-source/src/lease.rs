//! Scoped hold on an observation source.
//!
//! Every source feeds a bounded channel. The session owns the receiving
//! [`SourceLease`]; dropping it (normal completion, error, or cancellation of
//! the owning task) aborts the producer and runs the release hook.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use veriface_core::Observation;

pub type SourceItem = Result<Observation, SourceError>;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed observation on line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("observation stream closed")]
    Closed,
    #[error("source failed: {0}")]
    Failed(String),
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Receiving end of an observation source, released on drop.
pub struct SourceLease {
    name: String,
    rx: mpsc::Receiver<SourceItem>,
    producer: Option<JoinHandle<()>>,
    on_release: Option<ReleaseHook>,
}

impl SourceLease {
    pub fn new(name: impl Into<String>, rx: mpsc::Receiver<SourceItem>) -> Self {
        Self {
            name: name.into(),
            rx,
            producer: None,
            on_release: None,
        }
    }

    /// Attach the task feeding this lease; it is aborted on release.
    pub fn with_producer(mut self, producer: JoinHandle<()>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Run `hook` exactly once when the lease is released.
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next observation; `None` once the source has ended.
    pub async fn next(&mut self) -> Option<SourceItem> {
        self.rx.recv().await
    }

    fn release(&mut self) {
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        if let Some(hook) = self.on_release.take() {
            hook();
        }
        tracing::debug!(source = %self.name, "observation source released");
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Push side of a channel source.
#[derive(Clone)]
pub struct ObservationSender {
    tx: mpsc::Sender<SourceItem>,
}

impl ObservationSender {
    /// Waits for capacity; fails once the lease has been released.
    pub async fn send(&self, observation: Observation) -> Result<(), SourceError> {
        self.tx
            .send(Ok(observation))
            .await
            .map_err(|_| SourceError::Closed)
    }

    /// Report a source failure to the session.
    pub async fn fail(&self, error: SourceError) -> Result<(), SourceError> {
        self.tx.send(Err(error)).await.map_err(|_| SourceError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded push source: observations sent on the returned sender arrive on the lease.
pub fn channel(name: impl Into<String>, capacity: usize) -> (ObservationSender, SourceLease) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ObservationSender { tx }, SourceLease::new(name, rx))
}
