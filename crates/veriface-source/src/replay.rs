//! Scripted and JSON-lines observation sources.

use crate::lease::{SourceError, SourceItem, SourceLease};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use veriface_core::Observation;

/// Replay a fixed observation sequence, one every `interval`.
///
/// Must be called from within a tokio runtime.
pub fn scripted(
    name: impl Into<String>,
    observations: Vec<Observation>,
    interval: Duration,
) -> SourceLease {
    let (tx, rx) = mpsc::channel(observations.len().clamp(1, 64));
    let producer = tokio::spawn(async move {
        for (i, observation) in observations.into_iter().enumerate() {
            if i > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            if tx.send(Ok(observation)).await.is_err() {
                return;
            }
        }
    });
    SourceLease::new(name, rx).with_producer(producer)
}

/// Options for reading newline-delimited JSON observations.
#[derive(Debug, Clone, Copy)]
pub struct JsonLinesOptions {
    pub capacity: usize,
    /// Sleep between observations by their timestamp deltas (recorded files).
    pub paced: bool,
}

impl Default for JsonLinesOptions {
    fn default() -> Self {
        Self {
            capacity: 16,
            paced: false,
        }
    }
}

/// Read one JSON observation per line from `reader`.
///
/// Blank lines and lines starting with `#` are skipped. The first malformed
/// line is reported as an error and ends the stream.
pub fn json_lines<R>(name: impl Into<String>, reader: R, options: JsonLinesOptions) -> SourceLease
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(options.capacity.max(1));
    let producer = tokio::spawn(async move {
        if let Err(e) = pump_lines(reader, &tx, options.paced).await {
            let _ = tx.send(Err(e)).await;
        }
    });
    SourceLease::new(name, rx).with_producer(producer)
}

/// JSON-lines source over a file or FIFO, opened by the producer task.
pub fn json_lines_file(path: PathBuf, options: JsonLinesOptions) -> SourceLease {
    let (tx, rx) = mpsc::channel(options.capacity.max(1));
    let name = path.display().to_string();
    let producer = tokio::spawn(async move {
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to open observation source"
                );
                let _ = tx.send(Err(SourceError::Io(e))).await;
                return;
            }
        };
        if let Err(e) = pump_lines(BufReader::new(file), &tx, options.paced).await {
            let _ = tx.send(Err(e)).await;
        }
    });
    SourceLease::new(name, rx).with_producer(producer)
}

async fn pump_lines<R>(
    reader: R,
    tx: &mpsc::Sender<SourceItem>,
    paced: bool,
) -> Result<(), SourceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut last_ts: Option<u64> = None;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let observation: Observation =
            serde_json::from_str(trimmed).map_err(|e| SourceError::Malformed {
                line: line_no,
                message: e.to_string(),
            })?;

        if paced {
            if let Some(prev) = last_ts {
                let delta = observation.timestamp_ms.saturating_sub(prev);
                tokio::time::sleep(Duration::from_millis(delta)).await;
            }
            last_ts = Some(observation.timestamp_ms);
        }

        if tx.send(Ok(observation)).await.is_err() {
            // Lease released.
            return Ok(());
        }
    }

    tracing::debug!(lines = line_no, "observation stream reached end of input");
    Ok(())
}
