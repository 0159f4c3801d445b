//! veriface-source — Observation source adapters.
//!
//! Sources push per-frame [`veriface_core::Observation`]s into a bounded
//! channel held by a [`SourceLease`]. Adapters exist for scripted replay,
//! newline-delimited JSON from a file or FIFO, and direct push.

pub mod lease;
pub mod opener;
pub mod replay;

pub use lease::{channel, ObservationSender, SourceError, SourceItem, SourceLease};
pub use opener::{FileOpener, ScriptOpener, SourceOpener};
pub use replay::{json_lines, json_lines_file, scripted, JsonLinesOptions};
