//! Per-frame facial observations supplied by the external detection model.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// A 2-D landmark position in frame pixels.
pub type Point = (f32, f32);

/// Landmark sets follow the 68-point iBUG layout.
pub const LANDMARK_COUNT: usize = 68;
pub const LEFT_EYE: Range<usize> = 36..42;
pub const RIGHT_EYE: Range<usize> = 42..48;
pub const NOSE_TIP: usize = 30;

/// One tick of output from the observation source.
///
/// A tick where no face was found carries zero confidence and no landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// Source timestamp in milliseconds. Only differences are meaningful.
    pub timestamp_ms: u64,
    #[serde(default)]
    pub detection_confidence: f32,
    #[serde(default)]
    pub landmarks: Vec<Point>,
    /// Expression label → probability in [0, 1].
    #[serde(default)]
    pub expressions: BTreeMap<String, f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
}

impl Observation {
    /// A tick on which the source found no face.
    pub fn no_face(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            detection_confidence: 0.0,
            landmarks: Vec::new(),
            expressions: BTreeMap::new(),
            embedding: None,
        }
    }

    /// True if a face was detected with at least `min_confidence` and the
    /// landmark set is complete.
    pub fn has_face(&self, min_confidence: f32) -> bool {
        self.detection_confidence >= min_confidence && self.landmarks.len() >= LANDMARK_COUNT
    }

    pub fn left_eye(&self) -> Option<&[Point]> {
        self.landmarks.get(LEFT_EYE)
    }

    pub fn right_eye(&self) -> Option<&[Point]> {
        self.landmarks.get(RIGHT_EYE)
    }

    pub fn nose_tip(&self) -> Option<Point> {
        self.landmarks.get(NOSE_TIP).copied()
    }

    /// Probability for an expression label; absent labels read as 0.
    pub fn expression(&self, label: &str) -> f32 {
        self.expressions.get(label).copied().unwrap_or(0.0)
    }
}
