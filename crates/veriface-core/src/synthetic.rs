//! Synthetic observations for replay scripts, diagnostics and tests.

use crate::observation::{Observation, Point, LANDMARK_COUNT, LEFT_EYE, NOSE_TIP, RIGHT_EYE};
use crate::types::Embedding;
use std::collections::BTreeMap;

const EYE_WIDTH: f32 = 30.0;
const EYE_Y: f32 = 120.0;
const LEFT_EYE_X: f32 = 140.0;
const RIGHT_EYE_X: f32 = 230.0;

/// Builder for a face-present [`Observation`] with controllable geometry.
#[derive(Debug, Clone)]
pub struct SyntheticFace {
    timestamp_ms: u64,
    confidence: f32,
    eye_aspect_ratio: f32,
    nose: Point,
    expressions: BTreeMap<String, f32>,
    embedding: Option<Embedding>,
}

impl SyntheticFace {
    /// Open eyes, centred nose, neutral expression.
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            confidence: 0.9,
            eye_aspect_ratio: 0.32,
            nose: (200.0, 160.0),
            expressions: BTreeMap::from([("neutral".to_string(), 0.95)]),
            embedding: None,
        }
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn eye_aspect_ratio(mut self, ear: f32) -> Self {
        self.eye_aspect_ratio = ear;
        self
    }

    pub fn eyes_closed(self) -> Self {
        self.eye_aspect_ratio(0.1)
    }

    pub fn nose_at(mut self, x: f32, y: f32) -> Self {
        self.nose = (x, y);
        self
    }

    pub fn expression(mut self, label: &str, probability: f32) -> Self {
        self.expressions.insert(label.to_string(), probability);
        self
    }

    pub fn embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn build(self) -> Observation {
        let mut landmarks: Vec<Point> = (0..LANDMARK_COUNT)
            .map(|i| (100.0 + i as f32 * 3.0, 220.0))
            .collect();

        let opening = self.eye_aspect_ratio * EYE_WIDTH;
        for (range, x0) in [(LEFT_EYE, LEFT_EYE_X), (RIGHT_EYE, RIGHT_EYE_X)] {
            let contour = eye_contour(x0, opening);
            landmarks[range].copy_from_slice(&contour);
        }
        landmarks[NOSE_TIP] = self.nose;

        Observation {
            timestamp_ms: self.timestamp_ms,
            detection_confidence: self.confidence,
            landmarks,
            expressions: self.expressions,
            embedding: self.embedding,
        }
    }
}

/// Six-point contour whose eye aspect ratio is `opening / EYE_WIDTH`.
fn eye_contour(x0: f32, opening: f32) -> [Point; 6] {
    let half = opening / 2.0;
    [
        (x0, EYE_Y),
        (x0 + EYE_WIDTH * 0.3, EYE_Y - half),
        (x0 + EYE_WIDTH * 0.7, EYE_Y - half),
        (x0 + EYE_WIDTH, EYE_Y),
        (x0 + EYE_WIDTH * 0.7, EYE_Y + half),
        (x0 + EYE_WIDTH * 0.3, EYE_Y + half),
    ]
}
