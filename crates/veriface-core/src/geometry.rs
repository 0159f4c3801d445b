//! Facial geometry over landmark coordinates: eye aspect ratio and nose motion.

use crate::observation::{Observation, Point};

pub fn point_distance(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Eye aspect ratio for a six-point eye contour `[p0..p5]`:
/// `(|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)`.
///
/// Returns `None` for a malformed contour or a zero-width eye.
pub fn eye_aspect_ratio(eye: &[Point]) -> Option<f32> {
    let [p0, p1, p2, p3, p4, p5] = <[Point; 6]>::try_from(eye).ok()?;
    let width = point_distance(p0, p3);
    if width <= f32::EPSILON {
        return None;
    }
    Some((point_distance(p1, p5) + point_distance(p2, p4)) / (2.0 * width))
}

/// Mean eye aspect ratio of both eyes.
pub fn mean_eye_aspect_ratio(observation: &Observation) -> Option<f32> {
    let left = eye_aspect_ratio(observation.left_eye()?)?;
    let right = eye_aspect_ratio(observation.right_eye()?)?;
    Some((left + right) / 2.0)
}

/// Nose-tip displacement between two consecutive observations.
pub fn nose_displacement(previous: Point, current: Point, horizontal_only: bool) -> f32 {
    if horizontal_only {
        (current.0 - previous.0).abs()
    } else {
        point_distance(previous, current)
    }
}
