//! Landmark error measures.

use serde::Serialize;

use crate::types::{BoundingBox, Shape};

/// Mean Euclidean distance between corresponding landmarks.
///
/// Returns 0 for shapes without landmarks.
pub fn mean_point_error(a: &Shape, b: &Shape) -> f32 {
    debug_assert_eq!(a.num_landmarks(), b.num_landmarks());
    let n = a.num_landmarks().min(b.num_landmarks());
    if n == 0 {
        return 0.0;
    }
    let total: f32 = a
        .points
        .iter()
        .zip(&b.points)
        .map(|(p, q)| p.distance(q))
        .sum();
    total / n as f32
}

/// [`mean_point_error`] divided by the diagonal of `rect`.
pub fn normalized_point_error(a: &Shape, b: &Shape, rect: &BoundingBox) -> f32 {
    let diagonal = rect.diagonal();
    if diagonal <= 0.0 {
        return 0.0;
    }
    mean_point_error(a, b) / diagonal
}

/// Summary of a set of per-sample errors.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ErrorStats {
    pub count: usize,
    pub mean: f32,
    pub median: f32,
    pub max: f32,
}

impl ErrorStats {
    pub fn from_errors(errors: &[f32]) -> Self {
        if errors.is_empty() {
            return Self::default();
        }
        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
        };
        Self {
            count: n,
            mean: sorted.iter().sum::<f32>() / n as f32,
            median,
            max: sorted[n - 1],
        }
    }
}

impl std::fmt::Display for ErrorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} mean={:.5} median={:.5} max={:.5}",
            self.count, self.mean, self.median, self.max
        )
    }
}
