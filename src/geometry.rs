//! Similarity alignment between shapes and landmark lookups.
//!
//! The alignment is the closed-form least-squares (Procrustes / Umeyama)
//! solution restricted to uniform scale, rotation and translation. Reflections
//! are never returned: when the cross-covariance indicates a mirror image the
//! smaller singular direction is flipped so the rotation stays proper.

use nalgebra::{Matrix2, Vector2};

use crate::error::{Error, Result};
use crate::features::PixelCoordinates;
use crate::types::{Point, Shape};

/// A 2D transform restricted to uniform scale, rotation and translation.
///
/// `linear` holds `scale * rotation`; a point maps as `linear * p + translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub linear: Matrix2<f32>,
    pub translation: Vector2<f32>,
}

impl Default for SimilarityTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl SimilarityTransform {
    pub fn identity() -> Self {
        Self {
            linear: Matrix2::identity(),
            translation: Vector2::zeros(),
        }
    }

    /// Build from scale, counter-clockwise angle (radians) and translation.
    pub fn from_parts(scale: f32, angle: f32, translation: Point) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            linear: Matrix2::new(scale * cos, -scale * sin, scale * sin, scale * cos),
            translation: Vector2::new(translation.x, translation.y),
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        let v = self.linear * Vector2::new(p.x, p.y) + self.translation;
        Point::new(v.x, v.y)
    }

    /// Apply only the rotation and scale part, for offsets and directions.
    pub fn apply_linear(&self, p: Point) -> Point {
        let v = self.linear * Vector2::new(p.x, p.y);
        Point::new(v.x, v.y)
    }

    pub fn apply_shape(&self, shape: &Shape) -> Shape {
        Shape::new(shape.points.iter().map(|p| self.apply(*p)).collect())
    }

    /// `self ∘ other`: first `other`, then `self`.
    pub fn compose(&self, other: &SimilarityTransform) -> SimilarityTransform {
        Self {
            linear: self.linear * other.linear,
            translation: self.linear * other.translation + self.translation,
        }
    }

    /// Inverse transform, `None` when the scale is zero.
    pub fn inverse(&self) -> Option<SimilarityTransform> {
        let inv = self.linear.try_inverse()?;
        Some(Self {
            linear: inv,
            translation: -(inv * self.translation),
        })
    }

    pub fn determinant(&self) -> f32 {
        self.linear.determinant()
    }

    pub fn scale(&self) -> f32 {
        self.determinant().abs().sqrt()
    }

    /// Rotation angle in radians, in `(-pi, pi]`.
    pub fn rotation_angle(&self) -> f32 {
        self.linear[(1, 0)].atan2(self.linear[(0, 0)])
    }
}

fn centroid_of(points: &[Point]) -> Vector2<f32> {
    let sum = points
        .iter()
        .fold(Vector2::zeros(), |acc: Vector2<f32>, p| acc + Vector2::new(p.x, p.y));
    sum / points.len() as f32
}

/// Estimate the similarity transform that maps `from` onto `to` with minimal
/// mean squared point distance.
///
/// Both shapes must have the same number of landmarks. Degenerate inputs do
/// not fail: an empty shape yields the identity, a source without spread
/// (all landmarks coincide) yields unit scale, identity rotation and the
/// translation between the centroids.
pub fn estimate_similarity_transform(from: &Shape, to: &Shape) -> SimilarityTransform {
    debug_assert_eq!(from.num_landmarks(), to.num_landmarks());

    let n = from.num_landmarks().min(to.num_landmarks());
    if n == 0 {
        return SimilarityTransform::identity();
    }
    let from_points = &from.points[..n];
    let to_points = &to.points[..n];

    let mean_from = centroid_of(from_points);
    let mean_to = centroid_of(to_points);

    let mut cov = Matrix2::<f32>::zeros();
    let mut var_from = 0.0f32;
    for (p, q) in from_points.iter().zip(to_points) {
        let a = Vector2::new(p.x, p.y) - mean_from;
        let b = Vector2::new(q.x, q.y) - mean_to;
        cov += b * a.transpose();
        var_from += a.norm_squared();
    }
    cov /= n as f32;
    var_from /= n as f32;

    let translation_only = SimilarityTransform {
        linear: Matrix2::identity(),
        translation: mean_to - mean_from,
    };
    if var_from <= 0.0 {
        return translation_only;
    }

    let svd = cov.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return translation_only,
    };
    let d = svd.singular_values;

    // Flip the weaker direction when the best orthogonal fit is a reflection.
    let det_cov = cov.determinant();
    let det_uv = u.determinant() * v_t.determinant();
    let mut s = Vector2::new(1.0f32, 1.0);
    if det_cov < 0.0 || (det_cov == 0.0 && det_uv < 0.0) {
        if d[1] < d[0] {
            s[1] = -1.0;
        } else {
            s[0] = -1.0;
        }
    }

    let rotation = u * Matrix2::from_diagonal(&s) * v_t;
    let scale = d.component_mul(&s).sum() / var_from;

    SimilarityTransform {
        linear: rotation * scale,
        translation: mean_to - rotation * mean_from * scale,
    }
}

/// Index of the landmark nearest to `point` (squared Euclidean distance).
///
/// Ties resolve to the lowest index. Returns `None` for a shape without
/// landmarks.
pub fn find_closest_landmark_index(shape: &Shape, point: Point) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, p) in shape.points.iter().enumerate() {
        let d2 = p.distance_squared(&point);
        match best {
            Some((_, best_d2)) if d2 >= best_d2 => {}
            _ => best = Some((i, d2)),
        }
    }
    best.map(|(i, _)| i)
}

/// Express absolute coordinates relative to their nearest landmark of `shape`.
pub fn shape_relative_pixel_coordinates(
    shape: &Shape,
    absolute: &[Point],
) -> Result<PixelCoordinates> {
    let mut offsets = Vec::with_capacity(absolute.len());
    let mut anchors = Vec::with_capacity(absolute.len());

    for &coord in absolute {
        let idx = find_closest_landmark_index(shape, coord).ok_or_else(|| {
            Error::InvalidInput("cannot anchor pixel coordinates to an empty shape".into())
        })?;
        offsets.push(coord - shape[idx]);
        anchors.push(idx);
    }

    Ok(PixelCoordinates::new(offsets, anchors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn kite() -> Shape {
        Shape::new(vec![
            Point::new(0.0, 0.0),
            Point::new(4.0, 1.0),
            Point::new(5.0, 5.0),
            Point::new(1.0, 3.0),
            Point::new(2.0, -2.0),
        ])
    }

    #[test]
    fn self_alignment_is_identity() {
        let s = kite();
        let t = estimate_similarity_transform(&s, &s);
        assert_relative_eq!(t.linear, Matrix2::identity(), epsilon = 1e-5);
        assert_relative_eq!(t.translation, Vector2::zeros(), epsilon = 1e-4);
    }

    #[test]
    fn recovers_exact_similarity() {
        let truth = SimilarityTransform::from_parts(1.7, 0.6, Point::new(3.0, -2.0));
        let from = kite();
        let to = truth.apply_shape(&from);

        let t = estimate_similarity_transform(&from, &to);
        assert_relative_eq!(t.scale(), 1.7, epsilon = 1e-4);
        assert_relative_eq!(t.rotation_angle(), 0.6, epsilon = 1e-4);
        assert_relative_eq!(t.translation, truth.translation, epsilon = 1e-3);

        for (p, q) in t.apply_shape(&from).points.iter().zip(&to.points) {
            assert!(p.distance(q) < 1e-3);
        }
    }

    #[test]
    fn alignment_beats_perturbed_transforms() {
        let from = kite();
        let to = Shape::new(vec![
            Point::new(10.0, 10.0),
            Point::new(14.5, 11.0),
            Point::new(15.0, 16.0),
            Point::new(10.5, 13.0),
            Point::new(12.0, 8.5),
        ]);
        let best = estimate_similarity_transform(&from, &to);
        let err = |t: &SimilarityTransform| t.apply_shape(&from).difference(&to).squared_norm();
        let best_err = err(&best);

        let nudges = [
            SimilarityTransform::from_parts(1.01, 0.0, Point::zero()),
            SimilarityTransform::from_parts(1.0, 0.01, Point::zero()),
            SimilarityTransform::from_parts(1.0, 0.0, Point::new(0.05, -0.05)),
        ];
        for nudge in &nudges {
            assert!(best_err <= err(&nudge.compose(&best)) + 1e-4);
        }
    }

    #[test]
    fn mirrored_shape_yields_proper_rotation() {
        let from = kite();
        let to = Shape::new(from.points.iter().map(|p| Point::new(-p.x, p.y)).collect());

        let t = estimate_similarity_transform(&from, &to);
        assert!(t.determinant() > 0.0);
        let rotation = t.linear / t.scale();
        assert_relative_eq!(rotation.determinant(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn zero_variance_source_falls_back_to_translation() {
        let from = Shape::new(vec![Point::new(2.0, 2.0); 3]);
        let to = kite_prefix(3);
        let t = estimate_similarity_transform(&from, &to);

        assert_eq!(t.linear, Matrix2::identity());
        let c = to.centroid().unwrap();
        assert_relative_eq!(t.translation.x, c.x - 2.0, epsilon = 1e-5);
        assert_relative_eq!(t.translation.y, c.y - 2.0, epsilon = 1e-5);
    }

    fn kite_prefix(n: usize) -> Shape {
        Shape::new(kite().points[..n].to_vec())
    }

    #[test]
    fn empty_shapes_align_to_identity() {
        let t = estimate_similarity_transform(&Shape::zeros(0), &Shape::zeros(0));
        assert_eq!(t, SimilarityTransform::identity());
    }

    #[test]
    fn inverse_undoes_transform() {
        let t = SimilarityTransform::from_parts(2.5, -1.1, Point::new(7.0, 1.0));
        let inv = t.inverse().unwrap();
        let p = Point::new(3.0, -4.0);
        let back = inv.apply(t.apply(p));
        assert!(back.distance(&p) < 1e-4);

        let degenerate = SimilarityTransform::from_parts(0.0, 0.0, Point::zero());
        assert!(degenerate.inverse().is_none());
    }

    #[test]
    fn closest_landmark_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let n = rng.random_range(1..20);
            let shape = Shape::new(
                (0..n)
                    .map(|_| Point::new(rng.random_range(-10.0..10.0), rng.random_range(-10.0..10.0)))
                    .collect(),
            );
            let query = Point::new(rng.random_range(-12.0..12.0), rng.random_range(-12.0..12.0));

            let idx = find_closest_landmark_index(&shape, query).unwrap();
            assert!(idx < n);
            let best = shape.points[idx].distance_squared(&query);
            for p in &shape.points {
                assert!(best <= p.distance_squared(&query));
            }
        }
    }

    #[test]
    fn closest_landmark_prefers_lowest_index_on_ties() {
        let shape = Shape::new(vec![Point::new(-1.0, 0.0), Point::new(1.0, 0.0)]);
        assert_eq!(find_closest_landmark_index(&shape, Point::zero()), Some(0));
        assert_eq!(find_closest_landmark_index(&Shape::zeros(0), Point::zero()), None);
    }

    #[test]
    fn relative_coordinates_reference_nearest_landmark() {
        let shape = Shape::new(vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)]);
        let abs = [Point::new(1.0, 1.0), Point::new(8.0, -1.0)];
        let coords = shape_relative_pixel_coordinates(&shape, &abs).unwrap();

        assert_eq!(coords.anchors(), &[0, 1]);
        assert_eq!(coords.offsets()[0], Point::new(1.0, 1.0));
        assert_eq!(coords.offsets()[1], Point::new(-2.0, -1.0));

        assert!(shape_relative_pixel_coordinates(&Shape::zeros(0), &abs).is_err());
    }
}
