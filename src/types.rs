use serde::{Deserialize, Serialize};

use crate::geometry::SimilarityTransform;

/// A 2D point with floating-point coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub const fn zero() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        self.distance_squared(other).sqrt()
    }

    pub fn distance_squared(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

impl std::ops::Add for Point {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }
}

impl std::ops::AddAssign for Point {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl std::ops::Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

impl std::ops::SubAssign for Point {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl std::ops::Mul<f32> for Point {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self::Output {
        Self {
            x: self.x * rhs,
            y: self.y * rhs,
        }
    }
}

/// An axis-aligned detection rectangle: top-left corner, width and height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Tight bounding box of a shape. `None` for a shape without landmarks.
    pub fn around(shape: &Shape) -> Option<Self> {
        let (min, max) = shape.extent()?;
        Some(Self::new(min.x, min.y, max.x - min.x, max.y - min.y))
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn diagonal(&self) -> f32 {
        (self.width * self.width + self.height * self.height).sqrt()
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    /// Similarity transform taking the unit square `[0,1]x[0,1]` onto this
    /// rectangle in the least-squares sense.
    ///
    /// For square rectangles the mapping is exact. Otherwise the uniform scale
    /// is the mean of width and height, keeping the centers aligned.
    pub fn to_image_transform(&self) -> SimilarityTransform {
        let scale = 0.5 * (self.width + self.height);
        let center = self.center();
        SimilarityTransform::from_parts(
            scale,
            0.0,
            Point::new(center.x - 0.5 * scale, center.y - 0.5 * scale),
        )
    }
}

/// A shape represented as an ordered collection of landmark points.
///
/// The same type carries shape residuals (per-landmark corrections).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub points: Vec<Point>,
}

/// A per-landmark correction to be added onto a [`Shape`].
pub type ShapeResidual = Shape;

impl Shape {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn num_landmarks(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Create a zeroed shape with n landmarks.
    pub fn zeros(n: usize) -> Self {
        Self {
            points: vec![Point::zero(); n],
        }
    }

    /// Add another shape's deltas to this shape.
    pub fn add_delta(&mut self, delta: &Shape) {
        debug_assert_eq!(self.points.len(), delta.points.len());
        for (p, d) in self.points.iter_mut().zip(delta.points.iter()) {
            *p += *d;
        }
    }

    /// Add `factor * delta` to this shape.
    pub fn add_scaled(&mut self, delta: &Shape, factor: f32) {
        debug_assert_eq!(self.points.len(), delta.points.len());
        for (p, d) in self.points.iter_mut().zip(delta.points.iter()) {
            *p += *d * factor;
        }
    }

    /// Subtract another shape's deltas from this shape.
    pub fn sub_delta(&mut self, delta: &Shape) {
        debug_assert_eq!(self.points.len(), delta.points.len());
        for (p, d) in self.points.iter_mut().zip(delta.points.iter()) {
            *p -= *d;
        }
    }

    /// `self - other`, landmark by landmark.
    pub fn difference(&self, other: &Shape) -> Shape {
        debug_assert_eq!(self.points.len(), other.points.len());
        Shape::new(
            self.points
                .iter()
                .zip(other.points.iter())
                .map(|(a, b)| *a - *b)
                .collect(),
        )
    }

    pub fn scale(&mut self, factor: f32) {
        for p in &mut self.points {
            *p = *p * factor;
        }
    }

    /// Sum of squared coordinates.
    pub fn squared_norm(&self) -> f32 {
        self.points.iter().map(|p| p.x * p.x + p.y * p.y).sum()
    }

    /// Mean landmark position. `None` for an empty shape.
    pub fn centroid(&self) -> Option<Point> {
        if self.points.is_empty() {
            return None;
        }
        let n = self.points.len() as f32;
        let sum = self
            .points
            .iter()
            .fold(Point::zero(), |acc, p| acc + *p);
        Some(sum * (1.0 / n))
    }

    /// Componentwise minimum and maximum corner. `None` for an empty shape.
    pub fn extent(&self) -> Option<(Point, Point)> {
        let first = *self.points.first()?;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (
                Point::new(lo.x.min(p.x), lo.y.min(p.y)),
                Point::new(hi.x.max(p.x), hi.y.max(p.y)),
            )
        }))
    }

    /// Create shape from a flat vector of [x0, y0, x1, y1, ...] coordinates.
    pub fn from_flat_vec(v: &[f32]) -> Self {
        debug_assert!(v.len() % 2 == 0);
        let points: Vec<Point> = v
            .chunks_exact(2)
            .map(|chunk| Point::new(chunk[0], chunk[1]))
            .collect();
        Self { points }
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = Point;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.points[idx]
    }
}
