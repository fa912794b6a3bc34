//! Synthetic square scenes shared by the integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shape_cascade::{BoundingBox, GrayImage, InputData, Point, Shape, SimilarityTransform};

pub const SIZE: u32 = 64;
const HALF: f32 = 12.0;

/// Corners of a square centered at `center`, rotated by `angle`.
///
/// Landmark 0 is the corner carrying the bright patch.
pub fn square(center: Point, angle: f32) -> Shape {
    let pose = SimilarityTransform::from_parts(HALF, angle, center);
    Shape::new(vec![
        pose.apply(Point::new(-1.0, -1.0)),
        pose.apply(Point::new(1.0, -1.0)),
        pose.apply(Point::new(1.0, 1.0)),
        pose.apply(Point::new(-1.0, 1.0)),
    ])
}

/// Uniform square on a dark background with one bright corner.
pub fn render(center: Point, angle: f32) -> GrayImage {
    let (sin, cos) = angle.sin_cos();
    GrayImage::from_fn(SIZE, SIZE, |x, y| {
        let dx = x as f32 - center.x;
        let dy = y as f32 - center.y;
        // Back into the square's own frame.
        let u = (cos * dx + sin * dy) / HALF;
        let v = (-sin * dx + cos * dy) / HALF;
        if u.abs() > 1.0 || v.abs() > 1.0 {
            20
        } else if u < -0.5 && v < -0.5 {
            250
        } else {
            120
        }
    })
}

/// `count` random squares, labeled by their corners, with the ground-truth
/// bounding box as detection rectangle.
pub fn squares_dataset(count: usize, seed: u64) -> InputData {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = InputData::default();
    for _ in 0..count {
        let center = Point::new(
            32.0 + rng.random_range(-4.0..4.0),
            32.0 + rng.random_range(-4.0..4.0),
        );
        let angle = rng.random_range(-0.2..0.2);
        let shape = square(center, angle);
        data.rects.push(BoundingBox::around(&shape).expect("square has corners"));
        data.images.push(render(center, angle));
        data.shapes.push(shape);
    }
    data
}
