//! Shape-indexed pixel features.
//!
//! Each cascade stage draws a fixed set of pixel locations inside the mean
//! shape's bounding box and ties every location to its nearest landmark.
//! At evaluation time the offsets are carried along with the current shape
//! estimate, so the sampled intensities follow the shape's pose.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::geometry::SimilarityTransform;
use crate::image_access::ImageAccess;
use crate::types::{Point, Shape};

/// Pixel locations frozen for one cascade stage.
///
/// `offsets[i]` is expressed in mean-shape space, relative to landmark
/// `anchors[i]` of the mean shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelCoordinates {
    offsets: Vec<Point>,
    anchors: Vec<usize>,
}

impl PixelCoordinates {
    pub fn new(offsets: Vec<Point>, anchors: Vec<usize>) -> Self {
        debug_assert_eq!(offsets.len(), anchors.len());
        Self { offsets, anchors }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> &[Point] {
        &self.offsets
    }

    pub fn anchors(&self) -> &[usize] {
        &self.anchors
    }

    /// Absolute image-space locations for a shape estimate.
    ///
    /// `transform` maps the mean-shape frame onto the estimate's frame; only
    /// its rotation and scale are applied to the offsets.
    pub fn locate(&self, transform: &SimilarityTransform, estimate: &Shape) -> Vec<Point> {
        self.offsets
            .iter()
            .zip(&self.anchors)
            .map(|(offset, &anchor)| estimate[anchor] + transform.apply_linear(*offset))
            .collect()
    }
}

/// Draw `count` points uniformly inside the axis-aligned bounding box of
/// `mean_shape`, each axis independently.
///
/// A shape without landmarks yields no points.
pub fn sample_coordinates<R: Rng + ?Sized>(
    mean_shape: &Shape,
    count: usize,
    rng: &mut R,
) -> Vec<Point> {
    let Some((min, max)) = mean_shape.extent() else {
        return Vec::new();
    };
    let span = max - min;

    (0..count)
        .map(|_| {
            Point::new(
                min.x + rng.random::<f32>() * span.x,
                min.y + rng.random::<f32>() * span.y,
            )
        })
        .collect()
}

/// Sample the image at every stage coordinate placed on the current estimate.
pub fn read_pixel_intensities<I: ImageAccess + ?Sized>(
    coords: &PixelCoordinates,
    transform: &SimilarityTransform,
    estimate: &Shape,
    image: &I,
) -> Vec<f32> {
    coords
        .locate(transform, estimate)
        .into_iter()
        .map(|p| image.sample(p))
        .collect()
}
