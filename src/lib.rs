//! # shape-cascade
//!
//! Landmark alignment with a cascade of boosted regression trees.
//!
//! Given an image and a coarse initial estimate of a shape (a fixed set of 2D
//! landmarks, usually the mean shape placed in a detection rectangle), the
//! cascade refines the estimate stage by stage. Each stage reads pixel
//! intensities at locations tied to the current estimate, so the features
//! follow the shape's rotation, scale and translation.
//!
//! Implements the approach from "One Millisecond Face Alignment with an
//! Ensemble of Regression Trees" (Kazemi & Sullivan, 2014).
//!
//! ## Algorithm Overview
//!
//! 1. Normalize the ground-truth shapes into their rectangles' unit frame and
//!    average them into the mean shape
//! 2. Generate initial estimates per image (mean shape, other shapes, blends)
//! 3. For each cascade stage:
//!    - Sample pixel coordinates in mean-shape space, anchored to landmarks
//!    - Boost a forest of regression trees on pixel-difference split tests
//!    - Advance every estimate by the stage's prediction
//!
//! ## Quick Start
//!
//! ```rust
//! use shape_cascade::{
//!     BoundingBox, GrayImage, InputData, Point, SampleCreationParameters, Shape, Tracker,
//!     TrainingData, TrainingParameters,
//! };
//!
//! // A few bright squares on a dark background, labeled by their corners.
//! let mut input = InputData::default();
//! for i in 0..4 {
//!     let c = 14.0 + i as f32;
//!     input.images.push(GrayImage::from_fn(32, 32, |x, y| {
//!         if (x as f32 - c).abs() <= 6.0 && (y as f32 - c).abs() <= 6.0 { 200 } else { 30 }
//!     }));
//!     let shape = Shape::new(vec![
//!         Point::new(c - 6.0, c - 6.0),
//!         Point::new(c + 6.0, c - 6.0),
//!         Point::new(c + 6.0, c + 6.0),
//!         Point::new(c - 6.0, c + 6.0),
//!     ]);
//!     input.rects.push(BoundingBox::around(&shape).unwrap());
//!     input.shapes.push(shape);
//! }
//!
//! let params = TrainingParameters {
//!     num_cascades: 2,
//!     num_trees: 4,
//!     max_tree_depth: 2,
//!     num_random_pixel_coordinates: 20,
//!     num_random_split_tests_per_node: 5,
//!     ..Default::default()
//! };
//! let mut data = TrainingData::new(input, params);
//! data.create_training_samples(&SampleCreationParameters {
//!     shapes_per_image: 2,
//!     ..Default::default()
//! })?;
//!
//! let mut tracker = Tracker::new();
//! tracker.fit(&mut data)?;
//!
//! let rect = BoundingBox::new(10.0, 10.0, 12.0, 12.0);
//! let landmarks = tracker.predict_in_rect(&data.input.images[0], &rect)?;
//! assert_eq!(landmarks.num_landmarks(), 4);
//! # Ok::<(), shape_cascade::Error>(())
//! ```
//!
//! ## Custom Image Types
//!
//! Implement the [`ImageAccess`] trait for your own image types:
//!
//! ```rust
//! use shape_cascade::ImageAccess;
//!
//! struct MyImage { /* ... */ }
//!
//! impl ImageAccess for MyImage {
//!     fn get_pixel(&self, x: i32, y: i32) -> u8 {
//!         // Return grayscale intensity at (x, y)
//!         // Return 0 for out-of-bounds
//!         0
//!     }
//!     fn width(&self) -> u32 { 640 }
//!     fn height(&self) -> u32 { 480 }
//! }
//! ```

mod error;
pub mod evaluation;
mod features;
mod geometry;
mod image_access;
pub mod io;
mod regressor;
mod tracker;
mod training;
mod tree;
mod types;

pub use error::{Error, Result};
pub use features::{read_pixel_intensities, sample_coordinates, PixelCoordinates};
pub use geometry::{
    estimate_similarity_transform, find_closest_landmark_index, shape_relative_pixel_coordinates,
    SimilarityTransform,
};
pub use image_access::{GrayImage, ImageAccess};
pub use regressor::{Regressor, RegressorTraining};
pub use tracker::Tracker;
pub use training::{
    InputData, Sample, SampleCreationParameters, TrainingData, TrainingParameters,
};
pub use tree::{RegressionTree, SplitTest, TreeNode, TreeParameters, TreeSample, TreeTraining};
pub use types::{BoundingBox, Point, Shape, ShapeResidual};
