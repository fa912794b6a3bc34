//! One stage of the cascade: a boosted forest over a shared set of
//! shape-indexed pixel features.

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::features::{read_pixel_intensities, sample_coordinates, PixelCoordinates};
use crate::geometry::{estimate_similarity_transform, shape_relative_pixel_coordinates};
use crate::image_access::ImageAccess;
use crate::training::{check_samples, Sample, TrainingParameters};
use crate::tree::{RegressionTree, TreeParameters, TreeSample, TreeTraining};
use crate::types::{Shape, ShapeResidual};

/// Inputs for training one cascade stage.
///
/// `samples[k].input_idx` indexes both `images` and `shapes`; the sample
/// estimates are the running estimates after all previous stages.
pub struct RegressorTraining<'a, I> {
    pub images: &'a [I],
    pub shapes: &'a [Shape],
    pub samples: &'a [Sample],
    pub mean_shape: &'a Shape,
    pub params: &'a TrainingParameters,
}

/// A cascade stage.
///
/// Predicts `mean_residual + learning_rate * sum(tree predictions)`. The mean
/// residual acts as the stage's bias term and is applied without shrinkage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regressor {
    pixel_coordinates: PixelCoordinates,
    mean_residual: ShapeResidual,
    mean_shape: Shape,
    trees: Vec<RegressionTree>,
    learning_rate: f32,
}

impl Regressor {
    pub fn new(
        pixel_coordinates: PixelCoordinates,
        mean_residual: ShapeResidual,
        mean_shape: Shape,
        trees: Vec<RegressionTree>,
        learning_rate: f32,
    ) -> Self {
        Self {
            pixel_coordinates,
            mean_residual,
            mean_shape,
            trees,
            learning_rate,
        }
    }

    /// Train a stage against the residuals left by the current estimates.
    pub fn fit<I: ImageAccess, R: Rng + ?Sized>(
        training: &RegressorTraining<'_, I>,
        rng: &mut R,
    ) -> Result<Self> {
        training.params.validate()?;
        validate_training(training)?;

        let params = training.params;
        let mean_shape = training.mean_shape;
        let num_landmarks = mean_shape.num_landmarks();

        let positions = sample_coordinates(mean_shape, params.num_random_pixel_coordinates, rng);
        let pixel_coordinates = shape_relative_pixel_coordinates(mean_shape, &positions)?;

        let mut work: Vec<TreeSample> = training
            .samples
            .iter()
            .map(|sample| {
                let image = &training.images[sample.input_idx];
                let transform = estimate_similarity_transform(mean_shape, &sample.estimate);
                TreeSample {
                    intensities: read_pixel_intensities(
                        &pixel_coordinates,
                        &transform,
                        &sample.estimate,
                        image,
                    ),
                    residual: training.shapes[sample.input_idx].difference(&sample.estimate),
                }
            })
            .collect();

        let mut mean_residual = Shape::zeros(num_landmarks);
        for s in &work {
            mean_residual.add_delta(&s.residual);
        }
        mean_residual.scale(1.0 / work.len() as f32);

        let tree_params = TreeParameters {
            max_depth: params.max_tree_depth,
            num_split_tests: params.num_random_split_tests_per_node,
            exponential_lambda: params.exponential_lambda,
        };

        let mut trees: Vec<RegressionTree> = Vec::with_capacity(params.num_trees);
        for k in 0..params.num_trees {
            // Each tree fits what the bias term and the previous trees left over.
            for s in work.iter_mut() {
                match trees.last() {
                    None => s.residual.sub_delta(&mean_residual),
                    Some(prev) => s.residual.add_scaled(prev.predict(&s.intensities), -params.learning_rate),
                }
            }

            let tree = RegressionTree::fit(
                &TreeTraining {
                    samples: &work,
                    pixel_positions: &positions,
                    num_landmarks,
                    params: tree_params,
                },
                rng,
            );
            debug!(
                "tree {:3}: {} leaves, mean squared residual {:.5}",
                k,
                tree.num_leaves(),
                mean_squared_residual(&work)
            );
            trees.push(tree);
        }

        Ok(Self {
            pixel_coordinates,
            mean_residual,
            mean_shape: mean_shape.clone(),
            trees,
            learning_rate: params.learning_rate,
        })
    }

    /// Predict the correction for `shape`, observed in `image`.
    pub fn predict<I: ImageAccess + ?Sized>(&self, image: &I, shape: &Shape) -> ShapeResidual {
        debug_assert_eq!(shape.num_landmarks(), self.mean_shape.num_landmarks());

        let transform = estimate_similarity_transform(&self.mean_shape, shape);
        let intensities = read_pixel_intensities(&self.pixel_coordinates, &transform, shape, image);

        let mut residual = self.mean_residual.clone();
        for tree in &self.trees {
            residual.add_scaled(tree.predict(&intensities), self.learning_rate);
        }
        residual
    }

    pub fn pixel_coordinates(&self) -> &PixelCoordinates {
        &self.pixel_coordinates
    }

    pub fn mean_residual(&self) -> &ShapeResidual {
        &self.mean_residual
    }

    pub fn mean_shape(&self) -> &Shape {
        &self.mean_shape
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Check internal sizes against the tracker's landmark count.
    pub(crate) fn check(&self, num_landmarks: usize) -> std::result::Result<(), String> {
        if self.mean_shape.num_landmarks() != num_landmarks {
            return Err(format!(
                "mean shape has {} landmarks, expected {}",
                self.mean_shape.num_landmarks(),
                num_landmarks
            ));
        }
        if self.mean_residual.num_landmarks() != num_landmarks {
            return Err(format!(
                "mean residual has {} landmarks, expected {}",
                self.mean_residual.num_landmarks(),
                num_landmarks
            ));
        }
        if self.pixel_coordinates.offsets().len() != self.pixel_coordinates.anchors().len() {
            return Err("pixel offsets and anchors differ in length".into());
        }
        if let Some(a) = self
            .pixel_coordinates
            .anchors()
            .iter()
            .find(|&&a| a >= num_landmarks)
        {
            return Err(format!("anchor landmark {} out of range", a));
        }
        if !self.learning_rate.is_finite() {
            return Err("learning rate is not finite".into());
        }
        for (k, tree) in self.trees.iter().enumerate() {
            tree.check(num_landmarks, self.pixel_coordinates.len())
                .map_err(|msg| format!("tree {}: {}", k, msg))?;
        }
        Ok(())
    }
}

fn validate_training<I>(training: &RegressorTraining<'_, I>) -> Result<()> {
    let num_landmarks = training.mean_shape.num_landmarks();
    if num_landmarks == 0 {
        return Err(Error::InvalidInput("mean shape has no landmarks".into()));
    }
    if training.samples.is_empty() {
        return Err(Error::InvalidInput("cannot fit a regressor on zero samples".into()));
    }

    check_samples(
        training.samples,
        training.images.len().min(training.shapes.len()),
        training.shapes,
        num_landmarks,
    )
}

fn mean_squared_residual(samples: &[TreeSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.residual.squared_norm()).sum::<f32>() / samples.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SimilarityTransform;
    use crate::image_access::GrayImage;
    use crate::types::Point;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn square(center: Point, half: f32) -> Shape {
        Shape::new(vec![
            Point::new(center.x - half, center.y - half),
            Point::new(center.x + half, center.y - half),
            Point::new(center.x + half, center.y + half),
            Point::new(center.x - half, center.y + half),
        ])
    }

    /// Bright square on a dark background, centered at (cx, 20).
    fn scene(cx: f32) -> GrayImage {
        GrayImage::from_fn(40, 40, |x, y| {
            let inside = (x as f32 - cx).abs() <= 8.0 && (y as f32 - 20.0).abs() <= 8.0;
            if inside {
                200
            } else {
                30
            }
        })
    }

    struct Fixture {
        images: Vec<GrayImage>,
        shapes: Vec<Shape>,
        samples: Vec<Sample>,
        mean_shape: Shape,
    }

    fn fixture(rng: &mut StdRng) -> Fixture {
        let mut images = Vec::new();
        let mut shapes = Vec::new();
        let mut samples = Vec::new();
        for i in 0..12 {
            let cx = 16.0 + i as f32 * 0.75;
            images.push(scene(cx));
            shapes.push(square(Point::new(cx, 20.0), 8.0));
            for _ in 0..6 {
                let shift = rng.random_range(-3.0..3.0);
                samples.push(Sample {
                    input_idx: i,
                    estimate: square(Point::new(cx + shift, 20.0), 8.0),
                    shape_to_image: SimilarityTransform::identity(),
                });
            }
        }
        Fixture {
            images,
            shapes,
            samples,
            mean_shape: square(Point::new(0.5, 0.5), 0.5),
        }
    }

    fn params() -> TrainingParameters {
        TrainingParameters {
            num_cascades: 1,
            num_trees: 8,
            max_tree_depth: 3,
            num_random_pixel_coordinates: 60,
            num_random_split_tests_per_node: 20,
            exponential_lambda: 0.1,
            learning_rate: 0.3,
            seed: 0,
        }
    }

    fn training_error(f: &Fixture, residual_of: impl Fn(&Sample) -> Shape) -> f32 {
        f.samples
            .iter()
            .map(|s| {
                let mut estimate = s.estimate.clone();
                estimate.add_delta(&residual_of(s));
                f.shapes[s.input_idx].difference(&estimate).squared_norm()
            })
            .sum::<f32>()
            / f.samples.len() as f32
    }

    #[test]
    fn fit_stores_configuration_and_reduces_training_error() {
        let mut rng = StdRng::seed_from_u64(21);
        let f = fixture(&mut rng);
        let params = params();
        let training = RegressorTraining {
            images: &f.images,
            shapes: &f.shapes,
            samples: &f.samples,
            mean_shape: &f.mean_shape,
            params: &params,
        };
        let regressor = Regressor::fit(&training, &mut rng).unwrap();

        assert_eq!(regressor.trees().len(), 8);
        assert_eq!(regressor.pixel_coordinates().len(), 60);
        assert_eq!(regressor.learning_rate(), 0.3);
        assert_eq!(regressor.mean_shape(), &f.mean_shape);
        assert!(regressor.check(4).is_ok());

        let before = training_error(&f, |_| Shape::zeros(4));
        let after = training_error(&f, |s| regressor.predict(&f.images[s.input_idx], &s.estimate));
        assert!(after < before, "before {before}, after {after}");
    }

    #[test]
    fn boosting_never_increases_training_error() {
        let mut rng = StdRng::seed_from_u64(8);
        let f = fixture(&mut rng);
        let params = params();
        let training = RegressorTraining {
            images: &f.images,
            shapes: &f.shapes,
            samples: &f.samples,
            mean_shape: &f.mean_shape,
            params: &params,
        };
        let regressor = Regressor::fit(&training, &mut rng).unwrap();

        // Rebuild the stage tree by tree and watch the training error.
        let mut previous = training_error(&f, |_| regressor.mean_residual().clone());
        for k in 1..=regressor.trees().len() {
            let partial = Regressor::new(
                regressor.pixel_coordinates().clone(),
                regressor.mean_residual().clone(),
                regressor.mean_shape().clone(),
                regressor.trees()[..k].to_vec(),
                regressor.learning_rate(),
            );
            let err = training_error(&f, |s| partial.predict(&f.images[s.input_idx], &s.estimate));
            assert!(err <= previous + 1e-3, "tree {k}: {err} > {previous}");
            previous = err;
        }
    }

    #[test]
    fn mean_residual_is_average_target() {
        let mut rng = StdRng::seed_from_u64(4);
        let f = fixture(&mut rng);
        let params = params();
        let training = RegressorTraining {
            images: &f.images,
            shapes: &f.shapes,
            samples: &f.samples,
            mean_shape: &f.mean_shape,
            params: &params,
        };
        let regressor = Regressor::fit(&training, &mut rng).unwrap();

        let mut expected = Shape::zeros(4);
        for s in &f.samples {
            expected.add_delta(&f.shapes[s.input_idx].difference(&s.estimate));
        }
        expected.scale(1.0 / f.samples.len() as f32);
        assert!(regressor.mean_residual().difference(&expected).squared_norm() < 1e-8);
    }

    #[test]
    fn rejects_empty_and_mismatched_samples() {
        let mut rng = StdRng::seed_from_u64(0);
        let f = fixture(&mut rng);
        let params = params();

        let empty = RegressorTraining {
            images: &f.images,
            shapes: &f.shapes,
            samples: &[],
            mean_shape: &f.mean_shape,
            params: &params,
        };
        assert!(matches!(Regressor::fit(&empty, &mut rng), Err(Error::InvalidInput(_))));

        let bad = vec![Sample {
            input_idx: 0,
            estimate: Shape::zeros(3),
            shape_to_image: SimilarityTransform::identity(),
        }];
        let mismatched = RegressorTraining {
            samples: &bad,
            ..empty
        };
        assert!(matches!(Regressor::fit(&mismatched, &mut rng), Err(Error::InvalidInput(_))));

        let missing = vec![Sample {
            input_idx: 99,
            estimate: Shape::zeros(4),
            shape_to_image: SimilarityTransform::identity(),
        }];
        let out_of_range = RegressorTraining {
            samples: &missing,
            ..mismatched
        };
        assert!(matches!(Regressor::fit(&out_of_range, &mut rng), Err(Error::InvalidInput(_))));
    }
}
