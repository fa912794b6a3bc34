//! Training configuration and assembly of the per-sample working set.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::SimilarityTransform;
use crate::image_access::GrayImage;
use crate::types::{BoundingBox, Point, Shape};

/// Hyperparameters of cascade training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParameters {
    /// Number of regressors in the cascade.
    pub num_cascades: usize,
    /// Number of trees per regressor.
    pub num_trees: usize,
    /// Maximum number of split levels per tree.
    pub max_tree_depth: usize,
    /// Number of pixel coordinates drawn per regressor.
    pub num_random_pixel_coordinates: usize,
    /// Number of candidate split tests scored at each tree node.
    pub num_random_split_tests_per_node: usize,
    /// Prior favouring pixel pairs that are close in mean-shape space.
    ///
    /// A pair at distance `d` is kept with probability `exp(-lambda * d)`,
    /// where `d` is measured in the detection rectangle's unit frame and so
    /// rarely exceeds 1.4. At the default of 0.1 every pair is kept with
    /// probability above 0.87 and the selection is close to uniform; values
    /// around 5 to 10 make the prior prefer neighbouring pixels.
    pub exponential_lambda: f32,
    /// Shrinkage applied to every tree's contribution.
    pub learning_rate: f32,
    /// Seed of the training random source.
    pub seed: u64,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            num_cascades: 10,
            num_trees: 500,
            max_tree_depth: 5,
            num_random_pixel_coordinates: 400,
            num_random_split_tests_per_node: 20,
            exponential_lambda: 0.1,
            learning_rate: 0.08,
            seed: 0,
        }
    }
}

impl TrainingParameters {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_cascades", self.num_cascades),
            ("num_trees", self.num_trees),
            (
                "num_random_pixel_coordinates",
                self.num_random_pixel_coordinates,
            ),
            (
                "num_random_split_tests_per_node",
                self.num_random_split_tests_per_node,
            ),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidInput(format!("{} must be positive", name)));
        }
        if !(self.exponential_lambda.is_finite() && self.exponential_lambda > 0.0) {
            return Err(Error::InvalidInput(format!(
                "exponential_lambda must be positive, got {}",
                self.exponential_lambda
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "learning_rate must be in (0, 1], got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Controls how initial estimates are generated from the labeled data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleCreationParameters {
    /// Initial estimates generated per image.
    pub shapes_per_image: usize,
    /// Randomly perturbed copies added per initial estimate.
    pub transform_perturbations_per_shape: usize,
    /// Blend several ground-truth shapes instead of copying a single one.
    pub use_linear_combinations_of_shapes: bool,
    /// Largest perturbation rotation, in radians.
    pub max_rotation: f32,
    /// Largest relative scale change of a perturbation.
    pub max_scale_change: f32,
    /// Largest perturbation shift, relative to the detection rectangle size.
    pub max_translation: f32,
}

impl Default for SampleCreationParameters {
    fn default() -> Self {
        Self {
            shapes_per_image: 20,
            transform_perturbations_per_shape: 0,
            use_linear_combinations_of_shapes: true,
            max_rotation: 10f32.to_radians(),
            max_scale_change: 0.1,
            max_translation: 0.1,
        }
    }
}

impl SampleCreationParameters {
    pub fn validate(&self) -> Result<()> {
        if self.shapes_per_image == 0 {
            return Err(Error::InvalidInput(
                "shapes_per_image must be positive".into(),
            ));
        }
        let ranges = [
            ("max_rotation", self.max_rotation),
            ("max_scale_change", self.max_scale_change),
            ("max_translation", self.max_translation),
        ];
        if let Some((name, v)) = ranges.iter().find(|(_, v)| !(v.is_finite() && *v >= 0.0)) {
            return Err(Error::InvalidInput(format!(
                "{} must be finite and non-negative, got {}",
                name, v
            )));
        }
        if self.max_scale_change >= 1.0 {
            return Err(Error::InvalidInput(
                "max_scale_change must be below 1".into(),
            ));
        }
        Ok(())
    }
}

/// Labeled dataset: images with ground-truth shapes and detection rectangles.
#[derive(Debug, Clone, Default)]
pub struct InputData {
    pub images: Vec<GrayImage>,
    pub shapes: Vec<Shape>,
    pub rects: Vec<BoundingBox>,
}

impl InputData {
    pub fn new(images: Vec<GrayImage>, shapes: Vec<Shape>, rects: Vec<BoundingBox>) -> Self {
        Self {
            images,
            shapes,
            rects,
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn num_landmarks(&self) -> Option<usize> {
        self.shapes.first().map(Shape::num_landmarks)
    }

    /// Reject empty or inconsistent datasets.
    pub fn validate(&self) -> Result<()> {
        if self.images.is_empty() {
            return Err(Error::InvalidInput("dataset has no images".into()));
        }
        if self.shapes.len() != self.images.len() || self.rects.len() != self.images.len() {
            return Err(Error::InvalidInput(format!(
                "dataset has {} images, {} shapes and {} rectangles",
                self.images.len(),
                self.shapes.len(),
                self.rects.len()
            )));
        }
        let num_landmarks = self.shapes[0].num_landmarks();
        if num_landmarks == 0 {
            return Err(Error::InvalidInput("shapes have no landmarks".into()));
        }
        if let Some(i) = self
            .shapes
            .iter()
            .position(|s| s.num_landmarks() != num_landmarks)
        {
            return Err(Error::InvalidInput(format!(
                "shape {} has {} landmarks, expected {}",
                i,
                self.shapes[i].num_landmarks(),
                num_landmarks
            )));
        }
        if let Some(i) = self
            .rects
            .iter()
            .position(|r| !(r.width > 0.0 && r.height > 0.0))
        {
            return Err(Error::InvalidInput(format!(
                "rectangle {} has non-positive size",
                i
            )));
        }
        Ok(())
    }

    /// Ground-truth shapes expressed in the unit frame of their rectangles.
    ///
    /// This removes the dataset's scale and translation variance.
    pub fn normalized_shapes(&self) -> Result<Vec<Shape>> {
        self.validate()?;
        self.shapes
            .iter()
            .zip(&self.rects)
            .map(|(shape, rect)| {
                let to_unit = rect.to_image_transform().inverse().ok_or_else(|| {
                    Error::InvalidInput("degenerate detection rectangle".into())
                })?;
                Ok(to_unit.apply_shape(shape))
            })
            .collect()
    }

    /// Average of the normalized ground-truth shapes.
    pub fn mean_shape(&self) -> Result<Shape> {
        let normalized = self.normalized_shapes()?;
        Ok(average_shape(&normalized))
    }

    /// Move a random `fraction` of the entries into a new dataset.
    ///
    /// At least one entry always stays behind.
    pub fn random_partition<R: Rng + ?Sized>(&mut self, fraction: f32, rng: &mut R) -> InputData {
        let n = self.len();
        let count = ((fraction.clamp(0.0, 1.0) * n as f32).round() as usize).min(n.saturating_sub(1));

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let mut taken = vec![false; n];
        for &i in &order[..count] {
            taken[i] = true;
        }

        let mut kept = InputData::default();
        let mut split = InputData::default();
        let images = std::mem::take(&mut self.images);
        let shapes = std::mem::take(&mut self.shapes);
        let rects = std::mem::take(&mut self.rects);
        for (i, ((image, shape), rect)) in images.into_iter().zip(shapes).zip(rects).enumerate() {
            let target = if taken[i] { &mut split } else { &mut kept };
            target.images.push(image);
            target.shapes.push(shape);
            target.rects.push(rect);
        }
        *self = kept;
        split
    }
}

fn average_shape(shapes: &[Shape]) -> Shape {
    let Some(first) = shapes.first() else {
        return Shape::zeros(0);
    };
    let mut mean = Shape::zeros(first.num_landmarks());
    for s in shapes {
        mean.add_delta(s);
    }
    mean.scale(1.0 / shapes.len() as f32);
    mean
}

/// One training example: an initial estimate for one labeled image.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Index into the dataset's images and shapes.
    pub input_idx: usize,
    /// Current shape estimate in image space.
    pub estimate: Shape,
    /// Maps the detection rectangle's unit frame to image space.
    pub shape_to_image: SimilarityTransform,
}

/// Dataset plus the generated samples and the random source that drives training.
pub struct TrainingData {
    pub input: InputData,
    pub params: TrainingParameters,
    pub samples: Vec<Sample>,
    pub rng: StdRng,
}

impl TrainingData {
    /// Wrap a dataset; the random source is seeded from `params.seed`.
    pub fn new(input: InputData, params: TrainingParameters) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            input,
            params,
            samples: Vec::new(),
            rng,
        }
    }

    /// Replace `samples` with freshly generated initial estimates.
    ///
    /// Every image receives `shapes_per_image` base estimates in its
    /// rectangle's unit frame: the mean shape first, then other ground-truth
    /// shapes (or convex blends of them). Each is mapped to image space and
    /// followed by `transform_perturbations_per_shape` perturbed copies.
    pub fn create_training_samples(&mut self, create: &SampleCreationParameters) -> Result<()> {
        create.validate()?;
        let normalized = self.input.normalized_shapes()?;
        let mean = average_shape(&normalized);
        let n = normalized.len();
        let rng = &mut self.rng;

        let mut samples = Vec::with_capacity(
            n * create.shapes_per_image * (1 + create.transform_perturbations_per_shape),
        );
        for (i, rect) in self.input.rects.iter().enumerate() {
            let shape_to_image = rect.to_image_transform();
            for j in 0..create.shapes_per_image {
                let base = if j == 0 || n < 2 {
                    mean.clone()
                } else if create.use_linear_combinations_of_shapes {
                    blend_other_shapes(&normalized, i, rng)
                } else {
                    normalized[pick_other(i, n, rng)].clone()
                };
                push_with_perturbations(&mut samples, i, shape_to_image, &base, create, rng);
            }
        }

        self.samples = samples;
        Ok(())
    }

    /// Replace `samples` with estimates for measuring a trained cascade.
    ///
    /// Every image receives `shapes_per_image` copies of `mean_shape` (a unit
    /// frame shape, usually the tracker's) placed in its rectangle, each
    /// followed by `transform_perturbations_per_shape` perturbed copies.
    pub fn create_validation_samples(
        &mut self,
        mean_shape: &Shape,
        create: &SampleCreationParameters,
    ) -> Result<()> {
        create.validate()?;
        self.input.validate()?;
        if Some(mean_shape.num_landmarks()) != self.input.num_landmarks() {
            return Err(Error::InvalidInput(format!(
                "mean shape has {} landmarks, dataset shapes have {}",
                mean_shape.num_landmarks(),
                self.input.num_landmarks().unwrap_or(0)
            )));
        }

        let rng = &mut self.rng;
        let mut samples = Vec::new();
        for (i, rect) in self.input.rects.iter().enumerate() {
            let shape_to_image = rect.to_image_transform();
            for _ in 0..create.shapes_per_image {
                push_with_perturbations(&mut samples, i, shape_to_image, mean_shape, create, rng);
            }
        }

        self.samples = samples;
        Ok(())
    }
}

/// Map `base` into image space and append it plus its perturbed copies.
fn push_with_perturbations<R: Rng + ?Sized>(
    samples: &mut Vec<Sample>,
    input_idx: usize,
    shape_to_image: SimilarityTransform,
    base: &Shape,
    create: &SampleCreationParameters,
    rng: &mut R,
) {
    let estimate = shape_to_image.apply_shape(base);
    let perturbed: Vec<Shape> = (0..create.transform_perturbations_per_shape)
        .map(|_| perturb(&estimate, shape_to_image.scale(), create, rng))
        .collect();

    samples.push(Sample {
        input_idx,
        estimate,
        shape_to_image,
    });
    samples.extend(perturbed.into_iter().map(|estimate| Sample {
        input_idx,
        estimate,
        shape_to_image,
    }));
}

/// Reject samples that reference missing inputs or disagree on the landmark
/// count, before any of them is used for indexing.
pub(crate) fn check_samples(
    samples: &[Sample],
    num_inputs: usize,
    shapes: &[Shape],
    num_landmarks: usize,
) -> Result<()> {
    for (k, sample) in samples.iter().enumerate() {
        let idx = sample.input_idx;
        if idx >= num_inputs || idx >= shapes.len() {
            return Err(Error::InvalidInput(format!(
                "sample {} references missing input {}",
                k, idx
            )));
        }
        if sample.estimate.num_landmarks() != num_landmarks
            || shapes[idx].num_landmarks() != num_landmarks
        {
            return Err(Error::InvalidInput(format!(
                "sample {}: expected {} landmarks, estimate has {}, ground truth has {}",
                k,
                num_landmarks,
                sample.estimate.num_landmarks(),
                shapes[idx].num_landmarks()
            )));
        }
    }
    Ok(())
}

/// Uniformly pick an index in `0..n` other than `exclude`. Requires `n >= 2`.
fn pick_other<R: Rng + ?Sized>(exclude: usize, n: usize, rng: &mut R) -> usize {
    let r = rng.random_range(0..n - 1);
    if r >= exclude {
        r + 1
    } else {
        r
    }
}

/// Convex combination of two or three other normalized shapes.
fn blend_other_shapes<R: Rng + ?Sized>(normalized: &[Shape], exclude: usize, rng: &mut R) -> Shape {
    let n = normalized.len();
    let count = rng.random_range(2..=3);
    let weights: Vec<f32> = (0..count).map(|_| rng.random_range(0.05f32..1.0)).collect();
    let total: f32 = weights.iter().sum();

    let mut blend = Shape::zeros(normalized[0].num_landmarks());
    for w in weights {
        blend.add_scaled(&normalized[pick_other(exclude, n, rng)], w / total);
    }
    blend
}

/// Random similarity perturbation about the shape's centroid.
fn perturb<R: Rng + ?Sized>(
    shape: &Shape,
    unit: f32,
    create: &SampleCreationParameters,
    rng: &mut R,
) -> Shape {
    let center = shape.centroid().unwrap_or(Point::zero());
    let angle = rng.random_range(-create.max_rotation..=create.max_rotation);
    let scale = 1.0 + rng.random_range(-create.max_scale_change..=create.max_scale_change);
    let shift = Point::new(
        rng.random_range(-create.max_translation..=create.max_translation),
        rng.random_range(-create.max_translation..=create.max_translation),
    ) * unit;

    let about_center = SimilarityTransform::from_parts(scale, angle, Point::zero());
    Shape::new(
        shape
            .points
            .iter()
            .map(|p| center + about_center.apply_linear(*p - center) + shift)
            .collect(),
    )
}
