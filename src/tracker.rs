//! The full cascade and its persistence.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::evaluation::{normalized_point_error, ErrorStats};
use crate::image_access::ImageAccess;
use crate::regressor::{Regressor, RegressorTraining};
use crate::training::{check_samples, InputData, Sample, TrainingData};
use crate::types::{BoundingBox, Shape};

/// A trained cascade of regressors.
///
/// The mean shape lives in the unit frame of a detection rectangle; see
/// [`BoundingBox::to_image_transform`]. Each stage refines the estimate
/// produced by the stages before it.
///
/// # Usage
///
/// ```ignore
/// let tracker = Tracker::load("tracker.bin.bz2")?;
/// let rect = BoundingBox::new(100.0, 100.0, 200.0, 200.0);
/// let landmarks = tracker.predict_in_rect(&image, &rect)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tracker {
    mean_shape: Shape,
    cascade: Vec<Regressor>,
}

impl Tracker {
    /// An untrained tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a tracker from trained parts, checking that the sizes agree.
    pub fn from_parts(mean_shape: Shape, cascade: Vec<Regressor>) -> Result<Self> {
        let tracker = Self {
            mean_shape,
            cascade,
        };
        tracker.validate()?;
        Ok(tracker)
    }

    /// Train the cascade on `data`.
    ///
    /// `data.samples` supplies the initial estimates (see
    /// [`TrainingData::create_training_samples`]); they are copied and the
    /// copies are advanced stage by stage. On error the tracker keeps its
    /// previous state.
    pub fn fit(&mut self, data: &mut TrainingData) -> Result<()> {
        data.params.validate()?;
        data.input.validate()?;
        if data.samples.is_empty() {
            return Err(Error::InvalidInput(
                "no training samples; create them before fitting".into(),
            ));
        }

        let mean_shape = data.input.mean_shape()?;
        check_samples(
            &data.samples,
            data.input.len(),
            &data.input.shapes,
            mean_shape.num_landmarks(),
        )?;
        let mut samples = data.samples.clone();
        let num_cascades = data.params.num_cascades;

        info!(
            "training {} stages on {} samples from {} images, initial error {}",
            num_cascades,
            samples.len(),
            data.input.len(),
            sample_error_stats(&data.input, &samples)
        );

        let mut cascade = Vec::with_capacity(num_cascades);
        for stage in 0..num_cascades {
            let training = RegressorTraining {
                images: &data.input.images,
                shapes: &data.input.shapes,
                samples: &samples,
                mean_shape: &mean_shape,
                params: &data.params,
            };
            let regressor = Regressor::fit(&training, &mut data.rng)?;

            for s in samples.iter_mut() {
                let delta = regressor.predict(&data.input.images[s.input_idx], &s.estimate);
                s.estimate.add_delta(&delta);
            }
            info!(
                "stage {}/{}: {}",
                stage + 1,
                num_cascades,
                sample_error_stats(&data.input, &samples)
            );
            cascade.push(regressor);
        }

        self.mean_shape = mean_shape;
        self.cascade = cascade;
        Ok(())
    }

    /// Refine `initial` (an image-space estimate) through every stage.
    pub fn predict<I: ImageAccess + ?Sized>(&self, image: &I, initial: &Shape) -> Result<Shape> {
        if self.mean_shape.is_empty() {
            return Err(Error::InvalidInput("tracker is not trained".into()));
        }
        if initial.num_landmarks() != self.num_landmarks() {
            return Err(Error::InvalidInput(format!(
                "initial estimate has {} landmarks, tracker expects {}",
                initial.num_landmarks(),
                self.num_landmarks()
            )));
        }

        let mut estimate = initial.clone();
        for regressor in &self.cascade {
            let delta = regressor.predict(image, &estimate);
            estimate.add_delta(&delta);
        }
        Ok(estimate)
    }

    /// The mean shape placed in `rect`.
    pub fn initial_estimate(&self, rect: &BoundingBox) -> Shape {
        rect.to_image_transform().apply_shape(&self.mean_shape)
    }

    /// Predict starting from the mean shape placed in a detection rectangle.
    pub fn predict_in_rect<I: ImageAccess + ?Sized>(
        &self,
        image: &I,
        rect: &BoundingBox,
    ) -> Result<Shape> {
        self.predict(image, &self.initial_estimate(rect))
    }

    pub fn mean_shape(&self) -> &Shape {
        &self.mean_shape
    }

    pub fn cascade(&self) -> &[Regressor] {
        &self.cascade
    }

    pub fn num_landmarks(&self) -> usize {
        self.mean_shape.num_landmarks()
    }

    pub fn num_stages(&self) -> usize {
        self.cascade.len()
    }

    pub fn is_trained(&self) -> bool {
        !self.mean_shape.is_empty()
    }

    /// Save with bincode; paths ending in `.bz2` are bzip2-compressed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        if is_bz2(path) {
            let mut encoder = BzEncoder::new(&mut writer, Compression::default());
            self.write_to(&mut encoder)?;
            encoder.finish()?;
        } else {
            self.write_to(&mut writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Load a tracker written by [`Tracker::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        if is_bz2(path) {
            Self::read_from(BzDecoder::new(reader))
        } else {
            Self::read_from(reader)
        }
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        let tracker: Self = bincode::deserialize_from(reader)?;
        tracker.validate()?;
        Ok(tracker)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tracker: Self = bincode::deserialize(bytes)?;
        tracker.validate()?;
        Ok(tracker)
    }

    /// Check that every stage agrees with the tracker's landmark count.
    pub fn validate(&self) -> Result<()> {
        if self.mean_shape.is_empty() && !self.cascade.is_empty() {
            return Err(Error::InvalidModel(
                "cascade stages without a mean shape".into(),
            ));
        }
        let num_landmarks = self.num_landmarks();
        for (k, regressor) in self.cascade.iter().enumerate() {
            regressor
                .check(num_landmarks)
                .map_err(|msg| Error::InvalidModel(format!("stage {}: {}", k, msg)))?;
        }
        Ok(())
    }
}

fn is_bz2(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "bz2")
}

fn sample_error_stats(input: &InputData, samples: &[Sample]) -> ErrorStats {
    let errors: Vec<f32> = samples
        .iter()
        .map(|s| {
            normalized_point_error(
                &s.estimate,
                &input.shapes[s.input_idx],
                &input.rects[s.input_idx],
            )
        })
        .collect();
    ErrorStats::from_errors(&errors)
}
