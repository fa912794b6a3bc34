//! Command-line front end for training and running shape cascades.
//!
//! Usage:
//!   shape-cascade train <db> [-r rects.csv] [-o tracker.bin]     # Train and save
//!   shape-cascade evaluate <model> <db> [--perturbations 10]     # Error statistics
//!   shape-cascade predict <model> <image> --rect x,y,w,h --json  # Landmarks as JSON

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use shape_cascade::evaluation::{normalized_point_error, ErrorStats};
use shape_cascade::io::{import_database, parse_rect, ImportParameters};
use shape_cascade::{
    BoundingBox, GrayImage, InputData, Point, Sample, SampleCreationParameters, Tracker,
    TrainingData, TrainingParameters,
};

#[derive(Parser, Debug)]
#[command(name = "shape-cascade")]
#[command(author, version, about = "Shape alignment with cascaded regression trees", long_about = None)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a tracker on a labeled database
    Train(TrainArgs),
    /// Measure a trained tracker on a labeled database
    Evaluate(EvaluateArgs),
    /// Predict landmarks for one image
    Predict(PredictArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Directory of images with sibling .pts files
    database: PathBuf,

    /// Rectangle file, one x,y,width,height line per image
    #[arg(short, long)]
    rects: Option<PathBuf>,

    /// Output tracker file (.bz2 suffix compresses)
    #[arg(short, long, default_value = "tracker.bin")]
    output: PathBuf,

    /// Fraction of the database held out for validation
    #[arg(long, default_value_t = 0.01)]
    validation_fraction: f32,

    #[command(flatten)]
    training: TrainingFlags,

    #[command(flatten)]
    creation: CreationFlags,

    #[command(flatten)]
    load: LoadFlags,
}

#[derive(Args, Debug)]
struct TrainingFlags {
    /// Number of cascade stages
    #[arg(long, default_value_t = 10)]
    train_num_cascades: usize,

    /// Trees per stage
    #[arg(long, default_value_t = 500)]
    train_num_trees: usize,

    /// Maximum tree depth
    #[arg(long, default_value_t = 5)]
    train_max_depth: usize,

    /// Pixel coordinates sampled per stage
    #[arg(long, default_value_t = 400)]
    train_num_pixels: usize,

    /// Candidate split tests per node
    #[arg(long, default_value_t = 20)]
    train_num_splits: usize,

    /// Spatial prior on pixel pairs
    #[arg(long, default_value_t = 0.1)]
    train_lambda: f32,

    /// Learning rate
    #[arg(long, default_value_t = 0.08)]
    train_learn: f32,

    /// Random seed
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl TrainingFlags {
    fn parameters(&self) -> TrainingParameters {
        TrainingParameters {
            num_cascades: self.train_num_cascades,
            num_trees: self.train_num_trees,
            max_tree_depth: self.train_max_depth,
            num_random_pixel_coordinates: self.train_num_pixels,
            num_random_split_tests_per_node: self.train_num_splits,
            exponential_lambda: self.train_lambda,
            learning_rate: self.train_learn,
            seed: self.seed,
        }
    }
}

#[derive(Args, Debug)]
struct CreationFlags {
    /// Initial estimates per training image
    #[arg(long, default_value_t = 20)]
    create_num_shapes: usize,

    /// Use single shapes instead of blends as initial estimates
    #[arg(long)]
    create_no_combinations: bool,
}

#[derive(Args, Debug)]
struct LoadFlags {
    /// Downscale images whose longer side exceeds this
    #[arg(long, default_value_t = 2048)]
    load_max_size: u32,
}

impl LoadFlags {
    fn parameters(&self) -> ImportParameters {
        ImportParameters {
            max_image_side_length: self.load_max_size,
        }
    }
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// Trained tracker file
    model: PathBuf,

    /// Directory of images with sibling .pts files
    database: PathBuf,

    /// Rectangle file, one x,y,width,height line per image
    #[arg(short, long)]
    rects: Option<PathBuf>,

    /// Perturbed copies of each initial estimate
    #[arg(long, default_value_t = 0)]
    perturbations: usize,

    /// Random seed for the perturbations
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Output as JSON
    #[arg(short, long)]
    json: bool,

    #[command(flatten)]
    load: LoadFlags,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Trained tracker file
    model: PathBuf,

    /// Input image file
    image: PathBuf,

    /// Detection rectangle as x,y,width,height
    #[arg(long, value_parser = parse_rect)]
    rect: BoundingBox,

    /// Output as JSON
    #[arg(short, long)]
    json: bool,
}

/// Output structure for JSON serialization
#[derive(Serialize)]
struct EvaluationOutput {
    images: usize,
    samples: usize,
    initial: ErrorStats,
    refined: ErrorStats,
}

#[derive(Serialize)]
struct PredictionOutput {
    image: String,
    rect: BoundingBox,
    landmarks: Vec<Point>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Train(args) => train(&args),
        Command::Evaluate(args) => evaluate(&args),
        Command::Predict(args) => predict(&args),
    }
}

fn train(args: &TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let input = import_database(&args.database, args.rects.as_deref(), &args.load.parameters())?;
    let params = args.training.parameters();
    params.validate()?;

    let mut data = TrainingData::new(input, params.clone());
    let validation = data
        .input
        .random_partition(args.validation_fraction, &mut data.rng);
    info!(
        "{} training images, {} validation images",
        data.input.len(),
        validation.len()
    );

    data.create_training_samples(&SampleCreationParameters {
        shapes_per_image: args.creation.create_num_shapes,
        use_linear_combinations_of_shapes: !args.creation.create_no_combinations,
        ..Default::default()
    })?;

    let mut tracker = Tracker::new();
    tracker.fit(&mut data)?;
    tracker.save(&args.output)?;
    info!("saved tracker to {}", args.output.display());

    if !validation.is_empty() {
        let mut check = TrainingData::new(validation, params);
        let (initial, refined) = measure(&tracker, &mut check, 10)?;
        println!("Validation initial: {}", initial);
        println!("Validation refined: {}", refined);
    }
    Ok(())
}

fn evaluate(args: &EvaluateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tracker = Tracker::load(&args.model)?;
    let input = import_database(&args.database, args.rects.as_deref(), &args.load.parameters())?;
    let images = input.len();

    let params = TrainingParameters {
        seed: args.seed,
        ..Default::default()
    };
    let mut data = TrainingData::new(input, params);
    let (initial, refined) = measure(&tracker, &mut data, args.perturbations)?;

    let output = EvaluationOutput {
        images,
        samples: data.samples.len(),
        initial,
        refined,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Images:  {}", output.images);
        println!("Samples: {}", output.samples);
        println!("Initial: {}", output.initial);
        println!("Refined: {}", output.refined);
    }
    Ok(())
}

/// Error statistics before and after running the cascade, one mean-shape
/// estimate per image plus `perturbations` perturbed copies.
fn measure(
    tracker: &Tracker,
    data: &mut TrainingData,
    perturbations: usize,
) -> Result<(ErrorStats, ErrorStats), Box<dyn std::error::Error>> {
    data.create_validation_samples(
        tracker.mean_shape(),
        &SampleCreationParameters {
            shapes_per_image: 1,
            transform_perturbations_per_shape: perturbations,
            use_linear_combinations_of_shapes: false,
            ..Default::default()
        },
    )?;

    let mut initial = Vec::with_capacity(data.samples.len());
    let mut refined = Vec::with_capacity(data.samples.len());
    for sample in &data.samples {
        let prediction = tracker.predict(&data.input.images[sample.input_idx], &sample.estimate)?;
        initial.push(sample_error(&data.input, sample, &sample.estimate));
        refined.push(sample_error(&data.input, sample, &prediction));
    }
    Ok((
        ErrorStats::from_errors(&initial),
        ErrorStats::from_errors(&refined),
    ))
}

fn sample_error(input: &InputData, sample: &Sample, estimate: &shape_cascade::Shape) -> f32 {
    normalized_point_error(
        estimate,
        &input.shapes[sample.input_idx],
        &input.rects[sample.input_idx],
    )
}

fn predict(args: &PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tracker = Tracker::load(&args.model)?;
    let image = load_gray(&args.image)?;
    let landmarks = tracker.predict_in_rect(&image, &args.rect)?;

    let output = PredictionOutput {
        image: args.image.display().to_string(),
        rect: args.rect,
        landmarks: landmarks.points,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Image: {}", output.image);
        println!("Landmarks: {} points", output.landmarks.len());
        for (i, p) in output.landmarks.iter().enumerate() {
            println!("  {:3}: {:.2} {:.2}", i, p.x, p.y);
        }
    }
    Ok(())
}

fn load_gray(path: &Path) -> Result<GrayImage, Box<dyn std::error::Error>> {
    Ok(GrayImage::from(image::open(path)?.to_luma8()))
}
