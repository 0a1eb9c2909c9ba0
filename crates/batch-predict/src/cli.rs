use crate::config::PredictConfig;
use crate::error::PredictError;
use crate::model::load_model_bundle;
use crate::predict::predict_batch;
use crate::report::{save_results, summarize, OutputFormat, Summary};
use burn::prelude::Backend;
use clap::Parser;
use image_prep::find_images;
use std::path::PathBuf;

/// Run batch predictions on images using a Teachable Machine model
#[derive(Debug, Parser)]
pub struct Args {
	/// Directory containing keras_model.h5 and labels.txt
	pub model_dir: PathBuf,

	/// Directory containing images to process
	pub image_dir: PathBuf,

	/// Output file for results
	#[arg(short, long, default_value = "predictions.json")]
	pub output: PathBuf,

	/// Batch size for processing
	#[arg(short, long, default_value_t = 32)]
	pub batch_size: usize,

	/// Output format
	#[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
	pub format: OutputFormat,
}

/// Finds the images, loads the model, classifies, saves and summarizes.
pub fn run<B: Backend>(args: &Args, device: &B::Device) -> Result<Summary, PredictError> {
	if !args.image_dir.is_dir() {
		return Err(PredictError::ImageDirNotFound(args.image_dir.clone()));
	}
	let images = find_images(&args.image_dir)?;
	if images.is_empty() {
		return Err(PredictError::NoImages(args.image_dir.clone()));
	}

	let config = PredictConfig::new().with_batch_size(args.batch_size);
	if config.batch_size == 0 {
		return Err(PredictError::InvalidBatchSize);
	}

	let bundle = load_model_bundle::<B>(&args.model_dir, device)?;
	println!("Found {} images to process", images.len());

	let results = predict_batch(&bundle, &images, &config)?;
	save_results(&results, &args.output, args.format)?;

	Ok(summarize(&results))
}
