use crate::model::keras::KerasError;
use image_prep::PrepError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictError {
	#[error(
		"Could not detect model format in {0}.\n\
		Expected either:\n  \
		- Keras format: keras_model.h5 and labels.txt\n  \
		- TensorFlow.js format: model.json, weights.bin, and metadata.json"
	)]
	ModelNotFound(PathBuf),
	#[error("Labels file not found: {0}")]
	LabelsNotFound(PathBuf),
	#[error("Label {label:?} appears more than once in {path}")]
	DuplicateLabel { label: String, path: PathBuf },
	#[error("Image directory not found: {0}")]
	ImageDirNotFound(PathBuf),
	#[error("TensorFlow.js format detected in {0}. Please convert to Keras format first")]
	UnsupportedFormat(PathBuf),
	#[error("Could not load model {path}: {source}")]
	IncompatibleSerialization {
		path: PathBuf,
		#[source]
		source: KerasError,
	},
	#[error("Model outputs {actual} probabilities but {expected} labels were loaded")]
	ShapeMismatch { expected: usize, actual: usize },
	#[error("No image files found in {0}")]
	NoImages(PathBuf),
	#[error("Batch size must be a positive integer")]
	InvalidBatchSize,
	#[error("Inference failed: {0}")]
	Inference(String),
	#[error(transparent)]
	Preprocess(#[from] PrepError),
	#[error("Std IO error: {0}")]
	StdIoError(#[from] std::io::Error),
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("CSV error: {0}")]
	Csv(#[from] csv::Error),
}
