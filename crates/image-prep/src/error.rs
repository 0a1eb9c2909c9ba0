use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepError {
	#[error("Std IO error: {0}")]
	StdIoError(#[from] std::io::Error),
	#[error("Could not decode {path}: {source}")]
	Decode {
		path: PathBuf,
		#[source]
		source: image::ImageError,
	},
	#[error("Target size must be positive, got {width}x{height}")]
	InvalidSize { width: u32, height: u32 },
	#[error("No images were successfully processed")]
	Empty,
	#[error("Tensor shape error: {0}")]
	Shape(#[from] ndarray::ShapeError),
	#[error("Could not write .npy file: {0}")]
	Npy(#[from] ndarray_npy::WriteNpyError),
}
