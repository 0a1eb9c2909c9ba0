//! Image preprocessing for Teachable Machine image models: decode, orient,
//! resize like Pillow's bilinear filter and scale pixels into [-1, 1].

pub mod discover;
pub mod error;
pub mod preprocess;
pub mod resample;

pub use discover::{find_images, is_image, IMAGE_EXTENSIONS};
pub use error::PrepError;
pub use preprocess::{
	preprocess_batch, preprocess_image, process_directory, PreparedBatch, PreparedImage, TargetSize, SIDE,
};
