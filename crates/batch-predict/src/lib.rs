//! Batch classification of image folders with Teachable Machine models.

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod predict;
pub mod report;

pub use config::PredictConfig;
pub use error::PredictError;
pub use model::{load_model_bundle, Classifier, ModelBundle, ModelLayout};
pub use predict::{predict_batch, PredictionRecord, ResultSet};
pub use report::{save_results, summarize, OutputFormat, Summary};

use burn::prelude::Backend;

#[cfg(not(feature = "tch"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(feature = "tch")]
pub type DefaultBackend = burn_tch::LibTorch;

#[cfg(not(feature = "tch"))]
pub fn default_device() -> <DefaultBackend as Backend>::Device {
	Default::default()
}

/// First CUDA device when libtorch can see one, the CPU otherwise.
#[cfg(feature = "tch")]
pub fn default_device() -> <DefaultBackend as Backend>::Device {
	if tch::utils::has_cuda() {
		burn_tch::LibTorchDevice::Cuda(0)
	} else {
		burn_tch::LibTorchDevice::Cpu
	}
}
