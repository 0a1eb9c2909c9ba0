//! Keras HDF5 models (`keras_model.h5`) evaluated with burn.

pub mod architecture;
mod h5;
pub mod network;
pub mod weights;

use crate::error::PredictError;
use crate::model::Classifier;
use architecture::{parse_model, strip_unsupported_keys};
use burn::prelude::*;
use log::warn;
use ndarray::ArrayView4;
use network::Network;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use weights::WeightStore;

#[derive(Debug, Error)]
pub enum KerasError {
	#[error("HDF5 error: {0}")]
	Hdf5(#[from] hdf5::Error),
	#[error("Malformed model config: {0}")]
	Json(#[from] serde_json::Error),
	#[error("File has no `model_config` attribute, it only holds weights")]
	MissingConfig,
	#[error("`model_config` is stored as {0}, expected a string")]
	ConfigType(String),
	#[error("Unknown layer: {0}")]
	UnsupportedLayer(String),
	#[error("Layer `{layer}`: {reason}")]
	LayerConfig { layer: String, reason: String },
	#[error("Unrecognized keyword argument passed to {class} `{layer}`: {key}")]
	UnexpectedKey { layer: String, class: String, key: String },
	#[error("Layer `{layer}` has no `{param}` weight")]
	MissingWeight { layer: String, param: String },
	#[error("Weight `{layer}/{param}` has shape {shape:?}, expected {expected}")]
	WeightShape {
		layer: String,
		param: String,
		shape: Vec<usize>,
		expected: String,
	},
	#[error("Model graph error: {0}")]
	Graph(String),
}

fn build<B: Backend>(config: &Value, weights: &WeightStore, device: &B::Device) -> Result<Network<B>, KerasError> {
	let graph = parse_model(config)?;
	Network::build(&graph, weights, device)
}

/// Builds the network as saved. When that fails, drops the layer arguments
/// newer Keras versions reject (see [`architecture::STRIPPABLE_KEYS`]) and
/// tries once more. Nothing to drop means the first error is the answer.
pub fn build_with_fallback<B: Backend>(
	mut config: Value,
	weights: &WeightStore,
	device: &B::Device,
) -> Result<Network<B>, KerasError> {
	let err = match build(&config, weights, device) {
		Ok(network) => return Ok(network),
		Err(err) => err,
	};

	let removed = strip_unsupported_keys(&mut config);
	if removed == 0 {
		return Err(err);
	}

	warn!("Standard model load failed ({err}), retrying without {removed} unsupported layer argument(s)");
	build(&config, weights, device)
}

pub fn load_keras<B: Backend>(path: &Path, device: &B::Device) -> Result<Network<B>, KerasError> {
	let (config, weights) = h5::read_model_file(path)?;
	build_with_fallback(config, &weights, device)
}

/// A loaded Keras network bound to the device it runs on.
#[derive(Debug)]
pub struct KerasClassifier<B: Backend> {
	network: Network<B>,
	device: B::Device,
}

impl<B: Backend> KerasClassifier<B> {
	pub fn new(network: Network<B>, device: B::Device) -> Self {
		Self { network, device }
	}

	pub fn load(path: &Path, device: &B::Device) -> Result<Self, KerasError> {
		Ok(Self::new(load_keras(path, device)?, device.clone()))
	}
}

impl<B: Backend> Classifier for KerasClassifier<B> {
	fn output_width(&self) -> Option<usize> {
		self.network.output_width()
	}

	fn predict(&self, batch: ArrayView4<f32>) -> Result<Vec<Vec<f32>>, PredictError> {
		let shape = batch.shape().to_vec();
		let data = TensorData::new(batch.iter().copied().collect::<Vec<f32>>(), shape);
		let images = Tensor::<B, 4>::from_data(data.convert::<B::FloatElem>(), &self.device);

		let output = self
			.network
			.classify(images)
			.map_err(|err| PredictError::Inference(err.to_string()))?;
		let [rows, width] = output.dims();

		let values = output
			.into_data()
			.convert::<f32>()
			.to_vec::<f32>()
			.map_err(|err| PredictError::Inference(format!("{err:?}")))?;

		Ok(values.chunks(width.max(1)).take(rows).map(<[f32]>::to_vec).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use burn::backend::NdArray;
	use ndarray::Array4;
	use serde_json::json;
	use weights::WeightArray;

	type TestBackend = NdArray;

	/// The Teachable Machine layout: a nested feature extractor with a
	/// depthwise layer, then a classification head.
	fn model(groups: bool) -> Value {
		let mut depthwise = json!({
			"name": "dw",
			"kernel_size": [1, 1],
			"padding": "same",
			"use_bias": false,
			"depth_multiplier": 1
		});
		if groups {
			depthwise["groups"] = json!(1);
		}

		json!({
			"class_name": "Sequential",
			"config": {
				"name": "sequential_4",
				"layers": [
					{"class_name": "Functional", "config": {
						"name": "model1",
						"layers": [
							{"class_name": "InputLayer", "name": "input_1", "config": {"name": "input_1"}, "inbound_nodes": []},
							{"class_name": "DepthwiseConv2D", "name": "dw", "config": depthwise,
								"inbound_nodes": [[["input_1", 0, 0, {}]]]},
							{"class_name": "GlobalAveragePooling2D", "name": "gap", "config": {"name": "gap"},
								"inbound_nodes": [[["dw", 0, 0, {}]]]}
						],
						"input_layers": [["input_1", 0, 0]],
						"output_layers": [["gap", 0, 0]]
					}},
					{"class_name": "Sequential", "config": {
						"name": "sequential_3",
						"layers": [
							{"class_name": "Dense", "config": {"name": "dense_Dense2", "units": 2, "activation": "softmax"}}
						]
					}}
				]
			}
		})
	}

	fn weights() -> WeightStore {
		let mut store = WeightStore::new();
		store.insert_path("/model_weights/model1/dw/depthwise_kernel:0", WeightArray::new(vec![1, 1, 3, 1], vec![1.0; 3]));
		store.insert_path(
			"/model_weights/sequential_3/dense_Dense2/kernel:0",
			WeightArray::new(vec![3, 2], vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]),
		);
		store.insert_path("/model_weights/sequential_3/dense_Dense2/bias:0", WeightArray::new(vec![2], vec![0.0, 0.0]));
		store
	}

	#[test]
	fn clean_config_loads_directly() {
		let network = build_with_fallback::<TestBackend>(model(false), &weights(), &Default::default()).unwrap();
		assert_eq!(network.output_width(), Some(2));
	}

	#[test]
	fn depthwise_groups_falls_back_once() {
		let config = model(true);
		assert!(matches!(
			build::<TestBackend>(&config, &weights(), &Default::default()),
			Err(KerasError::UnexpectedKey { .. })
		));

		let network = build_with_fallback::<TestBackend>(config, &weights(), &Default::default()).unwrap();
		let classifier = KerasClassifier::new(network, Default::default());

		let batch = Array4::<f32>::zeros((3, 2, 2, 3));
		let rows = classifier.predict(batch.view()).unwrap();
		assert_eq!(rows.len(), 3);
		for row in rows {
			assert!((row[0] - 0.5).abs() < 1e-6);
			assert!((row[1] - 0.5).abs() < 1e-6);
		}
	}

	#[test]
	fn unrelated_failures_surface_unchanged() {
		let mut store = WeightStore::new();
		store.insert("dw", "depthwise_kernel", WeightArray::new(vec![1, 1, 3, 1], vec![1.0; 3]));

		let err = build_with_fallback::<TestBackend>(model(false), &store, &Default::default()).unwrap_err();
		assert!(matches!(err, KerasError::MissingWeight { ref layer, .. } if layer == "dense_Dense2"));

		// the retry's error is reported once something was stripped
		let err = build_with_fallback::<TestBackend>(model(true), &store, &Default::default()).unwrap_err();
		assert!(matches!(err, KerasError::MissingWeight { .. }));
	}
}
