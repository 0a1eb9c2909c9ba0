pub mod keras;

use crate::error::PredictError;
use burn::prelude::*;
use itertools::Itertools;
use keras::KerasClassifier;
use log::{info, warn};
use ndarray::ArrayView4;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const KERAS_MODEL_FILE: &str = "keras_model.h5";
pub const LABELS_FILE: &str = "labels.txt";
pub const TFJS_MODEL_FILE: &str = "model.json";
pub const TFJS_METADATA_FILE: &str = "metadata.json";

/// Anything that turns a `(N, H, W, 3)` image stack into `N` probability rows.
pub trait Classifier {
	/// Number of classes the model predicts, if it can tell before running.
	fn output_width(&self) -> Option<usize>;

	fn predict(&self, batch: ArrayView4<f32>) -> Result<Vec<Vec<f32>>, PredictError>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
	fn output_width(&self) -> Option<usize> {
		(**self).output_width()
	}

	fn predict(&self, batch: ArrayView4<f32>) -> Result<Vec<Vec<f32>>, PredictError> {
		(**self).predict(batch)
	}
}

/// A classifier with its label vocabulary: output `i` is `labels[i]`.
#[derive(Debug)]
pub struct ModelBundle<C> {
	pub classifier: C,
	pub labels: Vec<String>,
}

impl<C: Classifier> ModelBundle<C> {
	pub fn new(classifier: C, labels: Vec<String>) -> Result<Self, PredictError> {
		if let Some(width) = classifier.output_width() {
			if width != labels.len() {
				return Err(PredictError::ShapeMismatch {
					expected: labels.len(),
					actual: width,
				});
			}
		}
		Ok(Self { classifier, labels })
	}
}

/// The files a model directory was exported with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLayout {
	Keras { model: PathBuf, labels: PathBuf },
	TensorflowJs { descriptor: PathBuf, metadata: Option<PathBuf> },
}

impl ModelLayout {
	pub fn detect(dir: &Path) -> Result<Self, PredictError> {
		let keras = dir.join(KERAS_MODEL_FILE);
		let tfjs = dir.join(TFJS_MODEL_FILE);

		if keras.is_file() {
			Ok(ModelLayout::Keras {
				model: keras,
				labels: dir.join(LABELS_FILE),
			})
		} else if tfjs.is_file() {
			let metadata = dir.join(TFJS_METADATA_FILE);
			Ok(ModelLayout::TensorflowJs {
				descriptor: tfjs,
				metadata: metadata.is_file().then_some(metadata),
			})
		} else {
			Err(PredictError::ModelNotFound(dir.to_path_buf()))
		}
	}
}

/// One label per line, trimmed. Blank lines at the end are dropped. Every
/// label keys a probability in the results, so repeats are refused.
pub fn read_labels(path: &Path) -> Result<Vec<String>, PredictError> {
	if !path.is_file() {
		return Err(PredictError::LabelsNotFound(path.to_path_buf()));
	}

	let mut labels: Vec<String> = fs::read_to_string(path)?
		.lines()
		.map(|line| line.trim().to_string())
		.collect();
	while labels.last().is_some_and(String::is_empty) {
		labels.pop();
	}

	if let Some(label) = labels.iter().duplicates().next() {
		return Err(PredictError::DuplicateLabel {
			label: label.clone(),
			path: path.to_path_buf(),
		});
	}

	Ok(labels)
}

/// Class names from a Teachable Machine `metadata.json`.
pub fn labels_from_metadata(path: &Path) -> Result<Option<Vec<String>>, PredictError> {
	let metadata: Value = serde_json::from_str(&fs::read_to_string(path)?)?;

	let labels = ["labels", "classNames"]
		.iter()
		.find_map(|key| metadata.get(key).and_then(Value::as_array))
		.map(|values| values.iter().filter_map(Value::as_str).map(str::to_string).collect());

	Ok(labels)
}

fn explain_tfjs(dir: &Path, metadata: Option<&Path>) {
	println!("TensorFlow.js format detected (model.json, weights.bin)");
	println!("  This format needs to be converted to Keras format first.");
	println!("\n  Install tensorflowjs and convert:");
	println!("    pip3 install tensorflowjs");
	println!(
		"    tensorflowjs_converter --input_format=tfjs_layers_model --output_format=keras {}/model.json {}/keras_model.h5",
		dir.display(),
		dir.display()
	);

	let Some(metadata) = metadata else {
		return;
	};
	match labels_from_metadata(metadata) {
		Ok(Some(labels)) if !labels.is_empty() => {
			println!("\n  Found {} classes in metadata.json: {}", labels.len(), labels.join(", "));
			println!("  After conversion, save them one per line to labels.txt");
		}
		Ok(_) => {}
		Err(err) => warn!("Could not read metadata.json: {err}"),
	}
}

/// Loads the model and labels exported to `dir`.
pub fn load_model_bundle<B: Backend>(
	dir: &Path,
	device: &B::Device,
) -> Result<ModelBundle<KerasClassifier<B>>, PredictError> {
	let (model, labels) = match ModelLayout::detect(dir)? {
		ModelLayout::Keras { model, labels } => (model, labels),
		ModelLayout::TensorflowJs { metadata, .. } => {
			explain_tfjs(dir, metadata.as_deref());
			return Err(PredictError::UnsupportedFormat(dir.to_path_buf()));
		}
	};

	let labels = read_labels(&labels)?;

	println!("Loading Keras model from {}...", model.display());
	let classifier = KerasClassifier::load(&model, device).map_err(|source| PredictError::IncompatibleSerialization {
		path: model.clone(),
		source,
	})?;
	info!("Model network built on {:?}", device);

	let bundle = ModelBundle::new(classifier, labels)?;
	println!("Model loaded successfully with {} classes", bundle.labels.len());
	println!("Classes: {}", bundle.labels.join(", "));

	Ok(bundle)
}
