use crate::config::PredictConfig;
use crate::error::PredictError;
use crate::model::{Classifier, ModelBundle};
use image_prep::preprocess_batch;
use log::info;
use ndarray::Axis;
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};

/// The classification of one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
	pub image_path: String,
	pub predicted_class: String,
	pub confidence: f64,
	/// Probability per label, in label order.
	#[serde(serialize_with = "ordered_map")]
	pub all_probabilities: Vec<(String, f64)>,
}

/// Records in discovery order, minus the images that failed to decode.
pub type ResultSet = Vec<PredictionRecord>;

fn ordered_map<S: Serializer>(entries: &[(String, f64)], serializer: S) -> Result<S::Ok, S::Error> {
	serializer.collect_map(entries.iter().map(|(label, p)| (label, p)))
}

/// Index of the largest value, the first one on ties.
fn argmax(values: &[f32]) -> usize {
	let mut best = 0;
	for (i, v) in values.iter().enumerate() {
		if *v > values[best] {
			best = i;
		}
	}
	best
}

impl PredictionRecord {
	pub fn new(path: &Path, labels: &[String], probabilities: &[f32]) -> Self {
		let best = argmax(probabilities);
		Self {
			image_path: path.display().to_string(),
			predicted_class: labels[best].clone(),
			confidence: probabilities[best] as f64,
			all_probabilities: labels
				.iter()
				.cloned()
				.zip(probabilities.iter().map(|p| *p as f64))
				.collect(),
		}
	}
}

/// Classifies every image in `paths`. Images that fail to decode are skipped
/// with a warning, so the result can be shorter than the input.
pub fn predict_batch<C: Classifier>(
	bundle: &ModelBundle<C>,
	paths: &[PathBuf],
	config: &PredictConfig,
) -> Result<ResultSet, PredictError> {
	if config.batch_size == 0 {
		return Err(PredictError::InvalidBatchSize);
	}

	println!("Processing {} images...", paths.len());
	println!("Preprocessing images...");
	let batch = preprocess_batch(paths, config.target_size())?;

	println!("Running predictions...");
	let expected = bundle.labels.len();
	let mut outputs = Vec::with_capacity(batch.len());
	for chunk in batch.tensors.axis_chunks_iter(Axis(0), config.batch_size) {
		let rows = bundle.classifier.predict(chunk)?;
		if rows.len() != chunk.len_of(Axis(0)) {
			return Err(PredictError::Inference(format!(
				"model returned {} rows for {} images",
				rows.len(),
				chunk.len_of(Axis(0))
			)));
		}
		if let Some(row) = rows.iter().find(|row| row.len() != expected) {
			return Err(PredictError::ShapeMismatch {
				expected,
				actual: row.len(),
			});
		}
		outputs.extend(rows);
	}

	let total = batch.len();
	let mut records = Vec::with_capacity(total);
	for (i, (path, probabilities)) in batch.paths.iter().zip(&outputs).enumerate() {
		records.push(PredictionRecord::new(path, &bundle.labels, probabilities));
		if (i + 1) % 100 == 0 {
			info!("Processed {}/{} images...", i + 1, total);
		}
	}

	Ok(records)
}
