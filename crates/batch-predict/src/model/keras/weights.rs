use super::KerasError;
use std::collections::HashMap;

/// A dense float array read from the model file, row major.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightArray {
	pub shape: Vec<usize>,
	pub values: Vec<f32>,
}

impl WeightArray {
	pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
		Self { shape, values }
	}
}

/// Layer weights keyed by `(layer name, parameter name)`.
///
/// Keras names a weight `<scope>/<layer>/<param>:<index>`; only the last two
/// path segments identify it, the scope depends on how the model was nested
/// when it was saved.
#[derive(Debug, Default, Clone)]
pub struct WeightStore {
	entries: HashMap<(String, String), WeightArray>,
}

impl WeightStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, layer: &str, param: &str, array: WeightArray) {
		self.entries.insert((layer.to_string(), param.to_string()), array);
	}

	/// Inserts a weight under its HDF5 dataset path, e.g.
	/// `/model_weights/model1/Conv1/kernel:0`.
	pub fn insert_path(&mut self, path: &str, array: WeightArray) {
		let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
		let (Some(param), Some(layer)) = (segments.next(), segments.next()) else {
			return;
		};
		let param = param.split(':').next().unwrap_or(param);
		self.insert(layer, param, array);
	}

	pub fn get(&self, layer: &str, param: &str) -> Option<&WeightArray> {
		self.entries.get(&(layer.to_string(), param.to_string()))
	}

	pub fn require(&self, layer: &str, param: &str) -> Result<&WeightArray, KerasError> {
		self.get(layer, param).ok_or_else(|| KerasError::MissingWeight {
			layer: layer.to_string(),
			param: param.to_string(),
		})
	}

	/// Like [`require`](Self::require), also checking the rank.
	pub fn require_rank(&self, layer: &str, param: &str, rank: usize) -> Result<&WeightArray, KerasError> {
		let array = self.require(layer, param)?;
		if array.shape.len() != rank || array.shape.iter().product::<usize>() != array.values.len() {
			return Err(KerasError::WeightShape {
				layer: layer.to_string(),
				param: param.to_string(),
				shape: array.shape.clone(),
				expected: format!("a rank {rank} array"),
			});
		}
		Ok(array)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
