use super::weights::{WeightArray, WeightStore};
use super::KerasError;
use hdf5::types::{FixedAscii, FixedUnicode, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{File, Group};
use log::debug;
use serde_json::Value;
use std::path::Path;

/// Upper bound for a fixed length `model_config` attribute.
const MAX_CONFIG_BYTES: usize = 1 << 21;

/// Reads the architecture JSON and every weight of a Keras `.h5` file.
pub fn read_model_file(path: &Path) -> Result<(Value, WeightStore), KerasError> {
	let file = File::open(path)?;

	let config = read_config(&file)?;
	let weights = match file.group("model_weights") {
		Ok(group) => read_weights(&group)?,
		// `save_weights` style files keep the layers at the root
		Err(_) => read_weights(&file)?,
	};
	debug!("Read {} weight arrays from {}", weights.len(), path.display());

	Ok((serde_json::from_str(&config)?, weights))
}

fn read_config(file: &File) -> Result<String, KerasError> {
	let attr = file.attr("model_config").map_err(|_| KerasError::MissingConfig)?;

	let text = match attr.dtype()?.to_descriptor()? {
		TypeDescriptor::VarLenUnicode => attr.read_scalar::<VarLenUnicode>()?.as_str().to_string(),
		TypeDescriptor::VarLenAscii => attr.read_scalar::<VarLenAscii>()?.as_str().to_string(),
		TypeDescriptor::FixedAscii(len) if len <= MAX_CONFIG_BYTES => attr
			.read_raw::<FixedAscii<MAX_CONFIG_BYTES>>()?
			.first()
			.map(|s| s.as_str().to_string())
			.unwrap_or_default(),
		TypeDescriptor::FixedUnicode(len) if len <= MAX_CONFIG_BYTES => attr
			.read_raw::<FixedUnicode<MAX_CONFIG_BYTES>>()?
			.first()
			.map(|s| s.as_str().to_string())
			.unwrap_or_default(),
		other => return Err(KerasError::ConfigType(format!("{other:?}"))),
	};

	Ok(text)
}

fn read_weights(root: &Group) -> Result<WeightStore, KerasError> {
	let mut store = WeightStore::new();
	collect(root, &mut store)?;
	Ok(store)
}

fn collect(group: &Group, store: &mut WeightStore) -> Result<(), KerasError> {
	for dataset in group.datasets()? {
		if !matches!(dataset.dtype()?.to_descriptor()?, TypeDescriptor::Float(_)) {
			continue;
		}
		let array = WeightArray::new(dataset.shape(), dataset.read_raw::<f32>()?);
		store.insert_path(&dataset.name(), array);
	}

	for child in group.groups()? {
		collect(&child, store)?;
	}

	Ok(())
}
