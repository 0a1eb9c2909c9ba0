//! Typed view of the Keras `model_config` JSON.

use super::KerasError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Config keys that newer Keras releases reject for a layer type although
/// older ones wrote them. The load fallback drops exactly these.
pub const STRIPPABLE_KEYS: [(&str, &str); 1] = [("DepthwiseConv2D", "groups")];

/// Keyword arguments `DepthwiseConv2D` accepts. Anything else in its config
/// is rejected, the way the layer constructor rejects it.
const DEPTHWISE_KEYS: [&str; 20] = [
	"name",
	"trainable",
	"dtype",
	"batch_input_shape",
	"batch_shape",
	"kernel_size",
	"strides",
	"padding",
	"data_format",
	"dilation_rate",
	"activation",
	"use_bias",
	"depth_multiplier",
	"depthwise_initializer",
	"bias_initializer",
	"depthwise_regularizer",
	"bias_regularizer",
	"activity_regularizer",
	"depthwise_constraint",
	"bias_constraint",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
	#[default]
	Valid,
	Same,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
	#[default]
	Linear,
	Relu,
	Relu6,
	Sigmoid,
	Tanh,
	Softmax,
}

/// `3` or `[3, 3]`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum Pair {
	One(usize),
	Two([usize; 2]),
}

impl Pair {
	fn get(self) -> [usize; 2] {
		match self {
			Pair::One(v) => [v, v],
			Pair::Two(v) => v,
		}
	}
}

fn unit_pair() -> Pair {
	Pair::One(1)
}

fn yes() -> bool {
	true
}

fn one() -> usize {
	1
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvParams {
	pub filters: usize,
	pub kernel: [usize; 2],
	pub strides: [usize; 2],
	pub padding: Padding,
	pub dilation: [usize; 2],
	pub groups: usize,
	pub use_bias: bool,
	pub activation: ActivationKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthwiseParams {
	pub kernel: [usize; 2],
	pub strides: [usize; 2],
	pub padding: Padding,
	pub dilation: [usize; 2],
	pub depth_multiplier: usize,
	pub use_bias: bool,
	pub activation: ActivationKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormParams {
	pub epsilon: f64,
	pub center: bool,
	pub scale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReluParams {
	pub max_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseParams {
	pub units: usize,
	pub use_bias: bool,
	pub activation: ActivationKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
	Input,
	Conv2D(ConvParams),
	DepthwiseConv2D(DepthwiseParams),
	BatchNormalization(BatchNormParams),
	ReLU(ReluParams),
	Activation(ActivationKind),
	/// top, bottom, left, right
	ZeroPadding2D([usize; 4]),
	Add,
	GlobalAveragePooling2D { keepdims: bool },
	Flatten,
	Dense(DenseParams),
	Dropout,
	Softmax,
	Model(GraphDef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerDef {
	pub name: String,
	pub kind: LayerKind,
	/// Names of the layers feeding this one.
	pub inbound: Vec<String>,
}

/// A `Sequential` or functional model: layers in topological order.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphDef {
	pub name: String,
	pub layers: Vec<LayerDef>,
	pub inputs: Vec<String>,
	pub output: String,
}

#[derive(Debug, Deserialize)]
struct RawLayer {
	class_name: String,
	#[serde(default)]
	config: Value,
	#[serde(default)]
	name: Option<String>,
	#[serde(default)]
	inbound_nodes: Value,
}

impl RawLayer {
	fn name(&self) -> String {
		self.config
			.get("name")
			.and_then(Value::as_str)
			.map(str::to_string)
			.or_else(|| self.name.clone())
			.unwrap_or_else(|| self.class_name.to_lowercase())
	}
}

#[derive(Deserialize)]
struct ConvConfig {
	filters: usize,
	kernel_size: Pair,
	#[serde(default = "unit_pair")]
	strides: Pair,
	#[serde(default)]
	padding: Padding,
	#[serde(default)]
	data_format: Option<String>,
	#[serde(default = "unit_pair")]
	dilation_rate: Pair,
	#[serde(default = "one")]
	groups: usize,
	#[serde(default)]
	activation: Option<ActivationKind>,
	#[serde(default = "yes")]
	use_bias: bool,
}

#[derive(Deserialize)]
struct DepthwiseConfig {
	kernel_size: Pair,
	#[serde(default = "unit_pair")]
	strides: Pair,
	#[serde(default)]
	padding: Padding,
	#[serde(default)]
	data_format: Option<String>,
	#[serde(default = "unit_pair")]
	dilation_rate: Pair,
	#[serde(default = "one")]
	depth_multiplier: usize,
	#[serde(default)]
	activation: Option<ActivationKind>,
	#[serde(default = "yes")]
	use_bias: bool,
}

#[derive(Deserialize)]
struct BatchNormConfig {
	#[serde(default)]
	axis: Value,
	#[serde(default = "default_epsilon")]
	epsilon: f64,
	#[serde(default = "yes")]
	center: bool,
	#[serde(default = "yes")]
	scale: bool,
}

fn default_epsilon() -> f64 {
	1e-3
}

#[derive(Deserialize)]
struct ReluConfig {
	#[serde(default)]
	max_value: Option<f64>,
	#[serde(default)]
	negative_slope: f64,
	#[serde(default)]
	threshold: f64,
}

#[derive(Deserialize)]
struct ActivationConfig {
	activation: ActivationKind,
}

/// `1`, `[1, 1]` or `[[0, 1], [0, 1]]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ZeroPad {
	Uniform(usize),
	Symmetric([usize; 2]),
	Explicit([[usize; 2]; 2]),
}

#[derive(Deserialize)]
struct ZeroPaddingConfig {
	padding: ZeroPad,
	#[serde(default)]
	data_format: Option<String>,
}

#[derive(Deserialize)]
struct PoolingConfig {
	#[serde(default)]
	data_format: Option<String>,
	#[serde(default)]
	keepdims: bool,
}

#[derive(Deserialize)]
struct DenseConfig {
	units: usize,
	#[serde(default)]
	activation: Option<ActivationKind>,
	#[serde(default = "yes")]
	use_bias: bool,
}

#[derive(Deserialize)]
struct SoftmaxConfig {
	#[serde(default)]
	axis: Value,
}

fn layer_config<T: DeserializeOwned>(layer: &str, config: &Value) -> Result<T, KerasError> {
	T::deserialize(config).map_err(|err| KerasError::LayerConfig {
		layer: layer.to_string(),
		reason: err.to_string(),
	})
}

fn channels_last(layer: &str, data_format: Option<&str>) -> Result<(), KerasError> {
	match data_format {
		None | Some("channels_last") => Ok(()),
		Some(other) => Err(KerasError::LayerConfig {
			layer: layer.to_string(),
			reason: format!("data_format `{other}` is not supported, expected channels_last"),
		}),
	}
}

/// Channel axis given as -1, 3, [-1] or [3].
fn last_axis(axis: &Value) -> bool {
	match axis {
		Value::Null => true,
		Value::Number(n) => matches!(n.as_i64(), Some(-1) | Some(3)),
		Value::Array(items) => items.len() == 1 && last_axis(&items[0]),
		_ => false,
	}
}

fn reject_unknown_keys(layer: &str, class: &str, config: &Value, accepted: &[&str]) -> Result<(), KerasError> {
	let Some(map) = config.as_object() else {
		return Ok(());
	};
	match map.keys().find(|key| !accepted.contains(&key.as_str())) {
		Some(key) => Err(KerasError::UnexpectedKey {
			layer: layer.to_string(),
			class: class.to_string(),
			key: key.clone(),
		}),
		None => Ok(()),
	}
}

fn parse_kind(raw: &RawLayer, name: &str) -> Result<LayerKind, KerasError> {
	let config = &raw.config;

	let kind = match raw.class_name.as_str() {
		"InputLayer" => LayerKind::Input,
		"Conv2D" => {
			let c: ConvConfig = layer_config(name, config)?;
			channels_last(name, c.data_format.as_deref())?;
			LayerKind::Conv2D(ConvParams {
				filters: c.filters,
				kernel: c.kernel_size.get(),
				strides: c.strides.get(),
				padding: c.padding,
				dilation: c.dilation_rate.get(),
				groups: c.groups.max(1),
				use_bias: c.use_bias,
				activation: c.activation.unwrap_or_default(),
			})
		}
		"DepthwiseConv2D" => {
			reject_unknown_keys(name, &raw.class_name, config, &DEPTHWISE_KEYS)?;
			let c: DepthwiseConfig = layer_config(name, config)?;
			channels_last(name, c.data_format.as_deref())?;
			LayerKind::DepthwiseConv2D(DepthwiseParams {
				kernel: c.kernel_size.get(),
				strides: c.strides.get(),
				padding: c.padding,
				dilation: c.dilation_rate.get(),
				depth_multiplier: c.depth_multiplier.max(1),
				use_bias: c.use_bias,
				activation: c.activation.unwrap_or_default(),
			})
		}
		"BatchNormalization" => {
			let c: BatchNormConfig = layer_config(name, config)?;
			if !last_axis(&c.axis) {
				return Err(KerasError::LayerConfig {
					layer: name.to_string(),
					reason: format!("normalization axis {} is not the channel axis", c.axis),
				});
			}
			LayerKind::BatchNormalization(BatchNormParams {
				epsilon: c.epsilon,
				center: c.center,
				scale: c.scale,
			})
		}
		"ReLU" => {
			let c: ReluConfig = layer_config(name, config)?;
			if c.negative_slope != 0.0 || c.threshold != 0.0 {
				return Err(KerasError::LayerConfig {
					layer: name.to_string(),
					reason: "only plain and capped ReLU are supported".to_string(),
				});
			}
			LayerKind::ReLU(ReluParams { max_value: c.max_value })
		}
		"Activation" => {
			let c: ActivationConfig = layer_config(name, config)?;
			LayerKind::Activation(c.activation)
		}
		"ZeroPadding2D" => {
			let c: ZeroPaddingConfig = layer_config(name, config)?;
			channels_last(name, c.data_format.as_deref())?;
			let pad = match c.padding {
				ZeroPad::Uniform(p) => [p, p, p, p],
				ZeroPad::Symmetric([h, w]) => [h, h, w, w],
				ZeroPad::Explicit([[top, bottom], [left, right]]) => [top, bottom, left, right],
			};
			LayerKind::ZeroPadding2D(pad)
		}
		"Add" => LayerKind::Add,
		"GlobalAveragePooling2D" => {
			let c: PoolingConfig = layer_config(name, config)?;
			channels_last(name, c.data_format.as_deref())?;
			LayerKind::GlobalAveragePooling2D { keepdims: c.keepdims }
		}
		"Flatten" => LayerKind::Flatten,
		"Dense" => {
			let c: DenseConfig = layer_config(name, config)?;
			LayerKind::Dense(DenseParams {
				units: c.units,
				use_bias: c.use_bias,
				activation: c.activation.unwrap_or_default(),
			})
		}
		"Dropout" => LayerKind::Dropout,
		"Softmax" => {
			let c: SoftmaxConfig = layer_config(name, config)?;
			if !last_axis(&c.axis) {
				return Err(KerasError::LayerConfig {
					layer: name.to_string(),
					reason: "softmax is only supported over the last axis".to_string(),
				});
			}
			LayerKind::Softmax
		}
		"Sequential" => LayerKind::Model(parse_sequential(name, config)?),
		"Functional" | "Model" => LayerKind::Model(parse_functional(name, config)?),
		other => return Err(KerasError::UnsupportedLayer(other.to_string())),
	};

	Ok(kind)
}

fn raw_layers(config: &Value) -> Result<Vec<RawLayer>, KerasError> {
	// very old Sequential configs are the bare layer list
	let layers = match config {
		Value::Array(_) => config,
		_ => config.get("layers").unwrap_or(&Value::Null),
	};
	Ok(Vec::<RawLayer>::deserialize(layers)?)
}

fn parse_sequential(name: &str, config: &Value) -> Result<GraphDef, KerasError> {
	let input = format!("{name}_input");
	let mut previous = input.clone();
	let mut layers = Vec::new();

	for raw in raw_layers(config)? {
		let layer_name = raw.name();
		let kind = parse_kind(&raw, &layer_name)?;
		layers.push(LayerDef {
			name: layer_name.clone(),
			kind,
			inbound: vec![previous],
		});
		previous = layer_name;
	}

	if layers.is_empty() {
		return Err(KerasError::Graph(format!("Sequential model `{name}` has no layers")));
	}

	Ok(GraphDef {
		name: name.to_string(),
		layers,
		inputs: vec![input],
		output: previous,
	})
}

fn parse_functional(name: &str, config: &Value) -> Result<GraphDef, KerasError> {
	let mut layers = Vec::new();

	for raw in raw_layers(config)? {
		let layer_name = raw.name();
		let kind = parse_kind(&raw, &layer_name)?;
		let inbound = inbound_layer_names(&layer_name, &raw.inbound_nodes)?;
		layers.push(LayerDef { name: layer_name, kind, inbound });
	}

	let inputs = endpoint_names(config.get("input_layers"));
	let outputs = endpoint_names(config.get("output_layers"));

	if inputs.is_empty() {
		return Err(KerasError::Graph(format!("model `{name}` declares no input layers")));
	}
	let output = match outputs.as_slice() {
		[output] => output.clone(),
		[] => return Err(KerasError::Graph(format!("model `{name}` declares no output layers"))),
		_ => return Err(KerasError::Graph(format!("model `{name}` has several outputs"))),
	};

	Ok(GraphDef {
		name: name.to_string(),
		layers,
		inputs,
		output,
	})
}

/// `[["input_1", 0, 0]]` or a single `["input_1", 0, 0]`.
fn endpoint_names(value: Option<&Value>) -> Vec<String> {
	match value {
		Some(Value::Array(items)) => match items.first() {
			Some(Value::String(name)) => vec![name.clone()],
			_ => items
				.iter()
				.filter_map(|item| item.get(0).and_then(Value::as_str).map(str::to_string))
				.collect(),
		},
		_ => Vec::new(),
	}
}

/// Layers a functional layer is called on.
///
/// Keras 2 writes `[[["conv", 0, 0, {}], ...]]`, Keras 3 nests
/// `{"keras_history": ["conv", 0, 0]}` inside the call arguments.
fn inbound_layer_names(layer: &str, nodes: &Value) -> Result<Vec<String>, KerasError> {
	let nodes = match nodes {
		Value::Array(nodes) => nodes,
		_ => return Ok(Vec::new()),
	};

	match nodes.as_slice() {
		[] => Ok(Vec::new()),
		[node] => {
			let mut names = Vec::new();
			collect_history(node, &mut names);
			Ok(names)
		}
		_ => Err(KerasError::Graph(format!("layer `{layer}` is shared between several calls"))),
	}
}

fn collect_history(value: &Value, names: &mut Vec<String>) {
	match value {
		Value::Object(map) => match map.get("keras_history").and_then(Value::as_array) {
			Some(history) => {
				if let Some(name) = history.first().and_then(Value::as_str) {
					names.push(name.to_string());
				}
			}
			None => map.values().for_each(|v| collect_history(v, names)),
		},
		Value::Array(items) => match (items.first(), items.get(1)) {
			(Some(Value::String(name)), Some(Value::Number(_))) => names.push(name.clone()),
			_ => items.iter().for_each(|v| collect_history(v, names)),
		},
		_ => {}
	}
}

/// Parses a top level `model_config` document.
pub fn parse_model(config: &Value) -> Result<GraphDef, KerasError> {
	let raw = RawLayer::deserialize(config)?;
	let name = raw.name();

	match parse_kind(&raw, &name)? {
		LayerKind::Model(graph) => Ok(graph),
		_ => Err(KerasError::Graph(format!(
			"top level object is a `{}` layer, not a model",
			raw.class_name
		))),
	}
}

/// Removes the [`STRIPPABLE_KEYS`] from every layer config in the document,
/// returning how many were removed.
pub fn strip_unsupported_keys(value: &mut Value) -> usize {
	let mut removed = 0;

	match value {
		Value::Object(map) => {
			let class = map.get("class_name").and_then(Value::as_str).map(str::to_string);
			if let (Some(class), Some(Value::Object(config))) = (class, map.get_mut("config")) {
				for (layer_class, key) in STRIPPABLE_KEYS {
					if class == layer_class && config.remove(key).is_some() {
						removed += 1;
					}
				}
			}
			for child in map.values_mut() {
				removed += strip_unsupported_keys(child);
			}
		}
		Value::Array(items) => {
			for child in items {
				removed += strip_unsupported_keys(child);
			}
		}
		_ => {}
	}

	removed
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn depthwise(groups: Option<usize>) -> Value {
		let mut config = json!({
			"name": "expanded_conv_depthwise",
			"trainable": true,
			"dtype": "float32",
			"kernel_size": [3, 3],
			"strides": [1, 1],
			"padding": "same",
			"data_format": "channels_last",
			"dilation_rate": [1, 1],
			"activation": "linear",
			"use_bias": false,
			"depth_multiplier": 1,
			"depthwise_initializer": {"class_name": "VarianceScaling", "config": {}},
			"bias_initializer": {"class_name": "Zeros", "config": {}},
			"depthwise_regularizer": null,
			"bias_regularizer": null,
			"activity_regularizer": null,
			"depthwise_constraint": null,
			"bias_constraint": null
		});
		if let Some(groups) = groups {
			config["groups"] = json!(groups);
		}
		json!({"class_name": "DepthwiseConv2D", "config": config})
	}

	fn sequential(layers: Vec<Value>) -> Value {
		json!({"class_name": "Sequential", "config": {"name": "sequential_1", "layers": layers}})
	}

	#[test]
	fn sequential_layers_chain_in_order() {
		let model = sequential(vec![
			json!({"class_name": "InputLayer", "config": {"name": "in", "batch_input_shape": [null, 4, 4, 3]}}),
			json!({"class_name": "GlobalAveragePooling2D", "config": {"name": "gap"}}),
			json!({"class_name": "Dense", "config": {"name": "out", "units": 2, "activation": "softmax"}}),
		]);

		let graph = parse_model(&model).unwrap();
		assert_eq!(graph.inputs, vec!["sequential_1_input"]);
		assert_eq!(graph.output, "out");
		assert_eq!(graph.layers[1].inbound, vec!["in"]);
		assert_eq!(
			graph.layers[2].kind,
			LayerKind::Dense(DenseParams { units: 2, use_bias: true, activation: ActivationKind::Softmax })
		);
	}

	#[test]
	fn depthwise_groups_is_rejected_and_strippable() {
		let mut model = sequential(vec![depthwise(Some(1))]);

		let err = parse_model(&model).unwrap_err();
		assert!(matches!(err, KerasError::UnexpectedKey { ref key, .. } if key == "groups"));

		assert_eq!(strip_unsupported_keys(&mut model), 1);
		let graph = parse_model(&model).unwrap();
		match &graph.layers[0].kind {
			LayerKind::DepthwiseConv2D(params) => {
				assert_eq!(params.padding, Padding::Same);
				assert!(!params.use_bias);
			}
			other => panic!("unexpected layer {other:?}"),
		}
	}

	#[test]
	fn conv_groups_is_kept() {
		let mut model = sequential(vec![json!({
			"class_name": "Conv2D",
			"config": {"name": "c", "filters": 8, "kernel_size": 3, "groups": 1, "strides": 2}
		})]);
		assert_eq!(strip_unsupported_keys(&mut model), 0);

		let graph = parse_model(&model).unwrap();
		match &graph.layers[0].kind {
			LayerKind::Conv2D(params) => {
				assert_eq!(params.kernel, [3, 3]);
				assert_eq!(params.strides, [2, 2]);
				assert_eq!(params.padding, Padding::Valid);
			}
			other => panic!("unexpected layer {other:?}"),
		}
	}

	#[test]
	fn functional_inbound_nodes_in_both_notations() {
		let keras2 = json!({
			"class_name": "Functional",
			"config": {
				"name": "model1",
				"layers": [
					{"class_name": "InputLayer", "name": "input_1", "config": {"name": "input_1"}, "inbound_nodes": []},
					{"class_name": "ReLU", "name": "a", "config": {"name": "a", "max_value": 6.0},
						"inbound_nodes": [[["input_1", 0, 0, {}]]]},
					{"class_name": "Add", "name": "sum", "config": {"name": "sum"},
						"inbound_nodes": [[["input_1", 0, 0, {}], ["a", 0, 0, {}]]]}
				],
				"input_layers": [["input_1", 0, 0]],
				"output_layers": [["sum", 0, 0]]
			}
		});
		let graph = parse_model(&keras2).unwrap();
		assert_eq!(graph.layers[2].inbound, vec!["input_1", "a"]);
		assert_eq!(graph.layers[1].kind, LayerKind::ReLU(ReluParams { max_value: Some(6.0) }));

		let keras3 = json!({
			"class_name": "Functional",
			"config": {
				"name": "model1",
				"layers": [
					{"class_name": "InputLayer", "name": "input_layer", "config": {"name": "input_layer"}, "inbound_nodes": []},
					{"class_name": "Add", "name": "sum", "config": {"name": "sum"},
						"inbound_nodes": [{"args": [[
							{"class_name": "__keras_tensor__", "config": {"keras_history": ["input_layer", 0, 0]}},
							{"class_name": "__keras_tensor__", "config": {"keras_history": ["input_layer", 0, 0]}}
						]], "kwargs": {}}]}
				],
				"input_layers": ["input_layer", 0, 0],
				"output_layers": ["sum", 0, 0]
			}
		});
		let graph = parse_model(&keras3).unwrap();
		assert_eq!(graph.inputs, vec!["input_layer"]);
		assert_eq!(graph.layers[1].inbound, vec!["input_layer", "input_layer"]);
	}

	#[test]
	fn zero_padding_forms() {
		for (padding, expected) in [
			(json!(1), [1, 1, 1, 1]),
			(json!([2, 3]), [2, 2, 3, 3]),
			(json!([[0, 1], [0, 1]]), [0, 1, 0, 1]),
		] {
			let model = sequential(vec![json!({"class_name": "ZeroPadding2D", "config": {"name": "p", "padding": padding}})]);
			assert_eq!(parse_model(&model).unwrap().layers[0].kind, LayerKind::ZeroPadding2D(expected));
		}
	}

	#[test]
	fn unknown_layers_and_formats_are_reported() {
		let model = sequential(vec![json!({"class_name": "LSTM", "config": {"name": "rnn"}})]);
		assert!(matches!(parse_model(&model), Err(KerasError::UnsupportedLayer(ref c)) if c == "LSTM"));

		let model = sequential(vec![json!({
			"class_name": "Conv2D",
			"config": {"name": "c", "filters": 1, "kernel_size": 1, "data_format": "channels_first"}
		})]);
		assert!(matches!(parse_model(&model), Err(KerasError::LayerConfig { .. })));
	}
}
