use super::architecture::{ActivationKind, GraphDef, LayerDef, LayerKind, Padding};
use super::weights::{WeightArray, WeightStore};
use super::KerasError;
use burn::prelude::*;
use burn::tensor::activation;
use burn::tensor::ElementConversion;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use std::collections::HashMap;

/// Activations flowing between layers. Spatial tensors are NCHW.
#[derive(Debug, Clone)]
pub enum Features<B: Backend> {
	Spatial(Tensor<B, 4>),
	Flat(Tensor<B, 2>),
}

impl<B: Backend> Features<B> {
	fn kind(&self) -> &'static str {
		match self {
			Features::Spatial(_) => "a spatial",
			Features::Flat(_) => "a flat",
		}
	}

	fn activate(self, kind: ActivationKind) -> Self {
		match self {
			Features::Spatial(x) => Features::Spatial(activate(x, kind)),
			Features::Flat(x) => Features::Flat(activate(x, kind)),
		}
	}
}

/// Softmax is taken over dim 1, the channel axis of both layouts.
fn activate<B: Backend, const D: usize>(x: Tensor<B, D>, kind: ActivationKind) -> Tensor<B, D> {
	match kind {
		ActivationKind::Linear => x,
		ActivationKind::Relu => activation::relu(x),
		ActivationKind::Relu6 => x.clamp(0.0, 6.0),
		ActivationKind::Sigmoid => activation::sigmoid(x),
		ActivationKind::Tanh => activation::tanh(x),
		ActivationKind::Softmax => activation::softmax(x, 1),
	}
}

/// Keras `same` padding: the output has `ceil(input / stride)` positions and
/// the odd pixel, if any, goes after.
fn same_padding(input: usize, kernel: usize, stride: usize, dilation: usize) -> (usize, usize) {
	let out = input.div_ceil(stride);
	let span = (kernel - 1) * dilation + 1;
	let total = ((out.max(1) - 1) * stride + span).saturating_sub(input);
	(total / 2, total - total / 2)
}

#[derive(Debug)]
struct Convolution<B: Backend> {
	/// `[out, in / groups, kh, kw]`
	weight: Tensor<B, 4>,
	bias: Option<Tensor<B, 1>>,
	kernel: [usize; 2],
	strides: [usize; 2],
	dilation: [usize; 2],
	groups: usize,
	padding: Padding,
	activation: ActivationKind,
}

impl<B: Backend> Convolution<B> {
	fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
		let x = match self.padding {
			Padding::Valid => x,
			Padding::Same => {
				let [_, _, height, width] = x.dims();
				let (top, bottom) = same_padding(height, self.kernel[0], self.strides[0], self.dilation[0]);
				let (left, right) = same_padding(width, self.kernel[1], self.strides[1], self.dilation[1]);
				if top + bottom + left + right == 0 {
					x
				} else {
					x.pad((left, right, top, bottom), 0.0.elem())
				}
			}
		};

		let options = ConvOptions::new(self.strides, [0, 0], self.dilation, self.groups);
		activate(conv2d(x, self.weight.clone(), self.bias.clone(), options), self.activation)
	}
}

#[derive(Debug)]
enum Op<B: Backend> {
	Input,
	Conv(Convolution<B>),
	/// Inference time batch norm folded into `x * scale + shift`.
	BatchNorm {
		scale: Tensor<B, 1>,
		shift: Tensor<B, 1>,
	},
	Relu {
		max_value: Option<f64>,
	},
	Activation(ActivationKind),
	ZeroPad([usize; 4]),
	Add,
	GlobalAveragePool {
		keepdims: bool,
	},
	Flatten,
	Dense {
		/// `[in, out]`, the Keras layout
		weight: Tensor<B, 2>,
		bias: Option<Tensor<B, 1>>,
		activation: ActivationKind,
	},
	Identity,
	Model(Network<B>),
}

#[derive(Debug)]
struct Node<B: Backend> {
	name: String,
	op: Op<B>,
	inbound: Vec<String>,
}

/// A Keras model rebuilt as burn tensor operations, evaluated node by node in
/// the order the layers were saved.
#[derive(Debug)]
pub struct Network<B: Backend> {
	name: String,
	nodes: Vec<Node<B>>,
	input: String,
	output: String,
}

fn tensor<B: Backend, const D: usize>(array: &WeightArray, device: &B::Device) -> Tensor<B, D> {
	let data = TensorData::new(array.values.clone(), array.shape.clone());
	Tensor::from_data(data.convert::<B::FloatElem>(), device)
}

fn check_dims(layer: &str, param: &str, array: &WeightArray, expected: &[Option<usize>]) -> Result<(), KerasError> {
	let matches = array.shape.len() == expected.len()
		&& array
			.shape
			.iter()
			.zip(expected)
			.all(|(dim, want)| want.map_or(true, |w| w == *dim));

	if matches {
		return Ok(());
	}

	let expected = expected
		.iter()
		.map(|d| d.map_or("?".to_string(), |d| d.to_string()))
		.collect::<Vec<_>>()
		.join(", ");
	Err(KerasError::WeightShape {
		layer: layer.to_string(),
		param: param.to_string(),
		shape: array.shape.clone(),
		expected: format!("[{expected}]"),
	})
}

fn bias<B: Backend>(
	weights: &WeightStore,
	layer: &str,
	width: usize,
	device: &B::Device,
) -> Result<Tensor<B, 1>, KerasError> {
	let array = weights.require_rank(layer, "bias", 1)?;
	check_dims(layer, "bias", array, &[Some(width)])?;
	Ok(tensor(array, device))
}

fn build_op<B: Backend>(layer: &LayerDef, weights: &WeightStore, device: &B::Device) -> Result<Op<B>, KerasError> {
	let name = layer.name.as_str();

	let op = match &layer.kind {
		LayerKind::Input => Op::Input,
		LayerKind::Conv2D(params) => {
			let kernel = weights.require_rank(name, "kernel", 4)?;
			check_dims(name, "kernel", kernel, &[Some(params.kernel[0]), Some(params.kernel[1]), None, Some(params.filters)])?;
			Op::Conv(Convolution {
				// [kh, kw, in, out] -> [out, in, kh, kw]
				weight: tensor::<B, 4>(kernel, device).permute([3, 2, 0, 1]),
				bias: match params.use_bias {
					true => Some(bias(weights, name, params.filters, device)?),
					false => None,
				},
				kernel: params.kernel,
				strides: params.strides,
				dilation: params.dilation,
				groups: params.groups,
				padding: params.padding,
				activation: params.activation,
			})
		}
		LayerKind::DepthwiseConv2D(params) => {
			let kernel = weights.require_rank(name, "depthwise_kernel", 4)?;
			let multiplier = params.depth_multiplier;
			check_dims(
				name,
				"depthwise_kernel",
				kernel,
				&[Some(params.kernel[0]), Some(params.kernel[1]), None, Some(multiplier)],
			)?;
			let channels = kernel.shape[2];
			let out = channels * multiplier;
			// output channel `c * multiplier + m` reads only input channel `c`
			let weight = tensor::<B, 4>(kernel, device)
				.reshape([params.kernel[0], params.kernel[1], out, 1])
				.permute([2, 3, 0, 1]);
			Op::Conv(Convolution {
				weight,
				bias: match params.use_bias {
					true => Some(bias(weights, name, out, device)?),
					false => None,
				},
				kernel: params.kernel,
				strides: params.strides,
				dilation: params.dilation,
				groups: channels,
				padding: params.padding,
				activation: params.activation,
			})
		}
		LayerKind::BatchNormalization(params) => {
			let mean = weights.require_rank(name, "moving_mean", 1)?;
			let channels = mean.shape[0];
			let variance = weights.require_rank(name, "moving_variance", 1)?;
			check_dims(name, "moving_variance", variance, &[Some(channels)])?;

			let optional = |param: &str, enabled: bool| -> Result<Option<&WeightArray>, KerasError> {
				if !enabled {
					return Ok(None);
				}
				let array = weights.require_rank(name, param, 1)?;
				check_dims(name, param, array, &[Some(channels)])?;
				Ok(Some(array))
			};
			let gamma = optional("gamma", params.scale)?;
			let beta = optional("beta", params.center)?;

			let mut scale = Vec::with_capacity(channels);
			let mut shift = Vec::with_capacity(channels);
			for c in 0..channels {
				let inv = 1.0 / (variance.values[c] as f64 + params.epsilon).sqrt();
				let s = inv * gamma.map_or(1.0, |g| g.values[c] as f64);
				let b = beta.map_or(0.0, |b| b.values[c] as f64);
				scale.push(s as f32);
				shift.push((b - mean.values[c] as f64 * s) as f32);
			}

			Op::BatchNorm {
				scale: tensor(&WeightArray::new(vec![channels], scale), device),
				shift: tensor(&WeightArray::new(vec![channels], shift), device),
			}
		}
		LayerKind::ReLU(params) => Op::Relu { max_value: params.max_value },
		LayerKind::Activation(kind) => Op::Activation(*kind),
		LayerKind::ZeroPadding2D(pad) => Op::ZeroPad(*pad),
		LayerKind::Add => Op::Add,
		LayerKind::GlobalAveragePooling2D { keepdims } => Op::GlobalAveragePool { keepdims: *keepdims },
		LayerKind::Flatten => Op::Flatten,
		LayerKind::Dense(params) => {
			let kernel = weights.require_rank(name, "kernel", 2)?;
			check_dims(name, "kernel", kernel, &[None, Some(params.units)])?;
			Op::Dense {
				weight: tensor(kernel, device),
				bias: match params.use_bias {
					true => Some(bias(weights, name, params.units, device)?),
					false => None,
				},
				activation: params.activation,
			}
		}
		LayerKind::Dropout => Op::Identity,
		LayerKind::Softmax => Op::Activation(ActivationKind::Softmax),
		LayerKind::Model(graph) => Op::Model(Network::build(graph, weights, device)?),
	};

	Ok(op)
}

impl<B: Backend> Network<B> {
	/// Binds every layer of `graph` to its weights in `weights`.
	pub fn build(graph: &GraphDef, weights: &WeightStore, device: &B::Device) -> Result<Self, KerasError> {
		let input = match graph.inputs.as_slice() {
			[input] => input.clone(),
			_ => {
				return Err(KerasError::Graph(format!(
					"model `{}` has {} inputs, expected one",
					graph.name,
					graph.inputs.len()
				)))
			}
		};

		let nodes = graph
			.layers
			.iter()
			.map(|layer| -> Result<Node<B>, KerasError> {
				Ok(Node {
					name: layer.name.clone(),
					op: build_op(layer, weights, device)?,
					inbound: layer.inbound.clone(),
				})
			})
			.collect::<Result<Vec<_>, KerasError>>()?;

		if !nodes.iter().any(|node| node.name == graph.output) {
			return Err(KerasError::Graph(format!(
				"output layer `{}` is not part of model `{}`",
				graph.output, graph.name
			)));
		}

		Ok(Self {
			name: graph.name.clone(),
			nodes,
			input,
			output: graph.output.clone(),
		})
	}

	/// Class probabilities for a batch of NHWC images.
	pub fn classify(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>, KerasError> {
		match self.forward(Features::Spatial(images.permute([0, 3, 1, 2])))? {
			Features::Flat(x) => Ok(x),
			Features::Spatial(x) => Err(KerasError::Graph(format!(
				"model `{}` ends in a {:?} feature map instead of a probability vector",
				self.name,
				x.dims()
			))),
		}
	}

	pub fn forward(&self, x: Features<B>) -> Result<Features<B>, KerasError> {
		let mut outputs: HashMap<&str, Features<B>> = HashMap::new();
		outputs.insert(self.input.as_str(), x);

		for node in &self.nodes {
			if matches!(node.op, Op::Input) && outputs.contains_key(node.name.as_str()) {
				continue;
			}

			let mut inputs = Vec::with_capacity(node.inbound.len());
			for source in &node.inbound {
				let value = outputs.get(source.as_str()).ok_or_else(|| {
					KerasError::Graph(format!("layer `{}` reads `{source}` before it is computed", node.name))
				})?;
				inputs.push(value.clone());
			}

			let value = self.eval(node, inputs)?;
			outputs.insert(node.name.as_str(), value);
		}

		outputs
			.remove(self.output.as_str())
			.ok_or_else(|| KerasError::Graph(format!("model `{}` never computed its output", self.name)))
	}

	fn eval(&self, node: &Node<B>, mut inputs: Vec<Features<B>>) -> Result<Features<B>, KerasError> {
		let wrong_input = |x: &Features<B>| {
			KerasError::Graph(format!("layer `{}` cannot take {} input", node.name, x.kind()))
		};

		if let Op::Add = node.op {
			let mut inputs = inputs.into_iter();
			let first = inputs
				.next()
				.ok_or_else(|| KerasError::Graph(format!("layer `{}` has no inputs", node.name)))?;
			return inputs.try_fold(first, |acc, x| match (acc, x) {
				(Features::Spatial(a), Features::Spatial(b)) => Ok(Features::Spatial(a + b)),
				(Features::Flat(a), Features::Flat(b)) => Ok(Features::Flat(a + b)),
				(_, x) => Err(wrong_input(&x)),
			});
		}

		if inputs.len() != 1 {
			return Err(KerasError::Graph(format!(
				"layer `{}` expects one input, got {}",
				node.name,
				inputs.len()
			)));
		}
		let x = inputs.remove(0);

		let y = match (&node.op, x) {
			(Op::Input | Op::Identity, x) => x,
			(Op::Conv(conv), Features::Spatial(x)) => Features::Spatial(conv.forward(x)),
			(Op::BatchNorm { scale, shift }, Features::Spatial(x)) => {
				let [c] = scale.dims();
				Features::Spatial(x * scale.clone().reshape([1, c, 1, 1]) + shift.clone().reshape([1, c, 1, 1]))
			}
			(Op::BatchNorm { scale, shift }, Features::Flat(x)) => {
				let [c] = scale.dims();
				Features::Flat(x * scale.clone().reshape([1, c]) + shift.clone().reshape([1, c]))
			}
			(Op::Relu { max_value: None }, x) => x.activate(ActivationKind::Relu),
			(Op::Relu { max_value: Some(max) }, Features::Spatial(x)) => Features::Spatial(x.clamp(0.0, *max)),
			(Op::Relu { max_value: Some(max) }, Features::Flat(x)) => Features::Flat(x.clamp(0.0, *max)),
			(Op::Activation(kind), x) => x.activate(*kind),
			(Op::ZeroPad([top, bottom, left, right]), Features::Spatial(x)) => {
				Features::Spatial(x.pad((*left, *right, *top, *bottom), 0.0.elem()))
			}
			(Op::GlobalAveragePool { keepdims }, Features::Spatial(x)) => {
				let pooled = x.mean_dim(3).mean_dim(2);
				match keepdims {
					true => Features::Spatial(pooled),
					false => {
						let [n, c, _, _] = pooled.dims();
						Features::Flat(pooled.reshape([n, c]))
					}
				}
			}
			(Op::Flatten, Features::Spatial(x)) => {
				// Keras flattens channels last
				let [n, c, h, w] = x.dims();
				Features::Flat(x.permute([0, 2, 3, 1]).reshape([n, h * w * c]))
			}
			(Op::Flatten, x @ Features::Flat(_)) => x,
			(Op::Dense { weight, bias, activation }, Features::Flat(x)) => {
				let y = x.matmul(weight.clone());
				let y = match bias {
					Some(bias) => y + bias.clone().unsqueeze::<2>(),
					None => y,
				};
				Features::Flat(activate(y, *activation))
			}
			(Op::Model(network), x) => network.forward(x)?,
			(_, x) => return Err(wrong_input(&x)),
		};

		Ok(y)
	}

	/// Width of the final probability vector, when the output layer states it.
	pub fn output_width(&self) -> Option<usize> {
		self.width_of(&self.output)
	}

	fn width_of(&self, name: &str) -> Option<usize> {
		let node = self.nodes.iter().find(|node| node.name == name)?;
		match &node.op {
			Op::Dense { weight, .. } => Some(weight.dims()[1]),
			Op::Model(network) => network.output_width(),
			Op::Input | Op::Identity | Op::Activation(_) | Op::Relu { .. } | Op::BatchNorm { .. } => {
				node.inbound.first().and_then(|source| self.width_of(source))
			}
			_ => None,
		}
	}
}
