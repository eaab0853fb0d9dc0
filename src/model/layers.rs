//! Layer definitions of the baseline convolutional network.

use serde::{Deserialize, Serialize};

use crate::errors::{ModelError, ModelResult};
use crate::ops::{self, ConvParams};
use crate::tensor::{Lcg, Tensor};
use crate::utils::{DotKernel, dot};

/// Callback invoked with the fully-qualified name and the input tensor of every
/// weighted layer, right before the layer consumes it.
pub type InputHook<'a> = dyn FnMut(&str, &mut Tensor) + 'a;

/// 2-D convolution with the weight stored as `out_channels x (in_channels * k * k)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Conv2d {
    /// He-normal initialized convolution.
    pub fn init(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        rng: &mut Lcg,
    ) -> Self {
        let fan_in = in_channels * kernel * kernel;
        Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            weight: he_normal(out_channels * fan_in, fan_in, rng),
            bias: small_bias(out_channels, rng),
        }
    }

    pub fn params(&self) -> ConvParams {
        ConvParams {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel: self.kernel,
            stride: self.stride,
            padding: self.padding,
        }
    }

    /// Columns of the weight matrix.
    pub fn cols(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }

    /// Checks the stored tensors against the declared dimensions.
    pub fn validate(&self, name: &str) -> ModelResult<()> {
        if self.kernel == 0 || self.stride == 0 {
            return Err(ModelError::InvalidArchitecture {
                message: format!("{}: kernel and stride must be positive", name),
            });
        }
        check_len(name, "weight", self.weight.len(), self.out_channels * self.cols())?;
        check_len(name, "bias", self.bias.len(), self.out_channels)
    }

    pub fn forward(&self, name: &str, input: &Tensor) -> ModelResult<Tensor> {
        let kernel = DotKernel::detect();
        let cols = self.cols();
        ops::conv2d_with(name, input, &self.params(), |columns, patch_len, out| {
            let patches = columns.len() / patch_len;
            for (oc, row) in self.weight.chunks_exact(cols).enumerate() {
                let bias = self.bias[oc];
                let out_row = &mut out[oc * patches..(oc + 1) * patches];
                for (p, value) in out_row.iter_mut().enumerate() {
                    *value = dot(kernel, row, &columns[p * patch_len..(p + 1) * patch_len]) + bias;
                }
            }
        })
    }
}

/// Fully connected layer with the weight stored as `out_features x in_features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Linear {
    /// Initialized with a `1/sqrt(fan_in)` scale so logits stay near unit range.
    pub fn init(in_features: usize, out_features: usize, rng: &mut Lcg) -> Self {
        let scale = 1.0 / (in_features as f32).sqrt();
        let weight = (0..out_features * in_features)
            .map(|_| rng.next_gaussian_pair().0 * scale)
            .collect();
        Self {
            in_features,
            out_features,
            weight,
            bias: small_bias(out_features, rng),
        }
    }

    pub fn validate(&self, name: &str) -> ModelResult<()> {
        check_len(name, "weight", self.weight.len(), self.out_features * self.in_features)?;
        check_len(name, "bias", self.bias.len(), self.out_features)
    }

    pub fn forward(&self, name: &str, input: &Tensor) -> ModelResult<Tensor> {
        let kernel = DotKernel::detect();
        ops::linear_with(
            name,
            input,
            self.in_features,
            self.out_features,
            |row, _, out| {
                for (o, w) in self.weight.chunks_exact(self.in_features).enumerate() {
                    out[o] = dot(kernel, w, row) + self.bias[o];
                }
            },
        )
    }
}

/// Residual block: `relu(conv2(relu(conv1(x))) + shortcut(x))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub conv1: Conv2d,
    pub conv2: Conv2d,
    pub downsample: Option<Conv2d>,
}

impl BasicBlock {
    pub fn init(in_channels: usize, out_channels: usize, stride: usize, rng: &mut Lcg) -> Self {
        let conv1 = Conv2d::init(in_channels, out_channels, 3, stride, 1, rng);
        let conv2 = Conv2d::init(out_channels, out_channels, 3, 1, 1, rng);
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Conv2d::init(in_channels, out_channels, 1, stride, 0, rng));
        Self {
            conv1,
            conv2,
            downsample,
        }
    }

    pub fn validate(&self, name: &str) -> ModelResult<()> {
        self.conv1.validate(&format!("{}.conv1", name))?;
        self.conv2.validate(&format!("{}.conv2", name))?;
        if let Some(downsample) = &self.downsample {
            downsample.validate(&format!("{}.downsample", name))?;
        }
        Ok(())
    }

    pub fn forward(&self, name: &str, input: Tensor, hook: &mut InputHook<'_>) -> ModelResult<Tensor> {
        let identity = match &self.downsample {
            Some(downsample) => {
                let fqn = format!("{}.downsample", name);
                let mut shortcut = input.clone();
                hook(&fqn, &mut shortcut);
                downsample.forward(&fqn, &shortcut)?
            }
            None => input.clone(),
        };

        let fqn = format!("{}.conv1", name);
        let mut hidden = input;
        hook(&fqn, &mut hidden);
        let mut hidden = self.conv1.forward(&fqn, &hidden)?;
        ops::relu_inplace(&mut hidden);

        let fqn = format!("{}.conv2", name);
        hook(&fqn, &mut hidden);
        let mut out = self.conv2.forward(&fqn, &hidden)?;
        ops::add_inplace(&mut out, &identity)?;
        ops::relu_inplace(&mut out);
        Ok(out)
    }
}

/// One stage of the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Layer {
    Conv(Conv2d),
    Relu,
    MaxPool { kernel: usize, stride: usize },
    Block(BasicBlock),
    GlobalAvgPool,
    Linear(Linear),
}

impl Layer {
    pub fn validate(&self, name: &str) -> ModelResult<()> {
        match self {
            Layer::Conv(conv) => conv.validate(name),
            Layer::Block(block) => block.validate(name),
            Layer::Linear(linear) => linear.validate(name),
            Layer::MaxPool { kernel, stride } if *kernel == 0 || *stride == 0 => {
                Err(ModelError::InvalidArchitecture {
                    message: format!("{}: kernel and stride must be positive", name),
                })
            }
            Layer::Relu | Layer::MaxPool { .. } | Layer::GlobalAvgPool => Ok(()),
        }
    }

    pub fn forward(&self, name: &str, input: Tensor, hook: &mut InputHook<'_>) -> ModelResult<Tensor> {
        match self {
            Layer::Conv(conv) => {
                let mut input = input;
                hook(name, &mut input);
                conv.forward(name, &input)
            }
            Layer::Relu => {
                let mut input = input;
                ops::relu_inplace(&mut input);
                Ok(input)
            }
            Layer::MaxPool { kernel, stride } => ops::max_pool2d(name, &input, *kernel, *stride),
            Layer::Block(block) => block.forward(name, input, hook),
            Layer::GlobalAvgPool => ops::global_avg_pool(&input),
            Layer::Linear(linear) => {
                let mut input = input;
                hook(name, &mut input);
                linear.forward(name, &input)
            }
        }
    }
}

/// A layer together with its name inside the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedLayer {
    pub name: String,
    pub layer: Layer,
}

fn he_normal(len: usize, fan_in: usize, rng: &mut Lcg) -> Vec<f32> {
    let std = (2.0 / fan_in as f32).sqrt();
    (0..len).map(|_| rng.next_gaussian_pair().0 * std).collect()
}

fn small_bias(len: usize, rng: &mut Lcg) -> Vec<f32> {
    (0..len).map(|_| (rng.next_unit() - 0.5) * 0.02).collect()
}

fn check_len(name: &str, tensor: &str, actual: usize, expected: usize) -> ModelResult<()> {
    if actual != expected {
        return Err(ModelError::InvalidArchitecture {
            message: format!("{}.{} has {} values, expected {}", name, tensor, actual, expected),
        });
    }
    Ok(())
}
