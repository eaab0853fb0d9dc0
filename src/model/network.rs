//! The baseline network: a reduced ResNet-style classifier.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::layers::{BasicBlock, Conv2d, InputHook, Layer, Linear, NamedLayer};
use crate::errors::{ModelError, ModelResult};
use crate::tensor::{Lcg, Tensor};

/// Channel layout of the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchConfig {
    pub input_channels: usize,
    pub stem_channels: usize,
    pub stage_channels: Vec<usize>,
    pub num_classes: usize,
}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            input_channels: 3,
            stem_channels: 8,
            stage_channels: vec![8, 16, 32],
            num_classes: 10,
        }
    }
}

impl ArchConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.input_channels == 0 || self.stem_channels == 0 || self.num_classes == 0 {
            return Err(ModelError::InvalidArchitecture {
                message: "input_channels, stem_channels and num_classes must be greater than 0"
                    .to_string(),
            });
        }
        if self.stage_channels.is_empty() || self.stage_channels.contains(&0) {
            return Err(ModelError::InvalidArchitecture {
                message: "stage_channels must be non-empty and hold positive widths".to_string(),
            });
        }
        Ok(())
    }
}

/// Kind of a weighted layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightKind {
    Conv,
    Linear,
}

/// Read-only view of one weighted layer.
#[derive(Debug)]
pub struct WeightView<'a> {
    pub name: String,
    pub kind: WeightKind,
    pub rows: usize,
    pub cols: usize,
    pub weight: &'a [f32],
}

/// Mutable view of one weighted layer.
#[derive(Debug)]
pub struct WeightViewMut<'a> {
    pub name: String,
    pub kind: WeightKind,
    pub rows: usize,
    pub cols: usize,
    pub weight: &'a mut [f32],
}

/// Feed-forward network of named layers.
///
/// `Clone` is a deep copy: every transformation of the pipeline works on its own
/// clone, and `PartialEq` compares every weight so isolation can be checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    arch: ArchConfig,
    layers: Vec<NamedLayer>,
}

impl Network {
    /// Builds the stem → max-pool → residual stages → pool → classifier network
    /// with deterministic weights.
    pub fn resnet_like(arch: ArchConfig, seed: u64) -> ModelResult<Self> {
        arch.validate()?;
        let mut rng = Lcg::new(seed);
        let mut layers = vec![
            NamedLayer {
                name: "stem".to_string(),
                layer: Layer::Conv(Conv2d::init(
                    arch.input_channels,
                    arch.stem_channels,
                    3,
                    2,
                    1,
                    &mut rng,
                )),
            },
            NamedLayer {
                name: "stem_relu".to_string(),
                layer: Layer::Relu,
            },
            NamedLayer {
                name: "pool".to_string(),
                layer: Layer::MaxPool {
                    kernel: 2,
                    stride: 2,
                },
            },
        ];

        let mut channels = arch.stem_channels;
        for (i, &width) in arch.stage_channels.iter().enumerate() {
            let stride = if i == 0 { 1 } else { 2 };
            layers.push(NamedLayer {
                name: format!("stage{}", i + 1),
                layer: Layer::Block(BasicBlock::init(channels, width, stride, &mut rng)),
            });
            channels = width;
        }

        layers.push(NamedLayer {
            name: "avgpool".to_string(),
            layer: Layer::GlobalAvgPool,
        });
        layers.push(NamedLayer {
            name: "fc".to_string(),
            layer: Layer::Linear(Linear::init(channels, arch.num_classes, &mut rng)),
        });

        Ok(Self { arch, layers })
    }

    /// Loads a checkpoint written by [`Network::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> ModelResult<Self> {
        let content = fs::read_to_string(path)?;
        let network: Network = serde_json::from_str(&content)?;
        network.arch.validate()?;
        for named in &network.layers {
            named.layer.validate(&named.name)?;
        }
        Ok(network)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ModelResult<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn arch(&self) -> &ArchConfig {
        &self.arch
    }

    pub fn layers(&self) -> &[NamedLayer] {
        &self.layers
    }

    pub fn forward(&self, input: &Tensor) -> ModelResult<Tensor> {
        self.forward_with_hook(input, &mut |_, _| {})
    }

    /// Forward pass that lets the caller observe or rewrite the input of every
    /// weighted layer (used by calibration and fake quantization).
    pub fn forward_with_hook(
        &self,
        input: &Tensor,
        hook: &mut InputHook<'_>,
    ) -> ModelResult<Tensor> {
        match input.shape() {
            &[_, channels, _, _] if channels == self.arch.input_channels => {}
            other => {
                return Err(ModelError::InputShapeMismatch {
                    expected: vec![0, self.arch.input_channels, 0, 0],
                    actual: other.to_vec(),
                });
            }
        }

        let mut x = input.clone();
        for named in &self.layers {
            x = named.layer.forward(&named.name, x, hook)?;
        }
        Ok(x)
    }

    /// Every convolution and linear layer in forward order.
    pub fn weighted_layers(&self) -> Vec<WeightView<'_>> {
        let mut views = Vec::new();
        for named in &self.layers {
            match &named.layer {
                Layer::Conv(conv) => views.push(conv_view(named.name.clone(), conv)),
                Layer::Block(block) => {
                    views.push(conv_view(format!("{}.conv1", named.name), &block.conv1));
                    views.push(conv_view(format!("{}.conv2", named.name), &block.conv2));
                    if let Some(downsample) = &block.downsample {
                        views.push(conv_view(
                            format!("{}.downsample", named.name),
                            downsample,
                        ));
                    }
                }
                Layer::Linear(linear) => views.push(WeightView {
                    name: named.name.clone(),
                    kind: WeightKind::Linear,
                    rows: linear.out_features,
                    cols: linear.in_features,
                    weight: &linear.weight,
                }),
                Layer::Relu | Layer::MaxPool { .. } | Layer::GlobalAvgPool => {}
            }
        }
        views
    }

    pub fn weighted_layers_mut(&mut self) -> Vec<WeightViewMut<'_>> {
        let mut views = Vec::new();
        for named in &mut self.layers {
            let name = &named.name;
            match &mut named.layer {
                Layer::Conv(conv) => views.push(conv_view_mut(name.clone(), conv)),
                Layer::Block(block) => {
                    let BasicBlock {
                        conv1,
                        conv2,
                        downsample,
                    } = block;
                    views.push(conv_view_mut(format!("{}.conv1", name), conv1));
                    views.push(conv_view_mut(format!("{}.conv2", name), conv2));
                    if let Some(downsample) = downsample {
                        views.push(conv_view_mut(format!("{}.downsample", name), downsample));
                    }
                }
                Layer::Linear(linear) => views.push(WeightViewMut {
                    name: name.clone(),
                    kind: WeightKind::Linear,
                    rows: linear.out_features,
                    cols: linear.in_features,
                    weight: &mut linear.weight,
                }),
                Layer::Relu | Layer::MaxPool { .. } | Layer::GlobalAvgPool => {}
            }
        }
        views
    }

    /// Weight of the weighted layer called `name`.
    pub fn weight(&self, name: &str) -> ModelResult<&[f32]> {
        self.weighted_layers()
            .into_iter()
            .find(|view| view.name == name)
            .map(|view| view.weight)
            .ok_or_else(|| ModelError::UnknownModule {
                name: name.to_string(),
            })
    }
}

fn conv_view(name: String, conv: &Conv2d) -> WeightView<'_> {
    WeightView {
        name,
        kind: WeightKind::Conv,
        rows: conv.out_channels,
        cols: conv.cols(),
        weight: &conv.weight,
    }
}

fn conv_view_mut(name: String, conv: &mut Conv2d) -> WeightViewMut<'_> {
    let cols = conv.cols();
    WeightViewMut {
        name,
        kind: WeightKind::Conv,
        rows: conv.out_channels,
        cols,
        weight: &mut conv.weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_arch() -> ArchConfig {
        ArchConfig {
            input_channels: 3,
            stem_channels: 4,
            stage_channels: vec![4, 8],
            num_classes: 5,
        }
    }

    #[test]
    fn forward_produces_logits() {
        let network = Network::resnet_like(tiny_arch(), 3).unwrap();
        let input = Tensor::randn(vec![2, 3, 32, 32], 11);
        let out = network.forward(&input).unwrap();
        assert_eq!(out.shape(), &[2, 5]);
        assert!(out.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn weighted_layer_names_follow_forward_order() {
        let network = Network::resnet_like(tiny_arch(), 3).unwrap();
        let names: Vec<String> = network
            .weighted_layers()
            .into_iter()
            .map(|view| view.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "stem",
                "stage1.conv1",
                "stage1.conv2",
                "stage2.conv1",
                "stage2.conv2",
                "stage2.downsample",
                "fc"
            ]
        );
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let network = Network::resnet_like(tiny_arch(), 3).unwrap();
        let input = Tensor::randn(vec![1, 1, 32, 32], 11);
        assert!(matches!(
            network.forward(&input),
            Err(ModelError::InputShapeMismatch { .. })
        ));
    }
}
