//! Tensor operators shared by the baseline network, the quantized reference
//! model and the compiled engine.
//!
//! Weighted operators (convolution, linear) are expressed as drivers that
//! lower the input to patches and hand them to a `compute` callback, so each
//! caller only decides how a weight row is multiplied against a patch.

use serde::{Deserialize, Serialize};

use crate::errors::{ModelError, ModelResult};
use crate::tensor::Tensor;
use crate::utils::{ConvGeometry, im2col};

/// Static description of a 2-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvParams {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvParams {
    pub fn geometry(&self, height: usize, width: usize) -> ConvGeometry {
        ConvGeometry {
            in_channels: self.in_channels,
            height,
            width,
            kernel: self.kernel,
            stride: self.stride,
            padding: self.padding,
        }
    }

    /// Output shape for an NCHW input shape.
    pub fn output_shape(&self, layer: &str, input: &[usize]) -> ModelResult<Vec<usize>> {
        let [batch, channels, height, width] = expect_nchw(input)?;
        if channels != self.in_channels {
            return Err(ModelError::ChannelMismatch {
                layer: layer.to_string(),
                expected: self.in_channels,
                actual: channels,
            });
        }
        let geometry = self.geometry(height, width);
        if geometry.patches() == 0 {
            return Err(ModelError::EmptyOutput {
                layer: layer.to_string(),
                height,
                width,
            });
        }
        Ok(vec![
            batch,
            self.out_channels,
            geometry.out_height(),
            geometry.out_width(),
        ])
    }
}

pub(crate) fn expect_nchw(shape: &[usize]) -> ModelResult<[usize; 4]> {
    match shape {
        &[n, c, h, w] => Ok([n, c, h, w]),
        other => Err(ModelError::InputShapeMismatch {
            expected: vec![0, 0, 0, 0],
            actual: other.to_vec(),
        }),
    }
}

/// Runs a convolution image by image.
///
/// `compute(columns, patch_len, out)` receives the im2col buffer of one image
/// and must fill `out`, laid out as `out_channels x patches`.
pub fn conv2d_with<F>(
    layer: &str,
    input: &Tensor,
    params: &ConvParams,
    mut compute: F,
) -> ModelResult<Tensor>
where
    F: FnMut(&[f32], usize, &mut [f32]),
{
    let out_shape = params.output_shape(layer, input.shape())?;
    let [batch, _, height, width] = expect_nchw(input.shape())?;
    let geometry = params.geometry(height, width);
    let image_len = params.in_channels * height * width;
    let out_image_len = params.out_channels * geometry.patches();

    let mut output = Tensor::zeros(out_shape);
    for n in 0..batch {
        let image = &input.data()[n * image_len..(n + 1) * image_len];
        let columns = im2col(&geometry, image);
        let out = &mut output.data_mut()[n * out_image_len..(n + 1) * out_image_len];
        compute(&columns, geometry.patch_len(), out);
    }
    Ok(output)
}

/// Runs a fully connected layer; `compute` sees one input row (a single patch)
/// and fills `out_features` values.
pub fn linear_with<F>(
    layer: &str,
    input: &Tensor,
    in_features: usize,
    out_features: usize,
    mut compute: F,
) -> ModelResult<Tensor>
where
    F: FnMut(&[f32], usize, &mut [f32]),
{
    let (batch, features) = match input.shape() {
        &[n, f] => (n, f),
        other => {
            return Err(ModelError::InputShapeMismatch {
                expected: vec![0, in_features],
                actual: other.to_vec(),
            });
        }
    };
    if features != in_features {
        return Err(ModelError::ChannelMismatch {
            layer: layer.to_string(),
            expected: in_features,
            actual: features,
        });
    }

    let mut output = Tensor::zeros(vec![batch, out_features]);
    for n in 0..batch {
        let row = &input.data()[n * in_features..(n + 1) * in_features];
        let out = &mut output.data_mut()[n * out_features..(n + 1) * out_features];
        compute(row, in_features, out);
    }
    Ok(output)
}

pub fn relu_inplace(tensor: &mut Tensor) {
    for v in tensor.data_mut() {
        *v = v.max(0.0);
    }
}

/// In-place residual addition; both operands must share a shape.
pub fn add_inplace(lhs: &mut Tensor, rhs: &Tensor) -> ModelResult<()> {
    if lhs.shape() != rhs.shape() {
        return Err(ModelError::InputShapeMismatch {
            expected: lhs.shape().to_vec(),
            actual: rhs.shape().to_vec(),
        });
    }
    for (a, b) in lhs.data_mut().iter_mut().zip(rhs.data()) {
        *a += b;
    }
    Ok(())
}

pub fn max_pool_output_shape(
    layer: &str,
    input: &[usize],
    kernel: usize,
    stride: usize,
) -> ModelResult<Vec<usize>> {
    let [batch, channels, height, width] = expect_nchw(input)?;
    let out_h = ConvGeometry::out_dim(height, kernel, stride, 0);
    let out_w = ConvGeometry::out_dim(width, kernel, stride, 0);
    if out_h == 0 || out_w == 0 {
        return Err(ModelError::EmptyOutput {
            layer: layer.to_string(),
            height,
            width,
        });
    }
    Ok(vec![batch, channels, out_h, out_w])
}

pub fn max_pool2d(
    layer: &str,
    input: &Tensor,
    kernel: usize,
    stride: usize,
) -> ModelResult<Tensor> {
    let out_shape = max_pool_output_shape(layer, input.shape(), kernel, stride)?;
    let [batch, channels, height, width] = expect_nchw(input.shape())?;
    let (out_h, out_w) = (out_shape[2], out_shape[3]);

    let mut output = Tensor::zeros(out_shape);
    let out = output.data_mut();
    for plane in 0..batch * channels {
        let src = &input.data()[plane * height * width..(plane + 1) * height * width];
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut best = f32::NEG_INFINITY;
                for ky in 0..kernel {
                    let row = &src[(oy * stride + ky) * width..];
                    for kx in 0..kernel {
                        best = best.max(row[ox * stride + kx]);
                    }
                }
                out[(plane * out_h + oy) * out_w + ox] = best;
            }
        }
    }
    Ok(output)
}

/// Averages each channel plane, producing an `N x C` tensor.
pub fn global_avg_pool(input: &Tensor) -> ModelResult<Tensor> {
    let [batch, channels, height, width] = expect_nchw(input.shape())?;
    let plane_len = height * width;
    let data: Vec<f32> = input
        .data()
        .chunks_exact(plane_len.max(1))
        .map(|plane| plane.iter().sum::<f32>() / plane_len as f32)
        .collect();
    Tensor::new(vec![batch, channels], data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_1x1_conv() {
        let input = Tensor::new(vec![1, 2, 2, 2], (0..8).map(|v| v as f32).collect()).unwrap();
        let params = ConvParams {
            in_channels: 2,
            out_channels: 2,
            kernel: 1,
            stride: 1,
            padding: 0,
        };
        let weight = [1.0, 0.0, 0.0, 1.0];
        let out = conv2d_with("id", &input, &params, |cols, patch_len, out| {
            let patches = cols.len() / patch_len;
            for oc in 0..2 {
                for p in 0..patches {
                    let patch = &cols[p * patch_len..(p + 1) * patch_len];
                    out[oc * patches + p] =
                        weight[oc * 2] * patch[0] + weight[oc * 2 + 1] * patch[1];
                }
            }
        })
        .unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn pooling_shapes_and_values() {
        let input = Tensor::new(vec![1, 1, 2, 2], vec![1.0, -2.0, 3.0, 0.5]).unwrap();
        let pooled = max_pool2d("pool", &input, 2, 2).unwrap();
        assert_eq!(pooled.data(), &[3.0]);
        let avg = global_avg_pool(&input).unwrap();
        assert_eq!(avg.shape(), &[1, 1]);
        assert!((avg.data()[0] - 0.625).abs() < 1e-6);
        assert!(max_pool2d("pool", &input, 3, 3).is_err());
    }
}
