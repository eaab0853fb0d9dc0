//! Lowering of 2-D convolution to row-by-patch dot products.

use serde::{Deserialize, Serialize};

/// Shape of a single-image convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvGeometry {
    /// Output height, zero when the kernel does not fit.
    pub fn out_height(&self) -> usize {
        Self::out_dim(self.height, self.kernel, self.stride, self.padding)
    }

    pub fn out_width(&self) -> usize {
        Self::out_dim(self.width, self.kernel, self.stride, self.padding)
    }

    /// Number of output positions, i.e. patches per image.
    pub fn patches(&self) -> usize {
        self.out_height() * self.out_width()
    }

    /// Elements in one patch, equal to the column count of the weight matrix.
    pub fn patch_len(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }

    pub fn out_dim(size: usize, kernel: usize, stride: usize, padding: usize) -> usize {
        let padded = size + 2 * padding;
        if padded < kernel || stride == 0 {
            0
        } else {
            (padded - kernel) / stride + 1
        }
    }
}

/// Gathers every receptive field of `image` (`C x H x W`) into a patch-major
/// buffer of `patches() x patch_len()` elements.
///
/// Patch elements are ordered `(channel, ky, kx)`, the same order as a weight
/// row, so each output value is a plain dot product. Padding reads as zero.
pub fn im2col(geometry: &ConvGeometry, image: &[f32]) -> Vec<f32> {
    let ConvGeometry {
        in_channels,
        height,
        width,
        kernel,
        stride,
        padding,
    } = *geometry;
    let out_h = geometry.out_height();
    let out_w = geometry.out_width();
    let patch_len = geometry.patch_len();
    let mut columns = vec![0.0f32; out_h * out_w * patch_len];

    for oy in 0..out_h {
        for ox in 0..out_w {
            let patch = &mut columns[(oy * out_w + ox) * patch_len..][..patch_len];
            let mut idx = 0;
            for c in 0..in_channels {
                let plane = &image[c * height * width..(c + 1) * height * width];
                for ky in 0..kernel {
                    let y = (oy * stride + ky) as isize - padding as isize;
                    for kx in 0..kernel {
                        let x = (ox * stride + kx) as isize - padding as isize;
                        if y >= 0 && x >= 0 && (y as usize) < height && (x as usize) < width {
                            patch[idx] = plane[y as usize * width + x as usize];
                        }
                        idx += 1;
                    }
                }
            }
        }
    }

    columns
}
