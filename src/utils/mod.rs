//! Low-level numeric helpers: dot kernels and convolution lowering.

pub mod dot;
pub mod im2col;

pub use dot::{DotKernel, dot, dot_i8};
pub use im2col::{ConvGeometry, im2col};
