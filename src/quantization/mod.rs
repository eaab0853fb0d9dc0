//! Post-training int8 quantization.
//!
//! Follows the prepare → calibrate → convert flow: [`prepare`] inserts
//! activation observers according to a [`QConfigMap`], the prepared model is
//! run [`CALIBRATION_PASSES`] times over representative data, and [`convert`]
//! freezes the observed ranges into scales and per-channel int8 weights.

pub mod convert;
pub mod observer;
pub mod prepare;
pub mod qconfig;

pub use convert::{LayerQuant, QuantMode, QuantizedNetwork, convert};
pub use observer::{
    Observer, ObserverConfig, ObserverKind, QScheme, fake_quantize, per_channel_scales, quantize,
    weight_scales,
};
pub(crate) use observer::MIN_SCALE;
pub use prepare::{CALIBRATION_PASSES, PreparedModel, calibrate, prepare};
pub use qconfig::{QConfig, QConfigMap};
