use thiserror::Error;

use super::ModelError;

/// Errors raised while preparing, calibrating or converting a quantized model.
#[derive(Error, Debug)]
pub enum QuantizationError {
    #[error("No layer matched the qconfig map, nothing to quantize")]
    NoQuantizableLayers,

    #[error("Cannot convert before calibration: {passes} calibration passes ran")]
    NotCalibrated { passes: usize },

    #[error("Observer for '{layer}' saw no data")]
    EmptyObserver { layer: String },

    #[error("Invalid observer configuration: {message}")]
    InvalidObserver { message: String },

    #[error("Calibration forward pass failed: {0}")]
    Model(#[from] ModelError),
}
