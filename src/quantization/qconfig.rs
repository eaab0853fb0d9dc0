//! Quantization configuration and the module-name → qconfig map.

use serde::{Deserialize, Serialize};

use super::observer::{ObserverConfig, ObserverKind, QScheme};
use crate::errors::{QuantizationError, QuantizationResult};

const DEFAULT_HISTOGRAM_BINS: usize = 2048;

/// How activations and weights of a layer are observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QConfig {
    pub activation: ObserverConfig,
    pub weight: ObserverConfig,
}

impl QConfig {
    /// Symmetric int8 config for engines that consume explicit Q/DQ boundaries:
    /// histogram per-tensor activations, per-channel weights.
    pub fn explicit_int8() -> Self {
        Self {
            activation: ObserverConfig {
                kind: ObserverKind::Histogram {
                    bins: DEFAULT_HISTOGRAM_BINS,
                },
                qscheme: QScheme::PerTensorSymmetric,
                reduce_range: false,
            },
            weight: default_per_channel_weight(),
        }
    }

    /// Same as [`QConfig::explicit_int8`] but with 7-bit activations.
    pub fn implicit_int8() -> Self {
        let mut qconfig = Self::explicit_int8();
        qconfig.activation.reduce_range = true;
        qconfig
    }

    /// Activations are observed per tensor and weights with a min/max observer.
    pub fn validate(&self) -> QuantizationResult<()> {
        self.activation.validate()?;
        self.weight.validate()?;
        if self.activation.qscheme != QScheme::PerTensorSymmetric {
            return Err(QuantizationError::InvalidObserver {
                message: "activation observers must be per-tensor".to_string(),
            });
        }
        if self.weight.kind != ObserverKind::MinMax {
            return Err(QuantizationError::InvalidObserver {
                message: "weight observers must be min/max".to_string(),
            });
        }
        Ok(())
    }

    /// [`QConfig::explicit_int8`] with one weight scale per tensor.
    pub fn per_tensor_weight_int8() -> Self {
        Self {
            weight: ObserverConfig {
                qscheme: QScheme::PerTensorSymmetric,
                ..default_per_channel_weight()
            },
            ..Self::explicit_int8()
        }
    }
}

fn default_per_channel_weight() -> ObserverConfig {
    ObserverConfig {
        kind: ObserverKind::MinMax,
        qscheme: QScheme::PerChannelSymmetric,
        reduce_range: false,
    }
}

/// Maps module-name prefixes to a qconfig; `None` disables quantization for
/// that prefix. The longest matching prefix wins and `""` matches every module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QConfigMap {
    entries: Vec<(String, Option<QConfig>)>,
}

impl QConfigMap {
    pub fn global(qconfig: QConfig) -> Self {
        Self {
            entries: vec![(String::new(), Some(qconfig))],
        }
    }

    pub fn set_module_name(mut self, prefix: &str, qconfig: Option<QConfig>) -> Self {
        self.entries.retain(|(existing, _)| existing != prefix);
        self.entries.push((prefix.to_string(), qconfig));
        self
    }

    pub fn qconfig_for(&self, fqn: &str) -> Option<&QConfig> {
        self.entries
            .iter()
            .filter(|(prefix, _)| matches_prefix(fqn, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .and_then(|(_, qconfig)| qconfig.as_ref())
    }
}

fn matches_prefix(fqn: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || fqn == prefix
        || (fqn.starts_with(prefix) && fqn[prefix.len()..].starts_with('.'))
}
