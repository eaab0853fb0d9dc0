//! Calibration observers and symmetric int8 quantization primitives.

use serde::{Deserialize, Serialize};

use crate::errors::{QuantizationError, QuantizationResult};

/// Statistic an observer keeps about the values it sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverKind {
    /// Tracks the running absolute maximum.
    MinMax,
    /// Keeps a histogram of |x| and clips at the 99.99th percentile.
    Histogram { bins: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QScheme {
    PerTensorSymmetric,
    PerChannelSymmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub kind: ObserverKind,
    pub qscheme: QScheme,
    /// Uses 7 bits instead of 8 (`qmax = 63`).
    pub reduce_range: bool,
}

impl ObserverConfig {
    pub fn qmax(&self) -> i32 {
        if self.reduce_range { 63 } else { 127 }
    }

    pub fn validate(&self) -> QuantizationResult<()> {
        if let ObserverKind::Histogram { bins } = self.kind {
            if bins < 2 {
                return Err(QuantizationError::InvalidObserver {
                    message: format!("histogram needs at least 2 bins, got {}", bins),
                });
            }
        }
        Ok(())
    }
}

const HISTOGRAM_PERCENTILE: f64 = 0.9999;
pub(crate) const MIN_SCALE: f32 = 1e-8;

/// Activation observer inserted in front of a quantized layer.
#[derive(Debug, Clone)]
pub struct Observer {
    config: ObserverConfig,
    amax: f32,
    histogram: Vec<u64>,
    histogram_max: f32,
    batches: usize,
}

impl Observer {
    pub fn new(config: ObserverConfig) -> Self {
        let bins = match config.kind {
            ObserverKind::Histogram { bins } => bins,
            ObserverKind::MinMax => 0,
        };
        Self {
            config,
            amax: 0.0,
            histogram: vec![0; bins],
            histogram_max: 0.0,
            batches: 0,
        }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Number of batches observed so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn observe(&mut self, data: &[f32]) {
        if data.is_empty() {
            return;
        }
        let batch_max = data.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        self.amax = self.amax.max(batch_max);

        if !self.histogram.is_empty() {
            if batch_max > self.histogram_max {
                self.rebin(batch_max);
            }
            let bins = self.histogram.len();
            if self.histogram_max > 0.0 {
                let width = self.histogram_max / bins as f32;
                for v in data {
                    let bin = ((v.abs() / width) as usize).min(bins - 1);
                    self.histogram[bin] += 1;
                }
            } else {
                self.histogram[0] += data.len() as u64;
            }
        }
        self.batches += 1;
    }

    /// Widens the histogram range, moving existing counts to the bin that holds
    /// their old bin center.
    fn rebin(&mut self, new_max: f32) {
        let bins = self.histogram.len();
        let mut rebinned = vec![0u64; bins];
        if self.histogram_max > 0.0 {
            let old_width = self.histogram_max / bins as f32;
            let new_width = new_max / bins as f32;
            for (i, &count) in self.histogram.iter().enumerate() {
                let center = (i as f32 + 0.5) * old_width;
                let bin = ((center / new_width) as usize).min(bins - 1);
                rebinned[bin] += count;
            }
        } else {
            rebinned[0] = self.histogram.iter().sum();
        }
        self.histogram = rebinned;
        self.histogram_max = new_max;
    }

    /// Clipping threshold for the observed distribution.
    pub fn threshold(&self) -> f32 {
        match self.config.kind {
            ObserverKind::MinMax => self.amax,
            ObserverKind::Histogram { .. } => {
                let total: u64 = self.histogram.iter().sum();
                if total == 0 || self.histogram_max == 0.0 {
                    return self.amax;
                }
                let target = (total as f64 * HISTOGRAM_PERCENTILE).ceil() as u64;
                let width = self.histogram_max / self.histogram.len() as f32;
                let mut cumulative = 0u64;
                for (i, &count) in self.histogram.iter().enumerate() {
                    cumulative += count;
                    if cumulative >= target {
                        return ((i + 1) as f32 * width).min(self.amax);
                    }
                }
                self.amax
            }
        }
    }

    /// Symmetric scale mapping the threshold onto `qmax`.
    pub fn scale(&self) -> f32 {
        (self.threshold() / self.config.qmax() as f32).max(MIN_SCALE)
    }
}

/// Weight scales for a `rows x cols` matrix, one per row. A per-tensor scheme
/// repeats the tensor-wide scale on every row.
pub fn weight_scales(weight: &[f32], cols: usize, config: &ObserverConfig) -> Vec<f32> {
    let qmax = config.qmax();
    match config.qscheme {
        QScheme::PerChannelSymmetric => per_channel_scales(weight, cols, qmax),
        QScheme::PerTensorSymmetric => {
            let amax = weight.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
            let scale = (amax / qmax as f32).max(MIN_SCALE);
            vec![scale; weight.len().div_ceil(cols.max(1))]
        }
    }
}

/// Symmetric per-row scales for a `rows x cols` weight matrix.
pub fn per_channel_scales(weight: &[f32], cols: usize, qmax: i32) -> Vec<f32> {
    weight
        .chunks(cols.max(1))
        .map(|row| {
            let amax = row.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
            (amax / qmax as f32).max(MIN_SCALE)
        })
        .collect()
}

/// Rounds `value / scale` to the nearest integer in `[-qmax, qmax]`.
#[inline(always)]
pub fn quantize(value: f32, scale: f32, qmax: i32) -> i8 {
    (value / scale).round().clamp(-(qmax as f32), qmax as f32) as i8
}

#[inline(always)]
pub fn fake_quantize(value: f32, scale: f32, qmax: i32) -> f32 {
    quantize(value, scale, qmax) as f32 * scale
}
