//! Baseline model: layers and the ResNet-style network built from them.

pub mod layers;
pub mod network;

pub use layers::{BasicBlock, Conv2d, InputHook, Layer, Linear, NamedLayer};
pub use network::{ArchConfig, Network, WeightKind, WeightView, WeightViewMut};
