//! Shared data contracts for label records, model descriptors, checkpoints and run manifests.

pub mod checkpoint;
pub mod label;
pub mod model;

pub use checkpoint::{CheckpointKind, CheckpointMeta, EpochMetrics, SplitManifest};
pub use label::{argmax, LabelFile, LabelRecord, ValidationError};
pub use model::{ImageShape, ModelArch, ModelDescriptor};
