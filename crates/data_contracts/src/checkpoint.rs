use serde::{Deserialize, Serialize};

use crate::model::ModelDescriptor;

/// Aggregated metrics of one completed epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f32,
    /// Classifier only.
    pub accuracy: Option<f32>,
    /// `None` when the validation split is empty.
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub train_samples: usize,
    pub val_samples: usize,
    #[serde(default)]
    pub skipped_samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointKind {
    Epoch { epoch: usize },
    Final,
}

/// `checkpoint.json` written next to the model files of every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub run_name: String,
    pub kind: CheckpointKind,
    pub metrics: EpochMetrics,
    pub model: ModelDescriptor,
    pub learning_rate: f64,
    pub created_at_ms: u64,
}

/// Record of a train/validation partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitManifest {
    pub seed: u64,
    pub ratio: f64,
    pub train: Vec<String>,
    pub val: Vec<String>,
}
