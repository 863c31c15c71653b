//! The model seam of the training loop.

use crate::error::TrainResult;
use data_contracts::{argmax, ModelDescriptor};
use image_dataset::Batch;
use std::path::Path;

/// Result of one training step or one evaluation batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchMetrics {
    /// Mean loss over the batch.
    pub loss: f32,
    /// Correctly classified samples; `None` for regressors.
    pub correct: Option<usize>,
    pub samples: usize,
}

impl BatchMetrics {
    pub fn accuracy(&self) -> Option<f32> {
        let correct = self.correct?;
        (self.samples > 0).then(|| correct as f32 / self.samples as f32)
    }
}

/// A model the training loop can drive. Calls happen on the control thread only.
pub trait Trainable {
    fn descriptor(&self) -> &ModelDescriptor;
    fn learning_rate(&self) -> f64;
    /// Optimizer updates applied since the optimizer was created.
    fn optimizer_steps(&self) -> usize;
    /// One forward/backward pass and weight update.
    fn train_step(&mut self, batch: &Batch) -> TrainResult<BatchMetrics>;
    /// Loss (and accuracy) without touching the weights.
    fn evaluate(&self, batch: &Batch) -> TrainResult<BatchMetrics>;
    /// Scores for `count` CHW images packed in `inputs`, one row per image.
    fn predict(&self, inputs: &[f32], count: usize) -> TrainResult<Vec<Vec<f32>>>;
    /// Write the weights and descriptor into `dir`, which already exists.
    fn save(&self, dir: &Path) -> TrainResult<()>;
}

/// Load a model saved by [`Trainable::save`] with a fresh optimizer at `learning_rate`.
pub trait Restore: Sized {
    fn restore(dir: &Path, learning_rate: f64) -> TrainResult<Self>;
}

/// Number of rows whose highest score matches the highest label value.
pub fn count_correct(scores: &[f32], labels: &[f32], width: usize) -> usize {
    if width == 0 {
        return 0;
    }
    scores
        .chunks_exact(width)
        .zip(labels.chunks_exact(width))
        .filter(|(s, l)| argmax(s).is_some() && argmax(s) == argmax(l))
        .count()
}

/// Sample-weighted running totals over the batches of one stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsAccumulator {
    loss_sum: f64,
    samples: usize,
    correct: Option<usize>,
}

impl MetricsAccumulator {
    pub fn add(&mut self, m: &BatchMetrics) {
        self.loss_sum += m.loss as f64 * m.samples as f64;
        self.samples += m.samples;
        if let Some(c) = m.correct {
            *self.correct.get_or_insert(0) += c;
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn mean_loss(&self) -> Option<f32> {
        (self.samples > 0).then(|| (self.loss_sum / self.samples as f64) as f32)
    }

    pub fn accuracy(&self) -> Option<f32> {
        let correct = self.correct?;
        (self.samples > 0).then(|| correct as f32 / self.samples as f32)
    }
}
