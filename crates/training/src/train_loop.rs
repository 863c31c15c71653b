//! Epoch/batch state machine driving a [`Trainable`] over prefetched batch streams.
//!
//! ```text
//! Idle -> EpochRunning(1) -> EpochEnding(1) -> EpochRunning(2) -> ... -> EpochEnding(E) -> Done
//!   any state -> Failed
//! ```
//!
//! Validation for epoch `e` runs after its training batches and before its
//! checkpoint. The epoch-`e` checkpoint is on disk before epoch `e + 1` starts.

use crate::checkpoint::CheckpointManager;
use crate::config::TrainingConfig;
use crate::error::{TrainError, TrainResult};
use crate::progress::{format_epoch, notify, NullReporter, ProgressReporter};
use crate::trainable::{MetricsAccumulator, Trainable};
use data_contracts::EpochMetrics;
use image_dataset::{
    BatchAssembler, LabelSource, Prefetcher, Sample, ShuffleSplitter, Split, Transform,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    EpochRunning { epoch: usize },
    EpochEnding { epoch: usize },
    Done,
    Failed,
}

/// What a successful run leaves behind.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub epochs: Vec<EpochMetrics>,
    pub epoch_checkpoints: Vec<PathBuf>,
    pub final_checkpoint: PathBuf,
}

impl RunReport {
    pub fn last_metrics(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

pub struct TrainingLoop<M: Trainable> {
    config: TrainingConfig,
    split: Split,
    model: M,
    checkpoints: CheckpointManager,
    labels: LabelSource,
    transform: Arc<dyn Transform>,
    reporter: Box<dyn ProgressReporter>,
    state: LoopState,
    history: Vec<EpochMetrics>,
    epoch_checkpoints: Vec<PathBuf>,
}

struct StreamTotals {
    acc: MetricsAccumulator,
    skipped: usize,
}

impl<M: Trainable> TrainingLoop<M> {
    pub fn new(
        config: TrainingConfig,
        split: Split,
        model: M,
        checkpoints: CheckpointManager,
        transform: Arc<dyn Transform>,
    ) -> Self {
        let labels = LabelSource::new(config.label_len);
        Self {
            config,
            split,
            model,
            checkpoints,
            labels,
            transform,
            reporter: Box::new(NullReporter),
            state: LoopState::Idle,
            history: Vec::new(),
            epoch_checkpoints: Vec::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Metrics of every completed epoch so far.
    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    /// Run all epochs. Ends in [`LoopState::Done`] or [`LoopState::Failed`].
    pub fn run(&mut self) -> TrainResult<RunReport> {
        if self.state != LoopState::Idle {
            return Err(TrainError::Config(format!(
                "training loop already ran (state {:?})",
                self.state
            )));
        }
        let result = self.check_inputs().and_then(|()| self.drive());
        notify(self.reporter.as_mut(), "finish", |r| r.on_finish());
        match &result {
            Ok(_) => self.state = LoopState::Done,
            Err(e) => {
                log::error!("training failed in state {:?}: {e}", self.state);
                self.state = LoopState::Failed;
            }
        }
        result
    }

    fn check_inputs(&self) -> TrainResult<()> {
        self.config.validate()?;
        if self.split.train.is_empty() {
            return Err(TrainError::Config(format!(
                "training split is empty ({} samples at ratio {})",
                self.split.len(),
                self.config.split_ratio
            )));
        }
        let desc = self.model.descriptor();
        if desc.input != self.config.image_shape() || desc.output_len() != self.config.label_len {
            return Err(TrainError::Config(format!(
                "model expects {:?} -> {} but data is {:?} -> {}",
                desc.input,
                desc.output_len(),
                self.config.image_shape(),
                self.config.label_len
            )));
        }
        if desc.input != self.transform.shape() {
            return Err(TrainError::Config(format!(
                "transform produces {:?}, model expects {:?}",
                self.transform.shape(),
                desc.input
            )));
        }
        self.checkpoints.prepare()
    }

    fn drive(&mut self) -> TrainResult<RunReport> {
        let epochs = self.config.epochs;
        for epoch in 1..=epochs {
            self.state = LoopState::EpochRunning { epoch };
            let train = self.train_epoch(epoch).map_err(|e| e.in_epoch(epoch))?;

            self.state = LoopState::EpochEnding { epoch };
            let val = self.validate_epoch().map_err(|e| e.in_epoch(epoch))?;
            let metrics = EpochMetrics {
                epoch,
                loss: train.acc.mean_loss().unwrap_or(f32::NAN),
                accuracy: train.acc.accuracy(),
                val_loss: val.acc.mean_loss(),
                val_accuracy: val.acc.accuracy(),
                train_samples: train.acc.samples(),
                val_samples: val.acc.samples(),
                skipped_samples: train.skipped + val.skipped,
            };
            let path = self
                .checkpoints
                .save_epoch(epoch, &self.model, &metrics)
                .map_err(|e| e.in_epoch(epoch))?;
            self.epoch_checkpoints.push(path);
            log::info!("epoch {epoch}/{epochs}: {}", format_epoch(&metrics));
            notify(self.reporter.as_mut(), "epoch complete", |r| {
                r.on_epoch_complete(epoch, &metrics)
            });
            self.history.push(metrics);
        }

        let last = self
            .history
            .last()
            .cloned()
            .ok_or_else(|| TrainError::Config("no epoch completed".into()))?;
        let final_checkpoint = self.checkpoints.save_final(&self.model, &last)?;
        Ok(RunReport {
            epochs: self.history.clone(),
            epoch_checkpoints: self.epoch_checkpoints.clone(),
            final_checkpoint,
        })
    }

    fn stream(&self, samples: Vec<Sample>, name: &str) -> BatchAssembler {
        BatchAssembler::new(
            samples,
            self.config.batch_size,
            self.labels,
            Arc::clone(&self.transform),
        )
        .with_policy(self.config.sample_policy)
        .with_name(name)
    }

    fn train_epoch(&mut self, epoch: usize) -> TrainResult<StreamTotals> {
        let order = if self.config.reshuffle_each_epoch {
            ShuffleSplitter::epoch_order(&self.split.train, self.config.seed, epoch)
        } else {
            self.split.train.clone()
        };
        let assembler = self.stream(order, "train");
        let counters = assembler.counters();
        let total_batches = assembler.total_batches();
        let epochs = self.config.epochs;
        notify(self.reporter.as_mut(), "epoch start", |r| {
            r.on_epoch_start(epoch, epochs, total_batches)
        });

        let mut acc = MetricsAccumulator::default();
        let batches = Prefetcher::spawn(assembler, self.config.prefetch_depth);
        for (i, batch) in batches.enumerate() {
            let batch = batch?;
            let step = self.model.train_step(&batch)?;
            acc.add(&step);
            notify(self.reporter.as_mut(), "batch complete", |r| {
                r.on_batch_complete(i + 1, &step)
            });
        }
        let skipped = counters.snapshot().skipped;
        if acc.samples() == 0 {
            return Err(TrainError::Config(format!(
                "no training samples left after skipping {skipped}"
            )));
        }
        Ok(StreamTotals { acc, skipped })
    }

    fn validate_epoch(&mut self) -> TrainResult<StreamTotals> {
        let assembler = self.stream(self.split.val.clone(), "val");
        let counters = assembler.counters();
        let mut acc = MetricsAccumulator::default();
        for batch in Prefetcher::spawn(assembler, self.config.prefetch_depth) {
            acc.add(&self.model.evaluate(&batch?)?);
        }
        Ok(StreamTotals {
            acc,
            skipped: counters.snapshot().skipped,
        })
    }
}

impl<M: Trainable> std::fmt::Debug for TrainingLoop<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingLoop")
            .field("state", &self.state)
            .field("run", &self.checkpoints.run_name())
            .field("train", &self.split.train.len())
            .field("val", &self.split.val.len())
            .field("completed_epochs", &self.history.len())
            .finish()
    }
}

