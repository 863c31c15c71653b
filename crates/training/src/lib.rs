//! Checkpointed training of image models over streamed, prefetched batches.

pub mod burn_trainable;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod predict;
pub mod progress;
pub mod train_loop;
pub mod trainable;
pub mod util;

pub use burn_trainable::BurnModel;
pub use checkpoint::CheckpointManager;
pub use config::{RunPaths, RunSettings, TrainArgs, TrainingConfig};
pub use error::{TrainError, TrainResult};
pub use progress::{
    ConsoleReporter, FanoutReporter, LogReporter, MetricsFileReporter, NullReporter,
    ProgressReporter, ReporterError,
};
pub use train_loop::{LoopState, RunReport, TrainingLoop};
pub use trainable::{BatchMetrics, Restore, Trainable};
pub use util::{run_train, train_with};

/// Backend alias for training/eval.
pub type TrainBackend = burn_ndarray::NdArray<f32>;
pub type TrainAutodiff = burn::backend::Autodiff<TrainBackend>;
