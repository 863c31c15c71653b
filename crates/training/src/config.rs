//! Run configuration: built-in defaults, then a TOML file, then command-line flags.
//!
//! The TOML file is taken from `--config`, else `TRAINER_CONFIG`, else `trainer.toml`
//! in the working directory when present. Every key is optional:
//!
//! ```toml
//! [data]
//! image_dir = "data/images"
//! label_dir = "data/labels"
//!
//! [training]
//! epochs = 30
//! batch_size = 32
//! learning_rate = 0.001
//!
//! [model]
//! arch = "classifier"
//! outputs = 7
//! height = 64
//! width = 64
//! channels = 1
//!
//! [output]
//! temp_root = "cnn-temp"
//! model_root = "cnn-models"
//! overwrite = false
//! ```

use crate::error::{TrainError, TrainResult};
use clap::{Parser, ValueEnum};
use data_contracts::{ImageShape, ModelArch, ModelDescriptor};
use image_dataset::{IndexOptions, SamplePolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "TRAINER_CONFIG";
pub const DEFAULT_CONFIG_NAME: &str = "trainer.toml";
pub const DEFAULT_RUN_NAME: &str = "default-model";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchKind {
    Classifier,
    Regressor,
}

impl ArchKind {
    fn with_outputs(self, outputs: Option<usize>) -> ModelArch {
        match self {
            ArchKind::Classifier => ModelArch::Classifier {
                num_classes: outputs.unwrap_or(7),
            },
            ArchKind::Regressor => ModelArch::Regressor {
                num_outputs: outputs.unwrap_or(8),
            },
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// Interactive progress bars.
    #[default]
    Bars,
    /// Log lines only.
    Log,
    Off,
}

#[derive(Parser, Debug, Default)]
#[command(name = "train", about = "Train an image classifier/regressor with per-epoch checkpoints")]
pub struct TrainArgs {
    /// TOML config file (overrides TRAINER_CONFIG and ./trainer.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory of input images.
    #[arg(long)]
    pub images: Option<PathBuf>,
    /// Directory of `<image stem>.json` label records.
    #[arg(long)]
    pub labels: Option<PathBuf>,
    /// Root for per-epoch checkpoints [default: cnn-temp].
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,
    /// Root for final models [default: cnn-models].
    #[arg(long)]
    pub model_dir: Option<PathBuf>,
    /// Run name [default: file name of --teach, else default-model].
    #[arg(long = "model")]
    pub run_name: Option<String>,
    /// Checkpoint directory to continue training from (fresh optimizer).
    #[arg(long = "teach", alias = "resume-from")]
    pub resume_from: Option<PathBuf>,
    /// Learning rate [default: 0.001].
    #[arg(long)]
    pub lr: Option<f64>,
    /// Number of epochs [default: 30].
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Batch size [default: 32].
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Fraction of samples used for training [default: 0.8].
    #[arg(long)]
    pub split_ratio: Option<f64>,
    /// Seed for the split shuffle [default: 42].
    #[arg(long)]
    pub seed: Option<u64>,
    /// Batches prepared ahead of training [default: 1].
    #[arg(long)]
    pub prefetch: Option<usize>,
    /// Output head [default: classifier].
    #[arg(long, value_enum)]
    pub arch: Option<ArchKind>,
    /// Number of classes or regression outputs [default: 7 / 8].
    #[arg(long)]
    pub outputs: Option<usize>,
    /// Input height in pixels [default: 64].
    #[arg(long)]
    pub height: Option<u32>,
    /// Input width in pixels [default: 64].
    #[arg(long)]
    pub width: Option<u32>,
    /// 1 for grayscale, 3 for RGB [default: 1].
    #[arg(long)]
    pub channels: Option<u32>,
    /// Reshuffle the training set at every epoch.
    #[arg(long)]
    pub reshuffle: bool,
    /// Skip samples with missing/invalid labels or undecodable images instead of failing.
    #[arg(long)]
    pub skip_invalid: bool,
    /// Check every label before training and log a summary.
    #[arg(long)]
    pub preflight: bool,
    /// With --preflight, fail when any label is missing or invalid.
    #[arg(long)]
    pub strict_preflight: bool,
    /// Replace epoch checkpoints left by an earlier run with the same name.
    #[arg(long)]
    pub overwrite: bool,
    /// Append per-epoch metrics as JSON lines.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
    /// Write the train/validation split as JSON.
    #[arg(long)]
    pub split_manifest: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = ProgressMode::Bars)]
    pub progress: ProgressMode,
}

/// Everything that shapes the training itself. Immutable for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub model: ModelDescriptor,
    pub label_len: usize,
    pub prefetch_depth: usize,
    pub split_ratio: f64,
    pub seed: u64,
    pub reshuffle_each_epoch: bool,
    pub sample_policy: SamplePolicy,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let model = ModelDescriptor::default();
        Self {
            epochs: 30,
            batch_size: 32,
            learning_rate: 1e-3,
            label_len: model.output_len(),
            model,
            prefetch_depth: 1,
            split_ratio: 0.8,
            seed: 42,
            reshuffle_each_epoch: false,
            sample_policy: SamplePolicy::Abort,
        }
    }
}

impl TrainingConfig {
    pub fn image_shape(&self) -> ImageShape {
        self.model.input
    }

    pub fn validate(&self) -> TrainResult<()> {
        let invalid = |msg: String| Err(TrainError::Config(msg));
        if self.epochs == 0 {
            return invalid("epochs must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("batch size must be at least 1".into());
        }
        if self.prefetch_depth == 0 {
            return invalid("prefetch depth must be at least 1".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning rate must be positive, got {}", self.learning_rate));
        }
        if !(self.split_ratio > 0.0 && self.split_ratio <= 1.0) {
            return invalid(format!("split ratio {} outside (0, 1]", self.split_ratio));
        }
        if self.label_len != self.model.output_len() {
            return invalid(format!(
                "label length {} does not match {} outputs of the {}",
                self.label_len,
                self.model.output_len(),
                self.model.arch.as_str()
            ));
        }
        self.model
            .validate()
            .map_err(|e| TrainError::Config(e.to_string()))
    }
}

/// Where data is read from and artifacts are written to.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPaths {
    pub image_dir: PathBuf,
    pub label_dir: PathBuf,
    pub temp_root: PathBuf,
    pub model_root: PathBuf,
    pub run_name: String,
    pub resume_from: Option<PathBuf>,
    pub metrics_out: Option<PathBuf>,
    pub split_manifest: Option<PathBuf>,
    /// Whether epoch checkpoints of an earlier run with this name may be replaced.
    pub overwrite_checkpoints: bool,
}

impl Default for RunPaths {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("data/images"),
            label_dir: PathBuf::from("data/labels"),
            temp_root: PathBuf::from("cnn-temp"),
            model_root: PathBuf::from("cnn-models"),
            run_name: DEFAULT_RUN_NAME.to_string(),
            resume_from: None,
            metrics_out: None,
            split_manifest: None,
            overwrite_checkpoints: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preflight {
    #[default]
    Skip,
    Report,
    Strict,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub training: TrainingConfig,
    pub paths: RunPaths,
    pub index: IndexOptions,
    pub preflight: Preflight,
    pub progress: ProgressMode,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    data: Option<DataSection>,
    training: Option<TrainingSection>,
    model: Option<ModelSection>,
    output: Option<OutputSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DataSection {
    image_dir: Option<PathBuf>,
    label_dir: Option<PathBuf>,
    image_extensions: Option<Vec<String>>,
    label_extension: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainingSection {
    epochs: Option<usize>,
    batch_size: Option<usize>,
    learning_rate: Option<f64>,
    split_ratio: Option<f64>,
    seed: Option<u64>,
    prefetch_depth: Option<usize>,
    reshuffle_each_epoch: Option<bool>,
    skip_invalid_samples: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelSection {
    arch: Option<ArchKind>,
    outputs: Option<usize>,
    height: Option<u32>,
    width: Option<u32>,
    channels: Option<u32>,
    conv_filters: Option<Vec<usize>>,
    conv_dropout: Option<Vec<f64>>,
    hidden: Option<usize>,
    hidden_dropout: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputSection {
    temp_root: Option<PathBuf>,
    model_root: Option<PathBuf>,
    run_name: Option<String>,
    metrics_out: Option<PathBuf>,
    split_manifest: Option<PathBuf>,
    overwrite: Option<bool>,
}

fn read_config_file(path: &Path) -> TrainResult<ConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|source| TrainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|e| TrainError::Config(format!("{}: {e}", path.display())))
}

/// Config file named by `--config`, then the environment, then the working directory.
fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from(DEFAULT_CONFIG_NAME);
    local.exists().then_some(local)
}

impl RunSettings {
    pub fn resolve(args: TrainArgs) -> TrainResult<Self> {
        let file = match locate_config(args.config.as_deref()) {
            Some(path) => {
                log::info!("using config {}", path.display());
                read_config_file(&path)?
            }
            None => ConfigFile::default(),
        };
        Self::merge(args, file)
    }

    /// Resolve against TOML text instead of a file on disk.
    pub fn resolve_with_toml(args: TrainArgs, toml_text: &str) -> TrainResult<Self> {
        let file: ConfigFile =
            toml::from_str(toml_text).map_err(|e| TrainError::Config(e.to_string()))?;
        Self::merge(args, file)
    }

    fn merge(args: TrainArgs, file: ConfigFile) -> TrainResult<Self> {
        let data = file.data.unwrap_or_default();
        let train = file.training.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let defaults = TrainingConfig::default();
        let default_desc = ModelDescriptor::default();
        let default_paths = RunPaths::default();

        let arch_kind = args.arch.or(model.arch).unwrap_or(ArchKind::Classifier);
        let arch = arch_kind.with_outputs(args.outputs.or(model.outputs));
        let descriptor = ModelDescriptor {
            arch,
            input: ImageShape::new(
                args.height.or(model.height).unwrap_or(default_desc.input.height),
                args.width.or(model.width).unwrap_or(default_desc.input.width),
                args.channels.or(model.channels).unwrap_or(default_desc.input.channels),
            ),
            conv_filters: model.conv_filters.unwrap_or(default_desc.conv_filters),
            conv_dropout: model.conv_dropout.unwrap_or(default_desc.conv_dropout),
            hidden: model.hidden.unwrap_or(default_desc.hidden),
            hidden_dropout: model.hidden_dropout.unwrap_or(default_desc.hidden_dropout),
        };
        let skip = args.skip_invalid || train.skip_invalid_samples.unwrap_or(false);
        let training = TrainingConfig {
            epochs: args.epochs.or(train.epochs).unwrap_or(defaults.epochs),
            batch_size: args.batch_size.or(train.batch_size).unwrap_or(defaults.batch_size),
            learning_rate: args
                .lr
                .or(train.learning_rate)
                .unwrap_or(defaults.learning_rate),
            label_len: descriptor.output_len(),
            model: descriptor,
            prefetch_depth: args
                .prefetch
                .or(train.prefetch_depth)
                .unwrap_or(defaults.prefetch_depth),
            split_ratio: args
                .split_ratio
                .or(train.split_ratio)
                .unwrap_or(defaults.split_ratio),
            seed: args.seed.or(train.seed).unwrap_or(defaults.seed),
            reshuffle_each_epoch: args.reshuffle || train.reshuffle_each_epoch.unwrap_or(false),
            sample_policy: if skip {
                SamplePolicy::Skip
            } else {
                SamplePolicy::Abort
            },
        };

        let resume_from = args.resume_from;
        let run_name = args
            .run_name
            .or(output.run_name)
            .or_else(|| {
                resume_from
                    .as_deref()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| DEFAULT_RUN_NAME.to_string());
        let paths = RunPaths {
            image_dir: args.images.or(data.image_dir).unwrap_or(default_paths.image_dir),
            label_dir: args.labels.or(data.label_dir).unwrap_or(default_paths.label_dir),
            temp_root: args
                .temp_dir
                .or(output.temp_root)
                .unwrap_or(default_paths.temp_root),
            model_root: args
                .model_dir
                .or(output.model_root)
                .unwrap_or(default_paths.model_root),
            run_name,
            resume_from,
            metrics_out: args.metrics_out.or(output.metrics_out),
            split_manifest: args.split_manifest.or(output.split_manifest),
            overwrite_checkpoints: args.overwrite || output.overwrite.unwrap_or(false),
        };

        let mut index = IndexOptions::default();
        if let Some(exts) = data.image_extensions {
            index.image_extensions = exts.into_iter().map(|e| e.to_ascii_lowercase()).collect();
        }
        if let Some(ext) = data.label_extension {
            index.label_extension = ext;
        }
        let preflight = match (args.preflight, args.strict_preflight) {
            (_, true) => Preflight::Strict,
            (true, false) => Preflight::Report,
            _ => Preflight::Skip,
        };

        let settings = Self {
            training,
            paths,
            index,
            preflight,
            progress: args.progress,
        };
        // A resumed run takes its architecture from the checkpoint; checked after loading.
        if settings.paths.resume_from.is_none() {
            settings.training.validate()?;
        }
        Ok(settings)
    }
}
