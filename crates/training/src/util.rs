use crate::burn_trainable::BurnModel;
use crate::checkpoint::CheckpointManager;
use crate::config::{Preflight, ProgressMode, RunSettings, TrainArgs, TrainingConfig};
use crate::error::{TrainError, TrainResult};
use crate::progress::{
    ConsoleReporter, FanoutReporter, LogReporter, MetricsFileReporter, NullReporter,
    ProgressReporter,
};
use crate::train_loop::{RunReport, TrainingLoop};
use crate::trainable::{Restore, Trainable};
use crate::TrainAutodiff;
use image_dataset::{
    summarize_index, ImageTransform, LabelSource, SampleIndex, ShuffleSplitter, Split,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const LOG_EVERY_BATCHES: usize = 50;

pub fn run_train(args: TrainArgs) -> anyhow::Result<RunReport> {
    let settings = RunSettings::resolve(args)?;
    let reporter = build_reporter(&settings);
    let report = train_with(settings, reporter, |cfg: &TrainingConfig| {
        BurnModel::<TrainAutodiff>::new(cfg.model.clone(), cfg.learning_rate, Default::default())
    })?;
    println!(
        "Saved final model to {}",
        report.final_checkpoint.display()
    );
    Ok(report)
}

pub fn build_reporter(settings: &RunSettings) -> Box<dyn ProgressReporter> {
    let mut reporters: Vec<Box<dyn ProgressReporter>> = Vec::new();
    match settings.progress {
        ProgressMode::Bars => reporters.push(Box::new(ConsoleReporter::new())),
        ProgressMode::Log => reporters.push(Box::new(LogReporter::new(LOG_EVERY_BATCHES))),
        ProgressMode::Off => {}
    }
    if let Some(path) = &settings.paths.metrics_out {
        reporters.push(Box::new(MetricsFileReporter::new(
            path.clone(),
            settings.paths.run_name.clone(),
        )));
    }
    match reporters.len() {
        0 => Box::new(NullReporter),
        1 => reporters.remove(0),
        _ => Box::new(FanoutReporter::new(reporters)),
    }
}

/// Full pipeline: model (fresh or resumed), index, preflight, split, loop.
///
/// `fresh` builds the model when no resume checkpoint is configured.
pub fn train_with<M, F>(
    mut settings: RunSettings,
    reporter: Box<dyn ProgressReporter>,
    fresh: F,
) -> TrainResult<RunReport>
where
    M: Trainable + Restore,
    F: FnOnce(&TrainingConfig) -> TrainResult<M>,
{
    let model = match settings.paths.resume_from.clone() {
        Some(path) => {
            let model: M =
                CheckpointManager::load_for_resume(&path, settings.training.learning_rate)?;
            adopt_descriptor(&mut settings.training, &model);
            settings.training.validate()?;
            model
        }
        None => fresh(&settings.training)?,
    };

    let paths = &settings.paths;
    let cfg = &settings.training;
    let index = SampleIndex::build(&paths.image_dir, &paths.label_dir, &settings.index)?;
    log::info!(
        "indexed {} images from {}",
        index.len(),
        paths.image_dir.display()
    );

    if settings.preflight != Preflight::Skip {
        let summary = summarize_index(&index, &LabelSource::new(cfg.label_len));
        log::info!(
            "preflight: total={} labelled={} missing={} invalid={}",
            summary.total,
            summary.labelled,
            summary.missing_labels,
            summary.invalid_labels
        );
        if !summary.missing_ids.is_empty() {
            log::warn!("missing labels: {}", summary.missing_ids.join(", "));
        }
        if !summary.invalid_ids.is_empty() {
            log::warn!("invalid labels: {}", summary.invalid_ids.join(", "));
        }
        if settings.preflight == Preflight::Strict && !summary.is_clean() {
            return Err(TrainError::Config(format!(
                "preflight failed: {} missing and {} invalid labels",
                summary.missing_labels, summary.invalid_labels
            )));
        }
    }

    let split = ShuffleSplitter::split(&index, cfg.split_ratio, cfg.seed)?;
    log::info!(
        "split: train={} val={} (ratio {}, seed {})",
        split.train.len(),
        split.val.len(),
        cfg.split_ratio,
        cfg.seed
    );
    if let Some(path) = &paths.split_manifest {
        write_split_manifest(path, &split, cfg)?;
    }

    let checkpoints = CheckpointManager::new(&paths.temp_root, &paths.model_root, &paths.run_name)?
        .with_overwrite(paths.overwrite_checkpoints);
    let transform = Arc::new(ImageTransform::new(cfg.image_shape()));
    let mut training = TrainingLoop::new(cfg.clone(), split, model, checkpoints, transform)
        .with_reporter(reporter);
    training.run()
}

fn adopt_descriptor<M: Trainable>(cfg: &mut TrainingConfig, model: &M) {
    let desc = model.descriptor();
    if desc != &cfg.model {
        log::info!(
            "using {} architecture from checkpoint (input {:?}, {} outputs)",
            desc.arch.as_str(),
            desc.input,
            desc.output_len()
        );
    }
    cfg.model = desc.clone();
    cfg.label_len = desc.output_len();
}

fn write_split_manifest(path: &Path, split: &Split, cfg: &TrainingConfig) -> TrainResult<()> {
    let io_err = |source| TrainError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let manifest = split.manifest(cfg.seed, cfg.split_ratio);
    let raw = serde_json::to_vec_pretty(&manifest).map_err(|e| TrainError::Config(e.to_string()))?;
    fs::write(path, raw).map_err(io_err)
}
