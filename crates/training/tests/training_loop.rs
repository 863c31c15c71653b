//! Training loop behaviour against a scripted model: batch boundaries, failure
//! handling, checkpoint layout and resume semantics.

use data_contracts::{CheckpointKind, EpochMetrics, ImageShape, ModelArch, ModelDescriptor};
use image::{GrayImage, Luma};
use image_dataset::{
    Batch, ImageTransform, IndexOptions, SampleIndex, SamplePolicy, ShuffleSplitter, Transform,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use training::checkpoint::META_FILE;
use training::config::{Preflight, ProgressMode};
use training::{
    BatchMetrics, CheckpointManager, LoopState, ProgressReporter, ReporterError, Restore,
    RunPaths, RunSettings, TrainError, TrainResult, Trainable, TrainingConfig, TrainingLoop,
};

const CLASSES: usize = 3;

fn descriptor() -> ModelDescriptor {
    ModelDescriptor {
        arch: ModelArch::Classifier {
            num_classes: CLASSES,
        },
        input: ImageShape::new(8, 8, 1),
        ..Default::default()
    }
}

fn config(epochs: usize, batch_size: usize, split_ratio: f64) -> TrainingConfig {
    TrainingConfig {
        epochs,
        batch_size,
        learning_rate: 0.01,
        model: descriptor(),
        label_len: CLASSES,
        prefetch_depth: 1,
        split_ratio,
        seed: 42,
        reshuffle_each_epoch: false,
        sample_policy: SamplePolicy::Abort,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    weight: f32,
    steps: usize,
}

#[derive(Debug, Clone)]
struct ScriptedModel {
    descriptor: ModelDescriptor,
    lr: f64,
    steps: usize,
    weight: f32,
    train_batches: Vec<Vec<String>>,
    fail_save: bool,
}

impl ScriptedModel {
    fn new(lr: f64) -> Self {
        Self {
            descriptor: descriptor(),
            lr,
            steps: 0,
            weight: 0.0,
            train_batches: Vec::new(),
            fail_save: false,
        }
    }
}

impl Trainable for ScriptedModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn optimizer_steps(&self) -> usize {
        self.steps
    }

    fn train_step(&mut self, batch: &Batch) -> TrainResult<BatchMetrics> {
        self.train_batches.push(batch.ids.clone());
        self.steps += 1;
        self.weight += self.lr as f32 * batch.len() as f32;
        Ok(BatchMetrics {
            loss: 1.0 / self.steps as f32,
            correct: Some(batch.len()),
            samples: batch.len(),
        })
    }

    fn evaluate(&self, batch: &Batch) -> TrainResult<BatchMetrics> {
        Ok(BatchMetrics {
            loss: 0.5,
            correct: Some(0),
            samples: batch.len(),
        })
    }

    fn predict(&self, _inputs: &[f32], count: usize) -> TrainResult<Vec<Vec<f32>>> {
        Ok(vec![vec![0.0; CLASSES]; count])
    }

    fn save(&self, dir: &Path) -> TrainResult<()> {
        if self.fail_save {
            return Err(TrainError::CheckpointWrite {
                path: dir.to_path_buf(),
                msg: "disk full".into(),
            });
        }
        let state = SavedState {
            weight: self.weight,
            steps: self.steps,
        };
        fs::write(dir.join("weights.json"), serde_json::to_vec(&state).unwrap()).unwrap();
        Ok(())
    }
}

impl Restore for ScriptedModel {
    fn restore(dir: &Path, learning_rate: f64) -> TrainResult<Self> {
        let raw = fs::read(dir.join("weights.json")).map_err(|e| TrainError::CheckpointLoad {
            path: dir.to_path_buf(),
            msg: e.to_string(),
        })?;
        let state: SavedState = serde_json::from_slice(&raw).unwrap();
        let mut model = ScriptedModel::new(learning_rate);
        model.weight = state.weight;
        Ok(model)
    }
}

#[derive(Default, Clone)]
struct Events(Rc<RefCell<Vec<String>>>);

impl Events {
    fn take(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

impl ProgressReporter for Events {
    fn on_epoch_start(&mut self, epoch: usize, total: usize, batches: usize) -> Result<(), ReporterError> {
        self.0.borrow_mut().push(format!("start {epoch}/{total} ({batches})"));
        Ok(())
    }

    fn on_batch_complete(&mut self, batch_index: usize, m: &BatchMetrics) -> Result<(), ReporterError> {
        self.0.borrow_mut().push(format!("batch {batch_index} n={}", m.samples));
        Ok(())
    }

    fn on_epoch_complete(&mut self, epoch: usize, m: &EpochMetrics) -> Result<(), ReporterError> {
        self.0
            .borrow_mut()
            .push(format!("done {epoch} train={} val={}", m.train_samples, m.val_samples));
        Ok(())
    }
}

struct Exploding;

impl ProgressReporter for Exploding {
    fn on_epoch_start(&mut self, _: usize, _: usize, _: usize) -> Result<(), ReporterError> {
        Err(ReporterError("terminal closed".into()))
    }

    fn on_batch_complete(&mut self, _: usize, _: &BatchMetrics) -> Result<(), ReporterError> {
        panic!("reporter bug")
    }

    fn on_epoch_complete(&mut self, _: usize, _: &EpochMetrics) -> Result<(), ReporterError> {
        Err(ReporterError("terminal closed".into()))
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    images: PathBuf,
    labels: PathBuf,
    temp_root: PathBuf,
    model_root: PathBuf,
}

impl Fixture {
    fn new(count: usize, missing_labels: &[usize]) -> anyhow::Result<Self> {
        let tmp = tempfile::tempdir()?;
        let images = tmp.path().join("images");
        let labels = tmp.path().join("labels");
        fs::create_dir_all(&images)?;
        fs::create_dir_all(&labels)?;
        for i in 0..count {
            let id = format!("sample_{i:02}");
            GrayImage::from_pixel(8, 8, Luma([(i * 10) as u8])).save(images.join(format!("{id}.png")))?;
            if !missing_labels.contains(&i) {
                let json = serde_json::json!({ "class": i % CLASSES });
                fs::write(labels.join(format!("{id}.json")), json.to_string())?;
            }
        }
        Ok(Self {
            temp_root: tmp.path().join("cnn-temp"),
            model_root: tmp.path().join("cnn-models"),
            images,
            labels,
            _tmp: tmp,
        })
    }

    fn index(&self) -> anyhow::Result<SampleIndex> {
        Ok(SampleIndex::build(&self.images, &self.labels, &IndexOptions::default())?)
    }

    fn checkpoints(&self, run: &str) -> anyhow::Result<CheckpointManager> {
        Ok(CheckpointManager::new(&self.temp_root, &self.model_root, run)?)
    }

    fn training_loop(
        &self,
        cfg: TrainingConfig,
        model: ScriptedModel,
        run: &str,
    ) -> anyhow::Result<TrainingLoop<ScriptedModel>> {
        self.training_loop_on(cfg, model, self.checkpoints(run)?)
    }

    fn training_loop_on(
        &self,
        cfg: TrainingConfig,
        model: ScriptedModel,
        checkpoints: CheckpointManager,
    ) -> anyhow::Result<TrainingLoop<ScriptedModel>> {
        let split = ShuffleSplitter::split(&self.index()?, cfg.split_ratio, cfg.seed)?;
        let transform: Arc<dyn Transform> = Arc::new(ImageTransform::new(cfg.image_shape()));
        Ok(TrainingLoop::new(cfg, split, model, checkpoints, transform))
    }

    /// Validation samples for `cfg`, in split order.
    fn val_samples(&self, cfg: &TrainingConfig) -> anyhow::Result<Vec<image_dataset::Sample>> {
        Ok(ShuffleSplitter::split(&self.index()?, cfg.split_ratio, cfg.seed)?.val)
    }

    fn settings(&self, cfg: TrainingConfig, run: &str) -> RunSettings {
        RunSettings {
            training: cfg,
            paths: RunPaths {
                image_dir: self.images.clone(),
                label_dir: self.labels.clone(),
                temp_root: self.temp_root.clone(),
                model_root: self.model_root.clone(),
                run_name: run.to_string(),
                resume_from: None,
                metrics_out: None,
                split_manifest: None,
                overwrite_checkpoints: false,
            },
            index: IndexOptions::default(),
            preflight: Preflight::Skip,
            progress: ProgressMode::Off,
        }
    }
}

#[test]
fn ten_samples_give_two_full_train_batches_and_partial_val_batch() -> anyhow::Result<()> {
    let fx = Fixture::new(10, &[])?;
    let events = Events::default();
    let mut run = fx
        .training_loop(config(1, 4, 0.8), ScriptedModel::new(0.01), "ten")?
        .with_reporter(Box::new(events.clone()));
    let report = run.run()?;

    assert_eq!(run.state(), LoopState::Done);
    let sizes: Vec<_> = run.model().train_batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![4, 4]);
    let m = &report.epochs[0];
    assert_eq!((m.train_samples, m.val_samples), (8, 2));
    assert_eq!(m.val_loss, Some(0.5));
    assert_eq!(
        events.take(),
        vec!["start 1/1 (2)", "batch 1 n=4", "batch 2 n=4", "done 1 train=8 val=2"]
    );
    Ok(())
}

#[test]
fn missing_label_fails_run_without_checkpointing_that_epoch() -> anyhow::Result<()> {
    let fx = Fixture::new(5, &[3])?;
    let mut run = fx.training_loop(config(2, 2, 1.0), ScriptedModel::new(0.01), "broken")?;
    let err = run.run().unwrap_err();

    assert_eq!(run.state(), LoopState::Failed);
    assert_eq!(err.epoch(), Some(1));
    assert_eq!(err.sample_id(), Some("sample_03"));
    assert!(matches!(
        err.root(),
        TrainError::Dataset(image_dataset::DatasetError::LabelNotFound { .. })
    ));
    let checkpoints = fx.checkpoints("broken")?;
    assert!(!checkpoints.epoch_dir(1).exists());
    assert!(!checkpoints.final_dir().exists());
    assert!(checkpoints.list_epochs()?.is_empty());
    Ok(())
}

#[test]
fn bad_validation_sample_fails_epoch_before_checkpoint() -> anyhow::Result<()> {
    enum Fault {
        MissingLabel,
        CorruptImage,
    }
    for fault in [Fault::MissingLabel, Fault::CorruptImage] {
        let fx = Fixture::new(6, &[])?;
        let cfg = config(2, 2, 0.5);
        let bad = fx.val_samples(&cfg)?.remove(0);
        match fault {
            Fault::MissingLabel => fs::remove_file(&bad.label_path)?,
            Fault::CorruptImage => fs::write(&bad.image_path, b"not a png")?,
        }

        let events = Events::default();
        let mut run = fx
            .training_loop(cfg, ScriptedModel::new(0.01), "val-fault")?
            .with_reporter(Box::new(events.clone()));
        let err = run.run().unwrap_err();

        assert_eq!(run.state(), LoopState::Failed);
        assert_eq!(err.epoch(), Some(1));
        assert_eq!(err.sample_id(), Some(bad.id.as_str()));
        match fault {
            Fault::MissingLabel => assert!(matches!(
                err.root(),
                TrainError::Dataset(image_dataset::DatasetError::LabelNotFound { .. })
            )),
            Fault::CorruptImage => assert!(matches!(
                err.root(),
                TrainError::Dataset(image_dataset::DatasetError::Decode { .. })
            )),
        }
        // training batches of epoch 1 ran; validation stopped the epoch
        assert_eq!(run.model().optimizer_steps(), 2);
        assert!(!events.take().iter().any(|e| e.starts_with("done")));
        let checkpoints = fx.checkpoints("val-fault")?;
        assert!(!checkpoints.epoch_dir(1).exists());
        assert!(!checkpoints.final_dir().exists());
    }
    Ok(())
}

#[test]
fn earlier_run_checkpoints_are_never_replaced() -> anyhow::Result<()> {
    let fx = Fixture::new(4, &[])?;
    let mut first = fx.training_loop(config(3, 2, 1.0), ScriptedModel::new(0.01), "shared")?;
    first.run()?;
    let checkpoints = fx.checkpoints("shared")?;
    let before: Vec<_> = checkpoints
        .list_epochs()?
        .iter()
        .map(|(_, dir)| CheckpointManager::read_meta(dir))
        .collect::<Result<_, _>>()?;
    assert_eq!(before.len(), 3);

    let mut second = fx.training_loop(config(2, 2, 1.0), ScriptedModel::new(0.5), "shared")?;
    let err = second.run().unwrap_err();
    assert_eq!(second.state(), LoopState::Failed);
    assert!(matches!(err.root(), TrainError::CheckpointWrite { .. }));
    assert!(second.model().train_batches.is_empty());

    let after: Vec<_> = checkpoints
        .list_epochs()?
        .iter()
        .map(|(_, dir)| CheckpointManager::read_meta(dir))
        .collect::<Result<_, _>>()?;
    assert_eq!(after, before);
    Ok(())
}

#[test]
fn overwrite_replaces_the_whole_earlier_run() -> anyhow::Result<()> {
    let fx = Fixture::new(4, &[])?;
    fx.training_loop(config(3, 2, 1.0), ScriptedModel::new(0.01), "again")?
        .run()?;

    let checkpoints = fx.checkpoints("again")?.with_overwrite(true);
    let mut second = fx.training_loop_on(config(2, 2, 1.0), ScriptedModel::new(0.5), checkpoints)?;
    let report = second.run()?;

    let checkpoints = fx.checkpoints("again")?;
    let epochs: Vec<_> = checkpoints.list_epochs()?.into_iter().map(|(e, _)| e).collect();
    assert_eq!(epochs, vec![1, 2]);
    for dir in &report.epoch_checkpoints {
        assert_eq!(CheckpointManager::read_meta(dir)?.learning_rate, 0.5);
    }
    assert_eq!(CheckpointManager::read_meta(&checkpoints.final_dir())?.metrics.epoch, 2);
    Ok(())
}

#[test]
fn skip_policy_trains_around_missing_label() -> anyhow::Result<()> {
    let fx = Fixture::new(5, &[3])?;
    let cfg = TrainingConfig {
        sample_policy: SamplePolicy::Skip,
        ..config(2, 2, 1.0)
    };
    let mut run = fx.training_loop(cfg, ScriptedModel::new(0.01), "lenient")?;
    let report = run.run()?;
    assert_eq!(report.epochs.len(), 2);
    for m in &report.epochs {
        assert_eq!(m.train_samples, 4);
        assert_eq!(m.skipped_samples, 1);
        assert_eq!(m.val_loss, None);
    }
    let seen: Vec<_> = run.model().train_batches.concat();
    assert!(!seen.contains(&"sample_03".to_string()));
    Ok(())
}

#[test]
fn three_epochs_leave_three_epoch_checkpoints_and_final() -> anyhow::Result<()> {
    let fx = Fixture::new(6, &[])?;
    let mut run = fx.training_loop(config(3, 2, 0.5), ScriptedModel::new(0.01), "three")?;
    let report = run.run()?;

    let checkpoints = fx.checkpoints("three")?;
    let epochs: Vec<_> = checkpoints.list_epochs()?.into_iter().map(|(e, _)| e).collect();
    assert_eq!(epochs, vec![1, 2, 3]);
    assert_eq!(report.epoch_checkpoints.len(), 3);
    assert_eq!(report.final_checkpoint, checkpoints.final_dir());

    for (i, dir) in report.epoch_checkpoints.iter().enumerate() {
        let meta = CheckpointManager::read_meta(dir)?;
        assert_eq!(meta.kind, CheckpointKind::Epoch { epoch: i + 1 });
        assert_eq!(meta.metrics, report.epochs[i]);
        assert_eq!(meta.run_name, "three");
    }
    let final_meta = CheckpointManager::read_meta(&report.final_checkpoint)?;
    assert_eq!(final_meta.kind, CheckpointKind::Final);
    assert_eq!(Some(&final_meta.metrics), report.last_metrics());
    assert_eq!(final_meta.metrics.epoch, 3);
    assert!(report.final_checkpoint.join(META_FILE).is_file());
    Ok(())
}

#[test]
fn validation_runs_before_each_checkpoint() -> anyhow::Result<()> {
    let fx = Fixture::new(6, &[])?;
    let mut run = fx.training_loop(config(2, 2, 0.5), ScriptedModel::new(0.01), "order")?;
    let report = run.run()?;
    // val split has 3 samples: every checkpoint must already include them
    for (i, dir) in report.epoch_checkpoints.iter().enumerate() {
        let meta = CheckpointManager::read_meta(dir)?;
        assert_eq!(meta.metrics.val_samples, 3, "epoch {}", i + 1);
        let state: SavedState = serde_json::from_slice(&fs::read(dir.join("weights.json"))?)?;
        assert_eq!(state.steps, 2 * (i + 1));
    }
    Ok(())
}

#[test]
fn checkpoint_write_failure_is_fatal() -> anyhow::Result<()> {
    let fx = Fixture::new(4, &[])?;
    let mut model = ScriptedModel::new(0.01);
    model.fail_save = true;
    let mut run = fx.training_loop(config(2, 2, 1.0), model, "nospace")?;
    let err = run.run().unwrap_err();
    assert_eq!(run.state(), LoopState::Failed);
    assert!(matches!(err.root(), TrainError::CheckpointWrite { .. }));
    let checkpoints = fx.checkpoints("nospace")?;
    assert!(checkpoints.list_epochs()?.is_empty());
    assert!(!checkpoints.final_dir().exists());
    Ok(())
}

#[test]
fn reporter_failures_do_not_stop_training() -> anyhow::Result<()> {
    let fx = Fixture::new(4, &[])?;
    let mut run = fx
        .training_loop(config(2, 2, 1.0), ScriptedModel::new(0.01), "noisy")?
        .with_reporter(Box::new(Exploding));
    let report = run.run()?;
    assert_eq!(run.state(), LoopState::Done);
    assert_eq!(report.epochs.len(), 2);
    Ok(())
}

#[test]
fn loop_runs_once() -> anyhow::Result<()> {
    let fx = Fixture::new(4, &[])?;
    let mut run = fx.training_loop(config(1, 2, 1.0), ScriptedModel::new(0.01), "once")?;
    run.run()?;
    assert!(matches!(run.run(), Err(TrainError::Config(_))));
    assert_eq!(run.state(), LoopState::Done);
    Ok(())
}

#[test]
fn reshuffle_flag_controls_epoch_order() -> anyhow::Result<()> {
    let fx = Fixture::new(12, &[])?;
    let order_per_epoch = |reshuffle: bool| -> anyhow::Result<Vec<Vec<String>>> {
        let cfg = TrainingConfig {
            reshuffle_each_epoch: reshuffle,
            ..config(2, 12, 1.0)
        };
        let mut run = fx.training_loop(cfg, ScriptedModel::new(0.01), &format!("shuffle-{reshuffle}"))?;
        run.run()?;
        Ok(run.into_model().train_batches)
    };

    let fixed = order_per_epoch(false)?;
    assert_eq!(fixed[0], fixed[1]);

    let shuffled = order_per_epoch(true)?;
    assert_ne!(shuffled[0], shuffled[1]);
    let mut a = shuffled[0].clone();
    let mut b = shuffled[1].clone();
    a.sort();
    b.sort();
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn resume_loads_weights_with_fresh_optimizer() -> anyhow::Result<()> {
    let fx = Fixture::new(6, &[])?;
    let mut run = fx.training_loop(config(2, 2, 1.0), ScriptedModel::new(0.01), "first")?;
    let report = run.run()?;
    let trained = run.into_model();
    assert_eq!(trained.optimizer_steps(), 6);

    let resumed: ScriptedModel =
        CheckpointManager::load_for_resume(&report.final_checkpoint, 5e-4)?;
    assert_eq!(resumed.learning_rate(), 5e-4);
    assert_eq!(resumed.optimizer_steps(), 0);
    assert!((resumed.weight - trained.weight).abs() < 1e-6);

    let missing = CheckpointManager::load_for_resume::<ScriptedModel>(&fx.model_root.join("nope"), 1e-3);
    assert!(matches!(missing, Err(TrainError::CheckpointLoad { .. })));
    Ok(())
}

#[test]
fn train_with_resumes_from_checkpoint_directory() -> anyhow::Result<()> {
    let fx = Fixture::new(6, &[])?;
    let first = training::train_with(
        fx.settings(config(1, 3, 1.0), "base"),
        Box::new(training::NullReporter),
        |cfg: &TrainingConfig| Ok(ScriptedModel::new(cfg.learning_rate)),
    )?;

    let mut settings = fx.settings(config(1, 3, 1.0), "tuned");
    settings.training.learning_rate = 1e-4;
    settings.paths.resume_from = Some(first.final_checkpoint.clone());
    settings.paths.split_manifest = Some(fx.temp_root.join("split.json"));
    let second = training::train_with(settings, Box::new(training::NullReporter), |_: &TrainingConfig| {
        Err::<ScriptedModel, _>(TrainError::Model("fresh model must not be built on resume".into()))
    })?;

    let meta = CheckpointManager::read_meta(&second.final_checkpoint)?;
    assert_eq!(meta.learning_rate, 1e-4);
    assert_eq!(meta.run_name, "tuned");
    let manifest: data_contracts::SplitManifest =
        serde_json::from_slice(&fs::read(fx.temp_root.join("split.json"))?)?;
    assert_eq!(manifest.train.len(), 6);
    assert!(manifest.val.is_empty());
    Ok(())
}

#[test]
fn strict_preflight_rejects_missing_labels() -> anyhow::Result<()> {
    let fx = Fixture::new(4, &[0])?;
    let mut settings = fx.settings(config(1, 2, 1.0), "preflight");
    settings.preflight = Preflight::Strict;
    let err = training::train_with(settings, Box::new(training::NullReporter), |cfg: &TrainingConfig| {
        Ok(ScriptedModel::new(cfg.learning_rate))
    })
    .unwrap_err();
    assert!(matches!(err, TrainError::Config(ref msg) if msg.contains("preflight")));
    assert!(!fx.temp_root.join("preflight").exists());
    Ok(())
}

#[test]
fn epoch_checkpoints_must_increase() -> anyhow::Result<()> {
    let fx = Fixture::new(1, &[])?;
    let mut checkpoints = fx.checkpoints("manual")?;
    let model = ScriptedModel::new(0.01);
    let metrics = EpochMetrics::default();
    checkpoints.save_epoch(2, &model, &metrics)?;
    assert!(matches!(
        checkpoints.save_epoch(2, &model, &metrics),
        Err(TrainError::CheckpointOrder { epoch: 2, last: 2 })
    ));
    assert!(matches!(
        checkpoints.save_epoch(1, &model, &metrics),
        Err(TrainError::CheckpointOrder { epoch: 1, last: 2 })
    ));
    checkpoints.save_epoch(3, &model, &metrics)?;

    // final slot is replaced, not merged
    let final_dir = checkpoints.save_final(&model, &metrics)?;
    fs::write(final_dir.join("stale.txt"), "old")?;
    let leftover = fx.model_root.join(".manual.previous");
    fs::create_dir_all(&leftover)?;
    checkpoints.save_final(&model, &metrics)?;
    assert!(!final_dir.join("stale.txt").exists());
    assert!(final_dir.join("weights.json").is_file());
    assert!(!leftover.exists());

    // an epoch directory already on disk is never replaced
    let mut other = fx.checkpoints("manual")?;
    assert!(matches!(
        other.save_epoch(3, &model, &metrics),
        Err(TrainError::CheckpointWrite { .. })
    ));

    assert!(CheckpointManager::new(&fx.temp_root, &fx.model_root, "../escape").is_err());
    Ok(())
}
