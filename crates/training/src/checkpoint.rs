//! Per-epoch and final checkpoints on disk.
//!
//! Layout:
//! - `temp_root/<run>/epoch-<n>/` after each completed epoch,
//! - `model_root/<run>/` once the whole run succeeded.
//!
//! Each directory holds the model files plus `checkpoint.json`. Directories are
//! assembled in a hidden sibling and renamed into place, so a crash never leaves
//! a half-written checkpoint under its final name.
//!
//! Epoch checkpoints are append-only: a run refuses to start over epoch
//! directories already on disk unless overwriting was requested, in which case
//! the old epochs of that run are removed first. Only the final slot is replaced.

use crate::error::{TrainError, TrainResult};
use crate::trainable::{Restore, Trainable};
use data_contracts::{CheckpointKind, CheckpointMeta, EpochMetrics};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const META_FILE: &str = "checkpoint.json";
const EPOCH_PREFIX: &str = "epoch-";

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    temp_root: PathBuf,
    model_root: PathBuf,
    run_name: String,
    last_epoch: Option<usize>,
    overwrite: bool,
}

impl CheckpointManager {
    pub fn new(temp_root: &Path, model_root: &Path, run_name: &str) -> TrainResult<Self> {
        let bad_name = run_name.trim().is_empty()
            || run_name.contains(['/', '\\'])
            || run_name == "."
            || run_name == "..";
        if bad_name {
            return Err(TrainError::Config(format!("invalid run name {run_name:?}")));
        }
        Ok(Self {
            temp_root: temp_root.to_path_buf(),
            model_root: model_root.to_path_buf(),
            run_name: run_name.to_string(),
            last_epoch: None,
            overwrite: false,
        })
    }

    /// Allow this run to replace epoch checkpoints left by an earlier run of the same name.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    fn run_dir(&self) -> PathBuf {
        self.temp_root.join(&self.run_name)
    }

    /// Make sure no earlier epoch checkpoints stand in the way of this run.
    pub fn prepare(&self) -> TrainResult<()> {
        let existing = self.list_epochs()?;
        if existing.is_empty() {
            return Ok(());
        }
        let run_dir = self.run_dir();
        if !self.overwrite {
            return Err(TrainError::CheckpointWrite {
                path: run_dir,
                msg: format!(
                    "run {:?} already has {} epoch checkpoint(s); choose another run name or enable overwrite",
                    self.run_name,
                    existing.len()
                ),
            });
        }
        log::warn!(
            "removing {} epoch checkpoint(s) of an earlier run from {}",
            existing.len(),
            run_dir.display()
        );
        for (_, dir) in existing {
            fs::remove_dir_all(&dir).map_err(|e| TrainError::CheckpointWrite {
                path: dir.clone(),
                msg: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn epoch_dir(&self, epoch: usize) -> PathBuf {
        self.temp_root
            .join(&self.run_name)
            .join(format!("{EPOCH_PREFIX}{epoch}"))
    }

    pub fn final_dir(&self) -> PathBuf {
        self.model_root.join(&self.run_name)
    }

    /// Persist the model after `epoch`. Epochs must strictly increase per manager.
    pub fn save_epoch<M: Trainable + ?Sized>(
        &mut self,
        epoch: usize,
        model: &M,
        metrics: &EpochMetrics,
    ) -> TrainResult<PathBuf> {
        if let Some(last) = self.last_epoch {
            if epoch <= last {
                return Err(TrainError::CheckpointOrder { epoch, last });
            }
        }
        let dir = self.epoch_dir(epoch);
        if dir.exists() {
            if !self.overwrite {
                return Err(TrainError::CheckpointWrite {
                    path: dir,
                    msg: "epoch checkpoint already exists".into(),
                });
            }
            log::warn!("replacing checkpoint {} from an earlier run", dir.display());
        }
        self.write(&dir, CheckpointKind::Epoch { epoch }, model, metrics)?;
        self.last_epoch = Some(epoch);
        log::info!("saved epoch {epoch} checkpoint to {}", dir.display());
        Ok(dir)
    }

    /// Persist the final model, replacing any previous final checkpoint of this run.
    pub fn save_final<M: Trainable + ?Sized>(
        &self,
        model: &M,
        metrics: &EpochMetrics,
    ) -> TrainResult<PathBuf> {
        let dir = self.final_dir();
        self.write(&dir, CheckpointKind::Final, model, metrics)?;
        log::info!("saved final model to {}", dir.display());
        Ok(dir)
    }

    /// Load weights from any checkpoint directory and start a fresh optimizer at `learning_rate`.
    pub fn load_for_resume<M: Restore>(path: &Path, learning_rate: f64) -> TrainResult<M> {
        if !path.is_dir() {
            return Err(TrainError::CheckpointLoad {
                path: path.to_path_buf(),
                msg: "not a checkpoint directory".into(),
            });
        }
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(TrainError::Config(format!(
                "learning rate must be positive, got {learning_rate}"
            )));
        }
        let model = M::restore(path, learning_rate)?;
        log::info!(
            "resuming from {} with learning rate {learning_rate}",
            path.display()
        );
        Ok(model)
    }

    /// Epoch checkpoints of this run currently on disk, ascending.
    pub fn list_epochs(&self) -> TrainResult<Vec<(usize, PathBuf)>> {
        let run_dir = self.run_dir();
        let entries = match fs::read_dir(&run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(TrainError::Io {
                    path: run_dir,
                    source,
                })
            }
        };
        let mut epochs: Vec<_> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name();
                let epoch = name.to_str()?.strip_prefix(EPOCH_PREFIX)?.parse().ok()?;
                Some((epoch, e.path()))
            })
            .collect();
        epochs.sort_by_key(|(epoch, _)| *epoch);
        Ok(epochs)
    }

    pub fn read_meta(dir: &Path) -> TrainResult<CheckpointMeta> {
        let path = dir.join(META_FILE);
        let raw = fs::read(&path).map_err(|e| TrainError::CheckpointLoad {
            path: path.clone(),
            msg: e.to_string(),
        })?;
        serde_json::from_slice(&raw).map_err(|e| TrainError::CheckpointLoad {
            path,
            msg: e.to_string(),
        })
    }

    fn write<M: Trainable + ?Sized>(
        &self,
        dir: &Path,
        kind: CheckpointKind,
        model: &M,
        metrics: &EpochMetrics,
    ) -> TrainResult<()> {
        let write_err = |msg: String| TrainError::CheckpointWrite {
            path: dir.to_path_buf(),
            msg,
        };
        let (Some(parent), Some(name)) = (dir.parent(), dir.file_name()) else {
            return Err(write_err("checkpoint path has no parent".into()));
        };
        let staging = parent.join(format!(".{}.partial", name.to_string_lossy()));
        fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| write_err(e.to_string()))?;
        }
        fs::create_dir_all(&staging).map_err(|e| write_err(e.to_string()))?;

        let staged = model.save(&staging).and_then(|()| {
            let meta = CheckpointMeta {
                run_name: self.run_name.clone(),
                kind,
                metrics: metrics.clone(),
                model: model.descriptor().clone(),
                learning_rate: model.learning_rate(),
                created_at_ms: now_ms(),
            };
            let raw = serde_json::to_vec_pretty(&meta).map_err(|e| write_err(e.to_string()))?;
            fs::write(staging.join(META_FILE), raw).map_err(|e| write_err(e.to_string()))
        });
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            return Err(match e {
                TrainError::CheckpointWrite { msg, .. } => write_err(msg),
                other => write_err(other.to_string()),
            });
        }

        if !dir.exists() {
            return fs::rename(&staging, dir).map_err(|e| write_err(e.to_string()));
        }
        // swap: old content moves aside and comes back if the rename fails
        let previous = parent.join(format!(".{}.previous", name.to_string_lossy()));
        if previous.exists() {
            fs::remove_dir_all(&previous).map_err(|e| write_err(e.to_string()))?;
        }
        fs::rename(dir, &previous).map_err(|e| write_err(e.to_string()))?;
        if let Err(e) = fs::rename(&staging, dir) {
            if let Err(restore) = fs::rename(&previous, dir) {
                log::error!(
                    "could not restore {} from {}: {restore}",
                    dir.display(),
                    previous.display()
                );
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(write_err(e.to_string()));
        }
        if let Err(e) = fs::remove_dir_all(&previous) {
            log::warn!("could not remove {}: {e}", previous.display());
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
