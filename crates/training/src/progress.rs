//! Observers of training progress. Failures here never stop training.

use crate::trainable::BatchMetrics;
use data_contracts::EpochMetrics;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("progress reporter: {0}")]
pub struct ReporterError(pub String);

pub trait ProgressReporter {
    fn on_epoch_start(
        &mut self,
        epoch: usize,
        total_epochs: usize,
        total_batches: usize,
    ) -> Result<(), ReporterError>;

    /// `batch_index` counts from 1 within the epoch.
    fn on_batch_complete(
        &mut self,
        batch_index: usize,
        metrics: &BatchMetrics,
    ) -> Result<(), ReporterError>;

    fn on_epoch_complete(
        &mut self,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<(), ReporterError>;

    fn on_finish(&mut self) -> Result<(), ReporterError> {
        Ok(())
    }
}

/// Invoke a reporter hook, logging and swallowing errors and panics.
pub(crate) fn notify<F>(reporter: &mut dyn ProgressReporter, hook: &str, f: F)
where
    F: FnOnce(&mut dyn ProgressReporter) -> Result<(), ReporterError>,
{
    match catch_unwind(AssertUnwindSafe(|| f(reporter))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("{hook}: {e}"),
        Err(_) => log::warn!("{hook}: reporter panicked"),
    }
}

pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn on_epoch_start(&mut self, _: usize, _: usize, _: usize) -> Result<(), ReporterError> {
        Ok(())
    }

    fn on_batch_complete(&mut self, _: usize, _: &BatchMetrics) -> Result<(), ReporterError> {
        Ok(())
    }

    fn on_epoch_complete(&mut self, _: usize, _: &EpochMetrics) -> Result<(), ReporterError> {
        Ok(())
    }
}

/// Plain log lines, for non-interactive runs.
#[derive(Default)]
pub struct LogReporter {
    log_every_batches: usize,
}

impl LogReporter {
    pub fn new(log_every_batches: usize) -> Self {
        Self { log_every_batches }
    }
}

impl ProgressReporter for LogReporter {
    fn on_epoch_start(
        &mut self,
        epoch: usize,
        total_epochs: usize,
        total_batches: usize,
    ) -> Result<(), ReporterError> {
        log::info!("epoch {epoch}/{total_epochs}: {total_batches} batches");
        Ok(())
    }

    fn on_batch_complete(
        &mut self,
        batch_index: usize,
        metrics: &BatchMetrics,
    ) -> Result<(), ReporterError> {
        if self.log_every_batches > 0 && batch_index % self.log_every_batches == 0 {
            log::info!("  batch {batch_index}: loss {:.4}", metrics.loss);
        }
        Ok(())
    }

    fn on_epoch_complete(
        &mut self,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<(), ReporterError> {
        log::info!("epoch {epoch}: {}", format_epoch(metrics));
        Ok(())
    }
}

/// Epoch bar over a per-epoch batch bar with ETA.
pub struct ConsoleReporter {
    multi: MultiProgress,
    epoch_bar: Option<ProgressBar>,
    batch_bar: Option<ProgressBar>,
    running_loss: f64,
    running_samples: usize,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            epoch_bar: None,
            batch_bar: None,
            running_loss: 0.0,
            running_samples: 0,
        }
    }

    fn style(template: &str) -> Result<ProgressStyle, ReporterError> {
        ProgressStyle::with_template(template).map_err(|e| ReporterError(e.to_string()))
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ConsoleReporter {
    fn on_epoch_start(
        &mut self,
        epoch: usize,
        total_epochs: usize,
        total_batches: usize,
    ) -> Result<(), ReporterError> {
        if self.epoch_bar.is_none() {
            let bar = self.multi.add(ProgressBar::new(total_epochs as u64));
            bar.set_style(Self::style(" [epoch {pos}/{len}] {wide_msg}")?);
            self.epoch_bar = Some(bar);
        }
        if let Some(old) = self.batch_bar.take() {
            old.finish_and_clear();
        }
        let bar = self.multi.add(ProgressBar::new(total_batches as u64));
        bar.set_style(
            Self::style(
                "  [ep {prefix}] {elapsed_precise} [{bar:40}] {pos}/{len} eta {eta_precise} {msg}",
            )?
            .progress_chars("=> "),
        );
        bar.set_prefix(epoch.to_string());
        self.batch_bar = Some(bar);
        self.running_loss = 0.0;
        self.running_samples = 0;
        Ok(())
    }

    fn on_batch_complete(
        &mut self,
        _batch_index: usize,
        metrics: &BatchMetrics,
    ) -> Result<(), ReporterError> {
        self.running_loss += metrics.loss as f64 * metrics.samples as f64;
        self.running_samples += metrics.samples;
        if let Some(bar) = &self.batch_bar {
            let mean = self.running_loss / self.running_samples.max(1) as f64;
            bar.set_message(format!("loss {mean:.4}"));
            bar.inc(1);
        }
        Ok(())
    }

    fn on_epoch_complete(
        &mut self,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<(), ReporterError> {
        if let Some(bar) = self.batch_bar.take() {
            bar.finish_and_clear();
        }
        let line = format!("epoch {epoch}: {}", format_epoch(metrics));
        if let Some(bar) = &self.epoch_bar {
            bar.set_message(line.clone());
            bar.inc(1);
        }
        self.multi
            .println(line)
            .map_err(|e| ReporterError(e.to_string()))
    }

    fn on_finish(&mut self) -> Result<(), ReporterError> {
        if let Some(bar) = self.batch_bar.take() {
            bar.finish_and_clear();
        }
        if let Some(bar) = self.epoch_bar.take() {
            bar.finish_with_message("training done");
        }
        Ok(())
    }
}

/// Appends one JSON line per completed epoch.
pub struct MetricsFileReporter {
    path: PathBuf,
    run_name: String,
}

impl MetricsFileReporter {
    pub fn new(path: PathBuf, run_name: impl Into<String>) -> Self {
        Self {
            path,
            run_name: run_name.into(),
        }
    }
}

impl ProgressReporter for MetricsFileReporter {
    fn on_epoch_start(&mut self, _: usize, _: usize, _: usize) -> Result<(), ReporterError> {
        Ok(())
    }

    fn on_batch_complete(&mut self, _: usize, _: &BatchMetrics) -> Result<(), ReporterError> {
        Ok(())
    }

    fn on_epoch_complete(
        &mut self,
        _epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<(), ReporterError> {
        let io_err = |e: std::io::Error| ReporterError(format!("{}: {e}", self.path.display()));
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let record = serde_json::json!({
            "run": self.run_name,
            "epoch": metrics.epoch,
            "loss": metrics.loss,
            "acc": metrics.accuracy,
            "val_loss": metrics.val_loss,
            "val_acc": metrics.val_accuracy,
            "train_samples": metrics.train_samples,
            "val_samples": metrics.val_samples,
            "skipped": metrics.skipped_samples,
        });
        writeln!(file, "{record}").map_err(io_err)
    }
}

/// Forwards every hook to each inner reporter; one failing does not starve the rest.
pub struct FanoutReporter {
    inner: Vec<Box<dyn ProgressReporter>>,
}

impl FanoutReporter {
    pub fn new(inner: Vec<Box<dyn ProgressReporter>>) -> Self {
        Self { inner }
    }

    fn each<F>(&mut self, mut f: F) -> Result<(), ReporterError>
    where
        F: FnMut(&mut dyn ProgressReporter) -> Result<(), ReporterError>,
    {
        let errors: Vec<String> = self
            .inner
            .iter_mut()
            .filter_map(|r| f(r.as_mut()).err().map(|e| e.0))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReporterError(errors.join("; ")))
        }
    }
}

impl ProgressReporter for FanoutReporter {
    fn on_epoch_start(
        &mut self,
        epoch: usize,
        total_epochs: usize,
        total_batches: usize,
    ) -> Result<(), ReporterError> {
        self.each(|r| r.on_epoch_start(epoch, total_epochs, total_batches))
    }

    fn on_batch_complete(
        &mut self,
        batch_index: usize,
        metrics: &BatchMetrics,
    ) -> Result<(), ReporterError> {
        self.each(|r| r.on_batch_complete(batch_index, metrics))
    }

    fn on_epoch_complete(
        &mut self,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<(), ReporterError> {
        self.each(|r| r.on_epoch_complete(epoch, metrics))
    }

    fn on_finish(&mut self) -> Result<(), ReporterError> {
        self.each(|r| r.on_finish())
    }
}

pub fn format_epoch(m: &EpochMetrics) -> String {
    let opt = |v: Option<f32>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
    format!(
        "loss {:.4} acc {} val_loss {} val_acc {}",
        m.loss,
        opt(m.accuracy),
        opt(m.val_loss),
        opt(m.val_accuracy)
    )
}
