//! Batch assembly for training and validation streams.

use crate::labels::LabelSource;
use crate::transform::{DecodeError, Transform};
use crate::types::{Batch, DatasetError, DatasetResult, Sample};
use data_contracts::LabelRecord;
use rayon::prelude::*;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

/// What to do with a sample whose label or image cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplePolicy {
    /// End the stream with the error.
    #[default]
    Abort,
    /// Log, count and drop the sample.
    Skip,
}

/// Number of batches a stream of `samples` yields at `batch_size`.
pub fn batch_count(samples: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        samples.div_ceil(batch_size)
    }
}

/// Counters shared with whoever consumes the stream, possibly on another thread.
#[derive(Debug, Default)]
pub struct StreamCounters {
    batches: AtomicUsize,
    samples: AtomicUsize,
    skipped: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub batches: usize,
    pub samples: usize,
    pub skipped: usize,
}

impl StreamCounters {
    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            batches: self.batches.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Lazy, single-pass iterator of batches over an ordered sample list.
///
/// Every batch holds `batch_size` samples except possibly the last. Samples of
/// one batch are decoded in parallel and emitted in stream order. After the
/// first error the iterator is exhausted.
pub struct BatchAssembler {
    samples: Vec<Sample>,
    cursor: usize,
    batch_size: usize,
    labels: LabelSource,
    transform: Arc<dyn Transform>,
    policy: SamplePolicy,
    name: String,
    failed: bool,
    counters: Arc<StreamCounters>,
    started: Instant,
    total_load_time: Duration,
    last_logged_samples: usize,
    log_every_samples: Option<usize>,
}

impl BatchAssembler {
    pub fn new(
        samples: Vec<Sample>,
        batch_size: usize,
        labels: LabelSource,
        transform: Arc<dyn Transform>,
    ) -> Self {
        let log_every_samples = match std::env::var("IMAGE_DATASET_LOG_EVERY") {
            Ok(val) => {
                if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                    None
                } else {
                    val.trim().parse::<usize>().ok().filter(|v| *v > 0)
                }
            }
            Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
        };
        Self {
            samples,
            cursor: 0,
            batch_size: batch_size.max(1),
            labels,
            transform,
            policy: SamplePolicy::Abort,
            name: "stream".to_string(),
            failed: false,
            counters: Arc::new(StreamCounters::default()),
            started: Instant::now(),
            total_load_time: Duration::ZERO,
            last_logged_samples: 0,
            log_every_samples,
        }
    }

    pub fn with_policy(mut self, policy: SamplePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Name used in progress logs, e.g. `train` or `val`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn counters(&self) -> Arc<StreamCounters> {
        Arc::clone(&self.counters)
    }

    /// Batches this stream yields when no sample is skipped.
    pub fn total_batches(&self) -> usize {
        batch_count(self.samples.len(), self.batch_size)
    }

    pub fn total_samples(&self) -> usize {
        self.samples.len()
    }

    fn maybe_log_progress(&mut self, finished: bool) {
        let Some(threshold) = self.log_every_samples else {
            return;
        };
        let stats = self.counters.snapshot();
        let since = stats.samples.saturating_sub(self.last_logged_samples);
        if since < threshold && !(finished && since > 0) {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let avg_load_ms = if stats.batches > 0 {
            self.total_load_time.as_secs_f64() * 1000.0 / stats.batches as f64
        } else {
            0.0
        };
        log::info!(
            "[dataset:{}] batches={} samples={} skipped={} elapsed={:.1}s rate={:.1} img/s avg_load_ms={:.2}",
            self.name,
            stats.batches,
            stats.samples,
            stats.skipped,
            secs,
            stats.samples as f32 / secs,
            avg_load_ms
        );
        self.last_logged_samples = stats.samples;
    }
}

impl Iterator for BatchAssembler {
    type Item = DatasetResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.cursor >= self.samples.len() {
                self.maybe_log_progress(true);
                return None;
            }
            let end = (self.cursor + self.batch_size).min(self.samples.len());
            let slice = &self.samples[self.cursor..end];
            self.cursor = end;

            let t_load = Instant::now();
            let labels = self.labels;
            let transform = self.transform.as_ref();
            let loaded: Vec<_> = slice
                .par_iter()
                .map(|sample| load_sample(sample, &labels, transform))
                .collect();
            self.total_load_time += t_load.elapsed();

            let shape = self.transform.shape();
            let label_len = self.labels.label_len();
            let mut batch = Batch {
                ids: Vec::with_capacity(slice.len()),
                inputs: Vec::with_capacity(slice.len() * shape.len()),
                labels: Vec::with_capacity(slice.len() * label_len),
                shape,
                label_len,
            };
            for (sample, res) in slice.iter().zip(loaded) {
                match res {
                    Ok((pixels, label)) => {
                        batch.ids.push(sample.id.clone());
                        batch.inputs.extend_from_slice(&pixels);
                        batch.labels.extend_from_slice(&label.values);
                    }
                    Err(e) if self.policy == SamplePolicy::Skip && e.is_sample_error() => {
                        log::warn!("skipping sample {}: {e}", sample.id);
                        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }
            if batch.is_empty() {
                continue;
            }
            self.counters.batches.fetch_add(1, Ordering::Relaxed);
            self.counters
                .samples
                .fetch_add(batch.len(), Ordering::Relaxed);
            self.maybe_log_progress(false);
            return Some(Ok(batch));
        }
    }
}

fn load_sample(
    sample: &Sample,
    labels: &LabelSource,
    transform: &dyn Transform,
) -> DatasetResult<(Vec<f32>, LabelRecord)> {
    let label = labels.load(sample)?;
    let bytes = fs::read(&sample.image_path).map_err(|source| DatasetError::SampleIo {
        sample_id: sample.id.clone(),
        path: sample.image_path.clone(),
        source,
    })?;
    let decode_err = |source| DatasetError::Decode {
        sample_id: sample.id.clone(),
        path: sample.image_path.clone(),
        source,
    };
    let pixels = transform.decode(&bytes).map_err(decode_err)?;
    let expected = transform.shape().len();
    if pixels.len() != expected {
        return Err(decode_err(DecodeError::Shape {
            expected,
            actual: pixels.len(),
        }));
    }
    Ok((pixels, label))
}
