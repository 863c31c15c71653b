//! Core types and error definitions for image_dataset.

use crate::transform::DecodeError;
use data_contracts::ImageShape;
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot read image directory {path}: {source}")]
    Index {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no images found in {path}")]
    EmptyIndex { path: PathBuf },
    #[error("split ratio {ratio} outside (0, 1]")]
    InvalidSplitRatio { ratio: f64 },
    #[error("label for sample {sample_id} not found at {path}")]
    LabelNotFound { sample_id: String, path: PathBuf },
    #[error("label for sample {sample_id} at {path} is invalid: {msg}")]
    LabelParse {
        sample_id: String,
        path: PathBuf,
        msg: String,
    },
    #[error("cannot read {path} for sample {sample_id}: {source}")]
    SampleIo {
        sample_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sample {sample_id} at {path} could not be decoded: {source}")]
    Decode {
        sample_id: String,
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
}

impl DatasetError {
    /// Id of the sample that caused the error, for per-sample failures.
    pub fn sample_id(&self) -> Option<&str> {
        match self {
            DatasetError::LabelNotFound { sample_id, .. }
            | DatasetError::LabelParse { sample_id, .. }
            | DatasetError::SampleIo { sample_id, .. }
            | DatasetError::Decode { sample_id, .. } => Some(sample_id),
            _ => None,
        }
    }

    /// Errors confined to a single sample, which the skip policy may tolerate.
    pub fn is_sample_error(&self) -> bool {
        self.sample_id().is_some()
    }
}

/// One image and the location of its label record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sample {
    /// Image file stem, also the label file stem.
    pub id: String,
    pub image_path: PathBuf,
    pub label_path: PathBuf,
}

/// Decoded samples ready for the model, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub ids: Vec<String>,
    /// `len × C × H × W`, values in [0, 1].
    pub inputs: Vec<f32>,
    /// `len × label_len`.
    pub labels: Vec<f32>,
    pub shape: ImageShape,
    pub label_len: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Label row of the `i`-th sample.
    pub fn label(&self, i: usize) -> Option<&[f32]> {
        let start = i.checked_mul(self.label_len)?;
        self.labels.get(start..start + self.label_len)
    }
}
