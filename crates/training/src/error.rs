use image_dataset::DatasetError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("failed to write checkpoint {path}: {msg}")]
    CheckpointWrite { path: PathBuf, msg: String },
    #[error("failed to load checkpoint {path}: {msg}")]
    CheckpointLoad { path: PathBuf, msg: String },
    #[error("checkpoint for epoch {epoch} out of order (last saved epoch {last})")]
    CheckpointOrder { epoch: usize, last: usize },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("epoch {epoch} failed: {source}")]
    Epoch {
        epoch: usize,
        #[source]
        source: Box<TrainError>,
    },
}

impl TrainError {
    /// Attach the epoch in which the error happened.
    pub fn in_epoch(self, epoch: usize) -> Self {
        match self {
            TrainError::Epoch { .. } => self,
            other => TrainError::Epoch {
                epoch,
                source: Box::new(other),
            },
        }
    }

    pub fn epoch(&self) -> Option<usize> {
        match self {
            TrainError::Epoch { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }

    /// The underlying error, without the epoch wrapper.
    pub fn root(&self) -> &TrainError {
        match self {
            TrainError::Epoch { source, .. } => source.root(),
            other => other,
        }
    }

    /// Id of the sample involved, when the failure came from one sample.
    pub fn sample_id(&self) -> Option<&str> {
        match self.root() {
            TrainError::Dataset(e) => e.sample_id(),
            _ => None,
        }
    }
}
