use crate::types::{DatasetError, DatasetResult, Sample};
use data_contracts::{LabelFile, LabelRecord};
use std::fs;
use std::io::ErrorKind;

/// Loads and validates the label record of a sample on demand.
#[derive(Debug, Clone, Copy)]
pub struct LabelSource {
    label_len: usize,
}

impl LabelSource {
    pub fn new(label_len: usize) -> Self {
        Self { label_len }
    }

    pub fn label_len(&self) -> usize {
        self.label_len
    }

    pub fn load(&self, sample: &Sample) -> DatasetResult<LabelRecord> {
        let raw = match fs::read(&sample.label_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DatasetError::LabelNotFound {
                    sample_id: sample.id.clone(),
                    path: sample.label_path.clone(),
                })
            }
            Err(source) => {
                return Err(DatasetError::SampleIo {
                    sample_id: sample.id.clone(),
                    path: sample.label_path.clone(),
                    source,
                })
            }
        };
        let parse_err = |msg: String| DatasetError::LabelParse {
            sample_id: sample.id.clone(),
            path: sample.label_path.clone(),
            msg,
        };
        let file: LabelFile =
            serde_json::from_slice(&raw).map_err(|e| parse_err(e.to_string()))?;
        file.into_record(self.label_len)
            .map_err(|e| parse_err(e.to_string()))
    }
}
