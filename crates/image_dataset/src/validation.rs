//! Preflight label checks over a whole index.

use crate::index::SampleIndex;
use crate::labels::LabelSource;
use crate::types::DatasetError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const MAX_LISTED_IDS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub total: usize,
    pub labelled: usize,
    pub missing_labels: usize,
    pub invalid_labels: usize,
    /// First few offending sample ids, for the log.
    pub missing_ids: Vec<String>,
    pub invalid_ids: Vec<String>,
}

impl IndexSummary {
    pub fn is_clean(&self) -> bool {
        self.missing_labels == 0 && self.invalid_labels == 0
    }
}

/// Loads every label without stopping at the first failure. Images are not decoded.
pub fn summarize_index(index: &SampleIndex, labels: &LabelSource) -> IndexSummary {
    let results: Vec<_> = index
        .samples()
        .par_iter()
        .map(|s| (s.id.as_str(), labels.load(s)))
        .collect();
    let mut summary = IndexSummary {
        total: results.len(),
        ..Default::default()
    };
    for (id, res) in results {
        match res {
            Ok(_) => summary.labelled += 1,
            Err(DatasetError::LabelNotFound { .. }) => {
                summary.missing_labels += 1;
                if summary.missing_ids.len() < MAX_LISTED_IDS {
                    summary.missing_ids.push(id.to_string());
                }
            }
            Err(_) => {
                summary.invalid_labels += 1;
                if summary.invalid_ids.len() < MAX_LISTED_IDS {
                    summary.invalid_ids.push(id.to_string());
                }
            }
        }
    }
    summary
}
