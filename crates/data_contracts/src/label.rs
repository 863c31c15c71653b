use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On-disk label record. Accepted shapes:
/// - a bare array of numbers (regression targets or a one-hot vector),
/// - `{ "values": [...] }`,
/// - `{ "class": k }`, expanded to a one-hot vector of the configured length,
/// - `{ "averageCharMetrics": [...], "averageLineMetrics": [...] }`, concatenated
///   char metrics first. Other keys of that object are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelFile {
    Vector(Vec<f32>),
    Values {
        values: Vec<f32>,
    },
    Class {
        class: usize,
    },
    Metrics {
        #[serde(rename = "averageCharMetrics")]
        char_metrics: Vec<f32>,
        #[serde(rename = "averageLineMetrics")]
        line_metrics: Vec<f32>,
    },
}

/// Label vector attached to one sample, always `label_len` long once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub values: Vec<f32>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("label has {actual} values, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("label value at index {index} is not finite")]
    NonFinite { index: usize },
    #[error("class index {class} out of range for {num_classes} classes")]
    ClassOutOfRange { class: usize, num_classes: usize },
    #[error("invalid image shape {height}x{width}x{channels}: {reason}")]
    InvalidShape {
        height: u32,
        width: u32,
        channels: u32,
        reason: &'static str,
    },
    #[error("invalid model descriptor: {0}")]
    InvalidDescriptor(String),
}

impl LabelFile {
    /// Validate against the expected label length and normalize into a [`LabelRecord`].
    pub fn into_record(self, label_len: usize) -> Result<LabelRecord, ValidationError> {
        let values = match self {
            LabelFile::Vector(values) | LabelFile::Values { values } => values,
            LabelFile::Class { class } => {
                if class >= label_len {
                    return Err(ValidationError::ClassOutOfRange {
                        class,
                        num_classes: label_len,
                    });
                }
                let mut one_hot = vec![0.0; label_len];
                one_hot[class] = 1.0;
                one_hot
            }
            LabelFile::Metrics {
                mut char_metrics,
                line_metrics,
            } => {
                char_metrics.extend(line_metrics);
                char_metrics
            }
        };
        LabelRecord::new(values, label_len)
    }
}

impl LabelRecord {
    pub fn new(values: Vec<f32>, label_len: usize) -> Result<Self, ValidationError> {
        if values.len() != label_len {
            return Err(ValidationError::LengthMismatch {
                expected: label_len,
                actual: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index of the largest value; the class for one-hot labels.
    pub fn argmax(&self) -> Option<usize> {
        argmax(&self.values)
    }
}

pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_expands_to_one_hot() {
        let rec = LabelFile::Class { class: 2 }.into_record(4).unwrap();
        assert_eq!(rec.values, vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(rec.argmax(), Some(2));
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        assert_eq!(argmax(&[0.5, 0.9, 0.9]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn non_finite_rejected() {
        let err = LabelRecord::new(vec![0.0, f32::NAN], 2).unwrap_err();
        assert_eq!(err, ValidationError::NonFinite { index: 1 });
    }
}
