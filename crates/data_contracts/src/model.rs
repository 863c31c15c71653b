use serde::{Deserialize, Serialize};

use crate::label::ValidationError;

/// Input image geometry, `channels` is 1 (grayscale) or 3 (RGB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl ImageShape {
    pub fn new(height: u32, width: u32, channels: u32) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Number of f32 values in one CHW image.
    pub fn len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let reason = if self.height == 0 || self.width == 0 {
            Some("height and width must be positive")
        } else if self.channels != 1 && self.channels != 3 {
            Some("channels must be 1 or 3")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ValidationError::InvalidShape {
                height: self.height,
                width: self.width,
                channels: self.channels,
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl Default for ImageShape {
    fn default() -> Self {
        Self::new(64, 64, 1)
    }
}

/// Output head of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArch {
    /// Softmax over `num_classes`, trained with categorical cross-entropy.
    Classifier { num_classes: usize },
    /// Linear outputs trained with mean squared error.
    Regressor { num_outputs: usize },
}

impl ModelArch {
    pub fn output_len(&self) -> usize {
        match self {
            ModelArch::Classifier { num_classes } => *num_classes,
            ModelArch::Regressor { num_outputs } => *num_outputs,
        }
    }

    pub fn is_classifier(&self) -> bool {
        matches!(self, ModelArch::Classifier { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelArch::Classifier { .. } => "classifier",
            ModelArch::Regressor { .. } => "regressor",
        }
    }
}

impl Default for ModelArch {
    fn default() -> Self {
        ModelArch::Classifier { num_classes: 7 }
    }
}

/// Everything needed to rebuild a network before loading its weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub arch: ModelArch,
    pub input: ImageShape,
    /// Output channels of each conv block; every block halves the spatial size.
    pub conv_filters: Vec<usize>,
    /// Dropout after each conv block, same length as `conv_filters`.
    pub conv_dropout: Vec<f64>,
    pub hidden: usize,
    pub hidden_dropout: f64,
}

impl Default for ModelDescriptor {
    fn default() -> Self {
        Self {
            arch: ModelArch::default(),
            input: ImageShape::default(),
            conv_filters: vec![32, 64, 128],
            conv_dropout: vec![0.1, 0.1, 0.5],
            hidden: 128,
            hidden_dropout: 0.3,
        }
    }
}

impl ModelDescriptor {
    pub fn output_len(&self) -> usize {
        self.arch.output_len()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.input.validate()?;
        let invalid = |msg: String| Err(ValidationError::InvalidDescriptor(msg));
        if self.arch.output_len() == 0 {
            return invalid(format!("{} needs at least one output", self.arch.as_str()));
        }
        if self.conv_filters.is_empty() || self.conv_filters.contains(&0) {
            return invalid("conv_filters must be non-empty and positive".into());
        }
        if self.conv_dropout.len() != self.conv_filters.len() {
            return invalid(format!(
                "conv_dropout has {} entries for {} conv blocks",
                self.conv_dropout.len(),
                self.conv_filters.len()
            ));
        }
        let dropouts = self.conv_dropout.iter().chain(std::iter::once(&self.hidden_dropout));
        if dropouts.into_iter().any(|p| !(0.0..1.0).contains(p)) {
            return invalid("dropout probabilities must be in [0, 1)".into());
        }
        if self.hidden == 0 {
            return invalid("hidden must be positive".into());
        }
        let min_side = 1u64 << self.conv_filters.len().min(31);
        if (self.input.height as u64) < min_side || (self.input.width as u64) < min_side {
            return invalid(format!(
                "input {}x{} too small for {} pooling blocks (need >= {min_side})",
                self.input.height,
                self.input.width,
                self.conv_filters.len()
            ));
        }
        Ok(())
    }
}
