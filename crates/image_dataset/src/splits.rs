//! Seeded train/validation partitioning.

use crate::index::SampleIndex;
use crate::types::{DatasetError, DatasetResult, Sample};
use data_contracts::SplitManifest;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Disjoint train/validation partition of an index.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub train: Vec<Sample>,
    pub val: Vec<Sample>,
}

impl Split {
    pub fn len(&self) -> usize {
        self.train.len() + self.val.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn manifest(&self, seed: u64, ratio: f64) -> SplitManifest {
        SplitManifest {
            seed,
            ratio,
            train: self.train.iter().map(|s| s.id.clone()).collect(),
            val: self.val.iter().map(|s| s.id.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShuffleSplitter;

impl ShuffleSplitter {
    /// Shuffle the index with `seed`, then take the first `floor(N * ratio)` samples as train.
    pub fn split(index: &SampleIndex, ratio: f64, seed: u64) -> DatasetResult<Split> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(DatasetError::InvalidSplitRatio { ratio });
        }
        if index.is_empty() {
            return Err(DatasetError::EmptyIndex {
                path: index.image_dir().to_path_buf(),
            });
        }
        let mut order = index.samples().to_vec();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        let val = order.split_off(Self::train_len(order.len(), ratio));
        Ok(Split { train: order, val })
    }

    /// `floor(n * ratio)`, except that a product within a few ulps of an integer
    /// (e.g. `10 * 0.7`) counts as that integer.
    pub fn train_len(n: usize, ratio: f64) -> usize {
        let exact = n as f64 * ratio;
        let nearest = exact.round();
        let tolerance = 4.0 * f64::EPSILON * nearest.abs().max(1.0);
        let len = if (exact - nearest).abs() <= tolerance {
            nearest
        } else {
            exact.floor()
        };
        (len as usize).min(n)
    }

    /// Per-epoch permutation of the train set, stable for a given `(seed, epoch)`.
    pub fn epoch_order(train: &[Sample], seed: u64, epoch: usize) -> Vec<Sample> {
        let mut order = train.to_vec();
        let mixed = seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        order.shuffle(&mut StdRng::seed_from_u64(mixed));
        order
    }
}
