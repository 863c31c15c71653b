//! Labelled image directory pipeline: index, split, decode, batch and prefetch.
//!
//! - [`SampleIndex`] lists the images of a directory and pairs each with a label path.
//! - [`ShuffleSplitter`] partitions an index into train/validation sets, deterministically per seed.
//! - [`BatchAssembler`] decodes samples (in parallel within a batch) into fixed-shape batches.
//! - [`Prefetcher`] moves any batch stream onto a background thread behind a bounded queue.

pub mod batch;
pub mod index;
pub mod labels;
pub mod prefetch;
pub mod splits;
pub mod transform;
pub mod types;
pub mod validation;

pub use batch::{batch_count, BatchAssembler, SamplePolicy, StreamCounters, StreamStats};
pub use index::{IndexOptions, SampleIndex};
pub use labels::LabelSource;
pub use prefetch::Prefetcher;
pub use splits::{ShuffleSplitter, Split};
pub use transform::{DecodeError, ImageTransform, Transform};
pub use types::*;
pub use validation::{summarize_index, IndexSummary};
