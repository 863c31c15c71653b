use crate::types::{DatasetError, DatasetResult, Sample};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Lower-case extensions that count as images.
    pub image_extensions: Vec<String>,
    /// Extension of the label file paired with `{id}`.
    pub label_extension: String,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            image_extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            label_extension: "json".into(),
        }
    }
}

impl IndexOptions {
    fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| self.image_extensions.iter().any(|x| *x == e))
    }
}

/// Ordered list of samples found in an image directory.
///
/// Labels are not opened here; `label_path` is only computed.
#[derive(Debug, Clone)]
pub struct SampleIndex {
    image_dir: PathBuf,
    label_dir: PathBuf,
    samples: Vec<Sample>,
}

impl SampleIndex {
    pub fn build(image_dir: &Path, label_dir: &Path, opts: &IndexOptions) -> DatasetResult<Self> {
        let index_err = |source| DatasetError::Index {
            path: image_dir.to_path_buf(),
            source,
        };
        let mut samples = Vec::new();
        for entry in fs::read_dir(image_dir).map_err(index_err)? {
            let path = entry.map_err(index_err)?.path();
            if !path.is_file() || !opts.is_image(&path) {
                continue;
            }
            let Some(id) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let label_path = label_dir.join(format!("{id}.{}", opts.label_extension));
            samples.push(Sample {
                id,
                image_path: path,
                label_path,
            });
        }
        if samples.is_empty() {
            return Err(DatasetError::EmptyIndex {
                path: image_dir.to_path_buf(),
            });
        }
        // Directory listing order is platform dependent.
        samples.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.image_path.cmp(&b.image_path)));
        log::debug!(
            "indexed {} images in {} (labels from {})",
            samples.len(),
            image_dir.display(),
            label_dir.display()
        );
        Ok(Self {
            image_dir: image_dir.to_path_buf(),
            label_dir: label_dir.to_path_buf(),
            samples,
        })
    }

    /// Index over an explicit sample list, kept in the given order.
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self {
            image_dir: PathBuf::new(),
            label_dir: PathBuf::new(),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn get(&self, i: usize) -> Option<&Sample> {
        self.samples.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn label_dir(&self) -> &Path {
        &self.label_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_match_is_case_insensitive() {
        let opts = IndexOptions::default();
        assert!(opts.is_image(Path::new("a/b/IMG_01.JPG")));
        assert!(opts.is_image(Path::new("x.png")));
        assert!(!opts.is_image(Path::new("x.json")));
        assert!(!opts.is_image(Path::new("noext")));
    }

    #[test]
    fn missing_dir_is_index_error() {
        let err = SampleIndex::build(
            Path::new("/definitely/not/here"),
            Path::new("/nope"),
            &IndexOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DatasetError::Index { .. }));
    }
}
