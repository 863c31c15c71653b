//! Batch prediction over an image directory, with optional expected outputs.

use crate::burn_trainable::BurnModel;
use crate::error::{TrainError, TrainResult};
use crate::trainable::Trainable;
use crate::TrainAutodiff;
use clap::Parser;
use image_dataset::{DatasetError, ImageTransform, IndexOptions, SampleIndex, Transform};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "predict", about = "Run a trained model over a directory of images")]
pub struct PredictArgs {
    /// Checkpoint directory (final model or an epoch checkpoint).
    #[arg(long)]
    pub model: PathBuf,
    /// Directory with images to score.
    #[arg(long)]
    pub images: PathBuf,
    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,
    /// Score at or above which a category counts as present.
    #[arg(long, default_value_t = 0.5)]
    pub threshold: f32,
    /// JSON array of `{ "name": "<file>", "expects": [0, 1, ...] }`; `expects` may
    /// also be `{ "fontCatOutput": [...] }`.
    #[arg(long)]
    pub expect: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Expectation {
    pub name: String,
    pub expects: ExpectedOutputs,
}

/// Expected per-category values, bare or keyed by output name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ExpectedOutputs {
    Vector(Vec<f32>),
    Named {
        #[serde(rename = "fontCatOutput", default)]
        font_cat_output: Option<Vec<f32>>,
    },
}

impl ExpectedOutputs {
    /// `None` when the entry carries no values for the category output.
    pub fn into_values(self) -> Option<Vec<f32>> {
        match self {
            ExpectedOutputs::Vector(values) => Some(values),
            ExpectedOutputs::Named { font_cat_output } => font_cat_output,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryResult {
    pub category: usize,
    pub score: f32,
    pub present: bool,
    pub expected: Option<bool>,
}

impl CategoryResult {
    pub fn passed(&self) -> Option<bool> {
        self.expected.map(|e| e == self.present)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    pub name: String,
    pub categories: Vec<CategoryResult>,
}

impl ImageResult {
    /// `None` when the image has no expectation.
    pub fn passed(&self) -> Option<bool> {
        let checks: Option<Vec<bool>> = self.categories.iter().map(CategoryResult::passed).collect();
        checks.map(|c| c.into_iter().all(|p| p))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictSummary {
    pub images: usize,
    pub checked: usize,
    pub passed: usize,
}

impl PredictSummary {
    pub fn all_passed(&self) -> bool {
        self.passed == self.checked
    }
}

/// Threshold scores and compare with expected presence (any value >= 0.5 means present).
pub fn evaluate_outputs(
    name: &str,
    scores: &[f32],
    expects: Option<&[f32]>,
    threshold: f32,
) -> ImageResult {
    let categories = scores
        .iter()
        .enumerate()
        .map(|(i, &score)| CategoryResult {
            category: i + 1,
            score,
            present: score >= threshold,
            expected: expects.map(|e| e.get(i).is_some_and(|v| *v >= 0.5)),
        })
        .collect();
    ImageResult {
        name: name.to_string(),
        categories,
    }
}

pub fn load_expectations(path: &Path) -> TrainResult<HashMap<String, Vec<f32>>> {
    let raw = fs::read(path).map_err(|source| TrainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let list: Vec<Expectation> = serde_json::from_slice(&raw)
        .map_err(|e| TrainError::Config(format!("{}: {e}", path.display())))?;
    Ok(list
        .into_iter()
        .filter_map(|e| Some((e.name, e.expects.into_values()?)))
        .collect())
}

/// Score every image of `image_dir` with `model`, `batch_size` images per forward pass.
pub fn predict_dir<M: Trainable>(
    model: &M,
    image_dir: &Path,
    batch_size: usize,
    threshold: f32,
    expectations: Option<&HashMap<String, Vec<f32>>>,
) -> TrainResult<Vec<ImageResult>> {
    let index = SampleIndex::build(image_dir, image_dir, &IndexOptions::default())?;
    let transform = ImageTransform::new(model.descriptor().input);
    let mut results = Vec::with_capacity(index.len());
    for chunk in index.samples().chunks(batch_size.max(1)) {
        let mut inputs = Vec::with_capacity(chunk.len() * transform.shape().len());
        for sample in chunk {
            let bytes = fs::read(&sample.image_path).map_err(|source| DatasetError::SampleIo {
                sample_id: sample.id.clone(),
                path: sample.image_path.clone(),
                source,
            })?;
            let pixels = transform.decode(&bytes).map_err(|source| DatasetError::Decode {
                sample_id: sample.id.clone(),
                path: sample.image_path.clone(),
                source,
            })?;
            inputs.extend_from_slice(&pixels);
        }
        let scores = model.predict(&inputs, chunk.len())?;
        for (sample, row) in chunk.iter().zip(scores) {
            let name = sample
                .image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| sample.id.clone());
            let expects = expectations.and_then(|e| e.get(&name)).map(Vec::as_slice);
            results.push(evaluate_outputs(&name, &row, expects, threshold));
        }
    }
    Ok(results)
}

pub fn summarize(results: &[ImageResult]) -> PredictSummary {
    let mut summary = PredictSummary {
        images: results.len(),
        ..Default::default()
    };
    for passed in results.iter().filter_map(ImageResult::passed) {
        summary.checked += 1;
        if passed {
            summary.passed += 1;
        }
    }
    summary
}

fn print_result(result: &ImageResult) {
    println!("\nimage \"{}\":", result.name);
    for c in &result.categories {
        let mut line = format!(
            "    category {}: {} ({:.2}%)",
            c.category,
            if c.present { "yes" } else { "no" },
            c.score * 100.0
        );
        if let (Some(expected), Some(false)) = (c.expected, c.passed()) {
            line.push_str(&format!(" - expected {}", if expected { "yes" } else { "no" }));
        }
        println!("{line}");
    }
    if let Some(passed) = result.passed() {
        println!("    result: {}", if passed { "pass" } else { "FAIL" });
    }
}

pub fn run_predict(args: PredictArgs) -> anyhow::Result<PredictSummary> {
    let model = BurnModel::<TrainAutodiff>::load(&args.model, 1e-3, Default::default())?;
    log::info!(
        "loaded {} model from {} (input {:?})",
        model.descriptor().arch.as_str(),
        args.model.display(),
        model.descriptor().input
    );
    let expectations = args.expect.as_deref().map(load_expectations).transpose()?;
    let results = predict_dir(
        &model,
        &args.images,
        args.batch_size,
        args.threshold,
        expectations.as_ref(),
    )?;
    results.iter().for_each(print_result);

    let summary = summarize(&results);
    println!("\nscored {} images", summary.images);
    if expectations.is_some() {
        let pct = if summary.checked > 0 {
            summary.passed as f32 * 100.0 / summary.checked as f32
        } else {
            0.0
        };
        println!(
            "expectations passed: {}/{} ({pct:.2}%)",
            summary.passed, summary.checked
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_inclusive() {
        let r = evaluate_outputs("a.jpg", &[0.5, 0.49], None, 0.5);
        assert!(r.categories[0].present);
        assert!(!r.categories[1].present);
        assert_eq!(r.passed(), None);
    }

    #[test]
    fn expectations_decide_pass() {
        let ok = evaluate_outputs("a.jpg", &[0.9, 0.1], Some(&[1.0, 0.0]), 0.5);
        let bad = evaluate_outputs("b.jpg", &[0.9, 0.1], Some(&[0.0, 0.0]), 0.5);
        assert_eq!(ok.passed(), Some(true));
        assert_eq!(bad.passed(), Some(false));
        let plain = evaluate_outputs("c.jpg", &[0.2], None, 0.5);
        let summary = summarize(&[ok, bad, plain]);
        assert_eq!(
            summary,
            PredictSummary {
                images: 3,
                checked: 2,
                passed: 1
            }
        );
        assert!(!summary.all_passed());
    }

    #[test]
    fn expectation_file_accepts_bare_and_keyed_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.json");
        let raw = r#"[
            { "name": "a.jpg", "expects": [1, 0, 0] },
            { "name": "b.jpg", "expects": { "fontCatOutput": [0, 1, 0] } },
            { "name": "c.jpg", "expects": { "otherOutput": [1] } }
        ]"#;
        fs::write(&path, raw).unwrap();

        let map = load_expectations(&path).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a.jpg"], vec![1.0, 0.0, 0.0]);
        assert_eq!(map["b.jpg"], vec![0.0, 1.0, 0.0]);
        assert!(!map.contains_key("c.jpg"));
    }
}
