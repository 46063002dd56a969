//! Experiment execution: load the guide and table, walk the splitter, and
//! write libFM-ready files (plus provenance) for every split.

use crate::config::Experiment;
use crate::dataset::FullDataset;
use crate::errors::{PrepError, PrepResult};
use crate::guide::FeatureGuide;
use crate::lineage::{InputFileStats, Lineage, Metrics};
use crate::predictor;
use crate::splitter::ErrorPolicy;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct SplitResult {
    value: f64,
    n_train: usize,
    n_test: usize,
    n_features: usize,
    rmse: Option<f64>,
}

pub fn run_experiment(path: &PathBuf, run_id: Uuid) -> PrepResult<()> {
    info!("Loading experiment from {:?}", path);
    let experiment = Experiment::from_path(path)?;
    let guide = FeatureGuide::from_path(&experiment.guide)?;

    info!("Reading input: {:?}", experiment.input);
    let dataset = FullDataset::from_csv(&experiment.input, &guide)?;
    info!(rows = dataset.height(), "input table loaded");

    fs::create_dir_all(&experiment.output_dir)?;

    let mut metrics = Metrics::new();
    let splitter = dataset.splitter(
        &experiment.split.column,
        experiment.split.train,
        experiment.split.test,
        experiment.split.window,
    );
    let n_splits = splitter.n_splits()?;
    info!(
        column = %experiment.split.column,
        n_splits,
        "generating splits"
    );

    let pb = ProgressBar::new(n_splits as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
            .map_err(|e| PrepError::Unknown(e.into()))?
            .progress_chars("#>-"),
    );

    let mut results: Vec<SplitResult> = Vec::new();
    let mut outputs: Vec<String> = Vec::new();

    for item in splitter.iter(experiment.split.errors)? {
        pb.inc(1);
        let (value, mut split) = match item {
            Ok(pair) => pair,
            Err(err) => {
                // Raise policy: iteration fused after yielding this.
                pb.abandon_with_message("failed");
                return Err(err);
            }
        };
        pb.set_message(format!("split {value}"));

        let step_start = Instant::now();
        let encoded = match split.preprocess(&experiment.preprocess) {
            Ok(encoded) => encoded,
            Err(err) => match experiment.split.errors {
                ErrorPolicy::Raise => {
                    pb.abandon_with_message("failed");
                    return Err(err);
                }
                ErrorPolicy::Log => {
                    error!(value, error = %err, "preprocessing failed; skipping split");
                    continue;
                }
                ErrorPolicy::Ignore => continue,
            },
        };

        let split_dir = experiment.output_dir.join(format!("split-{value}"));
        fs::create_dir_all(&split_dir)?;

        let train_path = split_dir.join("train.libfm");
        let test_path = split_dir.join("test.libfm");
        predictor::write_libfm(&train_path, &encoded.train_x, &encoded.train_y)?;
        predictor::write_libfm(&test_path, &encoded.test_x, &encoded.test_y)?;
        write_json(&split_dir.join("feature_map.json"), &encoded.feature_map)?;
        split.state().save(split_dir.join("state.json"))?;
        outputs.push(split_dir.display().to_string());
        metrics.record_step(&format!("split-{value}"), step_start.elapsed());
        metrics.splits_generated += 1;

        let rmse = match &experiment.predictor {
            Some(params) => {
                let out_path = split_dir.join("predictions.txt");
                let predictions = params.run(&train_path, &test_path, &out_path)?;
                let rmse = predictor::rmse(&predictions, &encoded.test_y)?;
                info!(value, rmse, "libFM evaluated");
                Some(rmse)
            }
            None => None,
        };

        results.push(SplitResult {
            value,
            n_train: encoded.train_y.len(),
            n_test: encoded.test_y.len(),
            n_features: encoded.feature_map.len(),
            rmse,
        });
    }
    pb.finish_with_message("done");

    metrics.splits_skipped = n_splits - metrics.splits_generated;
    if metrics.splits_skipped > 0 {
        warn!(skipped = metrics.splits_skipped, "some splits were skipped");
    }

    write_json(&experiment.output_dir.join("results.json"), &results)?;
    write_json(&experiment.output_dir.join("metrics.json"), &metrics)?;

    let lineage = Lineage {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now(),
        inputs: vec![
            InputFileStats::for_path(&experiment.input)?,
            InputFileStats::for_path(&experiment.guide)?,
        ],
        outputs,
    };
    write_json(&experiment.output_dir.join("lineage.json"), &lineage)?;

    info!(
        splits = metrics.splits_generated,
        elapsed_ms = metrics.total_duration().as_millis() as u64,
        "experiment completed"
    );
    Ok(())
}

/// Preprocess a pre-split pair of CSV files without running an experiment.
pub fn prepare_pair(
    train_path: &Path,
    test_path: &Path,
    guide_path: &Path,
    output_dir: &Path,
    options: &crate::split::PreprocessOptions,
) -> PrepResult<()> {
    let guide = FeatureGuide::from_path(guide_path)?;
    let mut split = crate::split::TrainTestSplit::from_paths(train_path, test_path, &guide)?;
    let encoded = split.preprocess(options)?;

    fs::create_dir_all(output_dir)?;
    predictor::write_libfm(
        output_dir.join("train.libfm"),
        &encoded.train_x,
        &encoded.train_y,
    )?;
    predictor::write_libfm(
        output_dir.join("test.libfm"),
        &encoded.test_x,
        &encoded.test_y,
    )?;
    write_json(&output_dir.join("feature_map.json"), &encoded.feature_map)?;
    split.state().save(output_dir.join("state.json"))?;

    info!(
        n_train = encoded.train_y.len(),
        n_test = encoded.test_y.len(),
        n_features = encoded.feature_map.len(),
        "pair prepared"
    );
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> PrepResult<()> {
    let file = fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value)
        .map_err(|e| PrepError::Validation(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}
