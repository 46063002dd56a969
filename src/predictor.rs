//! Handoff to an external libFM binary.
//!
//! The encoded matrices are written in libFM's sparse text format
//! (`target index:value ...`, indices ascending), the binary is invoked as a
//! child process, and its prediction file is read back for evaluation.

use crate::errors::{PrepError, PrepResult};
use crate::matrix::SparseMatrix;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Parameters for one libFM invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibFmParams {
    /// Path to the libFM executable.
    pub binary: PathBuf,
    /// Rank of the pairwise interaction factors.
    pub dim: u32,
    pub iterations: u32,
    pub init_stdev: f64,
    /// Fit global and per-feature bias terms.
    pub bias: bool,
}

impl Default for LibFmParams {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("libFM"),
            dim: 8,
            iterations: 100,
            init_stdev: 0.1,
            bias: true,
        }
    }
}

impl LibFmParams {
    /// Command-line arguments for a regression run over the given files.
    /// The `-dim` triple switches the bias terms on or off together.
    pub fn args(&self, train: &Path, test: &Path, out: &Path) -> Vec<String> {
        let dim = if self.bias {
            format!("1,1,{}", self.dim)
        } else {
            format!("0,0,{}", self.dim)
        };
        vec![
            "-task".to_string(),
            "r".to_string(),
            "-train".to_string(),
            train.display().to_string(),
            "-test".to_string(),
            test.display().to_string(),
            "-dim".to_string(),
            dim,
            "-iter".to_string(),
            self.iterations.to_string(),
            "-init_stdev".to_string(),
            self.init_stdev.to_string(),
            "-out".to_string(),
            out.display().to_string(),
        ]
    }

    /// Run libFM on already-written train/test files, writing predictions to
    /// `out` and returning them.
    pub fn run(&self, train: &Path, test: &Path, out: &Path) -> PrepResult<Vec<f64>> {
        let args = self.args(train, test, out);
        info!(binary = %self.binary.display(), "invoking libFM");
        debug!(?args, "libFM arguments");

        let output = Command::new(&self.binary).args(&args).output().map_err(|e| {
            PrepError::Predictor(format!(
                "failed to launch '{}': {e}",
                self.binary.display()
            ))
        })?;
        if !output.status.success() {
            return Err(PrepError::Predictor(format!(
                "libFM exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        read_predictions(out)
    }
}

/// Write a matrix and its target vector in libFM's sparse text format. Row
/// entries come out with ascending column indices.
pub fn write_libfm<P: AsRef<Path>>(path: P, x: &SparseMatrix, y: &[f64]) -> PrepResult<()> {
    if x.n_rows() != y.len() {
        return Err(PrepError::Validation(format!(
            "matrix has {} rows but target has {} values",
            x.n_rows(),
            y.len()
        )));
    }

    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    for (i, target) in y.iter().enumerate() {
        write!(writer, "{target}")?;
        for (j, value) in x.row(i) {
            write!(writer, " {j}:{value}")?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a libFM prediction file, one float per line.
pub fn read_predictions<P: AsRef<Path>>(path: P) -> PrepResult<Vec<f64>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut predictions = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: f64 = trimmed.parse().map_err(|_| {
            PrepError::Predictor(format!(
                "bad prediction on line {}: '{trimmed}'",
                lineno + 1
            ))
        })?;
        predictions.push(value);
    }
    Ok(predictions)
}

/// Root mean squared error between predictions and actuals.
pub fn rmse(predicted: &[f64], actual: &[f64]) -> PrepResult<f64> {
    if predicted.len() != actual.len() {
        return Err(PrepError::Validation(format!(
            "prediction/actual length mismatch ({} != {})",
            predicted.len(),
            actual.len()
        )));
    }
    if predicted.is_empty() {
        return Err(PrepError::Validation(
            "cannot compute RMSE over zero predictions".to_string(),
        ));
    }
    let mse = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (p - a).powi(2))
        .sum::<f64>()
        / predicted.len() as f64;
    Ok(mse.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_write_libfm_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("train.libfm");

        let x = SparseMatrix::from_rows(
            vec![vec![(2, 1.0), (0, 1.0)], vec![(1, 0.5)]],
            3,
        )
        .unwrap();
        write_libfm(&path, &x, &[4.0, 2.5]).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "4 0:1 2:1\n2.5 1:0.5\n");
    }

    #[test]
    fn test_write_libfm_rejects_length_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("train.libfm");
        let x = SparseMatrix::zeros(2, 3);
        assert!(write_libfm(&path, &x, &[1.0]).is_err());
    }

    #[test]
    fn test_read_predictions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        fs::write(&path, "3.5\n2.25\n\n1\n").unwrap();
        assert_eq!(read_predictions(&path).unwrap(), vec![3.5, 2.25, 1.0]);
    }

    #[test]
    fn test_read_predictions_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        fs::write(&path, "3.5\nnot-a-number\n").unwrap();
        assert!(matches!(
            read_predictions(&path),
            Err(PrepError::Predictor(_))
        ));
    }

    #[test]
    fn test_args_bias_toggles_dim_triple() {
        let params = LibFmParams {
            dim: 4,
            ..Default::default()
        };
        let args = params.args(
            Path::new("train.libfm"),
            Path::new("test.libfm"),
            Path::new("out.txt"),
        );
        let dim_pos = args.iter().position(|a| a == "-dim").unwrap();
        assert_eq!(args[dim_pos + 1], "1,1,4");

        let no_bias = LibFmParams {
            dim: 4,
            bias: false,
            ..Default::default()
        };
        let args = no_bias.args(
            Path::new("train.libfm"),
            Path::new("test.libfm"),
            Path::new("out.txt"),
        );
        let dim_pos = args.iter().position(|a| a == "-dim").unwrap();
        assert_eq!(args[dim_pos + 1], "0,0,4");
    }

    #[test]
    fn test_rmse() {
        let value = rmse(&[3.0, 1.0], &[1.0, 3.0]).unwrap();
        assert!((value - 2.0).abs() < 1e-12);
        assert!(rmse(&[1.0], &[1.0, 2.0]).is_err());
        assert!(rmse(&[], &[]).is_err());
    }
}
