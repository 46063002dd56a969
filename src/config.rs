//! YAML experiment definitions.
//!
//! An experiment names the input table, the feature guide, the splitting
//! rule, preprocessing options, and (optionally) a libFM invocation to run
//! over each generated split.

use crate::errors::{PrepError, PrepResult};
use crate::predictor::LibFmParams;
use crate::split::PreprocessOptions;
use crate::splitter::{CmpOp, ErrorPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub name: String,
    /// Input CSV table.
    pub input: PathBuf,
    /// Feature guide file.
    pub guide: PathBuf,
    pub output_dir: PathBuf,
    pub split: SplitRule,
    #[serde(default)]
    pub preprocess: PreprocessOptions,
    /// When present, run libFM on every generated split.
    pub predictor: Option<LibFmParams>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SplitRule {
    /// Column whose distinct values drive the splits.
    pub column: String,
    /// Comparison selecting training rows (`row_value OP split_value`).
    pub train: CmpOp,
    /// Comparison selecting testing rows.
    pub test: CmpOp,
    /// Training-history window below the split value.
    #[serde(default)]
    pub window: Option<f64>,
    #[serde(default = "default_error_policy")]
    pub errors: ErrorPolicy,
}

fn default_error_policy() -> ErrorPolicy {
    ErrorPolicy::Log
}

impl Experiment {
    pub fn from_path<P: AsRef<Path>>(path: P) -> PrepResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> PrepResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PrepError::Config(format!("invalid experiment file: {e}")))
    }
}
