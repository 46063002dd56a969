//! Per-column transform bookkeeping shared by the single-table and paired
//! dataset types: imputation fill values, Z-score scaler parameters, and
//! entity-id remapping tables.
//!
//! The state is what makes transforms idempotent and reversible, and it is
//! JSON-serializable so an inference process can reconstruct the exact
//! encoding used at training time.

use crate::errors::{PrepError, PrepResult};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Statistic used to compute an imputation fill value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImputeMethod {
    Mean,
    Median,
    Mode,
}

/// What to do when a column to impute has only missing values in the
/// fitting partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllNullPolicy {
    /// Remove the feature entirely.
    Drop,
    /// Fail before mutating anything.
    Raise,
    /// Log and skip the column.
    Ignore,
}

/// What to do when un-mapping a column that was never mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotMappedPolicy {
    Raise,
    Warn,
}

/// Z-score scaler parameters fit on the training partition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    pub mean: f64,
    pub std: f64,
    /// Whether the scaling is currently applied to the column.
    pub applied: bool,
}

/// Bijection between original column values and a 0-contiguous index.
///
/// `levels[i]` is the original value (string form) mapped to index `i`. The
/// original dtype is kept in memory only; a reloaded map can still re-apply
/// forward mappings, which is all inference needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub levels: Vec<String>,
    #[serde(skip)]
    pub dtype: Option<DataType>,
}

impl ColumnMap {
    pub fn new(levels: Vec<String>, dtype: DataType) -> Self {
        Self {
            levels,
            dtype: Some(dtype),
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Forward lookup table (original value -> index).
    pub fn forward(&self) -> HashMap<&str, u32> {
        self.levels
            .iter()
            .enumerate()
            .map(|(i, v)| (v.as_str(), i as u32))
            .collect()
    }

    pub fn original(&self, index: u32) -> Option<&String> {
        self.levels.get(index as usize)
    }
}

/// All transform metadata for one Dataset / TrainTestSplit instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformState {
    pub imputations: HashMap<String, f64>,
    pub scalers: HashMap<String, ScalerParams>,
    pub column_maps: HashMap<String, ColumnMap>,
}

impl TransformState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scaled(&self, column: &str) -> bool {
        self.scalers.get(column).map(|s| s.applied).unwrap_or(false)
    }

    pub fn is_mapped(&self, column: &str) -> bool {
        self.column_maps.contains_key(column)
    }

    pub fn imputed_value(&self, column: &str) -> Option<f64> {
        self.imputations.get(column).copied()
    }

    pub fn scaler_params(&self, column: &str) -> Option<&ScalerParams> {
        self.scalers.get(column)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> PrepResult<()> {
        let file = File::create(path.as_ref())?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| PrepError::Validation(format!("failed to write transform state: {e}")))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> PrepResult<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let state: TransformState = serde_json::from_reader(reader)
            .map_err(|e| PrepError::Validation(format!("failed to parse transform state: {e}")))?;
        Ok(state)
    }
}

/// Extract a column as `Vec<Option<f64>>`, casting if needed.
pub(crate) fn column_f64(df: &DataFrame, column: &str) -> PrepResult<Vec<Option<f64>>> {
    let col = df
        .column(column)
        .map_err(|_| PrepError::NotFound(column.to_string()))?;
    let ca = col.cast(&DataType::Float64)?;
    Ok(ca.f64()?.into_iter().collect())
}

/// Extract a column as `Vec<Option<String>>`, casting if needed.
pub(crate) fn column_strings(df: &DataFrame, column: &str) -> PrepResult<Vec<Option<String>>> {
    let col = df
        .column(column)
        .map_err(|_| PrepError::NotFound(column.to_string()))?;
    let ca = col.cast(&DataType::String)?;
    Ok(ca
        .str()?
        .into_iter()
        .map(|opt| opt.map(|s| s.to_string()))
        .collect())
}

/// Ensure all columns are present before mutating anything, so a failed
/// request has no side effects.
pub(crate) fn verify_columns(df: &DataFrame, columns: &[String]) -> PrepResult<()> {
    for col in columns {
        if df.column(col).is_err() {
            return Err(PrepError::NotFound(col.clone()));
        }
    }
    Ok(())
}

/// Compute the fill statistic over the non-missing values. Returns None when
/// every value is missing.
pub(crate) fn fit_fill_value(values: &[Option<f64>], method: ImputeMethod) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        return None;
    }
    match method {
        ImputeMethod::Mean => Some(present.iter().sum::<f64>() / present.len() as f64),
        ImputeMethod::Median => {
            let mut sorted = present.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                Some((sorted[mid - 1] + sorted[mid]) / 2.0)
            } else {
                Some(sorted[mid])
            }
        }
        ImputeMethod::Mode => {
            let mut counts: HashMap<u64, usize> = HashMap::new();
            for v in &present {
                *counts.entry(v.to_bits()).or_insert(0) += 1;
            }
            // Ties resolve to the smallest value for determinism.
            present
                .iter()
                .copied()
                .min_by(|a, b| {
                    let ca = counts[&a.to_bits()];
                    let cb = counts[&b.to_bits()];
                    cb.cmp(&ca).then(
                        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
                    )
                })
        }
    }
}

/// Replace missing values in a column with `fill`, in place.
pub(crate) fn fill_column(df: &mut DataFrame, column: &str, fill: f64) -> PrepResult<()> {
    let values: Vec<f64> = column_f64(df, column)?
        .into_iter()
        .map(|v| v.unwrap_or(fill))
        .collect();
    df.with_column(Series::new(column.into(), values))?;
    Ok(())
}

/// Sample standard deviation (ddof = 1), like the engine's std aggregation.
pub(crate) fn fit_scaler(values: &[Option<f64>]) -> Option<(f64, f64)> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        return None;
    }
    let n = present.len() as f64;
    let mean = present.iter().sum::<f64>() / n;
    let std = if present.len() < 2 {
        0.0
    } else {
        (present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    };
    Some((mean, std))
}

/// Z-score a column in place. A zero std scales by 1.0 so the transform
/// stays reversible for constant columns.
pub(crate) fn scale_column(df: &mut DataFrame, column: &str, mean: f64, std: f64) -> PrepResult<()> {
    let divisor = if std.abs() < f64::EPSILON { 1.0 } else { std };
    let values: Vec<Option<f64>> = column_f64(df, column)?
        .into_iter()
        .map(|v| v.map(|x| (x - mean) / divisor))
        .collect();
    df.with_column(Series::new(column.into(), values))?;
    Ok(())
}

/// Reverse of `scale_column`.
pub(crate) fn unscale_column(
    df: &mut DataFrame,
    column: &str,
    mean: f64,
    std: f64,
) -> PrepResult<()> {
    let multiplier = if std.abs() < f64::EPSILON { 1.0 } else { std };
    let values: Vec<Option<f64>> = column_f64(df, column)?
        .into_iter()
        .map(|v| v.map(|x| x * multiplier + mean))
        .collect();
    df.with_column(Series::new(column.into(), values))?;
    Ok(())
}

/// Rewrite a column to the 0-contiguous indices given by `map`.
pub(crate) fn apply_column_map(
    df: &mut DataFrame,
    column: &str,
    map: &ColumnMap,
) -> PrepResult<()> {
    let forward = map.forward();
    let mut mapped: Vec<u32> = Vec::with_capacity(df.height());
    for value in column_strings(df, column)? {
        let value = value.ok_or_else(|| {
            PrepError::Validation(format!("null value in id column '{column}'"))
        })?;
        let index = forward.get(value.as_str()).ok_or_else(|| {
            PrepError::Validation(format!("value '{value}' of '{column}' not in column map"))
        })?;
        mapped.push(*index);
    }
    df.with_column(Series::new(column.into(), mapped))?;
    Ok(())
}

/// Restore a mapped column to its original values and dtype.
pub(crate) fn reverse_column_map(
    df: &mut DataFrame,
    column: &str,
    map: &ColumnMap,
) -> PrepResult<()> {
    let col = df
        .column(column)
        .map_err(|_| PrepError::NotFound(column.to_string()))?;
    let indices = col.cast(&DataType::UInt32)?;
    let mut originals: Vec<String> = Vec::with_capacity(df.height());
    for index in indices.u32()?.into_iter() {
        let index = index.ok_or_else(|| {
            PrepError::Validation(format!("null value in mapped column '{column}'"))
        })?;
        let original = map.original(index).ok_or_else(|| {
            PrepError::Validation(format!("index {index} of '{column}' not in column map"))
        })?;
        originals.push(original.clone());
    }
    let mut restored = Series::new(column.into(), originals);
    if let Some(dtype) = &map.dtype {
        restored = restored.cast(dtype)?;
    }
    df.with_column(restored)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fit_fill_value_mean_median() {
        let values = vec![Some(1.0), None, Some(2.0), Some(6.0)];
        assert_eq!(fit_fill_value(&values, ImputeMethod::Mean), Some(3.0));
        assert_eq!(fit_fill_value(&values, ImputeMethod::Median), Some(2.0));
    }

    #[test]
    fn test_fit_fill_value_mode_prefers_smallest_on_tie() {
        let values = vec![Some(2.0), Some(2.0), Some(1.0), Some(1.0), Some(3.0)];
        assert_eq!(fit_fill_value(&values, ImputeMethod::Mode), Some(1.0));
    }

    #[test]
    fn test_fit_fill_value_all_missing() {
        let values = vec![None, None];
        assert_eq!(fit_fill_value(&values, ImputeMethod::Mean), None);
    }

    #[test]
    fn test_fit_scaler() {
        let values = vec![Some(0.0), Some(10.0)];
        let (mean, std) = fit_scaler(&values).unwrap();
        assert!((mean - 5.0).abs() < 1e-12);
        assert!((std - 50f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_scale_unscale_round_trip() {
        let mut df = df! { "x" => &[1.0, 2.0, 3.0] }.unwrap();
        scale_column(&mut df, "x", 2.0, 1.0).unwrap();
        unscale_column(&mut df, "x", 2.0, 1.0).unwrap();
        let vals = column_f64(&df, "x").unwrap();
        assert_eq!(vals, vec![Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn test_column_map_round_trip_preserves_dtype() {
        let mut df = df! { "id" => &[7i64, 9, 7] }.unwrap();
        let map = ColumnMap::new(vec!["7".to_string(), "9".to_string()], DataType::Int64);

        apply_column_map(&mut df, "id", &map).unwrap();
        let mapped = column_f64(&df, "id").unwrap();
        assert_eq!(mapped, vec![Some(0.0), Some(1.0), Some(0.0)]);

        reverse_column_map(&mut df, "id", &map).unwrap();
        assert_eq!(df.column("id").unwrap().dtype(), &DataType::Int64);
        let restored = column_f64(&df, "id").unwrap();
        assert_eq!(restored, vec![Some(7.0), Some(9.0), Some(7.0)]);
    }

    #[test]
    fn test_state_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = TransformState::new();
        state.imputations.insert("gpa".to_string(), 3.2);
        state.scalers.insert(
            "gpa".to_string(),
            ScalerParams {
                mean: 3.0,
                std: 0.5,
                applied: true,
            },
        );
        state.column_maps.insert(
            "student".to_string(),
            ColumnMap {
                levels: vec!["1".to_string(), "2".to_string()],
                dtype: None,
            },
        );

        state.save(&path).unwrap();
        let loaded = TransformState::load(&path).unwrap();
        assert_eq!(state, loaded);
    }
}
