//! Paired train/test tables sharing one feature guide and one transform
//! state. This is where leakage safety lives: every statistic (fill values,
//! scaler parameters) is fit on the training partition only and applied
//! identically to both partitions.

use crate::errors::{PrepError, PrepResult};
use crate::guide::FeatureGuide;
use crate::matrix::SparseMatrix;
use crate::state::{
    self, AllNullPolicy, ColumnMap, ImputeMethod, NotMappedPolicy, ScalerParams, TransformState,
};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Options steering `TrainTestSplit::preprocess`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    /// Impute missing values in real-valued columns.
    pub impute: bool,
    pub impute_method: ImputeMethod,
    pub all_null: AllNullPolicy,
    /// Z-score scale real-valued columns.
    pub scale: bool,
    /// Include entity columns in the feature matrix.
    pub use_entities: bool,
    /// One-hot encode entities (otherwise their mapped indices are used raw).
    pub ohc_entities: bool,
    /// Include categorical columns in the feature matrix.
    pub use_categoricals: bool,
    /// One-hot encode categoricals (otherwise mapped indices are used raw).
    pub ohc_categoricals: bool,
    /// Drop test rows whose entity values never occur in train.
    pub remove_cold_start: bool,
    /// Restrict cold-start removal to these entities (default: all).
    pub cold_start_entities: Option<Vec<String>>,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            impute: true,
            impute_method: ImputeMethod::Median,
            all_null: AllNullPolicy::Raise,
            scale: true,
            use_entities: true,
            ohc_entities: true,
            use_categoricals: true,
            ohc_categoricals: true,
            remove_cold_start: true,
            cold_start_entities: None,
        }
    }
}

/// Output of `TrainTestSplit::preprocess`: encoded feature matrices, target
/// vectors, per-entity id vectors, and the feature map that decodes matrix
/// columns back to their source columns.
#[derive(Debug, Clone)]
pub struct EncodedSplit {
    pub train_x: SparseMatrix,
    pub train_y: Vec<f64>,
    pub train_eids: Vec<(String, Vec<u32>)>,
    pub test_x: SparseMatrix,
    pub test_y: Vec<f64>,
    pub test_eids: Vec<(String, Vec<u32>)>,
    /// One label per encoded column: `"{column}-{level}"` for one-hot
    /// columns, the bare column name otherwise.
    pub feature_map: Vec<String>,
    /// Number of leading columns owned by entity features.
    pub nf_entity: usize,
}

pub struct TrainTestSplit {
    guide: FeatureGuide,
    train: DataFrame,
    test: DataFrame,
    state: TransformState,
}

/// Generates the per-(partition, section) view accessors the guide sections
/// imply, replacing the original's dynamic attribute injection.
macro_rules! section_accessors {
    ($($fn_name:ident => ($partition:ident, $section:ident)),* $(,)?) => {
        $(
            pub fn $fn_name(&self) -> PrepResult<DataFrame> {
                let names = self.guide.$section.to_vec();
                self.$partition.select(names).map_err(PrepError::Polars)
            }
        )*
    };
}

impl TrainTestSplit {
    /// Construct from two frames already restricted to the guide's columns.
    ///
    /// Construction is rejected when either partition is empty or the column
    /// sets differ.
    pub fn new(train: DataFrame, test: DataFrame, guide: FeatureGuide) -> PrepResult<Self> {
        if train.height() == 0 {
            return Err(PrepError::Validation(
                "training partition has 0 rows".to_string(),
            ));
        }
        if test.height() == 0 {
            return Err(PrepError::Validation(
                "testing partition has 0 rows".to_string(),
            ));
        }
        let train_cols: Vec<String> = train
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let test_cols: Vec<String> = test
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        if train_cols != test_cols {
            return Err(PrepError::Validation(format!(
                "train/test column mismatch ({} != {})",
                train_cols.join(","),
                test_cols.join(",")
            )));
        }

        Ok(Self {
            guide,
            train,
            test,
            state: TransformState::new(),
        })
    }

    /// Construct from arbitrary frames, selecting the guide's columns in
    /// canonical order first.
    pub fn from_frames(train: &DataFrame, test: &DataFrame, guide: &FeatureGuide) -> PrepResult<Self> {
        let columns = guide.all_names().to_vec();
        let train = train.select(columns.clone())?;
        let test = test.select(columns)?;
        Self::new(train, test, guide.clone())
    }

    /// Load train and test CSV files restricted to the guide's columns.
    pub fn from_paths<P: AsRef<Path>>(
        train_path: P,
        test_path: P,
        guide: &FeatureGuide,
    ) -> PrepResult<Self> {
        let train = crate::io::read_csv_with_guide(train_path, guide)?;
        let test = crate::io::read_csv_with_guide(test_path, guide)?;
        Self::new(train, test, guide.clone())
    }

    pub fn guide(&self) -> &FeatureGuide {
        &self.guide
    }

    pub fn train(&self) -> &DataFrame {
        &self.train
    }

    pub fn test(&self) -> &DataFrame {
        &self.test
    }

    pub fn state(&self) -> &TransformState {
        &self.state
    }

    section_accessors! {
        train_entities => (train, entities),
        test_entities => (test, entities),
        train_categoricals => (train, categoricals),
        test_categoricals => (test, categoricals),
        train_reals => (train, real_valueds),
        test_reals => (test, real_valueds),
        train_key => (train, key),
        test_key => (test, key),
    }

    pub fn train_target(&self) -> PrepResult<Vec<f64>> {
        target_vector(&self.train, &self.guide.target)
    }

    pub fn test_target(&self) -> PrepResult<Vec<f64>> {
        target_vector(&self.test, &self.guide.target)
    }

    /// Map a column's values to a 0-contiguous index, in place in both
    /// partitions. The bijection is built over the union of ids seen across
    /// train and test, in order of first appearance (train first), so both
    /// partitions share one id space. Idempotent: a no-op if already mapped.
    pub fn map_column_to_index(&mut self, column: &str) -> PrepResult<()> {
        if self.state.is_mapped(column) {
            return Ok(());
        }
        state::verify_columns(&self.train, std::slice::from_ref(&column.to_string()))?;

        let dtype = self.train.column(column)?.dtype().clone();
        let mut levels: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for frame in [&self.train, &self.test] {
            for value in state::column_strings(frame, column)? {
                let value = value.ok_or_else(|| {
                    PrepError::Validation(format!("null value in id column '{column}'"))
                })?;
                if seen.insert(value.clone()) {
                    levels.push(value);
                }
            }
        }

        let map = ColumnMap::new(levels, dtype);
        state::apply_column_map(&mut self.train, column, &map)?;
        state::apply_column_map(&mut self.test, column, &map)?;
        self.state.column_maps.insert(column.to_string(), map);
        Ok(())
    }

    /// Restore a mapped column to its original ids in both partitions and
    /// forget the mapping.
    pub fn unmap_column_from_index(
        &mut self,
        column: &str,
        not_mapped: NotMappedPolicy,
    ) -> PrepResult<()> {
        let map = match self.state.column_maps.get(column) {
            Some(map) => map.clone(),
            None => {
                return match not_mapped {
                    NotMappedPolicy::Raise => Err(PrepError::NotMapped(column.to_string())),
                    NotMappedPolicy::Warn => {
                        warn!(column, "column was never mapped to an index; skipping");
                        Ok(())
                    }
                };
            }
        };
        state::reverse_column_map(&mut self.train, column, &map)?;
        state::reverse_column_map(&mut self.test, column, &map)?;
        self.state.column_maps.remove(column);
        Ok(())
    }

    /// Remove a feature from the guide and from both partitions.
    pub fn remove_feature(&mut self, name: &str) -> PrepResult<()> {
        // Validate against a scratch guide first so a data-side failure
        // leaves the real guide untouched.
        let mut guide = self.guide.clone();
        guide.remove(name)?;
        if self.train.column(name).is_err() {
            return Err(PrepError::NotFound(name.to_string()));
        }
        info!(feature = name, "removing feature");
        self.train = self.train.drop(name)?;
        self.test = self.test.drop(name)?;
        self.guide = guide;
        Ok(())
    }

    /// Impute missing values. The fill statistic is computed from the
    /// training partition only and applied to both partitions.
    ///
    /// With `AllNullPolicy::Raise`, every requested column is checked before
    /// any is mutated, so the call is all-or-nothing.
    pub fn impute(
        &mut self,
        columns: &[String],
        method: ImputeMethod,
        all_null: AllNullPolicy,
    ) -> PrepResult<()> {
        state::verify_columns(&self.train, columns)?;

        if all_null == AllNullPolicy::Raise {
            for col in columns {
                if state::column_f64(&self.train, col)?.iter().all(|v| v.is_none()) {
                    return Err(PrepError::Validation(format!(
                        "column '{col}' is entirely missing in the training partition"
                    )));
                }
            }
        }

        for col in columns {
            let values = state::column_f64(&self.train, col)?;
            match state::fit_fill_value(&values, method) {
                None => match all_null {
                    AllNullPolicy::Drop => {
                        self.remove_feature(col)?;
                        info!(column = %col, "all-null column dropped");
                    }
                    AllNullPolicy::Ignore => {
                        info!(column = %col, "all-null column ignored");
                    }
                    // Checked above.
                    AllNullPolicy::Raise => unreachable!("all-null pre-checked"),
                },
                Some(fill) => {
                    state::fill_column(&mut self.train, col, fill)?;
                    state::fill_column(&mut self.test, col, fill)?;
                    self.state.imputations.insert(col.clone(), fill);
                }
            }
        }
        Ok(())
    }

    pub fn impute_reals(&mut self, method: ImputeMethod, all_null: AllNullPolicy) -> PrepResult<()> {
        let reals = self.guide.real_valueds.to_vec();
        if reals.is_empty() {
            return Ok(());
        }
        self.impute(&reals, method, all_null)
    }

    /// Z-score scale columns in place, parameters fit on train only.
    /// Idempotent: an already-scaled column is skipped.
    pub fn scale(&mut self, columns: &[String]) -> PrepResult<()> {
        state::verify_columns(&self.train, columns)?;

        for col in columns {
            if self.state.is_scaled(col) {
                continue;
            }
            let params = match self.state.scalers.get(col) {
                Some(params) => *params,
                None => {
                    let values = state::column_f64(&self.train, col)?;
                    let (mean, std) = state::fit_scaler(&values).ok_or_else(|| {
                        PrepError::Validation(format!(
                            "cannot fit scaler: column '{col}' is entirely missing in train"
                        ))
                    })?;
                    if std.abs() < f64::EPSILON {
                        warn!(column = %col, "zero variance in train; centering only");
                    }
                    ScalerParams {
                        mean,
                        std,
                        applied: false,
                    }
                }
            };

            state::scale_column(&mut self.train, col, params.mean, params.std)?;
            state::scale_column(&mut self.test, col, params.mean, params.std)?;
            self.state.scalers.insert(
                col.clone(),
                ScalerParams {
                    applied: true,
                    ..params
                },
            );
        }
        Ok(())
    }

    /// Reverse Z-score scaling in place. Never-scaled columns are skipped
    /// with a log line.
    pub fn unscale(&mut self, columns: &[String]) -> PrepResult<()> {
        state::verify_columns(&self.train, columns)?;

        for col in columns {
            let params = match self.state.scalers.get(col) {
                Some(params) if params.applied => *params,
                _ => {
                    info!(column = %col, "column has not been scaled; skipping");
                    continue;
                }
            };
            state::unscale_column(&mut self.train, col, params.mean, params.std)?;
            state::unscale_column(&mut self.test, col, params.mean, params.std)?;
            self.state.scalers.insert(
                col.clone(),
                ScalerParams {
                    applied: false,
                    ..params
                },
            );
        }
        Ok(())
    }

    pub fn scale_reals(&mut self) -> PrepResult<()> {
        let reals = self.guide.real_valueds.to_vec();
        if reals.is_empty() {
            return Ok(());
        }
        self.scale(&reals)
    }

    pub fn unscale_reals(&mut self) -> PrepResult<()> {
        let reals = self.guide.real_valueds.to_vec();
        if reals.is_empty() {
            return Ok(());
        }
        self.unscale(&reals)
    }

    /// One-hot encode `columns` over the union of levels observed across
    /// train and test, so both encoded matrices share one width even when a
    /// level occurs on only one side.
    ///
    /// Returns the train matrix, the test matrix, and the ordered
    /// `"{column}-{level}"` feature map.
    pub fn one_hot_encode(
        &self,
        columns: &[String],
    ) -> PrepResult<(SparseMatrix, SparseMatrix, Vec<String>)> {
        let (mut matrices, fmap) = one_hot_frames(&[&self.train, &self.test], columns)?;
        let (test, train) = match (matrices.pop(), matrices.pop()) {
            (Some(test), Some(train)) => (test, train),
            _ => {
                return Err(PrepError::Validation(
                    "one-hot encoding produced the wrong number of matrices".to_string(),
                ))
            }
        };
        Ok((train, test, fmap))
    }

    /// Drop test rows whose value for any named entity column (default: all
    /// entities in the guide) never occurs in the training partition.
    pub fn remove_cold_start(&mut self, entities: Option<&[String]>) -> PrepResult<()> {
        let entities: Vec<String> = match entities {
            Some(cols) => {
                for col in cols {
                    if !self.guide.entities.contains(col) {
                        return Err(PrepError::NotFound(col.clone()));
                    }
                }
                cols.to_vec()
            }
            None => self.guide.entities.to_vec(),
        };

        for entity in &entities {
            let known: HashSet<String> = state::column_strings(&self.train, entity)?
                .into_iter()
                .flatten()
                .collect();
            let mask: Vec<bool> = state::column_strings(&self.test, entity)?
                .into_iter()
                .map(|v| v.map(|s| known.contains(&s)).unwrap_or(false))
                .collect();
            let removed = mask.iter().filter(|keep| !**keep).count();
            info!(entity = %entity, removed, "removing cold-start rows from test");

            let mask = Series::new("mask".into(), mask);
            self.test = self.test.filter(mask.bool()?)?;
        }
        Ok(())
    }

    /// Run the full preprocessing pipeline:
    /// cold-start removal, entity index mapping (capturing entity ids),
    /// real-value imputation, optional scaling, one-hot encoding, and matrix
    /// assembly in `[entities][categoricals][reals]` column order.
    pub fn preprocess(&mut self, opts: &PreprocessOptions) -> PrepResult<EncodedSplit> {
        if opts.remove_cold_start {
            self.remove_cold_start(opts.cold_start_entities.as_deref())?;
        }

        let entities = self.guide.entities.to_vec();
        let mut train_eids = Vec::with_capacity(entities.len());
        let mut test_eids = Vec::with_capacity(entities.len());
        for entity in &entities {
            self.map_column_to_index(entity)?;
            train_eids.push((entity.clone(), mapped_ids(&self.train, entity)?));
            test_eids.push((entity.clone(), mapped_ids(&self.test, entity)?));
        }

        if opts.impute {
            self.impute_reals(opts.impute_method, opts.all_null)?;
        }
        if opts.scale {
            self.scale_reals()?;
        }

        let n_train = self.train.height();
        let n_test = self.test.height();

        let (mut train_x, mut test_x, mut fmap) = if opts.use_entities && !entities.is_empty() {
            if opts.ohc_entities {
                self.one_hot_encode(&entities)?
            } else {
                self.raw_index_block(&entities)?
            }
        } else {
            empty_block(n_train, n_test)
        };
        let nf_entity = train_x.n_cols();

        let categoricals = self.guide.categoricals.to_vec();
        if opts.use_categoricals && !categoricals.is_empty() {
            let (cat_train, cat_test, cat_fmap) = if opts.ohc_categoricals {
                self.one_hot_encode(&categoricals)?
            } else {
                for col in &categoricals {
                    self.map_column_to_index(col)?;
                }
                self.raw_index_block(&categoricals)?
            };
            train_x = train_x.hstack(&cat_train)?;
            test_x = test_x.hstack(&cat_test)?;
            fmap.extend(cat_fmap);
        }

        let reals = self.guide.real_valueds.to_vec();
        if !reals.is_empty() {
            let real_train = dense_block(&self.train, &reals)?;
            let real_test = dense_block(&self.test, &reals)?;
            train_x = train_x.hstack(&real_train)?;
            test_x = test_x.hstack(&real_test)?;
            fmap.extend(reals.iter().cloned());
        }

        if train_x.n_cols() == 0 {
            return Err(PrepError::Validation(
                "no features to encode: no real-valued columns and entity/categorical \
                 features excluded"
                    .to_string(),
            ));
        }

        info!(
            nf_entity,
            nf_categorical = fmap.len() - nf_entity - reals.len(),
            nf_real = reals.len(),
            nf_total = train_x.n_cols(),
            "assembled feature matrices"
        );

        Ok(EncodedSplit {
            train_y: self.train_target()?,
            test_y: self.test_target()?,
            train_x,
            test_x,
            train_eids,
            test_eids,
            feature_map: fmap,
            nf_entity,
        })
    }

    /// One dense column per name, holding the column's mapped index values.
    fn raw_index_block(
        &self,
        columns: &[String],
    ) -> PrepResult<(SparseMatrix, SparseMatrix, Vec<String>)> {
        let train = dense_block(&self.train, columns)?;
        let test = dense_block(&self.test, columns)?;
        Ok((train, test, columns.to_vec()))
    }
}

fn empty_block(n_train: usize, n_test: usize) -> (SparseMatrix, SparseMatrix, Vec<String>) {
    (
        SparseMatrix::zeros(n_train, 0),
        SparseMatrix::zeros(n_test, 0),
        Vec::new(),
    )
}

fn target_vector(df: &DataFrame, target: &str) -> PrepResult<Vec<f64>> {
    state::column_f64(df, target)?
        .into_iter()
        .map(|v| {
            v.ok_or_else(|| PrepError::Validation(format!("null value in target '{target}'")))
        })
        .collect()
}

fn mapped_ids(df: &DataFrame, column: &str) -> PrepResult<Vec<u32>> {
    let col = df.column(column)?.cast(&DataType::UInt32)?;
    col.u32()?
        .into_iter()
        .map(|v| {
            v.ok_or_else(|| PrepError::Validation(format!("null value in id column '{column}'")))
        })
        .collect()
}

/// Dense matrix block from named columns; missing values are rejected so
/// un-imputed gaps cannot silently become zeros.
fn dense_block(df: &DataFrame, columns: &[String]) -> PrepResult<SparseMatrix> {
    let mut dense = Vec::with_capacity(columns.len());
    for col in columns {
        let values: PrepResult<Vec<f64>> = state::column_f64(df, col)?
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| {
                    PrepError::Validation(format!(
                        "missing value in column '{col}'; impute before encoding"
                    ))
                })
            })
            .collect();
        dense.push(values?);
    }
    SparseMatrix::from_dense_columns(&dense)
}

/// One-hot encode `columns` over the union of levels across all `frames`,
/// producing one matrix per frame with a shared width and one feature map.
///
/// Levels are ordered ascending, numerically when every level parses as a
/// number, lexically otherwise. Missing source values encode as an all-zero
/// block.
pub(crate) fn one_hot_frames(
    frames: &[&DataFrame],
    columns: &[String],
) -> PrepResult<(Vec<SparseMatrix>, Vec<String>)> {
    if columns.is_empty() {
        return Err(PrepError::Validation(
            "one-hot encoding requested with no columns".to_string(),
        ));
    }
    info!(columns = ?columns, "one-hot encoding columns");

    // Per column: ordered levels and the block's starting offset.
    let mut fmap = Vec::new();
    let mut column_levels: Vec<Vec<String>> = Vec::with_capacity(columns.len());
    let mut offsets: Vec<usize> = Vec::with_capacity(columns.len());
    let mut width = 0usize;

    for col in columns {
        let mut seen: HashSet<String> = HashSet::new();
        for frame in frames {
            for value in state::column_strings(frame, col)?.into_iter().flatten() {
                seen.insert(value);
            }
        }
        let levels = sort_levels(seen.into_iter().collect());
        info!(column = %col, levels = levels.len(), "distinct one-hot levels");

        fmap.extend(levels.iter().map(|level| format!("{col}-{level}")));
        offsets.push(width);
        width += levels.len();
        column_levels.push(levels);
    }

    let mut matrices = Vec::with_capacity(frames.len());
    for frame in frames {
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); frame.height()];
        for ((col, levels), offset) in columns.iter().zip(&column_levels).zip(&offsets) {
            let index_of: std::collections::HashMap<&str, usize> = levels
                .iter()
                .enumerate()
                .map(|(i, level)| (level.as_str(), i))
                .collect();
            for (row, value) in state::column_strings(frame, col)?.into_iter().enumerate() {
                if let Some(value) = value {
                    let level = index_of.get(value.as_str()).ok_or_else(|| {
                        PrepError::Validation(format!(
                            "level '{value}' of '{col}' missing from union vocabulary"
                        ))
                    })?;
                    rows[row].push((offset + level, 1.0));
                }
            }
        }
        matrices.push(SparseMatrix::from_rows(rows, width)?);
    }

    Ok((matrices, fmap))
}

fn sort_levels(mut levels: Vec<String>) -> Vec<String> {
    let numeric: Option<Vec<f64>> = levels.iter().map(|l| l.parse::<f64>().ok()).collect();
    match numeric {
        Some(_) => levels.sort_by(|a, b| {
            let fa: f64 = a.parse().unwrap_or(f64::NAN);
            let fb: f64 = b.parse().unwrap_or(f64::NAN);
            fa.partial_cmp(&fb).unwrap_or(std::cmp::Ordering::Equal)
        }),
        None => levels.sort(),
    }
    levels
}
