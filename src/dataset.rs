//! Single-table dataset bound to a feature guide.
//!
//! Transform statistics here are fit over the whole table, and
//! `map_column_to_index` builds its bijection from this table's ids only.
//! The paired variant in `split` unions train and test ids instead; the
//! asymmetry is deliberate and load-bearing for cold-start semantics.

use crate::errors::{PrepError, PrepResult};
use crate::guide::FeatureGuide;
use crate::matrix::SparseMatrix;
use crate::split::{self, TrainTestSplit};
use crate::splitter::{CmpOp, DatasetSplitter};
use crate::state::{
    self, AllNullPolicy, ColumnMap, ImputeMethod, NotMappedPolicy, ScalerParams, TransformState,
};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Encoded output of the single-table `preprocess`.
#[derive(Debug, Clone)]
pub struct EncodedTable {
    pub x: SparseMatrix,
    pub y: Vec<f64>,
    pub eids: Vec<(String, Vec<u32>)>,
    pub feature_map: Vec<String>,
    pub nf_entity: usize,
}

pub struct FullDataset {
    guide: FeatureGuide,
    df: DataFrame,
    state: TransformState,
}

impl FullDataset {
    /// Wrap a frame, selecting the guide's columns in canonical order.
    pub fn from_frame(df: &DataFrame, guide: &FeatureGuide) -> PrepResult<Self> {
        let df = df.select(guide.all_names().to_vec())?;
        Ok(Self {
            guide: guide.clone(),
            df,
            state: TransformState::new(),
        })
    }

    /// Load a CSV restricted to the guide's columns.
    pub fn from_csv<P: AsRef<Path>>(path: P, guide: &FeatureGuide) -> PrepResult<Self> {
        let df = crate::io::read_csv_with_guide(path, guide)?;
        Ok(Self {
            guide: guide.clone(),
            df,
            state: TransformState::new(),
        })
    }

    pub fn guide(&self) -> &FeatureGuide {
        &self.guide
    }

    pub fn frame(&self) -> &DataFrame {
        &self.df
    }

    pub fn state(&self) -> &TransformState {
        &self.state
    }

    pub fn height(&self) -> usize {
        self.df.height()
    }

    /// Map a column's values to a 0-contiguous index in place, using only
    /// this table's ids, in order of first appearance. Idempotent.
    pub fn map_column_to_index(&mut self, column: &str) -> PrepResult<()> {
        if self.state.is_mapped(column) {
            return Ok(());
        }
        state::verify_columns(&self.df, std::slice::from_ref(&column.to_string()))?;

        let dtype = self.df.column(column)?.dtype().clone();
        let mut levels: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for value in state::column_strings(&self.df, column)? {
            let value = value.ok_or_else(|| {
                PrepError::Validation(format!("null value in id column '{column}'"))
            })?;
            if seen.insert(value.clone()) {
                levels.push(value);
            }
        }

        let map = ColumnMap::new(levels, dtype);
        state::apply_column_map(&mut self.df, column, &map)?;
        self.state.column_maps.insert(column.to_string(), map);
        Ok(())
    }

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
        state::reverse_column_map(&mut self.df, column, &map)?;
        self.state.column_maps.remove(column);
        Ok(())
    }

    /// Map every entity column, making their id spaces 0-contiguous.
    pub fn make_entities_contiguous(&mut self) -> PrepResult<()> {
        for entity in self.guide.entities.to_vec() {
            self.map_column_to_index(&entity)?;
        }
        Ok(())
    }

    pub fn remove_feature(&mut self, name: &str) -> PrepResult<()> {
        let mut guide = self.guide.clone();
        guide.remove(name)?;
        if self.df.column(name).is_err() {
            return Err(PrepError::NotFound(name.to_string()));
        }
        info!(feature = name, "removing feature");
        self.df = self.df.drop(name)?;
        self.guide = guide;
        Ok(())
    }

    /// Impute missing values with a statistic fit over this table.
    /// With `AllNullPolicy::Raise` every column is checked before any is
    /// mutated.
    pub fn impute(
        &mut self,
        columns: &[String],
        method: ImputeMethod,
        all_null: AllNullPolicy,
    ) -> PrepResult<()> {
        state::verify_columns(&self.df, columns)?;

        if all_null == AllNullPolicy::Raise {
            for col in columns {
                if state::column_f64(&self.df, col)?.iter().all(|v| v.is_none()) {
                    return Err(PrepError::Validation(format!(
                        "column '{col}' is entirely missing"
                    )));
                }
            }
        }

        for col in columns {
            let values = state::column_f64(&self.df, col)?;
            match state::fit_fill_value(&values, method) {
                None => match all_null {
                    AllNullPolicy::Drop => {
                        self.remove_feature(col)?;
                        info!(column = %col, "all-null column dropped");
                    }
                    AllNullPolicy::Ignore => {
                        info!(column = %col, "all-null column ignored");
                    }
                    AllNullPolicy::Raise => unreachable!("all-null pre-checked"),
                },
                Some(fill) => {
                    state::fill_column(&mut self.df, col, fill)?;
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

    /// Z-score scale columns in place; already-scaled columns are skipped.
    pub fn scale(&mut self, columns: &[String]) -> PrepResult<()> {
        state::verify_columns(&self.df, columns)?;

        for col in columns {
            if self.state.is_scaled(col) {
                continue;
            }
            let params = match self.state.scalers.get(col) {
                Some(params) => *params,
                None => {
                    let values = state::column_f64(&self.df, col)?;
                    let (mean, std) = state::fit_scaler(&values).ok_or_else(|| {
                        PrepError::Validation(format!(
                            "cannot fit scaler: column '{col}' is entirely missing"
                        ))
                    })?;
                    ScalerParams {
                        mean,
                        std,
                        applied: false,
                    }
                }
            };
            state::scale_column(&mut self.df, col, params.mean, params.std)?;
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

    pub fn unscale(&mut self, columns: &[String]) -> PrepResult<()> {
        state::verify_columns(&self.df, columns)?;

        for col in columns {
            let params = match self.state.scalers.get(col) {
                Some(params) if params.applied => *params,
                _ => {
                    info!(column = %col, "column has not been scaled; skipping");
                    continue;
                }
            };
            state::unscale_column(&mut self.df, col, params.mean, params.std)?;
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

    /// One-hot encode over the levels observed in this table.
    pub fn one_hot_encode(
        &self,
        columns: &[String],
    ) -> PrepResult<(SparseMatrix, Vec<String>)> {
        let (mut matrices, fmap) = split::one_hot_frames(&[&self.df], columns)?;
        let matrix = matrices.pop().ok_or_else(|| {
            PrepError::Validation("one-hot encoding produced no matrix".to_string())
        })?;
        Ok((matrix, fmap))
    }

    /// Single-table preprocessing: entity mapping, imputation, optional
    /// scaling, one-hot encoding of entities and categoricals, and matrix
    /// assembly in `[entities][categoricals][reals]` order.
    pub fn preprocess(
        &mut self,
        method: ImputeMethod,
        all_null: AllNullPolicy,
        scale: bool,
    ) -> PrepResult<EncodedTable> {
        let entities = self.guide.entities.to_vec();
        let mut eids = Vec::with_capacity(entities.len());
        for entity in &entities {
            self.map_column_to_index(entity)?;
            let ids: PrepResult<Vec<u32>> = self
                .df
                .column(entity)?
                .cast(&DataType::UInt32)?
                .u32()?
                .into_iter()
                .map(|v| {
                    v.ok_or_else(|| {
                        PrepError::Validation(format!("null value in id column '{entity}'"))
                    })
                })
                .collect();
            eids.push((entity.clone(), ids?));
        }

        self.impute_reals(method, all_null)?;
        if scale {
            self.scale_reals()?;
        }

        let (mut x, mut fmap) = if entities.is_empty() {
            (SparseMatrix::zeros(self.df.height(), 0), Vec::new())
        } else {
            self.one_hot_encode(&entities)?
        };
        let nf_entity = x.n_cols();

        let categoricals = self.guide.categoricals.to_vec();
        if !categoricals.is_empty() {
            let (cat_x, cat_fmap) = self.one_hot_encode(&categoricals)?;
            x = x.hstack(&cat_x)?;
            fmap.extend(cat_fmap);
        }

        let reals = self.guide.real_valueds.to_vec();
        if !reals.is_empty() {
            let mut dense = Vec::with_capacity(reals.len());
            for col in &reals {
                let values: PrepResult<Vec<f64>> = state::column_f64(&self.df, col)?
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
            x = x.hstack(&SparseMatrix::from_dense_columns(&dense)?)?;
            fmap.extend(reals.iter().cloned());
        }

        if x.n_cols() == 0 {
            return Err(PrepError::Validation(
                "no features to encode".to_string(),
            ));
        }

        let y: PrepResult<Vec<f64>> = state::column_f64(&self.df, &self.guide.target)?
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| {
                    PrepError::Validation(format!(
                        "null value in target '{}'",
                        self.guide.target
                    ))
                })
            })
            .collect();

        Ok(EncodedTable {
            x,
            y: y?,
            eids,
            feature_map: fmap,
            nf_entity,
        })
    }

    /// Split into a paired train/test dataset by row masks. Each split gets
    /// its own copy of the guide and a fresh transform state.
    pub fn split(
        &self,
        train_mask: &BooleanChunked,
        test_mask: &BooleanChunked,
    ) -> PrepResult<TrainTestSplit> {
        let train = self.df.filter(train_mask)?;
        let test = self.df.filter(test_mask)?;
        TrainTestSplit::new(train, test, self.guide.clone())
    }

    /// Random binary split: roughly `p` of the rows go to train, the rest to
    /// test. A seed makes the partition reproducible. Fails with the usual
    /// empty-partition `Validation` error when `p` leaves one side with no
    /// rows.
    pub fn random_split(&self, p: f64, seed: Option<u64>) -> PrepResult<TrainTestSplit> {
        if !(0.0..=1.0).contains(&p) {
            return Err(PrepError::Validation(format!(
                "train fraction must be in [0, 1], got {p}"
            )));
        }
        let n = self.df.height();
        let n_train = ((n as f64 * p) as usize + 1).min(n);

        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        indices.shuffle(&mut rng);
        let train_rows: HashSet<usize> = indices[..n_train].iter().copied().collect();

        let train_mask: Vec<bool> = (0..n).map(|i| train_rows.contains(&i)).collect();
        let test_mask: Vec<bool> = train_mask.iter().map(|keep| !keep).collect();
        let train = Series::new("train".into(), train_mask);
        let test = Series::new("test".into(), test_mask);
        self.split(train.bool()?, test.bool()?)
    }

    /// Iterator over one train/test split per distinct value of `column`.
    pub fn splitter(
        &self,
        column: &str,
        train_cmp: CmpOp,
        test_cmp: CmpOp,
        window: Option<f64>,
    ) -> DatasetSplitter<'_> {
        DatasetSplitter::new(self, column, train_cmp, test_cmp, window)
    }
}
