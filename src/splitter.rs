//! Lazy generation of train/test splits from a single dataset.
//!
//! A `DatasetSplitter` walks the distinct values of one column in ascending
//! order and, for each value, materializes a `TrainTestSplit` by comparing
//! every row's value against it. Nothing is filtered until a split is
//! actually requested.

use crate::dataset::FullDataset;
use crate::errors::{PrepError, PrepResult};
use crate::split::TrainTestSplit;
use crate::state;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Comparison operator applied as `row_value OP split_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn eval(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }
}

/// What iteration does with a split that fails to materialize (for example
/// when a comparison leaves one partition empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Yield the error and stop.
    Raise,
    /// Log at error level and continue with the next value.
    Log,
    /// Skip silently (debug log only).
    Ignore,
}

pub struct DatasetSplitter<'a> {
    dataset: &'a FullDataset,
    column: String,
    train_cmp: CmpOp,
    test_cmp: CmpOp,
    /// Lower bound on train rows, as a distance below the split value. With
    /// `Some(w)`, train keeps only rows with `value >= split_value - w`.
    window: Option<f64>,
}

impl<'a> DatasetSplitter<'a> {
    pub fn new(
        dataset: &'a FullDataset,
        column: &str,
        train_cmp: CmpOp,
        test_cmp: CmpOp,
        window: Option<f64>,
    ) -> Self {
        Self {
            dataset,
            column: column.to_string(),
            train_cmp,
            test_cmp,
            window,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Distinct values of the split column, ascending. Recomputed on every
    /// call so the splitter tracks mutations of the underlying dataset.
    pub fn values(&self) -> PrepResult<Vec<f64>> {
        let mut values: Vec<f64> = state::column_f64(self.dataset.frame(), &self.column)?
            .into_iter()
            .flatten()
            .collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        Ok(values)
    }

    pub fn n_splits(&self) -> PrepResult<usize> {
        Ok(self.values()?.len())
    }

    /// Materialize the split for one known value of the column.
    pub fn get(&self, value: f64) -> PrepResult<TrainTestSplit> {
        let values = self.values()?;
        if !values.contains(&value) {
            return Err(PrepError::NotFound(format!(
                "no value {value} in column '{}'",
                self.column
            )));
        }
        self.materialize(value, &values)
    }

    fn materialize(&self, value: f64, values: &[f64]) -> PrepResult<TrainTestSplit> {
        let floor = match self.window {
            Some(window) => value - window,
            // No window: the whole history qualifies.
            None => values.first().copied().unwrap_or(f64::NEG_INFINITY),
        };

        let column = state::column_f64(self.dataset.frame(), &self.column)?;
        let mut train_mask = Vec::with_capacity(column.len());
        let mut test_mask = Vec::with_capacity(column.len());
        for v in column {
            match v {
                Some(x) => {
                    train_mask.push(self.train_cmp.eval(x, value) && x >= floor);
                    test_mask.push(self.test_cmp.eval(x, value));
                }
                None => {
                    train_mask.push(false);
                    test_mask.push(false);
                }
            }
        }

        let train = Series::new("train".into(), train_mask);
        let test = Series::new("test".into(), test_mask);
        self.dataset.split(train.bool()?, test.bool()?)
    }

    /// Iterate over all splits, one per distinct value, ascending.
    pub fn iter(&self, on_error: ErrorPolicy) -> PrepResult<SplitIter<'_, 'a>> {
        let values = self.values()?;
        Ok(SplitIter {
            splitter: self,
            values,
            next: 0,
            on_error,
            fused: false,
        })
    }
}

pub struct SplitIter<'s, 'a> {
    splitter: &'s DatasetSplitter<'a>,
    values: Vec<f64>,
    next: usize,
    on_error: ErrorPolicy,
    fused: bool,
}

impl Iterator for SplitIter<'_, '_> {
    type Item = PrepResult<(f64, TrainTestSplit)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        while self.next < self.values.len() {
            let value = self.values[self.next];
            self.next += 1;
            match self.splitter.materialize(value, &self.values) {
                Ok(split) => return Some(Ok((value, split))),
                Err(err) => match self.on_error {
                    ErrorPolicy::Raise => {
                        self.fused = true;
                        return Some(Err(err));
                    }
                    ErrorPolicy::Log => {
                        error!(value, error = %err, "skipping split");
                    }
                    ErrorPolicy::Ignore => {
                        debug!(value, "skipping split");
                    }
                },
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guide::FeatureGuide;

    fn dataset() -> FullDataset {
        let guide = FeatureGuide::parse("t:grade;\ne:student;\nc:term;\nr:gpa;").unwrap();
        let df = df! {
            "grade" => &[4.0, 3.0, 2.0, 1.0, 4.0, 3.0],
            "student" => &[1i64, 2, 1, 2, 3, 1],
            "term" => &[1i64, 1, 2, 2, 3, 3],
            "gpa" => &[3.0, 2.5, 3.1, 2.0, 3.5, 2.8],
        }
        .unwrap();
        FullDataset::from_frame(&df, &guide).unwrap()
    }

    #[test]
    fn test_values_are_sorted_distinct() {
        let dset = dataset();
        let splitter = dset.splitter("term", CmpOp::Lt, CmpOp::Eq, None);
        assert_eq!(splitter.values().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(splitter.n_splits().unwrap(), 3);
    }

    #[test]
    fn test_get_partitions_by_comparison() {
        let dset = dataset();
        let splitter = dset.splitter("term", CmpOp::Lt, CmpOp::Eq, None);

        let split = splitter.get(3.0).unwrap();
        // Train: terms 1 and 2; test: term 3.
        assert_eq!(split.train().height(), 4);
        assert_eq!(split.test().height(), 2);
    }

    #[test]
    fn test_get_unknown_value() {
        let dset = dataset();
        let splitter = dset.splitter("term", CmpOp::Lt, CmpOp::Eq, None);
        assert!(matches!(
            splitter.get(7.0),
            Err(PrepError::NotFound(_))
        ));
    }

    #[test]
    fn test_window_bounds_training_history() {
        let dset = dataset();
        let splitter = dset.splitter("term", CmpOp::Lt, CmpOp::Eq, Some(1.0));

        let split = splitter.get(3.0).unwrap();
        // Window of 1 keeps only term 2 in train.
        assert_eq!(split.train().height(), 2);
        assert_eq!(split.test().height(), 2);
    }

    #[test]
    fn test_iter_skips_unsplittable_values() {
        let dset = dataset();
        let splitter = dset.splitter("term", CmpOp::Lt, CmpOp::Eq, None);

        // Term 1 has no earlier history, so its train partition is empty.
        let splits: Vec<(f64, TrainTestSplit)> = splitter
            .iter(ErrorPolicy::Ignore)
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        let values: Vec<f64> = splits.iter().map(|(v, _)| *v).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[test]
    fn test_iter_raise_yields_error_then_stops() {
        let dset = dataset();
        let splitter = dset.splitter("term", CmpOp::Lt, CmpOp::Eq, None);

        let mut iter = splitter.iter(ErrorPolicy::Raise).unwrap();
        let first = iter.next().unwrap();
        assert!(first.is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_cmp_op_eval() {
        assert!(CmpOp::Lt.eval(1.0, 2.0));
        assert!(!CmpOp::Lt.eval(2.0, 2.0));
        assert!(CmpOp::Le.eval(2.0, 2.0));
        assert!(CmpOp::Gt.eval(3.0, 2.0));
        assert!(CmpOp::Ge.eval(2.0, 2.0));
        assert!(CmpOp::Eq.eval(2.0, 2.0));
        assert!(CmpOp::Ne.eval(1.0, 2.0));
    }
}
