//! Compressed sparse row matrix for encoded feature blocks.
//!
//! One-hot blocks are overwhelmingly sparse while real-valued columns are
//! dense; both are stored here in CSR form so the libFM writer can stream
//! `(column, value)` pairs row by row without materializing zeros.

use crate::errors::{PrepError, PrepResult};

#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    n_rows: usize,
    n_cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    /// All-zero matrix with the given shape.
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            indptr: vec![0; n_rows + 1],
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build from per-row `(column, value)` entries. Entries must use column
    /// indices below `n_cols`; within a row they are sorted on insertion.
    pub fn from_rows(rows: Vec<Vec<(usize, f64)>>, n_cols: usize) -> PrepResult<Self> {
        let n_rows = rows.len();
        let mut indptr = Vec::with_capacity(n_rows + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);

        for mut row in rows {
            row.sort_by_key(|(idx, _)| *idx);
            for (idx, value) in row {
                if idx >= n_cols {
                    return Err(PrepError::Validation(format!(
                        "column index {idx} out of bounds for width {n_cols}"
                    )));
                }
                indices.push(idx);
                values.push(value);
            }
            indptr.push(indices.len());
        }

        Ok(Self {
            n_rows,
            n_cols,
            indptr,
            indices,
            values,
        })
    }

    /// Build from dense columns. Every value is stored, zeros included, so
    /// real-valued feature columns keep their exact width-aligned layout.
    pub fn from_dense_columns(columns: &[Vec<f64>]) -> PrepResult<Self> {
        let n_cols = columns.len();
        let n_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        for col in columns {
            if col.len() != n_rows {
                return Err(PrepError::Validation(
                    "dense columns have unequal lengths".to_string(),
                ));
            }
        }

        let mut rows = Vec::with_capacity(n_rows);
        for i in 0..n_rows {
            let row: Vec<(usize, f64)> = columns.iter().enumerate().map(|(j, c)| (j, c[i])).collect();
            rows.push(row);
        }
        Self::from_rows(rows, n_cols)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Non-zero-structure entries of row `i` as `(column, value)` pairs.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let start = self.indptr[i];
        let end = self.indptr[i + 1];
        self.indices[start..end]
            .iter()
            .copied()
            .zip(self.values[start..end].iter().copied())
    }

    /// Horizontal concatenation; `other`'s columns land after `self`'s.
    pub fn hstack(&self, other: &SparseMatrix) -> PrepResult<SparseMatrix> {
        if self.n_rows != other.n_rows {
            return Err(PrepError::Validation(format!(
                "cannot hstack matrices with {} and {} rows",
                self.n_rows, other.n_rows
            )));
        }

        let n_cols = self.n_cols + other.n_cols;
        let mut rows = Vec::with_capacity(self.n_rows);
        for i in 0..self.n_rows {
            let mut row: Vec<(usize, f64)> = self.row(i).collect();
            row.extend(other.row(i).map(|(j, v)| (j + self.n_cols, v)));
            rows.push(row);
        }
        SparseMatrix::from_rows(rows, n_cols)
    }

    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.n_cols]; self.n_rows];
        for i in 0..self.n_rows {
            for (j, v) in self.row(i) {
                dense[i][j] = v;
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_and_row_iteration() {
        let m = SparseMatrix::from_rows(
            vec![vec![(1, 1.0)], vec![], vec![(0, 2.0), (2, 3.0)]],
            3,
        )
        .unwrap();
        assert_eq!(m.n_rows(), 3);
        assert_eq!(m.n_cols(), 3);
        assert_eq!(m.row(0).collect::<Vec<_>>(), vec![(1, 1.0)]);
        assert_eq!(m.row(1).count(), 0);
        assert_eq!(m.row(2).collect::<Vec<_>>(), vec![(0, 2.0), (2, 3.0)]);
    }

    #[test]
    fn test_from_rows_sorts_entries() {
        let m = SparseMatrix::from_rows(vec![vec![(2, 3.0), (0, 1.0)]], 3).unwrap();
        assert_eq!(m.row(0).collect::<Vec<_>>(), vec![(0, 1.0), (2, 3.0)]);
    }

    #[test]
    fn test_from_rows_rejects_out_of_bounds() {
        let err = SparseMatrix::from_rows(vec![vec![(5, 1.0)]], 3).unwrap_err();
        assert!(matches!(err, crate::errors::PrepError::Validation(_)));
    }

    #[test]
    fn test_from_dense_columns_keeps_zeros() {
        let m = SparseMatrix::from_dense_columns(&[vec![0.0, 1.0], vec![2.0, 0.0]]).unwrap();
        assert_eq!(m.row(0).collect::<Vec<_>>(), vec![(0, 0.0), (1, 2.0)]);
        assert_eq!(m.to_dense(), vec![vec![0.0, 2.0], vec![1.0, 0.0]]);
    }

    #[test]
    fn test_hstack() {
        let left = SparseMatrix::from_rows(vec![vec![(0, 1.0)], vec![(1, 2.0)]], 2).unwrap();
        let right = SparseMatrix::from_rows(vec![vec![(0, 3.0)], vec![]], 1).unwrap();
        let joined = left.hstack(&right).unwrap();
        assert_eq!(joined.n_cols(), 3);
        assert_eq!(joined.to_dense(), vec![vec![1.0, 0.0, 3.0], vec![0.0, 2.0, 0.0]]);
    }

    #[test]
    fn test_hstack_rejects_row_mismatch() {
        let left = SparseMatrix::zeros(2, 1);
        let right = SparseMatrix::zeros(3, 1);
        assert!(left.hstack(&right).is_err());
    }
}
