use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix, CsrMatrix};
use num_complex::Complex64;
use num_traits::Zero;

use super::error::{PowerFlowError, Result};

/// Collects the positions of a real CSC matrix whose values are filled in later.
pub(crate) struct PatternBuilder {
    nrows: usize,
    cols: Vec<Vec<usize>>,
}

impl PatternBuilder {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            cols: vec![Vec::new(); ncols],
        }
    }

    pub fn push(&mut self, row: usize, col: usize) {
        self.cols[col].push(row);
    }

    /// Builds the matrix with explicit zeros at every collected position.
    pub fn finish(mut self) -> Result<CscMatrix<f64>> {
        let mut offsets = Vec::with_capacity(self.cols.len() + 1);
        let mut rows = Vec::new();
        offsets.push(0);
        for col in self.cols.iter_mut() {
            col.sort_unstable();
            col.dedup();
            rows.extend_from_slice(col);
            offsets.push(rows.len());
        }
        let values = vec![0.0; rows.len()];
        CscMatrix::try_from_csc_data(self.nrows, self.cols.len(), offsets, rows, values)
            .map_err(|e| PowerFlowError::SingularSystem(e.to_string()))
    }
}

/// Index into `values()` of the stored entry `(row, col)`.
pub(crate) fn position(mat: &CscMatrix<f64>, row: usize, col: usize) -> Option<usize> {
    let start = mat.col_offsets()[col];
    let end = mat.col_offsets()[col + 1];
    mat.row_indices()[start..end]
        .binary_search(&row)
        .ok()
        .map(|k| start + k)
}

/// Keeps the entries whose row and column both map to a reduced index.
///
/// Every mapped index gets an explicit diagonal so the result is square and its pattern
/// only depends on the entries' positions.
pub(crate) fn restrict<I>(entries: I, map: &[Option<usize>], n: usize) -> CscMatrix<f64>
where
    I: IntoIterator<Item = (usize, usize, f64)>,
{
    let mut coo = CooMatrix::new(n, n);
    for k in 0..n {
        coo.push(k, k, 0.0);
    }
    for (i, j, v) in entries {
        if let (Some(r), Some(c)) = (map[i], map[j]) {
            coo.push(r, c, v);
        }
    }
    CscMatrix::from(&coo)
}

/// `sum_j Y[i, j] * v[j]` over the stored entries of row `i`.
#[inline(always)]
pub(crate) fn row_current(ybus: &CsrMatrix<Complex64>, i: usize, v: &DVector<Complex64>) -> Complex64 {
    let row = ybus.row(i);
    row.col_indices()
        .iter()
        .zip(row.values())
        .fold(Complex64::zero(), |acc, (&j, y)| acc + y * v[j])
}

/// Splits row `i` into its diagonal and the current contributed by the other buses.
#[inline(always)]
pub(crate) fn row_split(
    ybus: &CsrMatrix<Complex64>,
    i: usize,
    v: &DVector<Complex64>,
) -> (Complex64, Complex64) {
    let row = ybus.row(i);
    let mut diag = Complex64::zero();
    let mut others = Complex64::zero();
    for (&j, y) in row.col_indices().iter().zip(row.values()) {
        if j == i {
            diag = *y;
        } else {
            others += y * v[j];
        }
    }
    (diag, others)
}
