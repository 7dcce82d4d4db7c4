use std::fmt;

use nalgebra_sparse::CscMatrix;
use rsparse::{
    data::{self, Nmrc, Numeric, Symb},
    chol, lsolve, ltsolve, lu, qrsol, schol, sqr, usolve,
};

use super::SparseFactor;
use crate::basic::error::{PowerFlowError, Result};

/// Natural ordering, no AMD pass.
const ORDER_NATURAL: i8 = -1;
/// AMD on `A + A'`.
const ORDER_CHOL: i8 = 0;
/// AMD on `A'A` with dense rows dropped.
const ORDER_LU: i8 = 1;
/// AMD on `A'A`.
const ORDER_QR: i8 = 3;
/// Partial pivoting threshold; small values favour the diagonal.
const PIVOT_TOL: f64 = 1e-6;

fn to_sprs(mat: &CscMatrix<f64>) -> data::Sprs<f64> {
    data::Sprs {
        m: mat.nrows(),
        n: mat.ncols(),
        i: mat.row_indices().to_vec(),
        p: mat.col_offsets().iter().map(|&v| v as isize).collect(),
        x: mat.values().to_vec(),
        nzmax: mat.nnz(),
    }
}

/// AMD needs at least two columns.
fn ordering(a: &data::Sprs<f64>, order: i8) -> i8 {
    if a.n < 2 { ORDER_NATURAL } else { order }
}

fn singular(what: &str) -> PowerFlowError {
    PowerFlowError::SingularSystem(format!("{what} factorization failed"))
}

/// Sparse LU (`P A Q = L U`) keeping the column ordering between refactorizations.
#[derive(Default)]
pub struct RSparseLu {
    symbolic: Option<Symb>,
    numeric: Option<Nmrc<f64>>,
    x: Vec<f64>,
}

impl SparseFactor for RSparseLu {
    fn build(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        let a = to_sprs(mat);
        let mut s = sqr(&a, ordering(&a, ORDER_LU), false);
        self.numeric = None;
        self.numeric = Some(lu(&a, &mut s, PIVOT_TOL).map_err(|_| singular("LU"))?);
        self.symbolic = Some(s);
        self.x = vec![0.0; mat.ncols()];
        Ok(())
    }

    fn refactor(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        let Some(s) = self.symbolic.as_mut() else {
            return self.build(mat);
        };
        let a = to_sprs(mat);
        self.numeric = None;
        self.numeric = Some(lu(&a, s, PIVOT_TOL).map_err(|_| singular("LU"))?);
        Ok(())
    }

    fn solve(&mut self, b: &mut [f64]) -> Result<()> {
        let (Some(s), Some(n)) = (self.symbolic.as_ref(), self.numeric.as_ref()) else {
            return Err(singular("LU"));
        };
        let x = &mut self.x;
        ipvec(&n.pinv, b, x); // x = P*b
        lsolve(&n.l, x); // x = L\x
        usolve(&n.u, x); // x = U\x
        ipvec(&s.q, x, b); // b = Q*x
        Ok(())
    }
}

/// Sparse Cholesky `P A P' = L L'` for symmetric positive definite matrices.
#[derive(Default)]
pub struct RSparseLdlt {
    symbolic: Option<Symb>,
    numeric: Option<Nmrc<f64>>,
    x: Vec<f64>,
}

impl SparseFactor for RSparseLdlt {
    fn build(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        let a = to_sprs(mat);
        let mut s = schol(&a, ordering(&a, ORDER_CHOL));
        self.numeric = None;
        self.numeric = Some(chol(&a, &mut s).map_err(|_| singular("LDLt"))?);
        self.symbolic = Some(s);
        self.x = vec![0.0; mat.ncols()];
        Ok(())
    }

    fn refactor(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        let Some(s) = self.symbolic.as_mut() else {
            return self.build(mat);
        };
        let a = to_sprs(mat);
        self.numeric = None;
        self.numeric = Some(chol(&a, s).map_err(|_| singular("LDLt"))?);
        Ok(())
    }

    fn solve(&mut self, b: &mut [f64]) -> Result<()> {
        let (Some(s), Some(n)) = (self.symbolic.as_ref(), self.numeric.as_ref()) else {
            return Err(singular("LDLt"));
        };
        let x = &mut self.x;
        ipvec(&s.pinv, b, x); // x = P*b
        lsolve(&n.l, x); // x = L\x
        ltsolve(&n.l, x); // x = L'\x
        pvec(&s.pinv, x, b); // b = P'*x
        Ok(())
    }
}

/// Sparse QR. The rsparse entry point factorizes and solves in one call, so the numeric
/// work happens in [`solve`](SparseFactor::solve).
#[derive(Default)]
pub struct RSparseQr {
    matrix: Option<data::Sprs<f64>>,
    x: Vec<f64>,
}

impl SparseFactor for RSparseQr {
    fn build(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        self.matrix = Some(to_sprs(mat));
        self.x = vec![0.0; mat.ncols()];
        Ok(())
    }

    fn refactor(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        self.build(mat)
    }

    fn solve(&mut self, b: &mut [f64]) -> Result<()> {
        let Some(a) = self.matrix.as_ref() else {
            return Err(singular("QR"));
        };
        // a zero pivot in R shows up as a non-finite solution
        self.x.copy_from_slice(b);
        qrsol(a, &mut self.x, ordering(a, ORDER_QR));
        b.copy_from_slice(&self.x);
        Ok(())
    }
}

macro_rules! opaque_debug {
    ($($ty:ident),*) => {
        $(impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("dim", &self.x.len())
                    .finish_non_exhaustive()
            }
        })*
    };
}
opaque_debug!(RSparseLu, RSparseLdlt, RSparseQr);

fn ipvec_perm<T: Numeric<T>>(p: &[isize], b: &[T], x: &mut [T]) {
    for k in 0..b.len() {
        x[p[k] as usize] = b[k];
    }
}

fn pvec_perm<T: Numeric<T>>(p: &[isize], b: &[T], x: &mut [T]) {
    for k in 0..b.len() {
        x[k] = b[p[k] as usize];
    }
}

/// `x(p) = b`, identity when no permutation is stored.
fn ipvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(pvec) => ipvec_perm(pvec, b, x),
        None => x.copy_from_slice(b),
    }
}

/// `x = b(p)`, identity when no permutation is stored.
fn pvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(pvec) => pvec_perm(pvec, b, x),
        None => x.copy_from_slice(b),
    }
}
