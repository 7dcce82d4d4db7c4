use std::fmt;

use faer::{
    MatMut,
    linalg::solvers::Solve,
    sparse::{
        SparseColMatRef, SymbolicSparseColMatRef,
        linalg::solvers::{Lu, SymbolicLu},
    },
};
use nalgebra_sparse::CscMatrix;

use super::SparseFactor;
use crate::basic::error::{PowerFlowError, Result};

/// faer sparse LU; the symbolic analysis is kept across numeric refactorizations.
#[derive(Default)]
pub struct FaerLu {
    lu: Option<Lu<usize, f64>>,
    symbolic: Option<SymbolicLu<usize>>,
    dim: usize,
}

impl FaerLu {
    fn numeric(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        let n = mat.ncols();
        let s = SymbolicSparseColMatRef::new_checked(
            n,
            n,
            mat.col_offsets(),
            None,
            mat.row_indices(),
        );
        let a = SparseColMatRef::new(s, mat.values());
        let Some(symbolic) = self.symbolic.as_ref() else {
            return Err(PowerFlowError::SingularSystem(
                "faer LU used before symbolic analysis".to_string(),
            ));
        };
        self.lu = Some(
            Lu::try_new_with_symbolic(symbolic.clone(), a)
                .map_err(|_| PowerFlowError::SingularSystem("faer numeric LU failed".into()))?,
        );
        Ok(())
    }
}

impl SparseFactor for FaerLu {
    fn build(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        let n = mat.ncols();
        let s = SymbolicSparseColMatRef::new_checked(
            n,
            n,
            mat.col_offsets(),
            None,
            mat.row_indices(),
        );
        self.lu = None;
        self.symbolic = Some(
            SymbolicLu::try_new(s)
                .map_err(|_| PowerFlowError::SingularSystem("faer symbolic LU failed".into()))?,
        );
        self.dim = n;
        self.numeric(mat)
    }

    fn refactor(&mut self, mat: &CscMatrix<f64>) -> Result<()> {
        if self.symbolic.is_none() {
            return self.build(mat);
        }
        self.numeric(mat)
    }

    fn solve(&mut self, b: &mut [f64]) -> Result<()> {
        let Some(lu) = self.lu.as_ref() else {
            return Err(PowerFlowError::SingularSystem(
                "faer LU has no numeric factors".to_string(),
            ));
        };
        let rhs = MatMut::from_column_major_slice_mut(b, self.dim, 1);
        lu.solve_in_place(rhs);
        Ok(())
    }
}

impl fmt::Debug for FaerLu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaerLu")
            .field("dim", &self.dim)
            .finish_non_exhaustive()
    }
}
