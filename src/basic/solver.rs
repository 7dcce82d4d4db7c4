//! Sparse factorizations and the cache that decides how much of them to redo.
//!
//! The cache keeps one factorization per solver instance together with the
//! [`Signature`] of the matrix it was computed from:
//!
//! - different pattern: full symbolic + numeric factorization ([`FactorAction::Built`]);
//! - same pattern: numeric refactorization on the stored symbolic analysis
//!   ([`FactorAction::Refactored`]);
//! - same pattern and model, constant matrices only: nothing to do ([`FactorAction::Reused`]).
use derive_more::Display;
use nalgebra_sparse::CscMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    error::{PowerFlowError, Result},
    network::Signature,
};

#[cfg(feature = "faer")]
mod faer_lu;
#[cfg(feature = "faer")]
pub use faer_lu::*;

mod direct;
pub use direct::*;

/// Factorization kind, chosen once per solver instance.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Factorization {
    /// Sparse LU with partial pivoting.
    #[default]
    LU,
    /// Sparse Cholesky (LDLt), symmetric positive definite systems only.
    LDLt,
    /// Sparse QR, slower but tolerant of near-singular systems.
    QR,
}

/// A sparse direct factorization of a square real matrix.
pub trait SparseFactor {
    /// Runs the symbolic analysis and the numeric factorization of `mat`.
    fn build(&mut self, mat: &CscMatrix<f64>) -> Result<()>;

    /// Recomputes the numeric factors of `mat`, reusing the symbolic analysis of the
    /// last [`build`](SparseFactor::build).
    ///
    /// `mat` must have the sparsity pattern the analysis was built from.
    fn refactor(&mut self, mat: &CscMatrix<f64>) -> Result<()>;

    /// Solves `A x = b` in place.
    fn solve(&mut self, b: &mut [f64]) -> Result<()>;
}

#[derive(Debug)]
enum Backend {
    #[cfg(not(feature = "faer"))]
    Lu(RSparseLu),
    Ldlt(RSparseLdlt),
    Qr(RSparseQr),
    #[cfg(feature = "faer")]
    Faer(FaerLu),
}

impl Backend {
    fn new(kind: Factorization) -> Self {
        match kind {
            #[cfg(feature = "faer")]
            Factorization::LU => Backend::Faer(FaerLu::default()),
            #[cfg(not(feature = "faer"))]
            Factorization::LU => Backend::Lu(RSparseLu::default()),
            Factorization::LDLt => Backend::Ldlt(RSparseLdlt::default()),
            Factorization::QR => Backend::Qr(RSparseQr::default()),
        }
    }

    fn factor(&mut self) -> &mut dyn SparseFactor {
        match self {
            #[cfg(not(feature = "faer"))]
            Backend::Lu(f) => f,
            Backend::Ldlt(f) => f,
            Backend::Qr(f) => f,
            #[cfg(feature = "faer")]
            Backend::Faer(f) => f,
        }
    }
}

/// What the last factorization request actually did.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum FactorAction {
    Built,
    Refactored,
    Reused,
}

/// Factorization handle plus the signature it was computed from.
#[derive(Debug)]
pub struct FactorizationCache {
    kind: Factorization,
    backend: Backend,
    signature: Option<Signature>,
    dim: usize,
    last: Option<FactorAction>,
}

impl FactorizationCache {
    pub fn new(kind: Factorization) -> Self {
        Self {
            kind,
            backend: Backend::new(kind),
            signature: None,
            dim: 0,
            last: None,
        }
    }

    pub fn kind(&self) -> Factorization {
        self.kind
    }

    /// Signature of the matrix the current factors belong to.
    pub fn signature(&self) -> Option<Signature> {
        self.signature
    }

    pub fn last_action(&self) -> Option<FactorAction> {
        self.last
    }

    /// Full symbolic + numeric factorization.
    pub fn build(&mut self, mat: &CscMatrix<f64>, signature: Signature) -> Result<()> {
        self.signature = None;
        self.backend.factor().build(mat)?;
        self.commit(mat, signature, FactorAction::Built);
        Ok(())
    }

    /// Numeric-only refactorization. The caller guarantees the pattern is unchanged.
    pub fn rebuild_numeric(&mut self, mat: &CscMatrix<f64>, signature: Signature) -> Result<()> {
        self.signature = None;
        self.backend.factor().refactor(mat)?;
        self.commit(mat, signature, FactorAction::Refactored);
        Ok(())
    }

    /// Factorizes a matrix whose values change between calls (Jacobians): the pattern
    /// signature alone selects between [`build`](Self::build) and
    /// [`rebuild_numeric`](Self::rebuild_numeric).
    pub fn factorize(&mut self, mat: &CscMatrix<f64>, signature: Signature) -> Result<FactorAction> {
        match self.signature {
            Some(sig) if sig.pattern == signature.pattern && self.dim == mat.ncols() => {
                self.rebuild_numeric(mat, signature)?;
                Ok(FactorAction::Refactored)
            }
            _ => {
                self.build(mat, signature)?;
                Ok(FactorAction::Built)
            }
        }
    }

    /// Factorizes a constant matrix: identical signatures reuse the factors untouched.
    pub fn prepare(&mut self, mat: &CscMatrix<f64>, signature: Signature) -> Result<FactorAction> {
        if self.signature == Some(signature) && self.dim == mat.ncols() {
            self.last = Some(FactorAction::Reused);
            return Ok(FactorAction::Reused);
        }
        self.factorize(mat, signature)
    }

    /// Solves against the current factors. The solution must be finite.
    pub fn solve(&mut self, b: &mut [f64]) -> Result<()> {
        if self.signature.is_none() {
            return Err(PowerFlowError::SingularSystem(
                "no valid factorization to solve with".to_string(),
            ));
        }
        if b.len() != self.dim {
            return Err(PowerFlowError::SingularSystem(format!(
                "right-hand side of length {} for a system of dimension {}",
                b.len(),
                self.dim
            )));
        }
        self.backend.factor().solve(b)?;
        if b.iter().any(|x| !x.is_finite()) {
            return Err(PowerFlowError::SingularSystem(
                "non-finite solution".to_string(),
            ));
        }
        Ok(())
    }

    fn commit(&mut self, mat: &CscMatrix<f64>, signature: Signature, action: FactorAction) {
        debug!(kind = %self.kind, dim = mat.ncols(), nnz = mat.nnz(), %action, "factorized");
        self.signature = Some(signature);
        self.dim = mat.ncols();
        self.last = Some(action);
    }
}
