use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{error::PowerFlowError, solver::Factorization};

/// Power flow algorithm selected by [`PowerFlowConfig`].
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    NewtonRaphson,
    FastDecoupledBX,
    FastDecoupledXB,
    GaussSeidel,
    DC,
}

impl Algorithm {
    /// Factorization kinds the algorithm accepts.
    pub fn supports(&self, factorization: Factorization) -> bool {
        match self {
            Algorithm::DC => true,
            Algorithm::GaussSeidel => true,
            _ => factorization != Factorization::LDLt,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::NewtonRaphson => "Newton-Raphson",
            Algorithm::FastDecoupledBX => "fast decoupled BX",
            Algorithm::FastDecoupledXB => "fast decoupled XB",
            Algorithm::GaussSeidel => "Gauss-Seidel",
            Algorithm::DC => "DC",
        }
    }
}

/// Resource that holds the power flow configuration options: algorithm, factorization kind,
/// maximum iterations and tolerance for convergence.
///
/// The configuration is immutable once handed to a solver constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerFlowConfig {
    pub algorithm: Algorithm,
    pub factorization: Factorization,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_it: Option<usize>, // Maximum number of iterations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tol: Option<f64>, // Tolerance for convergence
    /// Run the reactive limit enforcer after convergence and re-solve on violations.
    pub enforce_q_limits: bool,
    /// Cap on reclassify-and-resolve rounds when `enforce_q_limits` is set.
    pub max_outer: usize,
}

impl Default for PowerFlowConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            factorization: Factorization::default(),
            max_it: None,
            tol: None,
            enforce_q_limits: false,
            max_outer: 10,
        }
    }
}

impl PowerFlowConfig {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    pub fn with_factorization(mut self, factorization: Factorization) -> Self {
        self.factorization = factorization;
        self
    }

    pub fn with_max_it(mut self, max_it: usize) -> Self {
        self.max_it = Some(max_it);
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = Some(tol);
        self
    }

    pub fn with_q_limits(mut self, enforce: bool) -> Self {
        self.enforce_q_limits = enforce;
        self
    }

    pub fn with_max_outer(mut self, max_outer: usize) -> Self {
        self.max_outer = max_outer;
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_it.unwrap_or(100)
    }

    pub fn tolerance(&self) -> f64 {
        self.tol.unwrap_or(1e-6)
    }

    /// Checks that the options can be used together.
    pub fn validate(&self) -> Result<(), PowerFlowError> {
        if let Some(tol) = self.tol {
            if !(tol.is_finite() && tol > 0.0) {
                return Err(PowerFlowError::InvalidConfig(format!(
                    "tolerance must be positive, got {tol}"
                )));
            }
        }
        if self.max_it == Some(0) {
            return Err(PowerFlowError::InvalidConfig(
                "max_it must be at least 1".to_string(),
            ));
        }
        if !self.algorithm.supports(self.factorization) {
            return Err(PowerFlowError::UnsupportedFactorization {
                algorithm: self.algorithm.name(),
                factorization: self.factorization,
            });
        }
        Ok(())
    }
}

impl FromStr for PowerFlowConfig {
    type Err = PowerFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: PowerFlowConfig =
            serde_json::from_str(s).map_err(|e| PowerFlowError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
