use thiserror::Error;

use super::solver::Factorization;

/// Errors raised by the power flow engine.
///
/// Non-convergence is not an error: it is reported through
/// [`PowerFlowResult::converged`](super::driver::PowerFlowResult) together with the last iterate.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PowerFlowError {
    /// No bus is eligible to become the slack bus.
    #[error("no slack bus: no PV bus with an in-service generator can be promoted")]
    MissingSlack,
    /// The factorization of a Jacobian or nodal matrix failed.
    #[error("singular system: {0}")]
    SingularSystem(String),
    /// A solver was stepped after a structural or classification change it did not re-derive.
    #[error(
        "solver built for pattern {built_pattern} / classification {built_classification} \
         cannot be reused on pattern {live_pattern} / classification {live_classification}"
    )]
    IncompatibleReuse {
        built_pattern: u64,
        built_classification: u64,
        live_pattern: u64,
        live_classification: u64,
    },
    /// The requested factorization kind is not available for this algorithm.
    #[error("{factorization} factorization is not supported by the {algorithm} solver")]
    UnsupportedFactorization {
        algorithm: &'static str,
        factorization: Factorization,
    },
    /// A bus index outside the network was referenced.
    #[error("bus {0} does not exist")]
    InvalidBus(usize),
    /// A configuration value could not be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PowerFlowError>;
