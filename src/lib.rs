mod basic;
pub mod testcases;
pub mod prelude {
    use crate::basic;
    pub use basic::*;

    pub use basic::angle::align_angles;
    pub use basic::classify::classify;
    pub use basic::config::{Algorithm, PowerFlowConfig};
    pub use basic::error::PowerFlowError;
    pub use basic::fdpf::DecoupledVariant;
    pub use basic::network::{Branch, Bus, BusType, Generator, PowerSystem, Signature};
    pub use basic::qlim::{LimitReport, ReactiveLimit, enforce_q_limits};
    pub use basic::solver::{FactorAction, Factorization, FactorizationCache};
    pub use basic::state::Voltage;
}
