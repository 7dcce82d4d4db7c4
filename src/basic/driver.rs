//! Convergence loop shared by every algorithm, and [`run_pf`], the one-call entry point.

use derive_more::From;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    angle::align_angles,
    config::{Algorithm, PowerFlowConfig},
    dcpf::DcPowerFlow,
    error::{PowerFlowError, Result},
    fdpf::{DecoupledVariant, FastDecoupled},
    gausspf::GaussSeidel,
    network::PowerSystem,
    newtonpf::NewtonRaphson,
    qlim::{ReactiveLimit, check_q_limits, enforce_q_limits},
    state::Voltage,
};

/// Solver instance of the configured algorithm.
#[derive(Debug, From)]
pub enum PowerFlow {
    NewtonRaphson(NewtonRaphson),
    FastDecoupled(FastDecoupled),
    GaussSeidel(GaussSeidel),
    DC(DcPowerFlow),
}

impl PowerFlow {
    /// Validates `config`, classifies `system` and builds the solver from configured voltages.
    pub fn new(system: &mut PowerSystem, config: &PowerFlowConfig) -> Result<Self> {
        config.validate()?;
        Ok(match config.algorithm {
            Algorithm::NewtonRaphson => NewtonRaphson::new(system, config)?.into(),
            Algorithm::FastDecoupledBX => {
                FastDecoupled::new(system, config, DecoupledVariant::BX)?.into()
            }
            Algorithm::FastDecoupledXB => {
                FastDecoupled::new(system, config, DecoupledVariant::XB)?.into()
            }
            Algorithm::GaussSeidel => GaussSeidel::new(system)?.into(),
            Algorithm::DC => DcPowerFlow::new(system, config)?.into(),
        })
    }

    /// Like [`new`](Self::new), warm-started from `voltage`. The DC solver has no use for it.
    pub fn with_voltage(
        system: &mut PowerSystem,
        config: &PowerFlowConfig,
        voltage: Voltage,
    ) -> Result<Self> {
        config.validate()?;
        Ok(match config.algorithm {
            Algorithm::NewtonRaphson => NewtonRaphson::with_voltage(system, config, voltage)?.into(),
            Algorithm::FastDecoupledBX => {
                FastDecoupled::with_voltage(system, config, DecoupledVariant::BX, voltage)?.into()
            }
            Algorithm::FastDecoupledXB => {
                FastDecoupled::with_voltage(system, config, DecoupledVariant::XB, voltage)?.into()
            }
            Algorithm::GaussSeidel => GaussSeidel::with_voltage(system, voltage)?.into(),
            Algorithm::DC => DcPowerFlow::new(system, config)?.into(),
        })
    }

    /// Largest absolute active and reactive mismatch at the current iterate.
    ///
    /// The DC solver reports infinity until it has solved the network as it is now, zero after.
    pub fn mismatch(&mut self, system: &PowerSystem) -> Result<(f64, f64)> {
        let m = match self {
            PowerFlow::NewtonRaphson(s) => s.mismatch(system)?,
            PowerFlow::FastDecoupled(s) => s.mismatch(system)?,
            PowerFlow::GaussSeidel(s) => s.mismatch(system)?,
            PowerFlow::DC(s) => {
                let e = if s.is_solved(system) { 0.0 } else { f64::INFINITY };
                return Ok((e, e));
            }
        };
        Ok((m.max_active, m.max_reactive))
    }

    pub fn step(&mut self, system: &PowerSystem) -> Result<()> {
        match self {
            PowerFlow::NewtonRaphson(s) => s.step(system),
            PowerFlow::FastDecoupled(s) => s.step(system),
            PowerFlow::GaussSeidel(s) => s.step(system),
            PowerFlow::DC(s) => s.solve(system).map(|_| ()),
        }
    }

    pub fn voltage(&self) -> Voltage {
        match self {
            PowerFlow::NewtonRaphson(s) => s.voltage().clone(),
            PowerFlow::FastDecoupled(s) => s.voltage().clone(),
            PowerFlow::GaussSeidel(s) => s.voltage(),
            PowerFlow::DC(s) => s.voltage(),
        }
    }

    pub fn iterations(&self) -> usize {
        match self {
            PowerFlow::NewtonRaphson(s) => s.iterations(),
            PowerFlow::FastDecoupled(s) => s.iterations(),
            PowerFlow::GaussSeidel(s) => s.iterations(),
            PowerFlow::DC(s) => s.iterations(),
        }
    }

    /// Algorithm this instance runs.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            PowerFlow::NewtonRaphson(_) => Algorithm::NewtonRaphson,
            PowerFlow::FastDecoupled(s) => match s.variant() {
                DecoupledVariant::BX => Algorithm::FastDecoupledBX,
                DecoupledVariant::XB => Algorithm::FastDecoupledXB,
            },
            PowerFlow::GaussSeidel(_) => Algorithm::GaussSeidel,
            PowerFlow::DC(_) => Algorithm::DC,
        }
    }

    pub fn name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Solved state handed to post-processing and warm starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerFlowResult {
    pub voltage: Voltage,
    /// Solver iterations, summed over reactive limit rounds.
    pub iterations: usize,
    pub converged: bool,
    /// Slack bus of the final solve.
    pub slack: usize,
    /// Re-solves triggered by reactive limit violations.
    pub outer_iterations: usize,
    /// Per-generator limit signals of the last enforcement pass; empty when limits are off.
    pub limits: Vec<ReactiveLimit>,
}

/// Iterates `flow` until both mismatch maxima drop below the tolerance or the iteration
/// cap is reached.
///
/// Reaching the cap is not an error: the last iterate is returned with `converged == false`.
pub fn drive(
    flow: &mut PowerFlow,
    system: &PowerSystem,
    config: &PowerFlowConfig,
) -> Result<PowerFlowResult> {
    let tol = config.tolerance();
    let max_it = config.max_iterations();
    let start = flow.iterations();
    let converged = loop {
        let (dp, dq) = flow.mismatch(system)?;
        let done = flow.iterations() - start;
        debug!(iteration = done, dp, dq, "mismatch");
        if dp < tol && dq < tol {
            break true;
        }
        if done >= max_it {
            break false;
        }
        flow.step(system)?;
    };

    let iterations = flow.iterations() - start;
    if converged {
        info!(solver = flow.name(), iterations, "power flow converged");
    } else {
        warn!(
            solver = flow.name(),
            iterations, "power flow did not converge within the iteration cap"
        );
    }
    Ok(PowerFlowResult {
        voltage: flow.voltage(),
        iterations,
        converged,
        slack: system.slack().ok_or(PowerFlowError::MissingSlack)?,
        outer_iterations: 0,
        limits: Vec::new(),
    })
}

/// Runs a complete power flow on `system` as configured.
///
/// # Behavior:
/// - Classifies the buses, builds the solver and drives it to convergence.
/// - With `enforce_q_limits`, converged AC solutions are checked against generator
///   reactive limits; violating buses become PQ buses and the flow is solved again from
///   the previous voltages, for at most `max_outer` rounds.
/// - If a limit violation moved the slack bus, angles are shifted back so the original
///   slack bus sits at its configured angle.
///
/// The classification of `system` is left as the last solve used it.
pub fn run_pf(system: &mut PowerSystem, config: &PowerFlowConfig) -> Result<PowerFlowResult> {
    let mut flow = PowerFlow::new(system, config)?;
    let reference = system.slack().ok_or(PowerFlowError::MissingSlack)?;
    info!(
        solver = flow.name(),
        buses = system.bus_count(),
        branches = system.branches().len(),
        "power flow started"
    );
    let mut result = drive(&mut flow, system, config)?;
    if !config.enforce_q_limits || config.algorithm == Algorithm::DC {
        return Ok(result);
    }

    let mut total = result.iterations;
    let mut round = 0;
    while result.converged {
        if round == config.max_outer {
            // no re-solve left, so report without reclassifying
            let report = check_q_limits(system, &result.voltage);
            if !report.is_compliant() {
                warn!(
                    round,
                    buses = ?report.reclassified,
                    "reactive limits still violated after the last round"
                );
            }
            result.limits = report.signals;
            break;
        }
        let report = enforce_q_limits(system, &result.voltage)?;
        result.limits = report.signals.clone();
        if report.is_compliant() {
            break;
        }
        round += 1;
        info!(round, buses = ?report.reclassified, "re-solving with reactive limits");
        flow = PowerFlow::with_voltage(system, config, result.voltage.clone())?;
        let limits = std::mem::take(&mut result.limits);
        result = drive(&mut flow, system, config)?;
        result.limits = limits;
        total += result.iterations;
    }
    result.iterations = total;
    result.outer_iterations = round;

    if result.slack != reference {
        align_angles(system, &mut result.voltage, reference)?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::network::BusType;
    use crate::testcases::{case3, case_ieee14};

    #[test]
    fn test_dc_takes_one_iteration() {
        let mut sys = case3();
        let res = run_pf(&mut sys, &PowerFlowConfig::new(Algorithm::DC)).unwrap();
        assert!(res.converged);
        assert_eq!(res.iterations, 1);
        assert_eq!(res.voltage.angle[0], 0.0);
    }

    #[test]
    fn test_iteration_cap_returns_last_iterate() {
        let mut sys = case_ieee14();
        let cfg = PowerFlowConfig::new(Algorithm::GaussSeidel).with_max_it(3);
        let res = run_pf(&mut sys, &cfg).unwrap();
        assert!(!res.converged);
        assert_eq!(res.iterations, 3);
        assert!(res.voltage.magnitude.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_already_converged_start() {
        let mut sys = case3();
        let cfg = PowerFlowConfig::default().with_tol(1e-10);
        let first = run_pf(&mut sys, &cfg).unwrap();
        let mut flow = PowerFlow::with_voltage(&mut sys, &cfg, first.voltage.clone()).unwrap();
        let again = drive(&mut flow, &sys, &cfg).unwrap();
        assert!(again.converged);
        assert!(again.iterations <= 1);
    }

    #[test]
    fn test_unsupported_factorization() {
        let mut sys = case3();
        let cfg = PowerFlowConfig::new(Algorithm::FastDecoupledBX)
            .with_factorization(crate::basic::solver::Factorization::LDLt);
        assert!(matches!(
            run_pf(&mut sys, &cfg),
            Err(PowerFlowError::UnsupportedFactorization { .. })
        ));
    }

    #[test]
    fn test_instance_reports_its_algorithm() {
        for algorithm in [
            Algorithm::NewtonRaphson,
            Algorithm::FastDecoupledBX,
            Algorithm::FastDecoupledXB,
            Algorithm::GaussSeidel,
            Algorithm::DC,
        ] {
            let mut sys = case3();
            let flow = PowerFlow::new(&mut sys, &PowerFlowConfig::new(algorithm)).unwrap();
            assert_eq!(flow.algorithm(), algorithm);
            assert_eq!(flow.name(), algorithm.name());
        }
    }

    #[test]
    fn test_outer_cap_keeps_classification() {
        let mut sys = case_ieee14();
        let kinds: Vec<BusType> = sys.buses().iter().map(|b| b.kind).collect();
        let classification = sys.classification();
        let cfg = PowerFlowConfig::default()
            .with_tol(1e-8)
            .with_q_limits(true)
            .with_max_outer(0);
        let res = run_pf(&mut sys, &cfg).unwrap();
        assert!(res.converged);
        assert_eq!(res.outer_iterations, 0);
        assert_eq!(sys.slack(), Some(res.slack));
        assert_eq!(sys.classification(), classification);
        assert_eq!(sys.buses().iter().map(|b| b.kind).collect::<Vec<_>>(), kinds);
        // the violations are still reported
        assert!(res.limits.iter().any(|l| *l != ReactiveLimit::Ok));
    }

    #[test]
    fn test_q_limits_outer_loop() {
        let mut sys = case_ieee14();
        let cfg = PowerFlowConfig::default().with_tol(1e-8).with_q_limits(true);
        let res = run_pf(&mut sys, &cfg).unwrap();
        assert!(res.converged);
        assert!(res.outer_iterations >= 1);
        // slack generator of case 14 has q_min = 0 and absorbs negative Q unconstrained
        assert_ne!(sys.buses()[0].kind, BusType::Slack);
        assert_eq!(res.voltage.angle[0], 0.0);
        assert_eq!(res.limits.len(), sys.generators().len());
        assert!(res.limits.iter().all(|l| *l == ReactiveLimit::Ok));
    }
}
