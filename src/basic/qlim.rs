use derive_more::Display;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    classify::promote_slack,
    error::Result,
    network::{BusType, PowerSystem},
    post_processing::generator_power,
    state::Voltage,
};

/// Reactive limit status of one generator.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactiveLimit {
    /// Within limits, out of service, or connected to a PQ bus.
    #[default]
    Ok,
    BelowMin,
    AboveMax,
}

/// Outcome of one [`enforce_q_limits`] pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitReport {
    /// One signal per generator, in generator order.
    pub signals: Vec<ReactiveLimit>,
    /// Buses turned into PQ buses, ascending.
    pub reclassified: Vec<usize>,
    /// Bus promoted to slack when the former slack hit a limit.
    pub new_slack: Option<usize>,
}

impl LimitReport {
    pub fn is_compliant(&self) -> bool {
        self.reclassified.is_empty()
    }
}

/// Reports which generators violate their reactive limits at `voltage` without touching
/// `system`. `reclassified` lists the buses [`enforce_q_limits`] would convert.
pub fn check_q_limits(system: &PowerSystem, voltage: &Voltage) -> LimitReport {
    assess(system, &generator_power(system, voltage))
}

fn assess(system: &PowerSystem, outputs: &[Complex64]) -> LimitReport {
    let mut report = LimitReport {
        signals: vec![ReactiveLimit::Ok; system.generators().len()],
        ..Default::default()
    };
    for (k, g) in system.generators().iter().enumerate() {
        if !g.in_service || system.buses()[g.bus].kind == BusType::PQ {
            continue;
        }
        let q = outputs[k].im;
        if q < g.q_min {
            report.signals[k] = ReactiveLimit::BelowMin;
        } else if q > g.q_max {
            report.signals[k] = ReactiveLimit::AboveMax;
        } else {
            continue;
        }
        report.reclassified.push(g.bus);
    }
    report.reclassified.sort_unstable();
    report.reclassified.dedup();
    report
}

/// Checks generator reactive outputs at `voltage` against their limits and converts the
/// violating PV or slack buses to PQ buses.
///
/// # Behavior:
/// - Generator outputs are computed with [`generator_power`] from the solved state.
/// - Every violating generator is clamped to the bound it crossed; the other generators at
///   the same bus keep their share of the solved reactive power, so the bus injection stays
///   fully specified once it is a PQ bus.
/// - If the slack bus violates, its generators also take the active output they had in the
///   solution and the first PV bus with an in-service generator becomes the new slack.
/// - Nothing is modified when all generators comply.
///
/// # Notes:
/// - The caller must solve again; any solver built before this call rejects the new
///   classification.
pub fn enforce_q_limits(system: &mut PowerSystem, voltage: &Voltage) -> Result<LimitReport> {
    let outputs = generator_power(system, voltage);
    let mut report = assess(system, &outputs);
    if report.is_compliant() {
        return Ok(report);
    }

    let slack = system.slack();
    for &bus in &report.reclassified {
        let units: Vec<usize> = system.generators_at(bus).map(|(k, _)| k).collect();
        for k in units {
            let g = &system.generators()[k];
            let q = match report.signals[k] {
                ReactiveLimit::BelowMin => g.q_min,
                ReactiveLimit::AboveMax => g.q_max,
                ReactiveLimit::Ok => outputs[k].im,
            };
            let output = Complex64::new(outputs[k].re, q);
            system.modify_generator(k, |g| g.output = output)?;
            warn!(generator = k, bus, q, signal = %report.signals[k], "reactive limit reached");
        }
        system.reclassify(bus, BusType::PQ);
    }

    if let Some(slack) = slack.filter(|s| report.reclassified.contains(s)) {
        let promoted = promote_slack(system)?;
        info!(from = slack, to = promoted, "slack bus moved after reactive limit violation");
        report.new_slack = Some(promoted);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::{config::PowerFlowConfig, error::PowerFlowError, newtonpf::NewtonRaphson};
    use crate::testcases::case3;

    fn solve(sys: &mut PowerSystem) -> Voltage {
        let cfg = PowerFlowConfig::default();
        let mut nr = NewtonRaphson::new(sys, &cfg).unwrap();
        while !nr.mismatch(sys).unwrap().within(1e-10) {
            nr.step(sys).unwrap();
        }
        nr.voltage().clone()
    }

    #[test]
    fn test_compliant_network_is_untouched() {
        let mut sys = case3();
        let v = solve(&mut sys);
        let sig = sys.signature();
        let classification = sys.classification();
        let report = enforce_q_limits(&mut sys, &v).unwrap();
        assert!(report.is_compliant());
        assert!(report.signals.iter().all(|s| *s == ReactiveLimit::Ok));
        assert_eq!(sys.signature(), sig);
        assert_eq!(sys.classification(), classification);
    }

    #[test]
    fn test_check_leaves_the_network_alone() {
        let mut sys = case3();
        let v = solve(&mut sys);
        let q = generator_power(&sys, &v)[1].im;
        sys.modify_generator(1, |g| g.q_max = q - 0.05).unwrap();
        let sig = sys.signature();
        let classification = sys.classification();

        let report = check_q_limits(&sys, &v);
        assert_eq!(report.signals[1], ReactiveLimit::AboveMax);
        assert_eq!(report.reclassified, vec![2]);
        assert_eq!(sys.signature(), sig);
        assert_eq!(sys.classification(), classification);
        assert_eq!(sys.buses()[2].kind, BusType::PV);
    }

    #[test]
    fn test_pv_bus_is_clamped() {
        let mut sys = case3();
        let v = solve(&mut sys);
        let q = generator_power(&sys, &v)[1].im;
        sys.modify_generator(1, |g| g.q_max = q - 0.05).unwrap();

        let report = enforce_q_limits(&mut sys, &v).unwrap();
        assert_eq!(report.signals[1], ReactiveLimit::AboveMax);
        assert_eq!(report.reclassified, vec![2]);
        assert_eq!(report.new_slack, None);
        assert_eq!(sys.buses()[2].kind, BusType::PQ);
        assert!((sys.generators()[1].output.im - (q - 0.05)).abs() < 1e-12);

        // the bus is PQ now; a rerun reports nothing
        let v = solve(&mut sys);
        assert!(enforce_q_limits(&mut sys, &v).unwrap().is_compliant());
    }

    #[test]
    fn test_slack_violation_promotes() {
        let mut sys = case3();
        let v = solve(&mut sys);
        let out = generator_power(&sys, &v);
        sys.modify_generator(0, |g| g.q_min = out[0].im + 0.01).unwrap();

        let report = enforce_q_limits(&mut sys, &v).unwrap();
        assert_eq!(report.signals[0], ReactiveLimit::BelowMin);
        assert_eq!(report.new_slack, Some(2));
        assert_eq!(sys.slack(), Some(2));
        assert_eq!(sys.buses()[0].kind, BusType::PQ);
        // the former slack keeps its solved active output
        assert!((sys.generators()[0].output.re - out[0].re).abs() < 1e-12);
    }

    #[test]
    fn test_no_candidate_for_slack() {
        let mut sys = case3();
        let v = solve(&mut sys);
        let out = generator_power(&sys, &v);
        sys.modify_generator(0, |g| g.q_min = out[0].im + 0.01).unwrap();
        sys.modify_generator(1, |g| g.q_max = out[1].im - 0.01).unwrap();
        assert_eq!(
            enforce_q_limits(&mut sys, &v),
            Err(PowerFlowError::MissingSlack)
        );
    }
}
