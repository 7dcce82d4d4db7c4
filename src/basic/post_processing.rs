//! Powers and currents derived from a solved voltage state.

use nalgebra::DVector;
use num_complex::Complex64;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use super::{
    mismatch,
    network::{BusType, PowerSystem},
    state::Voltage,
};

/// Power at both ends of a branch, in p.u.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BranchFlow {
    pub from: Complex64,
    pub to: Complex64,
    /// Current magnitude at the from end.
    pub current_from: f64,
    /// Current magnitude at the to end.
    pub current_to: f64,
}

impl BranchFlow {
    /// Series and shunt losses.
    pub fn loss(&self) -> Complex64 {
        self.from + self.to
    }
}

/// Complex power injected at every bus by the network side.
pub fn bus_injection(system: &PowerSystem, voltage: &Voltage) -> DVector<Complex64> {
    mismatch::bus_injection(&system.ac_model().ybus, &voltage.to_complex())
}

/// Branch flows in branch order; out-of-service branches carry nothing.
pub fn branch_flows(system: &PowerSystem, voltage: &Voltage) -> Vec<BranchFlow> {
    let v = voltage.to_complex();
    system
        .branches()
        .iter()
        .map(|br| {
            if !br.in_service {
                return BranchFlow::default();
            }
            let y = br.admittance();
            let (vf, vt) = (v[br.from], v[br.to]);
            let i_from = y.ff * vf + y.ft * vt;
            let i_to = y.tf * vf + y.tt * vt;
            BranchFlow {
                from: vf * i_from.conj(),
                to: vt * i_to.conj(),
                current_from: i_from.norm(),
                current_to: i_to.norm(),
            }
        })
        .collect()
}

/// Generator outputs consistent with `voltage`, in generator order.
///
/// # Behavior:
/// - At PQ buses the configured outputs are returned untouched.
/// - At PV and slack buses the reactive output of the bus is `Q_inj + Q_demand`,
///   shared among the bus's generators in proportion to their `q_max - q_min` range,
///   or equally when any range is unbounded or all ranges are zero.
/// - At the slack bus the first generator also absorbs the active balance.
/// - Out-of-service generators produce zero.
pub fn generator_power(system: &PowerSystem, voltage: &Voltage) -> Vec<Complex64> {
    let injection = bus_injection(system, voltage);
    let mut out: Vec<Complex64> = system
        .generators()
        .iter()
        .map(|g| if g.in_service { g.output } else { Complex64::zero() })
        .collect();

    for (i, bus) in system.buses().iter().enumerate() {
        if bus.kind == BusType::PQ {
            continue;
        }
        let units: Vec<usize> = system.generators_at(i).map(|(k, _)| k).collect();
        let Some(&first) = units.first() else {
            continue;
        };
        let total = injection[i] + bus.demand;

        if bus.kind == BusType::Slack {
            let others: f64 = units.iter().skip(1).map(|&k| out[k].re).sum();
            out[first].re = total.re - others;
        }

        let gens = system.generators();
        let ranges: Vec<f64> = units
            .iter()
            .map(|&k| gens[k].q_max - gens[k].q_min)
            .collect();
        let span: f64 = ranges.iter().sum();
        if span.is_finite() && span > 0.0 {
            let floor: f64 = units.iter().map(|&k| gens[k].q_min).sum();
            for (&k, r) in units.iter().zip(&ranges) {
                out[k].im = gens[k].q_min + (total.im - floor) * r / span;
            }
        } else {
            let share = total.im / units.len() as f64;
            for &k in &units {
                out[k].im = share;
            }
        }
    }
    out
}
