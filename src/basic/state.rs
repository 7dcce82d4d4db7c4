use nalgebra::DVector;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::{
    error::{PowerFlowError, Result},
    network::{BusType, PowerSystem},
};

/// Bus voltages in polar form, indexed by bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voltage {
    pub magnitude: DVector<f64>,
    pub angle: DVector<f64>,
}

impl Voltage {
    /// 1.0 p.u. at 0 rad everywhere.
    pub fn flat(n: usize) -> Self {
        Self {
            magnitude: DVector::from_element(n, 1.0),
            angle: DVector::zeros(n),
        }
    }

    /// Initial point of iterative solvers: configured bus voltages, with the generator
    /// setpoint as magnitude on PV and slack buses.
    pub fn seed(system: &PowerSystem) -> Self {
        let mut v = Self {
            magnitude: DVector::from_iterator(
                system.bus_count(),
                system.buses().iter().map(|b| b.voltage.magnitude),
            ),
            angle: DVector::from_iterator(
                system.bus_count(),
                system.buses().iter().map(|b| b.voltage.angle),
            ),
        };
        v.pin_setpoints(system);
        v
    }

    /// Forces magnitudes of PV and slack buses to their generator setpoints.
    pub fn pin_setpoints(&mut self, system: &PowerSystem) {
        for (i, bus) in system.buses().iter().enumerate() {
            if bus.kind == BusType::PQ {
                continue;
            }
            if let Some(vm) = system.setpoint(i) {
                self.magnitude[i] = vm;
            }
        }
    }

    pub fn from_complex(v: &DVector<Complex64>) -> Self {
        Self {
            magnitude: v.map(|e| e.norm()),
            angle: v.map(|e| e.arg()),
        }
    }

    pub fn to_complex(&self) -> DVector<Complex64> {
        self.magnitude
            .zip_map(&self.angle, |vm, va| Complex64::from_polar(vm, va))
    }

    pub fn len(&self) -> usize {
        self.magnitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitude.is_empty()
    }
}

/// Unknown-vector layout of one bus classification.
///
/// Angles of all non-slack buses come first, then magnitudes of PQ buses, both in
/// ascending bus order. The layout remembers the pattern and classification it was
/// derived from; any later change makes it unusable.
#[derive(Debug, Clone)]
pub struct BusLayout {
    pub slack: usize,
    /// Non-slack buses.
    pub pvpq: Vec<usize>,
    pub pv: Vec<usize>,
    pub pq: Vec<usize>,
    /// Bus → position among the angle unknowns.
    pub angle_index: Vec<Option<usize>>,
    /// Bus → position among the magnitude unknowns.
    pub magnitude_index: Vec<Option<usize>>,
    pattern: u64,
    classification: u64,
}

impl BusLayout {
    pub fn new(system: &PowerSystem) -> Result<Self> {
        let slack = system.slack().ok_or(PowerFlowError::MissingSlack)?;
        let n = system.bus_count();
        let pvpq: Vec<usize> = (0..n).filter(|&i| i != slack).collect();
        let pv = system.buses_of(BusType::PV);
        let pq = system.buses_of(BusType::PQ);
        let mut angle_index = vec![None; n];
        let mut magnitude_index = vec![None; n];
        for (k, &i) in pvpq.iter().enumerate() {
            angle_index[i] = Some(k);
        }
        for (k, &i) in pq.iter().enumerate() {
            magnitude_index[i] = Some(k);
        }
        Ok(Self {
            slack,
            pvpq,
            pv,
            pq,
            angle_index,
            magnitude_index,
            pattern: system.signature().pattern,
            classification: system.classification(),
        })
    }

    pub fn bus_count(&self) -> usize {
        self.angle_index.len()
    }

    /// Number of unknowns of the full Newton-Raphson system.
    pub fn unknowns(&self) -> usize {
        self.pvpq.len() + self.pq.len()
    }

    /// Fails with [`PowerFlowError::IncompatibleReuse`] once the network structure or the
    /// classification moved past the one this layout was built for.
    pub fn ensure_current(&self, system: &PowerSystem) -> Result<()> {
        let live_pattern = system.signature().pattern;
        let live_classification = system.classification();
        if live_pattern != self.pattern || live_classification != self.classification {
            return Err(PowerFlowError::IncompatibleReuse {
                built_pattern: self.pattern,
                built_classification: self.classification,
                live_pattern,
                live_classification,
            });
        }
        Ok(())
    }
}
