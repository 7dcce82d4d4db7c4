//! Gauss-Seidel power flow on rectangular voltages.
//!
//! Every sweep updates PQ buses first, then PV buses, each in ascending order and in place,
//! so later buses in a sweep already see the new values of earlier ones. No matrix is
//! factorized.

use nalgebra::DVector;
use num_complex::Complex64;
use tracing::debug;

use super::{
    error::{PowerFlowError, Result},
    mismatch::Mismatch,
    network::{PowerSystem, Signature},
    sparse::row_split,
    state::{BusLayout, Voltage},
};

#[derive(Debug)]
pub struct GaussSeidel {
    layout: BusLayout,
    voltage: DVector<Complex64>,
    /// Magnitude each PV bus is pinned to after its update, in `layout.pv` order.
    pv_magnitude: Vec<f64>,
    /// Model revision `pv_magnitude` and the slack voltage were pinned for.
    pinned: u64,
    mismatch: Option<(Signature, Mismatch)>,
    iterations: usize,
}

impl GaussSeidel {
    pub fn new(system: &mut PowerSystem) -> Result<Self> {
        super::classify::classify(system)?;
        let voltage = Voltage::seed(system);
        Self::build(system, voltage)
    }

    pub fn with_voltage(system: &mut PowerSystem, voltage: Voltage) -> Result<Self> {
        super::classify::classify(system)?;
        Self::build(system, voltage)
    }

    fn build(system: &PowerSystem, mut voltage: Voltage) -> Result<Self> {
        if voltage.len() != system.bus_count() {
            return Err(PowerFlowError::InvalidConfig(format!(
                "initial voltage has {} entries for {} buses",
                voltage.len(),
                system.bus_count()
            )));
        }
        voltage.pin_setpoints(system);
        let layout = BusLayout::new(system)?;
        let pv_magnitude = layout.pv.iter().map(|&i| voltage.magnitude[i]).collect();
        debug!(pq = layout.pq.len(), pv = layout.pv.len(), "gauss-seidel sweep order");
        Ok(Self {
            layout,
            voltage: voltage.to_complex(),
            pv_magnitude,
            pinned: system.signature().model,
            mismatch: None,
            iterations: 0,
        })
    }

    pub fn voltage(&self) -> Voltage {
        Voltage::from_complex(&self.voltage)
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn mismatch(&mut self, system: &PowerSystem) -> Result<&Mismatch> {
        self.layout.ensure_current(system)?;
        self.sync_setpoints(system);
        let live = system.signature();
        let cached = match self.mismatch.take() {
            Some((sig, m)) if sig == live => (sig, m),
            _ => (
                live,
                Mismatch::rectangular(
                    &system.ac_model().ybus,
                    &system.specified_injection(),
                    &self.voltage,
                    &self.layout,
                ),
            ),
        };
        Ok(&self.mismatch.insert(cached).1)
    }

    /// One sweep over PQ buses then PV buses.
    pub fn step(&mut self, system: &PowerSystem) -> Result<()> {
        self.layout.ensure_current(system)?;
        self.sync_setpoints(system);
        self.mismatch = None;
        let ybus = &system.ac_model().ybus;
        let specified = system.specified_injection();
        let v = &mut self.voltage;

        for &i in &self.layout.pq {
            let (diag, others) = row_split(ybus, i, v);
            v[i] = (specified[i].conj() / v[i].conj() - others) / diag;
        }

        for (&i, &vm) in self.layout.pv.iter().zip(&self.pv_magnitude) {
            let (diag, others) = row_split(ybus, i, v);
            let q = -(v[i].conj() * (others + diag * v[i])).im;
            let s = Complex64::new(specified[i].re, q);
            let updated = (s.conj() / v[i].conj() - others) / diag;
            v[i] = updated * (vm / updated.norm());
        }

        if v.iter().any(|e| !e.is_finite()) {
            return Err(PowerFlowError::SingularSystem(
                "gauss-seidel sweep produced a non-finite voltage".to_string(),
            ));
        }
        self.iterations += 1;
        Ok(())
    }

    /// Re-pins PV and slack magnitudes after a model edit.
    fn sync_setpoints(&mut self, system: &PowerSystem) {
        let model = system.signature().model;
        if model == self.pinned {
            return;
        }
        let mut voltage = Voltage::from_complex(&self.voltage);
        voltage.pin_setpoints(system);
        self.pv_magnitude = self.layout.pv.iter().map(|&i| voltage.magnitude[i]).collect();
        self.voltage = voltage.to_complex();
        self.pinned = model;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::{config::PowerFlowConfig, newtonpf::NewtonRaphson};
    use crate::testcases::case3;

    #[test]
    fn test_matches_newton_raphson() {
        let mut sys = case3();
        let mut gs = GaussSeidel::new(&mut sys).unwrap();
        while !gs.mismatch(&sys).unwrap().within(1e-10) {
            assert!(gs.iterations() < 1000);
            gs.step(&sys).unwrap();
        }
        let cfg = PowerFlowConfig::default();
        let mut nr = NewtonRaphson::new(&mut sys, &cfg).unwrap();
        while !nr.mismatch(&sys).unwrap().within(1e-10) {
            nr.step(&sys).unwrap();
        }
        let a = gs.voltage();
        let b = nr.voltage();
        assert!((&a.magnitude - &b.magnitude).amax() < 1e-6);
        assert!((&a.angle - &b.angle).amax() < 1e-6);
    }

    #[test]
    fn test_pv_magnitude_is_pinned() {
        let mut sys = case3();
        let mut gs = GaussSeidel::new(&mut sys).unwrap();
        gs.step(&sys).unwrap();
        gs.step(&sys).unwrap();
        let v = gs.voltage();
        assert!((v.magnitude[2] - sys.setpoint(2).unwrap()).abs() < 1e-14);
        // slack untouched
        assert_eq!(v.angle[0], 0.0);
        assert_eq!(gs.iterations(), 2);
    }

    #[test]
    fn test_setpoint_edit_is_picked_up() {
        let mut sys = case3();
        let mut gs = GaussSeidel::new(&mut sys).unwrap();
        gs.step(&sys).unwrap();
        sys.modify_generator(0, |g| g.magnitude = 1.05).unwrap();
        sys.modify_generator(1, |g| g.magnitude = 1.03).unwrap();
        while !gs.mismatch(&sys).unwrap().within(1e-10) {
            assert!(gs.iterations() < 2000);
            gs.step(&sys).unwrap();
        }
        let v = gs.voltage();
        assert!((v.magnitude[0] - 1.05).abs() < 1e-12);
        assert!((v.magnitude[2] - 1.03).abs() < 1e-12);
    }
}
