//! Fast-decoupled power flow, BX and XB variants.
//!
//! Two constant matrices replace the Jacobian: `B'` couples active mismatch with angles at
//! non-slack buses, `B''` couples reactive mismatch with magnitudes at PQ buses. Both are
//! factorized once and reused for every half-iteration until a numeric edit of the network
//! arrives, which triggers a numeric refactorization on the kept symbolic analysis.
//!
//! | variant | `B'` branch coefficient | `B''` series admittance |
//! |---------|-------------------------|-------------------------|
//! | BX      | `1/x`                   | `1/(r + jx)`            |
//! | XB      | `-Im(1/(r + jx))`       | `1/(jx)`                |

use derive_more::Display;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    config::PowerFlowConfig,
    error::{PowerFlowError, Result},
    mismatch::Mismatch,
    network::{Branch, BranchAdmittance, PowerSystem, Signature, nodal::assemble_ybus},
    solver::{FactorAction, FactorizationCache},
    sparse::restrict,
    state::{BusLayout, Voltage},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecoupledVariant {
    BX,
    XB,
}

impl DecoupledVariant {
    /// Per-branch coefficient of `B'`.
    fn active_coefficient(self, br: &Branch) -> f64 {
        match self {
            DecoupledVariant::BX => 1.0 / br.reactance,
            DecoupledVariant::XB => -br.series_admittance().im,
        }
    }

    /// Series admittance used for `B''`.
    fn reactive_series(self, br: &Branch) -> Complex64 {
        match self {
            DecoupledVariant::BX => br.series_admittance(),
            DecoupledVariant::XB => Complex64::new(0.0, -1.0 / br.reactance),
        }
    }
}

#[derive(Debug)]
pub struct FastDecoupled {
    variant: DecoupledVariant,
    layout: BusLayout,
    voltage: Voltage,
    b_active: CscMatrix<f64>,
    b_reactive: CscMatrix<f64>,
    active: FactorizationCache,
    reactive: FactorizationCache,
    /// Model revision the constant matrices were built from.
    model: u64,
    /// Model revision the PV and slack magnitudes were pinned for.
    pinned: u64,
    mismatch: Option<(Signature, Mismatch)>,
    iterations: usize,
}

impl FastDecoupled {
    pub fn new(
        system: &mut PowerSystem,
        config: &PowerFlowConfig,
        variant: DecoupledVariant,
    ) -> Result<Self> {
        super::classify::classify(system)?;
        let voltage = Voltage::seed(system);
        Self::build(system, config, variant, voltage)
    }

    pub fn with_voltage(
        system: &mut PowerSystem,
        config: &PowerFlowConfig,
        variant: DecoupledVariant,
        voltage: Voltage,
    ) -> Result<Self> {
        super::classify::classify(system)?;
        Self::build(system, config, variant, voltage)
    }

    fn build(
        system: &PowerSystem,
        config: &PowerFlowConfig,
        variant: DecoupledVariant,
        mut voltage: Voltage,
    ) -> Result<Self> {
        if voltage.len() != system.bus_count() {
            return Err(PowerFlowError::InvalidConfig(format!(
                "initial voltage has {} entries for {} buses",
                voltage.len(),
                system.bus_count()
            )));
        }
        voltage.pin_setpoints(system);
        let layout = BusLayout::new(system)?;
        let (b_active, b_reactive) = decoupled_matrices(system, &layout, variant);
        let mut fd = Self {
            variant,
            layout,
            voltage,
            b_active,
            b_reactive,
            active: FactorizationCache::new(config.factorization),
            reactive: FactorizationCache::new(config.factorization),
            model: system.signature().model,
            pinned: system.signature().model,
            mismatch: None,
            iterations: 0,
        };
        fd.factorize(system.signature())?;
        Ok(fd)
    }

    pub fn variant(&self) -> DecoupledVariant {
        self.variant
    }

    pub fn voltage(&self) -> &Voltage {
        &self.voltage
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// `B'` over non-slack buses.
    pub fn active_matrix(&self) -> &CscMatrix<f64> {
        &self.b_active
    }

    /// `B''` over PQ buses.
    pub fn reactive_matrix(&self) -> &CscMatrix<f64> {
        &self.b_reactive
    }

    /// Factorization caches of `B'` and `B''`.
    pub fn caches(&self) -> (&FactorizationCache, &FactorizationCache) {
        (&self.active, &self.reactive)
    }

    pub fn mismatch(&mut self, system: &PowerSystem) -> Result<&Mismatch> {
        self.layout.ensure_current(system)?;
        let live = system.signature();
        if live.model != self.pinned {
            self.voltage.pin_setpoints(system);
            self.pinned = live.model;
        }
        let cached = match self.mismatch.take() {
            Some((sig, m)) if sig == live => (sig, m),
            _ => (live, self.evaluate(system)),
        };
        Ok(&self.mismatch.insert(cached).1)
    }

    /// One active half-iteration followed by one reactive half-iteration.
    pub fn step(&mut self, system: &PowerSystem) -> Result<()> {
        self.layout.ensure_current(system)?;
        if system.signature().model != self.model {
            info!(
                from = self.model,
                to = system.signature().model,
                "network parameters changed, refreshing decoupled matrices"
            );
            let (b_active, b_reactive) = decoupled_matrices(system, &self.layout, self.variant);
            self.b_active = b_active;
            self.b_reactive = b_reactive;
            self.model = system.signature().model;
            self.factorize(system.signature())?;
        }

        let mismatch = self.mismatch(system)?.clone();
        self.mismatch = None;
        if !self.layout.pvpq.is_empty() {
            let mut dx: Vec<f64> = self
                .layout
                .pvpq
                .iter()
                .zip(mismatch.active.iter())
                .map(|(&bus, m)| -m / self.voltage.magnitude[bus])
                .collect();
            self.active.solve(&mut dx)?;
            for (&bus, d) in self.layout.pvpq.iter().zip(&dx) {
                self.voltage.angle[bus] -= d;
            }
        }

        if !self.layout.pq.is_empty() {
            // reactive half uses the freshly updated angles
            let mismatch = self.evaluate(system);
            let mut dx: Vec<f64> = self
                .layout
                .pq
                .iter()
                .zip(mismatch.reactive.iter())
                .map(|(&bus, m)| -m / self.voltage.magnitude[bus])
                .collect();
            self.reactive.solve(&mut dx)?;
            for (&bus, d) in self.layout.pq.iter().zip(&dx) {
                self.voltage.magnitude[bus] -= d;
            }
        }
        self.iterations += 1;
        Ok(())
    }

    fn evaluate(&self, system: &PowerSystem) -> Mismatch {
        Mismatch::polar(
            &system.ac_model().ybus,
            &system.specified_injection(),
            &self.voltage,
            &self.layout,
        )
    }

    fn factorize(&mut self, signature: Signature) -> Result<()> {
        let mut actions: [Option<FactorAction>; 2] = [None, None];
        if self.b_active.ncols() > 0 {
            actions[0] = Some(self.active.prepare(&self.b_active, signature)?);
        }
        if self.b_reactive.ncols() > 0 {
            actions[1] = Some(self.reactive.prepare(&self.b_reactive, signature)?);
        }
        debug!(variant = %self.variant, ?actions, "decoupled matrices factorized");
        Ok(())
    }
}

/// `B'` over non-slack buses and `B''` over PQ buses.
fn decoupled_matrices(
    system: &PowerSystem,
    layout: &BusLayout,
    variant: DecoupledVariant,
) -> (CscMatrix<f64>, CscMatrix<f64>) {
    let mut active = Vec::new();
    for br in system.branches().iter().filter(|b| b.in_service) {
        let b = variant.active_coefficient(br);
        active.extend([
            (br.from, br.from, b),
            (br.to, br.to, b),
            (br.from, br.to, -b),
            (br.to, br.from, -b),
        ]);
    }
    let b_active = restrict(active, &layout.angle_index, layout.pvpq.len());

    // phase shifters are dropped, taps, charging and bus shunts stay
    let ybus = assemble_ybus(
        system.buses(),
        system.branches(),
        |br| {
            BranchAdmittance::pi_model(
                variant.reactive_series(br),
                br.shunt_admittance(),
                br.ratio(),
                0.0,
            )
        },
        true,
    );
    let b_reactive = restrict(
        ybus.triplet_iter().map(|(i, j, y)| (i, j, -y.im)),
        &layout.magnitude_index,
        layout.pq.len(),
    );
    (b_active, b_reactive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::network::BusType;
    use crate::testcases::{case3, case_ieee14};

    fn converge(fd: &mut FastDecoupled, sys: &PowerSystem, tol: f64, cap: usize) {
        while !fd.mismatch(sys).unwrap().within(tol) {
            assert!(fd.iterations() < cap, "{} did not converge", fd.variant());
            fd.step(sys).unwrap();
        }
    }

    #[test]
    fn test_matrix_dimensions() {
        let mut sys = case_ieee14();
        let cfg = PowerFlowConfig::default();
        let fd = FastDecoupled::new(&mut sys, &cfg, DecoupledVariant::XB).unwrap();
        // 13 non-slack buses, 9 PQ buses
        assert_eq!(fd.active_matrix().ncols(), 13);
        assert_eq!(fd.reactive_matrix().ncols(), 9);
    }

    #[test]
    fn test_bx_active_coefficient_ignores_resistance() {
        let mut sys = case3();
        let cfg = PowerFlowConfig::default();
        let fd = FastDecoupled::new(&mut sys, &cfg, DecoupledVariant::BX).unwrap();
        let br = &sys.branches()[0];
        // branch 0 joins the slack with bus 1
        assert_eq!(br.from, 0);
        assert_eq!(br.to, 1);
        let mut expected = 1.0 / br.reactance;
        for other in sys.branches().iter().skip(1) {
            if other.from == 1 || other.to == 1 {
                expected += 1.0 / other.reactance;
            }
        }
        let b11 = fd.active_matrix().get_entry(0, 0).unwrap().into_value();
        assert!((b11 - expected).abs() < 1e-12, "{b11} != {expected}");
    }

    #[test]
    fn test_both_variants_converge() {
        for variant in [DecoupledVariant::BX, DecoupledVariant::XB] {
            let mut sys = case_ieee14();
            let cfg = PowerFlowConfig::default();
            let mut fd = FastDecoupled::new(&mut sys, &cfg, variant).unwrap();
            converge(&mut fd, &sys, 1e-8, 40);
            let (active, reactive) = fd.caches();
            // constant matrices were factorized exactly once
            assert_eq!(active.last_action(), Some(FactorAction::Built));
            assert_eq!(reactive.last_action(), Some(FactorAction::Built));
        }
    }

    #[test]
    fn test_numeric_edit_refactorizes() {
        let mut sys = case_ieee14();
        let cfg = PowerFlowConfig::default();
        let mut fd = FastDecoupled::new(&mut sys, &cfg, DecoupledVariant::XB).unwrap();
        converge(&mut fd, &sys, 1e-8, 40);
        sys.modify_branch(3, |b| b.reactance *= 1.1).unwrap();
        fd.step(&sys).unwrap();
        assert_eq!(fd.caches().0.last_action(), Some(FactorAction::Refactored));
        converge(&mut fd, &sys, 1e-8, 80);
    }

    #[test]
    fn test_single_pq_bus() {
        // case3 has one PQ bus, so B'' is 1x1
        for variant in [DecoupledVariant::BX, DecoupledVariant::XB] {
            let mut sys = case3();
            let cfg = PowerFlowConfig::default();
            let mut fd = FastDecoupled::new(&mut sys, &cfg, variant).unwrap();
            assert_eq!(fd.reactive_matrix().ncols(), 1);
            converge(&mut fd, &sys, 1e-10, 40);
        }
    }

    #[test]
    fn test_setpoint_edit_is_picked_up() {
        let mut sys = case3();
        let cfg = PowerFlowConfig::default();
        let mut fd = FastDecoupled::new(&mut sys, &cfg, DecoupledVariant::XB).unwrap();
        converge(&mut fd, &sys, 1e-10, 40);
        sys.modify_generator(1, |g| g.magnitude = 1.03).unwrap();
        converge(&mut fd, &sys, 1e-10, 80);
        assert_eq!(fd.voltage().magnitude[2], 1.03);

        let mut fresh_sys = sys.clone();
        let mut fresh = FastDecoupled::new(&mut fresh_sys, &cfg, DecoupledVariant::XB).unwrap();
        converge(&mut fresh, &fresh_sys, 1e-10, 40);
        let dm = (&fd.voltage().magnitude - &fresh.voltage().magnitude).amax();
        let da = (&fd.voltage().angle - &fresh.voltage().angle).amax();
        assert!(dm < 1e-8 && da < 1e-8, "{dm} {da}");
    }

    #[test]
    fn test_structural_edit_is_rejected() {
        let mut sys = case3();
        let cfg = PowerFlowConfig::default();
        let mut fd = FastDecoupled::new(&mut sys, &cfg, DecoupledVariant::BX).unwrap();
        sys.set_bus_type(1, BusType::PV).unwrap();
        assert!(matches!(
            fd.step(&sys),
            Err(PowerFlowError::IncompatibleReuse { .. })
        ));
    }
}
