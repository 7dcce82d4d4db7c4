//! Power mismatch `specified - calculated` at the buses that carry an equation.
//!
//! Active mismatch is evaluated at every non-slack bus, reactive mismatch at every PQ bus,
//! in the order of [`BusLayout`]. Each entry is one sparse row product of the admittance
//! matrix with the current voltage.

use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use num_complex::Complex64;

use super::{
    sparse::row_current,
    state::{BusLayout, Voltage},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// `P_spec - P_calc` at non-slack buses.
    pub active: DVector<f64>,
    /// `Q_spec - Q_calc` at PQ buses.
    pub reactive: DVector<f64>,
    pub max_active: f64,
    pub max_reactive: f64,
}

impl Mismatch {
    /// Mismatch of a rectangular voltage vector.
    pub fn rectangular(
        ybus: &CsrMatrix<Complex64>,
        specified: &DVector<Complex64>,
        v: &DVector<Complex64>,
        layout: &BusLayout,
    ) -> Self {
        let calculated = |i: usize| v[i] * row_current(ybus, i, v).conj();
        let active = DVector::from_iterator(
            layout.pvpq.len(),
            layout.pvpq.iter().map(|&i| specified[i].re - calculated(i).re),
        );
        let reactive = DVector::from_iterator(
            layout.pq.len(),
            layout.pq.iter().map(|&i| specified[i].im - calculated(i).im),
        );
        let max_active = norm_inf(&active);
        let max_reactive = norm_inf(&reactive);
        Self {
            active,
            reactive,
            max_active,
            max_reactive,
        }
    }

    /// Mismatch of a polar voltage state.
    pub fn polar(
        ybus: &CsrMatrix<Complex64>,
        specified: &DVector<Complex64>,
        voltage: &Voltage,
        layout: &BusLayout,
    ) -> Self {
        Self::rectangular(ybus, specified, &voltage.to_complex(), layout)
    }

    /// Mismatch of a solver whose state is exact by construction.
    pub fn zero() -> Self {
        Self {
            active: DVector::zeros(0),
            reactive: DVector::zeros(0),
            max_active: 0.0,
            max_reactive: 0.0,
        }
    }

    /// Mismatch of a solver that has not produced a solution yet.
    pub fn unbounded() -> Self {
        Self {
            max_active: f64::INFINITY,
            max_reactive: f64::INFINITY,
            ..Self::zero()
        }
    }

    pub fn within(&self, tol: f64) -> bool {
        self.max_active < tol && self.max_reactive < tol
    }
}

/// Largest absolute entry; any non-finite entry makes the whole norm infinite.
fn norm_inf(x: &DVector<f64>) -> f64 {
    x.iter().fold(0.0f64, |m, v| {
        if v.is_finite() {
            m.max(v.abs())
        } else {
            f64::INFINITY
        }
    })
}

/// Complex power `V conj(Y V)` injected at every bus.
pub fn bus_injection(ybus: &CsrMatrix<Complex64>, v: &DVector<Complex64>) -> DVector<Complex64> {
    DVector::from_iterator(
        v.len(),
        (0..v.len()).map(|i| v[i] * row_current(ybus, i, v).conj()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::network::{Branch, Bus, BusType, PowerSystem};
    use crate::testcases::case3;

    #[test]
    fn test_flat_start_mismatch() {
        let sys = case3();
        let layout = BusLayout::new(&sys).unwrap();
        let v = Voltage::flat(sys.bus_count());
        let m = Mismatch::polar(&sys.ac_model().ybus, &sys.specified_injection(), &v, &layout);
        assert_eq!(m.active.len(), 2);
        assert_eq!(m.reactive.len(), 1);
        // flat start without shunts or charging: nothing is calculated
        let s = sys.specified_injection();
        assert!((m.active[0] - s[1].re).abs() < 1e-12);
        assert!((m.active[1] - s[2].re).abs() < 1e-12);
        assert!((m.reactive[0] - s[1].im).abs() < 1e-12);
        assert!(m.max_active >= m.active[0].abs());
    }

    #[test]
    fn test_injection_of_lossless_line() {
        let mut sys = PowerSystem::new(100.0);
        sys.add_bus(Bus::new(BusType::Slack));
        sys.add_bus(Bus::new(BusType::PQ));
        sys.add_branch(Branch::new(0, 1, 0.0, 0.1)).unwrap();
        let v = DVector::from_vec(vec![
            Complex64::from_polar(1.0, 0.0),
            Complex64::from_polar(1.0, -0.1),
        ]);
        let s = bus_injection(&sys.ac_model().ybus, &v);
        let p = 0.1f64.sin() / 0.1;
        assert!((s[0].re - p).abs() < 1e-12, "{}", s[0]);
        assert!((s[1].re + p).abs() < 1e-12, "{}", s[1]);
    }

    #[test]
    fn test_non_finite_state() {
        let sys = case3();
        let layout = BusLayout::new(&sys).unwrap();
        let mut v = Voltage::flat(sys.bus_count());
        v.magnitude[1] = f64::NAN;
        let m = Mismatch::polar(&sys.ac_model().ybus, &sys.specified_injection(), &v, &layout);
        assert!(m.max_active.is_infinite());
        assert!(!m.within(1.0));
    }

    #[test]
    fn test_sentinels() {
        assert!(Mismatch::zero().within(1e-12));
        assert!(!Mismatch::unbounded().within(1e30));
    }
}
