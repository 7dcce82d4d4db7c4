//! Newton-Raphson power flow in polar coordinates.
//!
//! The Jacobian pattern is derived once from the admittance pattern and the bus
//! classification; every iteration only refills its values and refactorizes numerically.

use nalgebra_sparse::{CscMatrix, CsrMatrix};
use num_complex::Complex64;
use tracing::debug;

use super::{
    config::PowerFlowConfig,
    error::{PowerFlowError, Result},
    mismatch::Mismatch,
    network::{PowerSystem, Signature},
    solver::FactorizationCache,
    sparse::{PatternBuilder, position},
    state::{BusLayout, Voltage},
};

/// Positions in the Jacobian value array fed by one admittance entry `Y[i, j]`.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    i: usize,
    j: usize,
    /// Index into the admittance values, in CSR order.
    y: usize,
    p_angle: Option<usize>,
    p_magnitude: Option<usize>,
    q_angle: Option<usize>,
    q_magnitude: Option<usize>,
}

#[derive(Debug)]
pub struct NewtonRaphson {
    layout: BusLayout,
    voltage: Voltage,
    jacobian: CscMatrix<f64>,
    stamps: Vec<Stamp>,
    cache: FactorizationCache,
    /// Model revision the PV and slack magnitudes were pinned for.
    pinned: u64,
    /// Mismatch at the current voltage and the model it was evaluated against.
    mismatch: Option<(Signature, Mismatch)>,
    iterations: usize,
}

impl NewtonRaphson {
    /// Classifies `system` and starts from its configured voltages.
    pub fn new(system: &mut PowerSystem, config: &PowerFlowConfig) -> Result<Self> {
        super::classify::classify(system)?;
        let voltage = Voltage::seed(system);
        Self::build(system, config, voltage)
    }

    /// Classifies `system` and starts from a previous solution.
    pub fn with_voltage(
        system: &mut PowerSystem,
        config: &PowerFlowConfig,
        voltage: Voltage,
    ) -> Result<Self> {
        super::classify::classify(system)?;
        Self::build(system, config, voltage)
    }

    fn build(system: &PowerSystem, config: &PowerFlowConfig, mut voltage: Voltage) -> Result<Self> {
        if voltage.len() != system.bus_count() {
            return Err(PowerFlowError::InvalidConfig(format!(
                "initial voltage has {} entries for {} buses",
                voltage.len(),
                system.bus_count()
            )));
        }
        voltage.pin_setpoints(system);
        let layout = BusLayout::new(system)?;
        let ybus = &system.ac_model().ybus;
        let (jacobian, stamps) = jacobian_pattern(ybus, &layout)?;
        debug!(
            unknowns = layout.unknowns(),
            nnz = jacobian.nnz(),
            "newton-raphson jacobian pattern"
        );
        Ok(Self {
            layout,
            voltage,
            jacobian,
            stamps,
            cache: FactorizationCache::new(config.factorization),
            pinned: system.signature().model,
            mismatch: None,
            iterations: 0,
        })
    }

    pub fn voltage(&self) -> &Voltage {
        &self.voltage
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn layout(&self) -> &BusLayout {
        &self.layout
    }

    pub fn cache(&self) -> &FactorizationCache {
        &self.cache
    }

    /// Jacobian evaluated at the last step.
    pub fn jacobian(&self) -> &CscMatrix<f64> {
        &self.jacobian
    }

    /// Mismatch at the current voltage.
    pub fn mismatch(&mut self, system: &PowerSystem) -> Result<&Mismatch> {
        self.layout.ensure_current(system)?;
        let live = system.signature();
        if live.model != self.pinned {
            self.voltage.pin_setpoints(system);
            self.pinned = live.model;
        }
        let cached = match self.mismatch.take() {
            Some((sig, m)) if sig == live => (sig, m),
            _ => (
                live,
                Mismatch::polar(
                    &system.ac_model().ybus,
                    &system.specified_injection(),
                    &self.voltage,
                    &self.layout,
                ),
            ),
        };
        Ok(&self.mismatch.insert(cached).1)
    }

    /// One Newton update `x -= J⁻¹ F(x)` with `F = calculated - specified`.
    pub fn step(&mut self, system: &PowerSystem) -> Result<()> {
        let mismatch = self.mismatch(system)?.clone();
        self.mismatch = None;
        if self.layout.unknowns() > 0 {
            self.fill_jacobian(&system.ac_model().ybus);
            self.cache.factorize(&self.jacobian, system.signature())?;

            let npvpq = self.layout.pvpq.len();
            let mut dx: Vec<f64> = mismatch
                .active
                .iter()
                .chain(mismatch.reactive.iter())
                .map(|m| -m)
                .collect();
            self.cache.solve(&mut dx)?;

            for (k, &bus) in self.layout.pvpq.iter().enumerate() {
                self.voltage.angle[bus] -= dx[k];
            }
            for (k, &bus) in self.layout.pq.iter().enumerate() {
                self.voltage.magnitude[bus] -= dx[npvpq + k];
            }
        }
        self.iterations += 1;
        Ok(())
    }

    /// Writes the polar Jacobian at the current voltage into the fixed pattern.
    fn fill_jacobian(&mut self, ybus: &CsrMatrix<Complex64>) {
        let v = self.voltage.to_complex();
        let s = super::mismatch::bus_injection(ybus, &v);
        let vm = &self.voltage.magnitude;
        let va = &self.voltage.angle;
        let y = ybus.values();
        let values = self.jacobian.values_mut();

        for st in &self.stamps {
            let (g, b) = (y[st.y].re, y[st.y].im);
            let (i, j) = (st.i, st.j);
            let (dp_da, dp_dv, dq_da, dq_dv) = if i == j {
                let (p, q) = (s[i].re, s[i].im);
                let v2 = vm[i] * vm[i];
                (
                    -q - b * v2,
                    p / vm[i] + g * vm[i],
                    p - g * v2,
                    q / vm[i] - b * vm[i],
                )
            } else {
                let (sin, cos) = (va[i] - va[j]).sin_cos();
                let vivj = vm[i] * vm[j];
                (
                    vivj * (g * sin - b * cos),
                    vm[i] * (g * cos + b * sin),
                    -vivj * (g * cos + b * sin),
                    vm[i] * (g * sin - b * cos),
                )
            };
            set(values, st.p_angle, dp_da);
            set(values, st.p_magnitude, dp_dv);
            set(values, st.q_angle, dq_da);
            set(values, st.q_magnitude, dq_dv);
        }
    }
}

#[inline(always)]
fn set(values: &mut [f64], at: Option<usize>, value: f64) {
    if let Some(k) = at {
        values[k] = value;
    }
}

/// Jacobian pattern over the unknowns of `layout` plus, per admittance entry, the
/// positions its four partial derivatives land in.
fn jacobian_pattern(
    ybus: &CsrMatrix<Complex64>,
    layout: &BusLayout,
) -> Result<(CscMatrix<f64>, Vec<Stamp>)> {
    let n = layout.unknowns();
    let npvpq = layout.pvpq.len();
    let p_row = |i: usize| layout.angle_index[i];
    let q_row = |i: usize| layout.magnitude_index[i].map(|k| npvpq + k);
    let angle_col = p_row;
    let magnitude_col = q_row;

    let mut builder = PatternBuilder::new(n, n);
    for (i, j, _) in ybus.triplet_iter() {
        for (row, col) in [
            (p_row(i), angle_col(j)),
            (p_row(i), magnitude_col(j)),
            (q_row(i), angle_col(j)),
            (q_row(i), magnitude_col(j)),
        ] {
            if let (Some(r), Some(c)) = (row, col) {
                builder.push(r, c);
            }
        }
    }
    let jacobian = builder.finish()?;

    let at = |row: Option<usize>, col: Option<usize>| match (row, col) {
        (Some(r), Some(c)) => position(&jacobian, r, c),
        _ => None,
    };
    let stamps = ybus
        .triplet_iter()
        .enumerate()
        .map(|(k, (i, j, _))| Stamp {
            i,
            j,
            y: k,
            p_angle: at(p_row(i), angle_col(j)),
            p_magnitude: at(p_row(i), magnitude_col(j)),
            q_angle: at(q_row(i), angle_col(j)),
            q_magnitude: at(q_row(i), magnitude_col(j)),
        })
        .filter(|st| {
            st.p_angle.is_some()
                || st.p_magnitude.is_some()
                || st.q_angle.is_some()
                || st.q_magnitude.is_some()
        })
        .collect();
    Ok((jacobian, stamps))
}
