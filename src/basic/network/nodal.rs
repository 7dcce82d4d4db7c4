use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix, CsrMatrix};
use num_complex::Complex64;
use num_traits::Zero;

use super::{Branch, Bus, PowerSystem, Signature};

/// Two-port admittances of a branch in the π model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchAdmittance {
    pub ff: Complex64,
    pub ft: Complex64,
    pub tf: Complex64,
    pub tt: Complex64,
}

impl BranchAdmittance {
    /// π model with complex ratio `α = e^{-jφ}/τ` placed at the from end.
    pub fn pi_model(series: Complex64, shunt: Complex64, ratio: f64, shift: f64) -> Self {
        let alpha = Complex64::from_polar(1.0 / ratio, -shift);
        Self {
            ff: (series + 0.5 * shunt) / (ratio * ratio),
            ft: -alpha.conj() * series,
            tf: -alpha * series,
            tt: series + 0.5 * shunt,
        }
    }
}

impl Branch {
    pub fn admittance(&self) -> BranchAdmittance {
        BranchAdmittance::pi_model(
            self.series_admittance(),
            self.shunt_admittance(),
            self.ratio(),
            self.shift_angle,
        )
    }
}

/// AC nodal admittance matrix with the signature it was derived from.
#[derive(Debug, Clone)]
pub struct AcModel {
    pub ybus: CsrMatrix<Complex64>,
    pub signature: Signature,
}

impl AcModel {
    pub(crate) fn build(system: &PowerSystem) -> Self {
        let ybus = assemble_ybus(system.buses(), system.branches(), Branch::admittance, true);
        Self {
            ybus,
            signature: system.signature(),
        }
    }
}

/// DC nodal susceptance matrix and phase-shift injections.
#[derive(Debug, Clone)]
pub struct DcModel {
    pub bbus: CscMatrix<f64>,
    pub shift_power: DVector<f64>,
    pub signature: Signature,
}

impl DcModel {
    pub(crate) fn build(system: &PowerSystem) -> Self {
        let n = system.bus_count();
        let mut coo = CooMatrix::new(n, n);
        let mut shift_power = DVector::zeros(n);
        for i in 0..n {
            coo.push(i, i, 0.0);
        }
        for br in system.branches().iter().filter(|b| b.in_service) {
            let adm = 1.0 / (br.ratio() * br.reactance);
            coo.push(br.from, br.from, adm);
            coo.push(br.to, br.to, adm);
            coo.push(br.from, br.to, -adm);
            coo.push(br.to, br.from, -adm);
            shift_power[br.from] -= adm * br.shift_angle;
            shift_power[br.to] += adm * br.shift_angle;
        }
        Self {
            bbus: CscMatrix::from(&coo),
            shift_power,
            signature: system.signature(),
        }
    }
}

/// Assembles a nodal admittance matrix from per-branch stamps.
///
/// Every bus gets an explicit diagonal entry so the pattern only depends on the in-service
/// topology. Duplicated entries of parallel branches are summed.
pub(crate) fn assemble_ybus<F>(
    buses: &[Bus],
    branches: &[Branch],
    stamp: F,
    bus_shunts: bool,
) -> CsrMatrix<Complex64>
where
    F: Fn(&Branch) -> BranchAdmittance,
{
    let n = buses.len();
    let mut coo = CooMatrix::new(n, n);
    for (i, bus) in buses.iter().enumerate() {
        let shunt = if bus_shunts { bus.shunt } else { Complex64::zero() };
        coo.push(i, i, shunt);
    }
    for br in branches.iter().filter(|b| b.in_service) {
        let y = stamp(br);
        coo.push(br.from, br.from, y.ff);
        coo.push(br.from, br.to, y.ft);
        coo.push(br.to, br.from, y.tf);
        coo.push(br.to, br.to, y.tt);
    }
    CsrMatrix::from(&coo)
}
