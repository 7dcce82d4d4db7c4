//! DC power flow: one linear solve of `B θ = P` with the slack angle pinned.

use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use tracing::debug;

use super::{
    config::PowerFlowConfig,
    error::{PowerFlowError, Result},
    network::{PowerSystem, Signature},
    solver::{FactorAction, FactorizationCache},
    state::Voltage,
};

#[derive(Debug)]
pub struct DcPowerFlow {
    cache: FactorizationCache,
    angle: DVector<f64>,
    /// Network pattern and slack the factorized structure belongs to.
    structure: Option<(u64, usize)>,
    revision: u64,
    /// Signature the current angles solve.
    solved: Option<Signature>,
    iterations: usize,
}

impl DcPowerFlow {
    pub fn new(system: &mut PowerSystem, config: &PowerFlowConfig) -> Result<Self> {
        super::classify::classify(system)?;
        Ok(Self {
            cache: FactorizationCache::new(config.factorization),
            angle: DVector::zeros(system.bus_count()),
            structure: None,
            revision: 0,
            solved: None,
            iterations: 0,
        })
    }

    /// Solved angles with unit magnitudes.
    pub fn voltage(&self) -> Voltage {
        Voltage {
            magnitude: DVector::from_element(self.angle.len(), 1.0),
            angle: self.angle.clone(),
        }
    }

    pub fn angle(&self) -> &DVector<f64> {
        &self.angle
    }

    /// Number of linear solves performed.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn cache(&self) -> &FactorizationCache {
        &self.cache
    }

    /// Whether the stored angles solve the network as it is now.
    pub fn is_solved(&self, system: &PowerSystem) -> bool {
        self.solved == Some(system.signature())
            && self.structure.map(|(_, slack)| slack) == system.slack()
    }

    /// Solves for the bus angles and returns what the factorization cache did.
    ///
    /// A new pattern or slack bus triggers a full factorization, a numeric edit a
    /// numeric refactorization; otherwise the stored factors are reused.
    pub fn solve(&mut self, system: &PowerSystem) -> Result<FactorAction> {
        let slack = system.slack().ok_or(PowerFlowError::MissingSlack)?;
        let live = system.signature();
        if self.structure != Some((live.pattern, slack)) {
            self.structure = Some((live.pattern, slack));
            self.revision += 1;
        }
        let sig = Signature {
            pattern: self.revision,
            model: live.model,
        };

        let dc = system.dc_model();
        let action = self.cache.prepare(&pinned(&dc.bbus, slack), sig)?;

        let mut b: Vec<f64> = system
            .specified_injection()
            .iter()
            .zip(system.buses())
            .zip(dc.shift_power.iter())
            .map(|((s, bus), shift)| s.re - bus.shunt.re - shift)
            .collect();
        b[slack] = 0.0;
        self.cache.solve(&mut b)?;
        b[slack] = 0.0;

        let reference = system.bus(slack)?.voltage.angle;
        self.angle = DVector::from_vec(b);
        if reference != 0.0 {
            self.angle.add_scalar_mut(reference);
        }
        debug!(%action, slack, "dc power flow solved");
        self.solved = Some(live);
        self.iterations += 1;
        Ok(action)
    }
}

/// Copy of `bbus` with the slack row and column replaced by the identity.
fn pinned(bbus: &CscMatrix<f64>, slack: usize) -> CscMatrix<f64> {
    let n = bbus.nrows();
    let mut coo = CooMatrix::new(n, n);
    for (i, j, v) in bbus.triplet_iter() {
        if i != slack && j != slack {
            coo.push(i, j, *v);
        }
    }
    coo.push(slack, slack, 1.0);
    CscMatrix::from(&coo)
}
