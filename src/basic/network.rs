//! Network model consumed by the power flow engine.
//!
//! [`PowerSystem`] keeps the bus, branch and generator records and derives the nodal
//! matrices from them. Every edit goes through a method that advances one of the
//! change counters:
//!
//! - `pattern`: graph structure changed (bus/branch/generator added, in-service status toggled,
//!   endpoints moved).
//! - `model`: a numeric parameter of an in-service element changed.
//! - `classification`: a bus kind changed.
//!
//! Solvers snapshot these counters and compare them before every step; nothing is
//! observed implicitly.

use std::cell::OnceCell;

use derive_more::Display;
use nalgebra::DVector;
use num_complex::Complex64;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use super::error::{PowerFlowError, Result};

pub mod nodal;
pub use nodal::{AcModel, BranchAdmittance, DcModel};

/// Bus classification.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusType {
    /// Fixed active and reactive injection.
    #[default]
    PQ,
    /// Fixed active injection and voltage magnitude.
    PV,
    /// Angle reference; absorbs the power balance.
    Slack,
}

/// Configured voltage of a bus: the seed of iterative solvers and, for the slack bus,
/// the reference angle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusVoltage {
    pub magnitude: f64, // p.u.
    pub angle: f64,     // rad
}

impl Default for BusVoltage {
    fn default() -> Self {
        Self {
            magnitude: 1.0,
            angle: 0.0,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bus {
    pub kind: BusType,
    /// Consumed power in p.u.
    pub demand: Complex64,
    /// Shunt admittance G + jB in p.u.
    pub shunt: Complex64,
    pub voltage: BusVoltage,
}

impl Bus {
    pub fn new(kind: BusType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_demand(mut self, p: f64, q: f64) -> Self {
        self.demand = Complex64::new(p, q);
        self
    }

    pub fn with_shunt(mut self, g: f64, b: f64) -> Self {
        self.shunt = Complex64::new(g, b);
        self
    }

    pub fn with_voltage(mut self, magnitude: f64, angle: f64) -> Self {
        self.voltage = BusVoltage { magnitude, angle };
        self
    }
}

/// Branch in the unified π model: line or transformer with optional phase shift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub from: usize,
    pub to: usize,
    pub resistance: f64,
    pub reactance: f64,
    /// Total shunt conductance, split half to each end.
    pub conductance: f64,
    /// Total line charging susceptance, split half to each end.
    pub susceptance: f64,
    /// Off-nominal turns ratio at the from end; zero means no transformer.
    pub turns_ratio: f64,
    /// Phase shift in rad.
    pub shift_angle: f64,
    pub in_service: bool,
}

impl Branch {
    pub fn new(from: usize, to: usize, resistance: f64, reactance: f64) -> Self {
        Self {
            from,
            to,
            resistance,
            reactance,
            conductance: 0.0,
            susceptance: 0.0,
            turns_ratio: 0.0,
            shift_angle: 0.0,
            in_service: true,
        }
    }

    pub fn with_charging(mut self, susceptance: f64) -> Self {
        self.susceptance = susceptance;
        self
    }

    pub fn with_transformer(mut self, turns_ratio: f64, shift_angle: f64) -> Self {
        self.turns_ratio = turns_ratio;
        self.shift_angle = shift_angle;
        self
    }

    /// Effective turns ratio.
    pub fn ratio(&self) -> f64 {
        if self.turns_ratio == 0.0 {
            1.0
        } else {
            self.turns_ratio
        }
    }

    pub fn series_admittance(&self) -> Complex64 {
        Complex64::new(self.resistance, self.reactance).inv()
    }

    pub fn shunt_admittance(&self) -> Complex64 {
        Complex64::new(self.conductance, self.susceptance)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generator {
    pub bus: usize,
    /// Injected power in p.u.
    pub output: Complex64,
    /// Voltage magnitude setpoint in p.u.
    pub magnitude: f64,
    #[serde(with = "unbounded::below")]
    pub q_min: f64,
    #[serde(with = "unbounded::above")]
    pub q_max: f64,
    pub in_service: bool,
}

/// JSON has no infinities: unbounded reactive limits are written as `null`.
mod unbounded {
    use serde::{Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        value.is_finite().then_some(*value).serialize(serializer)
    }

    pub mod below {
        use serde::{Deserialize, Deserializer};

        pub use super::serialize;

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
        }
    }

    pub mod above {
        use serde::{Deserialize, Deserializer};

        pub use super::serialize;

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
        }
    }
}

impl Generator {
    pub fn new(bus: usize, p: f64, magnitude: f64) -> Self {
        Self {
            bus,
            output: Complex64::new(p, 0.0),
            magnitude,
            q_min: f64::NEG_INFINITY,
            q_max: f64::INFINITY,
            in_service: true,
        }
    }

    pub fn with_reactive(mut self, q: f64) -> Self {
        self.output.im = q;
        self
    }

    pub fn with_q_limits(mut self, q_min: f64, q_max: f64) -> Self {
        self.q_min = q_min;
        self.q_max = q_max;
        self
    }
}

/// Change signature pair of the network.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub pattern: u64,
    pub model: u64,
}

/// Power network with derived nodal matrices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowerSystem {
    /// System base power in MVA.
    pub base_mva: f64,
    buses: Vec<Bus>,
    branches: Vec<Branch>,
    generators: Vec<Generator>,
    #[serde(skip)]
    signature: Signature,
    #[serde(skip)]
    classification: u64,
    #[serde(skip)]
    ac: OnceCell<AcModel>,
    #[serde(skip)]
    dc: OnceCell<DcModel>,
}

impl PowerSystem {
    pub fn new(base_mva: f64) -> Self {
        Self {
            base_mva,
            ..Default::default()
        }
    }

    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn generators(&self) -> &[Generator] {
        &self.generators
    }

    pub fn bus(&self, index: usize) -> Result<&Bus> {
        self.buses.get(index).ok_or(PowerFlowError::InvalidBus(index))
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn classification(&self) -> u64 {
        self.classification
    }

    /// Index of the slack bus, if one is designated.
    pub fn slack(&self) -> Option<usize> {
        self.buses.iter().position(|b| b.kind == BusType::Slack)
    }

    /// Indices of buses of the given kind in ascending order.
    pub fn buses_of(&self, kind: BusType) -> Vec<usize> {
        self.buses
            .iter()
            .enumerate()
            .filter_map(|(i, b)| (b.kind == kind).then_some(i))
            .collect()
    }

    pub fn generators_at(&self, bus: usize) -> impl Iterator<Item = (usize, &Generator)> + '_ {
        self.generators
            .iter()
            .enumerate()
            .filter(move |(_, g)| g.in_service && g.bus == bus)
    }

    pub fn has_active_generator(&self, bus: usize) -> bool {
        self.generators_at(bus).next().is_some()
    }

    /// Aggregate in-service generator supply per bus.
    pub fn supply(&self) -> Vec<Complex64> {
        let mut supply = vec![Complex64::zero(); self.buses.len()];
        for g in self.generators.iter().filter(|g| g.in_service) {
            supply[g.bus] += g.output;
        }
        supply
    }

    /// Specified injection `supply - demand` per bus.
    pub fn specified_injection(&self) -> DVector<Complex64> {
        let supply = self.supply();
        DVector::from_iterator(
            self.buses.len(),
            self.buses.iter().zip(supply).map(|(b, s)| s - b.demand),
        )
    }

    /// Voltage magnitude setpoint of the first in-service generator at `bus`.
    pub fn setpoint(&self, bus: usize) -> Option<f64> {
        self.generators_at(bus).next().map(|(_, g)| g.magnitude)
    }

    /// AC nodal admittance matrix, derived on first use after an edit.
    pub fn ac_model(&self) -> &AcModel {
        self.ac.get_or_init(|| AcModel::build(self))
    }

    /// DC nodal susceptance matrix, derived on first use after an edit.
    pub fn dc_model(&self) -> &DcModel {
        self.dc.get_or_init(|| DcModel::build(self))
    }

    pub fn add_bus(&mut self, bus: Bus) -> usize {
        if bus.kind == BusType::Slack {
            self.demote_slack();
        }
        self.buses.push(bus);
        self.bump_pattern();
        self.buses.len() - 1
    }

    pub fn add_branch(&mut self, branch: Branch) -> Result<usize> {
        self.check_bus(branch.from)?;
        self.check_bus(branch.to)?;
        self.branches.push(branch);
        self.bump_pattern();
        Ok(self.branches.len() - 1)
    }

    pub fn add_generator(&mut self, generator: Generator) -> Result<usize> {
        self.check_bus(generator.bus)?;
        self.generators.push(generator);
        self.bump_pattern();
        Ok(self.generators.len() - 1)
    }

    /// Edits a bus. Kind changes advance the classification counter, numeric changes the model.
    pub fn modify_bus<F: FnOnce(&mut Bus)>(&mut self, index: usize, f: F) -> Result<()> {
        self.check_bus(index)?;
        let before = self.buses[index].clone();
        f(&mut self.buses[index]);
        let after = self.buses[index].clone();
        if before.kind != after.kind {
            if after.kind == BusType::Slack {
                self.buses[index].kind = BusType::PQ;
                self.demote_slack();
                self.buses[index].kind = BusType::Slack;
            }
            self.classification += 1;
        }
        let numeric_changed = before.demand != after.demand
            || before.shunt != after.shunt
            || before.voltage != after.voltage;
        if numeric_changed {
            self.bump_model();
        }
        Ok(())
    }

    pub fn set_bus_type(&mut self, index: usize, kind: BusType) -> Result<()> {
        self.modify_bus(index, |b| b.kind = kind)
    }

    /// Edits a branch. Endpoint or status changes advance the pattern, numeric changes of
    /// an in-service branch advance the model.
    pub fn modify_branch<F: FnOnce(&mut Branch)>(&mut self, index: usize, f: F) -> Result<()> {
        let Some(before) = self.branches.get(index).cloned() else {
            return Err(PowerFlowError::InvalidConfig(format!(
                "branch {index} does not exist"
            )));
        };
        let mut after = before.clone();
        f(&mut after);
        self.check_bus(after.from)?;
        self.check_bus(after.to)?;
        let structural = before.from != after.from
            || before.to != after.to
            || before.in_service != after.in_service;
        let numeric = after.in_service && before != after;
        self.branches[index] = after;
        if structural {
            self.bump_pattern();
        } else if numeric {
            self.bump_model();
        }
        Ok(())
    }

    pub fn set_branch_status(&mut self, index: usize, in_service: bool) -> Result<()> {
        self.modify_branch(index, |b| b.in_service = in_service)
    }

    /// Edits a generator. Bus or status changes advance the pattern, numeric changes of an
    /// in-service generator advance the model.
    pub fn modify_generator<F: FnOnce(&mut Generator)>(
        &mut self,
        index: usize,
        f: F,
    ) -> Result<()> {
        let Some(before) = self.generators.get(index).cloned() else {
            return Err(PowerFlowError::InvalidConfig(format!(
                "generator {index} does not exist"
            )));
        };
        let mut after = before.clone();
        f(&mut after);
        self.check_bus(after.bus)?;
        let structural = before.bus != after.bus || before.in_service != after.in_service;
        let numeric = after.in_service && before != after;
        self.generators[index] = after;
        if structural {
            self.bump_pattern();
        } else if numeric {
            self.bump_model();
        }
        Ok(())
    }

    pub fn set_generator_status(&mut self, index: usize, in_service: bool) -> Result<()> {
        self.modify_generator(index, |g| g.in_service = in_service)
    }

    /// Reclassifies a bus on behalf of the classifier and the limit enforcer.
    pub(crate) fn reclassify(&mut self, index: usize, kind: BusType) {
        if self.buses[index].kind != kind {
            self.buses[index].kind = kind;
            self.classification += 1;
        }
    }

    fn demote_slack(&mut self) {
        if let Some(old) = self.slack() {
            self.buses[old].kind = BusType::PV;
            self.classification += 1;
        }
    }

    fn check_bus(&self, index: usize) -> Result<()> {
        if index < self.buses.len() {
            Ok(())
        } else {
            Err(PowerFlowError::InvalidBus(index))
        }
    }

    fn bump_pattern(&mut self) {
        self.signature.pattern += 1;
        self.invalidate();
    }

    fn bump_model(&mut self) {
        self.signature.model += 1;
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.ac.take();
        self.dc.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bus() -> PowerSystem {
        let mut sys = PowerSystem::new(100.0);
        sys.add_bus(Bus::new(BusType::Slack));
        sys.add_bus(Bus::new(BusType::PQ).with_demand(0.5, 0.2));
        sys.add_branch(Branch::new(0, 1, 0.01, 0.1)).unwrap();
        sys.add_generator(Generator::new(0, 0.0, 1.0)).unwrap();
        sys
    }

    #[test]
    fn test_structural_edits_bump_pattern() {
        let mut sys = two_bus();
        let sig = sys.signature();
        sys.set_branch_status(0, false).unwrap();
        assert_eq!(sys.signature().pattern, sig.pattern + 1);
        assert_eq!(sys.signature().model, sig.model);
    }

    #[test]
    fn test_numeric_edits_bump_model() {
        let mut sys = two_bus();
        let sig = sys.signature();
        sys.modify_branch(0, |b| b.reactance = 0.2).unwrap();
        assert_eq!(sys.signature().pattern, sig.pattern);
        assert_eq!(sys.signature().model, sig.model + 1);

        sys.modify_bus(1, |b| b.demand.re = 0.6).unwrap();
        assert_eq!(sys.signature().model, sig.model + 2);
    }

    #[test]
    fn test_out_of_service_edit_is_silent() {
        let mut sys = two_bus();
        sys.set_branch_status(0, false).unwrap();
        let sig = sys.signature();
        sys.modify_branch(0, |b| b.resistance = 0.5).unwrap();
        assert_eq!(sys.signature(), sig);
    }

    #[test]
    fn test_cached_matrix_follows_edits() {
        let mut sys = two_bus();
        let y0 = sys.ac_model().ybus.get_entry(0, 1).unwrap().into_value();
        assert_eq!(sys.ac_model().signature, sys.signature());
        sys.modify_branch(0, |b| b.reactance = 0.2).unwrap();
        let y1 = sys.ac_model().ybus.get_entry(0, 1).unwrap().into_value();
        assert_ne!(y0, y1);
        assert_eq!(sys.ac_model().signature, sys.signature());
    }

    #[test]
    fn test_single_slack() {
        let mut sys = two_bus();
        sys.set_bus_type(1, BusType::Slack).unwrap();
        assert_eq!(sys.slack(), Some(1));
        assert_eq!(sys.buses()[0].kind, BusType::PV);
        assert_eq!(sys.buses_of(BusType::Slack), vec![1]);
    }

    #[test]
    fn test_invalid_bus() {
        let mut sys = two_bus();
        let err = sys.add_branch(Branch::new(0, 7, 0.0, 0.1)).unwrap_err();
        assert_eq!(err, PowerFlowError::InvalidBus(7));
    }

    #[test]
    fn test_specified_injection() {
        let mut sys = two_bus();
        sys.add_generator(Generator::new(1, 0.3, 1.0).with_reactive(0.1))
            .unwrap();
        let s = sys.specified_injection();
        assert!((s[1] - Complex64::new(-0.2, -0.1)).norm() < 1e-12, "{}", s[1]);
    }

    #[test]
    fn test_serde_roundtrip_keeps_data() {
        let sys = two_bus();
        let text = serde_json::to_string(&sys).unwrap();
        let back: PowerSystem = serde_json::from_str(&text).unwrap();
        assert_eq!(back.buses(), sys.buses());
        assert_eq!(back.branches(), sys.branches());
        assert_eq!(back.slack(), Some(0));
    }

    #[test]
    fn test_serde_keeps_reactive_limits() {
        let mut sys = two_bus();
        sys.add_generator(Generator::new(1, 0.1, 1.0).with_q_limits(-0.2, f64::INFINITY))
            .unwrap();
        let text = serde_json::to_string(&sys).unwrap();
        let back: PowerSystem = serde_json::from_str(&text).unwrap();
        assert_eq!(back.generators(), sys.generators());
        let g = &back.generators()[back.generators().len() - 1];
        assert_eq!((g.q_min, g.q_max), (-0.2, f64::INFINITY));
    }
}
