//! Slack/PV/PQ assignment repair.
//!
//! [`classify`] runs before every solver construction:
//!
//! 1. a PV bus without an in-service generator becomes PQ;
//! 2. a slack bus without an in-service generator (or a missing slack) is replaced by the
//!    first PV bus, in ascending bus order, that has one; the former slack becomes PQ;
//! 3. when no such bus exists the network cannot be solved.
//!
//! Running it twice changes nothing the second time.

use tracing::warn;

use super::{
    error::{PowerFlowError, Result},
    network::{BusType, PowerSystem},
};

/// Repairs the classification of `system` and returns the slack bus.
pub fn classify(system: &mut PowerSystem) -> Result<usize> {
    // extra slack buses left by deserialized data fall back to PV
    let slacks = system.buses_of(BusType::Slack);
    for &extra in slacks.iter().skip(1) {
        system.reclassify(extra, BusType::PV);
    }

    for i in system.buses_of(BusType::PV) {
        if !system.has_active_generator(i) {
            system.reclassify(i, BusType::PQ);
        }
    }

    match system.slack() {
        Some(slack) if system.has_active_generator(slack) => Ok(slack),
        Some(slack) => {
            let promoted = promote_slack(system)?;
            system.reclassify(slack, BusType::PQ);
            warn!(from = slack, to = promoted, "slack bus has no generator, reassigned");
            Ok(promoted)
        }
        None => promote_slack(system),
    }
}

/// Promotes the first PV bus with an in-service generator to slack.
///
/// The caller is responsible for the former slack bus.
pub fn promote_slack(system: &mut PowerSystem) -> Result<usize> {
    let candidate = system
        .buses_of(BusType::PV)
        .into_iter()
        .find(|&i| system.has_active_generator(i))
        .ok_or(PowerFlowError::MissingSlack)?;
    system.reclassify(candidate, BusType::Slack);
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::network::{Branch, Bus, Generator};

    fn system(kinds: &[BusType]) -> PowerSystem {
        let mut sys = PowerSystem::new(100.0);
        for &k in kinds {
            sys.add_bus(Bus::new(k));
        }
        for i in 1..kinds.len() {
            sys.add_branch(Branch::new(i - 1, i, 0.01, 0.1)).unwrap();
        }
        sys
    }

    #[test]
    fn test_pv_without_generator_becomes_pq() {
        let mut sys = system(&[BusType::Slack, BusType::PV, BusType::PV]);
        sys.add_generator(Generator::new(0, 0.0, 1.0)).unwrap();
        sys.add_generator(Generator::new(2, 0.2, 1.01)).unwrap();
        assert_eq!(classify(&mut sys).unwrap(), 0);
        assert_eq!(sys.buses()[1].kind, BusType::PQ);
        assert_eq!(sys.buses()[2].kind, BusType::PV);
    }

    #[test]
    fn test_slack_reassigned_in_ascending_order() {
        let mut sys = system(&[BusType::Slack, BusType::PQ, BusType::PV, BusType::PV]);
        sys.add_generator(Generator::new(3, 0.1, 1.0)).unwrap();
        sys.add_generator(Generator::new(2, 0.1, 1.0)).unwrap();
        let g = sys.add_generator(Generator::new(0, 0.0, 1.0)).unwrap();
        sys.set_generator_status(g, false).unwrap();

        assert_eq!(classify(&mut sys).unwrap(), 2);
        assert_eq!(sys.buses()[0].kind, BusType::PQ);
        assert_eq!(sys.buses()[2].kind, BusType::Slack);
        assert_eq!(sys.buses()[3].kind, BusType::PV);
    }

    #[test]
    fn test_missing_slack() {
        let mut sys = system(&[BusType::Slack, BusType::PQ, BusType::PV]);
        assert_eq!(classify(&mut sys), Err(PowerFlowError::MissingSlack));
    }

    #[test]
    fn test_idempotent() {
        let mut sys = system(&[BusType::Slack, BusType::PV, BusType::PV]);
        sys.add_generator(Generator::new(1, 0.1, 1.0)).unwrap();
        classify(&mut sys).unwrap();
        let kinds: Vec<_> = sys.buses().iter().map(|b| b.kind).collect();
        let revision = sys.classification();
        assert_eq!(classify(&mut sys).unwrap(), 1);
        let again: Vec<_> = sys.buses().iter().map(|b| b.kind).collect();
        assert_eq!(kinds, again);
        assert_eq!(sys.classification(), revision);
    }

    #[test]
    fn test_no_designated_slack() {
        let mut sys = system(&[BusType::PQ, BusType::PV]);
        sys.add_generator(Generator::new(1, 0.0, 1.0)).unwrap();
        assert_eq!(classify(&mut sys).unwrap(), 1);
    }
}
