//! Built-in networks, all on a 100 MVA base with powers in p.u.

use crate::basic::network::{Branch, Bus, BusType, Generator, PowerSystem};

/// Three buses in a triangle: slack at bus 0, a load at bus 1 and a PV bus with a local
/// load at bus 2. Lines carry no charging.
pub fn case3() -> PowerSystem {
    let mut sys = PowerSystem::new(100.0);
    sys.add_bus(Bus::new(BusType::Slack));
    sys.add_bus(Bus::new(BusType::PQ).with_demand(0.217, 0.127));
    sys.add_bus(Bus::new(BusType::PV).with_demand(0.478, -0.039));
    for (f, t, r, x) in [
        (0, 1, 0.01938, 0.05917),
        (0, 2, 0.05403, 0.22304),
        (1, 2, 0.04699, 0.19797),
    ] {
        sys.add_branch(Branch::new(f, t, r, x)).expect("case3 branch endpoints");
    }
    sys.add_generator(Generator::new(0, 0.0, 1.06)).expect("case3 generator bus");
    sys.add_generator(Generator::new(2, 0.2, 1.01)).expect("case3 generator bus");
    sys
}

/// IEEE 14-bus test system.
pub fn case_ieee14() -> PowerSystem {
    use BusType::*;
    // kind, Pd, Qd (MW, MVAr), Bs (MVAr)
    let buses = [
        (Slack, 0.0, 0.0, 0.0),
        (PV, 21.7, 12.7, 0.0),
        (PV, 94.2, 19.0, 0.0),
        (PQ, 47.8, -3.9, 0.0),
        (PQ, 7.6, 1.6, 0.0),
        (PV, 11.2, 7.5, 0.0),
        (PQ, 0.0, 0.0, 0.0),
        (PV, 0.0, 0.0, 0.0),
        (PQ, 29.5, 16.6, 19.0),
        (PQ, 9.0, 5.8, 0.0),
        (PQ, 3.5, 1.8, 0.0),
        (PQ, 6.1, 1.6, 0.0),
        (PQ, 13.5, 5.8, 0.0),
        (PQ, 14.9, 5.0, 0.0),
    ];
    // from, to, r, x, b, ratio
    let branches = [
        (0, 1, 0.01938, 0.05917, 0.0528, 0.0),
        (0, 4, 0.05403, 0.22304, 0.0492, 0.0),
        (1, 2, 0.04699, 0.19797, 0.0438, 0.0),
        (1, 3, 0.05811, 0.17632, 0.0340, 0.0),
        (1, 4, 0.05695, 0.17388, 0.0346, 0.0),
        (2, 3, 0.06701, 0.17103, 0.0128, 0.0),
        (3, 4, 0.01335, 0.04211, 0.0, 0.0),
        (3, 6, 0.0, 0.20912, 0.0, 0.978),
        (3, 8, 0.0, 0.55618, 0.0, 0.969),
        (4, 5, 0.0, 0.25202, 0.0, 0.932),
        (5, 10, 0.09498, 0.19890, 0.0, 0.0),
        (5, 11, 0.12291, 0.25581, 0.0, 0.0),
        (5, 12, 0.06615, 0.13027, 0.0, 0.0),
        (6, 7, 0.0, 0.17615, 0.0, 0.0),
        (6, 8, 0.0, 0.11001, 0.0, 0.0),
        (8, 9, 0.03181, 0.08450, 0.0, 0.0),
        (8, 13, 0.12711, 0.27038, 0.0, 0.0),
        (9, 10, 0.08205, 0.19207, 0.0, 0.0),
        (11, 12, 0.22092, 0.19988, 0.0, 0.0),
        (12, 13, 0.17093, 0.34802, 0.0, 0.0),
    ];
    // bus, Pg (MW), Vg, Qmin, Qmax (MVAr)
    let generators = [
        (0, 232.4, 1.06, 0.0, 10.0),
        (1, 40.0, 1.045, -40.0, 50.0),
        (2, 0.0, 1.01, 0.0, 40.0),
        (5, 0.0, 1.07, -6.0, 24.0),
        (7, 0.0, 1.09, -6.0, 24.0),
    ];

    let mut sys = PowerSystem::new(100.0);
    let base = sys.base_mva;
    for (kind, pd, qd, bs) in buses {
        sys.add_bus(
            Bus::new(kind)
                .with_demand(pd / base, qd / base)
                .with_shunt(0.0, bs / base),
        );
    }
    for (f, t, r, x, b, ratio) in branches {
        sys.add_branch(
            Branch::new(f, t, r, x)
                .with_charging(b)
                .with_transformer(ratio, 0.0),
        )
        .expect("case14 branch endpoints");
    }
    for (bus, pg, vg, qmin, qmax) in generators {
        sys.add_generator(
            Generator::new(bus, pg / base, vg).with_q_limits(qmin / base, qmax / base),
        )
        .expect("case14 generator bus");
    }
    sys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_sizes() {
        let sys = case_ieee14();
        assert_eq!(sys.bus_count(), 14);
        assert_eq!(sys.branches().len(), 20);
        assert_eq!(sys.generators().len(), 5);
        assert_eq!(sys.slack(), Some(0));
        assert_eq!(sys.buses_of(BusType::PV), vec![1, 2, 5, 7]);

        let sys = case3();
        assert_eq!(sys.bus_count(), 3);
        assert_eq!(sys.generators().len(), 2);
    }
}
