use tracing::debug;

use super::{error::Result, network::PowerSystem, state::Voltage};

/// Shifts all angles so that bus `reference` sits at its configured angle again.
///
/// Used after the slack bus moved: the solution is then expressed against the original
/// reference. Returns the applied shift; a second call returns zero.
pub fn align_angles(system: &PowerSystem, voltage: &mut Voltage, reference: usize) -> Result<f64> {
    let target = system.bus(reference)?.voltage.angle;
    let shift = target - voltage.angle[reference];
    if shift != 0.0 {
        voltage.angle.add_scalar_mut(shift);
        // exact, whatever the rounding of the addition
        voltage.angle[reference] = target;
    }
    debug!(reference, shift, "angles aligned");
    Ok(shift)
}
