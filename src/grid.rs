use crate::error::Error;
use crate::motors::MotorLog;
use std::f64::consts::PI;

/// Tolerance for matching observed angles onto grid values, and for
/// snapping near-π values before the wrap. Ten floating-point epsilons.
pub const GRID_TOLERANCE: f64 = 10.0 * f64::EPSILON;

/// Canonical excitation and emission angle grids.
///
/// The portrait fits are interpreted on these grids rather than on the raw
/// motor angles. Each grid spans [0, π) with as many evenly spaced values
/// as there are unique observed angles on that axis; the phase offset of
/// the optical path is added to the excitation grid only, and the result is
/// wrapped back into [0, π).
///
/// Construction validates that every observed angle lands on its grid. A
/// mismatch means the scan schedule does not sample the grid it claims to,
/// which no downstream stage can recover from.
#[derive(Clone, Debug)]
pub struct AngleGrid {
    excitation: Vec<f64>,
    emission: Vec<f64>,
}

impl AngleGrid {
    /// Build both grids from the unique angles of a motor log.
    pub fn from_motor_log(motors: &MotorLog) -> Result<Self, Error> {
        Self::build(
            &motors.unique_excitation(),
            &motors.unique_emission(),
            motors.phase_offset_rad(),
        )
    }

    /// Build grids for the given sets of unique observed angles (radians).
    pub fn build(
        unique_ex: &[f64],
        unique_em: &[f64],
        phase_offset_rad: f64,
    ) -> Result<Self, Error> {
        if unique_ex.is_empty() || unique_em.is_empty() {
            return Err(Error::InvalidInput(
                "cannot build an angle grid without observed angles".into(),
            ));
        }

        let excitation = spaced(unique_ex.len(), phase_offset_rad);
        let emission = spaced(unique_em.len(), 0.0);

        validate_coverage(unique_ex, &excitation, "excitation")?;
        validate_coverage(unique_em, &emission, "emission")?;

        Ok(Self {
            excitation,
            emission,
        })
    }

    pub fn excitation(&self) -> &[f64] {
        &self.excitation
    }

    pub fn emission(&self) -> &[f64] {
        &self.emission
    }
}

/// `n` evenly spaced angles over [0, π) shifted by `offset` and wrapped.
///
/// Values that the shift pushes within [`GRID_TOLERANCE`] of π are snapped
/// to exactly π first, so the wrap sends them to 0 instead of leaving a
/// spurious near-π value that matches nothing.
fn spaced(n: usize, offset: f64) -> Vec<f64> {
    let step = PI / n as f64;
    (0..n)
        .map(|i| {
            let mut angle = i as f64 * step + offset;
            if (angle - PI).abs() < GRID_TOLERANCE {
                angle = PI;
            }
            angle.rem_euclid(PI)
        })
        .collect()
}

fn validate_coverage(observed: &[f64], grid: &[f64], axis: &'static str) -> Result<(), Error> {
    for &angle in observed {
        let matched = grid.iter().any(|&g| (angle - g).abs() < GRID_TOLERANCE);
        if !matched {
            return Err(Error::GridMismatch { axis, angle });
        }
    }
    Ok(())
}

/// Grid length with a trailing value dropped when it duplicates angle 0
/// modulo π. The ruler resampling must not step onto the same angle twice.
pub(crate) fn effective_len(grid: &[f64]) -> usize {
    match grid.last() {
        Some(&last) if (last - PI).abs() < GRID_TOLERANCE => grid.len() - 1,
        _ => grid.len(),
    }
}
