//! Modulation depths, phases and anisotropy from the fitted portraits.

use crate::error::Error;
use crate::fit::cosine::fit_columns;
use crate::movie::Context;
use crate::spot::{Modulation, Spot};
use nalgebra::DMatrix;
use std::f64::consts::{FRAC_PI_2, PI};

/// Wrap a phase difference into (−π/2, π/2] by a ±π correction.
fn wrap_line_shift(mut shift: f64) -> f64 {
    if shift > FRAC_PI_2 {
        shift -= PI;
    }
    if shift < -FRAC_PI_2 {
        shift += PI;
    }
    shift
}

/// Mean over all portraits of the vertical-fit surface evaluated on the
/// emission grid.
fn average_portrait(spot: &Spot, em_grid: &[f64]) -> DMatrix<f64> {
    let n_portraits = spot.vertical_fits.rows();
    let n_ex = spot.vertical_fits.cols();
    let mut sam = DMatrix::zeros(em_grid.len(), n_ex);
    for pi in 0..n_portraits {
        for exi in 0..n_ex {
            let fit = spot.vertical_fits.get(pi, exi);
            for (emi, &em) in em_grid.iter().enumerate() {
                sam[(emi, exi)] += fit.eval(em);
            }
        }
    }
    sam / n_portraits as f64
}

pub(crate) fn find_modulation(
    ctx: &Context,
    spots: &mut [Spot],
    targets: &[usize],
) -> Result<(), Error> {
    if targets.is_empty() {
        return Ok(());
    }
    for &si in targets {
        if spots[si].vertical_fits.is_empty() {
            return Err(Error::StageOrder(
                "modulation analysis requires the portrait fits",
            ));
        }
    }

    let ex_grid = ctx.grid.excitation();
    let em_grid = ctx.grid.emission();

    // Average portraits and their projections onto the two angular axes,
    // one column per spot.
    let mut proj_ex: Vec<Vec<f64>> = Vec::with_capacity(targets.len());
    let mut proj_em: Vec<Vec<f64>> = Vec::with_capacity(targets.len());
    for &si in targets {
        let sam = average_portrait(&spots[si], em_grid);
        proj_ex.push((0..sam.ncols()).map(|c| sam.column(c).mean()).collect());
        proj_em.push((0..sam.nrows()).map(|r| sam.row(r).mean()).collect());
        spots[si].sam = Some(sam);
    }

    let ex_fits = fit_columns(ex_grid, &proj_ex, ctx.settings.ex_phase_steps)?;
    let em_fits = fit_columns(em_grid, &proj_em, ctx.settings.em_phase_steps)?;

    for (k, &si) in targets.iter().enumerate() {
        let ex = ex_fits[k].params;
        let em = em_fits[k].params;
        let spot = &mut spots[si];
        spot.modulation_ex = Modulation {
            depth: ex.modulation,
            phase: ex.phase,
            intensity: ex.i0,
            residual: ex.residual,
        };
        spot.modulation_em = Modulation {
            depth: em.modulation,
            phase: em.phase,
            intensity: em.i0,
            residual: em.residual,
        };
        spot.line_shift = wrap_line_shift(ex.phase - em.phase);
    }

    // Advanced anisotropy: evaluate every spot at its own excitation
    // phase. Normal anisotropy: evaluate at the lab frame's 0°.
    let advanced = anisotropy_pass(ctx, spots, targets, |spot| spot.modulation_ex.phase)?;
    let normal = anisotropy_pass(ctx, spots, targets, |_| 0.0)?;
    for (k, &si) in targets.iter().enumerate() {
        spots[si].anisotropy = advanced[k];
        spots[si].anisotropy_normal = normal[k];
    }

    Ok(())
}

/// One anisotropy variant for all target spots.
///
/// The horizontal line fits are evaluated at the chosen excitation angle,
/// averaged over portraits, and vertically fit against the line emission
/// angles. Parallel and perpendicular intensities come from that fit at the
/// angle itself and a quarter turn away.
fn anisotropy_pass(
    ctx: &Context,
    spots: &[Spot],
    targets: &[usize],
    angle_of: impl Fn(&Spot) -> f64,
) -> Result<Vec<f64>, Error> {
    let n_portraits = ctx.portraits.portrait_count();
    let n_lines = ctx.portraits.line_count();
    let emission_angles = ctx.portraits.line_emission_angles();

    let columns: Vec<Vec<f64>> = targets
        .iter()
        .map(|&si| {
            let spot = &spots[si];
            let angle = angle_of(spot);
            (0..n_lines)
                .map(|li| {
                    (0..n_portraits)
                        .map(|pi| spot.line_fits.get(pi, li).eval(angle))
                        .sum::<f64>()
                        / n_portraits as f64
                })
                .collect()
        })
        .collect();

    let fits = fit_columns(&emission_angles, &columns, ctx.settings.em_phase_steps)?;

    Ok(targets
        .iter()
        .enumerate()
        .map(|(k, &si)| {
            let angle = angle_of(&spots[si]);
            let fit = fits[k].params;
            let i_para = fit.eval(angle);
            let i_perp = fit.eval(angle - FRAC_PI_2);
            anisotropy_ratio(i_para, i_perp)
        })
        .collect())
}

/// `(I∥ − I⊥) / (I∥ + 2·I⊥)`, NaN when the denominator is exactly zero.
fn anisotropy_ratio(i_para: f64, i_perp: f64) -> f64 {
    let denominator = i_para + 2.0 * i_perp;
    if denominator == 0.0 {
        f64::NAN
    } else {
        (i_para - i_perp) / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[rstest]
    #[case(0.3, 0.3)]
    #[case(2.0, 2.0 - PI)]
    #[case(-1.8, -1.8 + PI)]
    #[case(FRAC_PI_2, FRAC_PI_2)]
    fn line_shift_wraps_into_half_turn(#[case] raw: f64, #[case] wrapped: f64) {
        assert_relative_eq!(wrap_line_shift(raw), wrapped);
    }

    #[test]
    fn line_shift_propagates_nan() {
        assert!(wrap_line_shift(f64::NAN).is_nan());
    }

    #[test]
    fn anisotropy_zero_denominator_is_nan() {
        // I∥ + 2·I⊥ == 0 exactly must never raise.
        assert!(anisotropy_ratio(2.0, -1.0).is_nan());
        assert_relative_eq!(anisotropy_ratio(3.0, 1.0), 0.4);
    }
}
