//! Two-stage portrait fitting.
//!
//! Stage A fits every line of every portrait horizontally, across all
//! requested spots at once. Stage B evaluates the line fits on the
//! excitation grid and fits the resulting verticals, again batched over
//! spots. The cosine model separates along the two angular axes, which is
//! what lets thousands of spots go through a constant number of batched
//! least-squares calls instead of one fit per spot per line.

use crate::error::Error;
use crate::fit::cosine::fit_columns;
use crate::movie::Context;
use crate::spot::{FitGrid, Spot};

pub(crate) fn fit_portraits(
    ctx: &Context,
    spots: &mut [Spot],
    targets: &[usize],
) -> Result<(), Error> {
    if targets.is_empty() {
        return Ok(());
    }

    let n_portraits = ctx.portraits.portrait_count();
    let n_lines = ctx.portraits.line_count();
    let ex_grid = ctx.grid.excitation();
    let n_ex = ex_grid.len();

    for &si in targets {
        let spot = &mut spots[si];
        if spot.intensity.is_empty() {
            return Err(Error::InvalidInput(format!(
                "spot '{}' has no intensity series",
                spot.label()
            )));
        }
        spot.line_fits = FitGrid::filled(n_portraits, n_lines);
        spot.vertical_fits = FitGrid::filled(n_portraits, n_ex);
        spot.residual = 0.0;
    }

    // Portraits go in series; all spots in parallel inside each fit call.
    for pi in 0..n_portraits {
        for li in 0..n_lines {
            let line = ctx.portraits.line(pi, li);
            let columns: Vec<Vec<f64>> = targets
                .iter()
                .map(|&si| spots[si].line_intensity(line))
                .collect();

            let fits = fit_columns(line.excitation(), &columns, ctx.settings.ex_phase_steps)?;
            for (k, &si) in targets.iter().enumerate() {
                spots[si].line_fits.set(pi, li, fits[k].params);
            }
        }

        // Stage B: one vertical per excitation-grid angle per spot, fit
        // against the line-center emission angles.
        let emission_angles: Vec<f64> = ctx
            .portraits
            .lines(pi)
            .iter()
            .map(|line| line.emission())
            .collect();

        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(targets.len() * n_ex);
        for &si in targets {
            for &ex_angle in ex_grid {
                columns.push(
                    (0..n_lines)
                        .map(|li| spots[si].line_fits.get(pi, li).eval(ex_angle))
                        .collect(),
                );
            }
        }

        let fits = fit_columns(&emission_angles, &columns, ctx.settings.em_phase_steps)?;
        for (k, &si) in targets.iter().enumerate() {
            for exi in 0..n_ex {
                spots[si]
                    .vertical_fits
                    .set(pi, exi, fits[k * n_ex + exi].params);
            }
        }
    }

    for &si in targets {
        spots[si].residual = spots[si].line_fits.residual_sum();
    }

    Ok(())
}
