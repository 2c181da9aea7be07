//! Single-funnel dipole model of energy transfer.
//!
//! A chromophore aggregate is modelled as three excitation dipoles of which
//! the outer two are tilted symmetrically by ±κ around the main one, plus a
//! shared emission "funnel". Without energy transfer each dipole re-emits
//! itself; with transfer the excitation lands in the funnel regardless of
//! which dipole absorbed it. The measured portrait is an `et`-weighted
//! mixture of the two limits.

use crate::movie::Context;
use crate::settings::FunnelSettings;
use crate::spot::Spot;
use log::debug;
use nalgebra::{DMatrix, Matrix4, Vector4};
use std::f64::consts::FRAC_PI_2;

/// Result of the bounded funnel-model fit.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunnelFit {
    /// Modulation depth of the funnel emission.
    pub depth: f64,
    /// Phase of the funnel emission, bounded to the excitation phase ± π/2.
    pub phase: f64,
    /// Geometric ratio of the central dipole amplitude to the outer ones.
    pub geometric_ratio: f64,
    /// Energy-transfer fraction in [0, 1].
    pub et_fraction: f64,
    /// Final squared error of the fit.
    pub residual: f64,
}

impl FunnelFit {
    pub const NAN: FunnelFit = FunnelFit {
        depth: f64::NAN,
        phase: f64::NAN,
        geometric_ratio: f64::NAN,
        et_fraction: f64::NAN,
        residual: f64::NAN,
    };
}

/// Tilt of the outer dipoles for a given excitation modulation depth and
/// geometric ratio. The bounds on `gr` keep the argument inside ±1; the
/// clamp only absorbs finite-difference excursions.
fn dipole_tilt(m_ex: f64, gr: f64) -> f64 {
    0.5 * (0.5 * ((gr + 2.0) * m_ex - gr)).clamp(-1.0, 1.0).acos()
}

/// No-transfer emission surface: each of the three dipoles absorbs and
/// emits along its own axis. Normalized to unit sum.
pub fn no_et_surface(
    ex_grid: &[f64],
    em_grid: &[f64],
    m_ex: f64,
    phase_ex: f64,
    gr: f64,
) -> DMatrix<f64> {
    let kappa = dipole_tilt(m_ex, gr);
    let mut surface = DMatrix::zeros(em_grid.len(), ex_grid.len());
    for (emi, &em) in em_grid.iter().enumerate() {
        for (exi, &ex) in ex_grid.iter().enumerate() {
            let mut value = 0.0;
            for (alpha, weight) in [
                (phase_ex - kappa, 1.0),
                (phase_ex, gr),
                (phase_ex + kappa, 1.0),
            ] {
                value += weight * (ex - alpha).cos().powi(2) * (em - alpha).cos().powi(2);
            }
            surface[(emi, exi)] = value / (2.0 + gr);
        }
    }
    normalize(surface)
}

/// Full-transfer emission surface: excitation follows the aggregate's
/// absorption modulation, emission comes entirely from the funnel.
/// Normalized to unit sum.
pub fn funnel_surface(
    ex_grid: &[f64],
    em_grid: &[f64],
    m_ex: f64,
    phase_ex: f64,
    depth: f64,
    funnel_phase: f64,
) -> DMatrix<f64> {
    let mut surface = DMatrix::zeros(em_grid.len(), ex_grid.len());
    for (emi, &em) in em_grid.iter().enumerate() {
        for (exi, &ex) in ex_grid.iter().enumerate() {
            surface[(emi, exi)] = 0.25
                * (1.0 + m_ex * (2.0 * (ex - phase_ex)).cos())
                * (1.0 + depth * (2.0 * (em - funnel_phase)).cos());
        }
    }
    normalize(surface)
}

/// Model surface for parameters `[depth, funnel_phase, gr, et]`.
pub fn model_surface(
    params: &[f64; 4],
    ex_grid: &[f64],
    em_grid: &[f64],
    m_ex: f64,
    phase_ex: f64,
) -> DMatrix<f64> {
    let [depth, funnel_phase, gr, et] = *params;
    let with_et = funnel_surface(ex_grid, em_grid, m_ex, phase_ex, depth, funnel_phase);
    let without = no_et_surface(ex_grid, em_grid, m_ex, phase_ex, gr);
    with_et * et + without * (1.0 - et)
}

fn normalize(surface: DMatrix<f64>) -> DMatrix<f64> {
    let total = surface.sum();
    surface / total
}

fn model_error(
    params: &[f64; 4],
    ex_grid: &[f64],
    em_grid: &[f64],
    m_ex: f64,
    phase_ex: f64,
    observed: &DMatrix<f64>,
) -> f64 {
    let model = model_surface(params, ex_grid, em_grid, m_ex, phase_ex);
    (model - observed).map(|d| d * d).sum()
}

/// Fit the funnel model to a spot's normalized average portrait.
///
/// The excitation modulation depth is clipped away from [0, 1] so the tilt
/// arc-cosine stays defined; an undefined depth skips the fit entirely and
/// reports NaN throughout.
pub fn fit_spot(
    sam: &DMatrix<f64>,
    ex_grid: &[f64],
    em_grid: &[f64],
    m_ex: f64,
    phase_ex: f64,
    cfg: &FunnelSettings,
) -> FunnelFit {
    if !m_ex.is_finite() || !phase_ex.is_finite() {
        return FunnelFit::NAN;
    }
    let total = sam.sum();
    if !total.is_finite() || total == 0.0 {
        return FunnelFit::NAN;
    }
    let observed = sam / total;

    let mex = m_ex.clamp(1e-6, 1.0 - 1e-6);
    let lower = Vector4::new(1e-3, phase_ex - FRAC_PI_2, 0.0, 0.0);
    let upper = Vector4::new(
        0.999999,
        phase_ex + FRAC_PI_2,
        2.0 * (1.0 + mex) / (1.0 - mex) * 0.999,
        1.0,
    );
    let start = Vector4::new(mex, phase_ex, 1.0, 0.5);

    let objective = |x: &Vector4<f64>| {
        model_error(
            &[x[0], x[1], x[2], x[3]],
            ex_grid,
            em_grid,
            mex,
            phase_ex,
            &observed,
        )
    };

    let (x, fx, converged) = minimize_bounded(&objective, start, lower, upper, cfg);
    if !converged {
        debug!("funnel fit stopped without convergence, residual {fx:.3e}");
    }

    FunnelFit {
        depth: x[0],
        phase: x[1],
        geometric_ratio: x[2],
        et_fraction: x[3],
        residual: fx,
    }
}

/// Run the funnel-model stage over the selected spots.
pub(crate) fn et_model_stage(
    ctx: &Context,
    spots: &mut [Spot],
    targets: &[usize],
) -> Result<(), crate::error::Error> {
    for &si in targets {
        let spot = &mut spots[si];
        let Some(sam) = &spot.sam else {
            return Err(crate::error::Error::StageOrder(
                "the funnel-model fit requires the modulation stage",
            ));
        };
        spot.et_model = fit_spot(
            sam,
            ctx.grid.excitation(),
            ctx.grid.emission(),
            spot.modulation_ex.depth,
            spot.modulation_ex.phase,
            &ctx.settings.funnel,
        );
    }
    Ok(())
}

fn clamp_into(x: Vector4<f64>, lower: &Vector4<f64>, upper: &Vector4<f64>) -> Vector4<f64> {
    Vector4::from_fn(|i, _| x[i].clamp(lower[i], upper[i]))
}

/// Central-difference gradient, falling back to a shifted stencil where a
/// bound is closer than the step.
fn gradient<F: Fn(&Vector4<f64>) -> f64>(
    f: &F,
    x: &Vector4<f64>,
    lower: &Vector4<f64>,
    upper: &Vector4<f64>,
    step: f64,
) -> Vector4<f64> {
    Vector4::from_fn(|i, _| {
        let up = (x[i] + step).min(upper[i]);
        let down = (x[i] - step).max(lower[i]);
        if up == down {
            return 0.0;
        }
        let mut xu = *x;
        let mut xd = *x;
        xu[i] = up;
        xd[i] = down;
        (f(&xu) - f(&xd)) / (up - down)
    })
}

/// Box-bounded quasi-Newton minimization with numerically approximated
/// gradients. A BFGS approximation of the inverse Hessian drives the search
/// direction; trial points are projected back onto the box and accepted by
/// backtracking. Terminates on a small projected gradient, on a relative
/// objective decrease below `factr` machine epsilons, or when no decreasing
/// step can be found.
fn minimize_bounded<F: Fn(&Vector4<f64>) -> f64>(
    f: &F,
    start: Vector4<f64>,
    lower: Vector4<f64>,
    upper: Vector4<f64>,
    cfg: &FunnelSettings,
) -> (Vector4<f64>, f64, bool) {
    let mut x = clamp_into(start, &lower, &upper);
    let mut fx = f(&x);
    let mut g = gradient(f, &x, &lower, &upper, cfg.gradient_step);
    let mut h_inv = Matrix4::identity();

    for _ in 0..cfg.max_iterations {
        let pg_max = (0..4)
            .map(|i| {
                let at_lower = x[i] <= lower[i] && g[i] > 0.0;
                let at_upper = x[i] >= upper[i] && g[i] < 0.0;
                if at_lower || at_upper { 0.0 } else { g[i].abs() }
            })
            .fold(0.0, f64::max);
        if pg_max <= cfg.pg_tolerance {
            return (x, fx, true);
        }

        let mut direction = -(h_inv * g);
        if direction.dot(&g) >= 0.0 {
            // The curvature estimate has gone stale; restart from steepest
            // descent.
            direction = -g;
            h_inv = Matrix4::identity();
        }

        let mut accepted = None;
        let mut step = 1.0;
        for _ in 0..40 {
            let xt = clamp_into(x + direction * step, &lower, &upper);
            let ft = f(&xt);
            if ft.is_finite() && ft < fx {
                accepted = Some((xt, ft));
                break;
            }
            step *= 0.5;
        }
        let Some((xt, ft)) = accepted else {
            return (x, fx, false);
        };

        let flat = (fx - ft) <= cfg.factr * f64::EPSILON * fx.abs().max(ft.abs()).max(1.0);
        let gt = gradient(f, &xt, &lower, &upper, cfg.gradient_step);

        let s = xt - x;
        let y = gt - g;
        let sy = s.dot(&y);
        if sy > 1e-12 {
            let rho = 1.0 / sy;
            let i = Matrix4::identity();
            let left = i - (s * y.transpose()) * rho;
            h_inv = left * h_inv * left.transpose() + (s * s.transpose()) * rho;
        }

        x = xt;
        fx = ft;
        g = gt;

        if flat {
            return (x, fx, true);
        }
    }

    (x, fx, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn grid(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * PI / n as f64).collect()
    }

    #[test]
    fn surfaces_are_normalized() {
        let ex = grid(6);
        let em = grid(4);
        assert_relative_eq!(no_et_surface(&ex, &em, 0.5, 0.3, 1.0).sum(), 1.0);
        assert_relative_eq!(funnel_surface(&ex, &em, 0.5, 0.3, 0.8, 0.1).sum(), 1.0);
    }

    #[test]
    fn mixture_interpolates_between_limits() {
        let ex = grid(6);
        let em = grid(6);
        let params = [0.7, 0.2, 1.3, 0.0];
        let at_zero = model_surface(&params, &ex, &em, 0.5, 0.3);
        let without = no_et_surface(&ex, &em, 0.5, 0.3, 1.3);
        assert_relative_eq!((at_zero - without).abs().sum(), 0.0, epsilon = 1e-12);

        let params = [0.7, 0.2, 1.3, 1.0];
        let at_one = model_surface(&params, &ex, &em, 0.5, 0.3);
        let with = funnel_surface(&ex, &em, 0.5, 0.3, 0.7, 0.2);
        assert_relative_eq!((at_one - with).abs().sum(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn minimizer_finds_interior_minimum() {
        let cfg = FunnelSettings::default();
        let target = Vector4::new(0.3, -0.2, 1.5, 0.6);
        let f = |x: &Vector4<f64>| (x - target).norm_squared();
        let (x, fx, _) = minimize_bounded(
            &f,
            Vector4::new(0.5, 0.0, 1.0, 0.5),
            Vector4::new(0.0, -1.0, 0.0, 0.0),
            Vector4::new(1.0, 1.0, 3.0, 1.0),
            &cfg,
        );
        assert!(fx < 1e-10);
        assert_relative_eq!(x[0], 0.3, epsilon = 1e-4);
        assert_relative_eq!(x[3], 0.6, epsilon = 1e-4);
    }

    #[test]
    fn minimizer_respects_bounds() {
        let cfg = FunnelSettings::default();
        let target = Vector4::new(2.0, 0.0, 0.0, 0.0);
        let f = |x: &Vector4<f64>| (x - target).norm_squared();
        let (x, _, _) = minimize_bounded(
            &f,
            Vector4::new(0.5, 0.0, 0.0, 0.0),
            Vector4::new(0.0, -1.0, 0.0, 0.0),
            Vector4::new(1.0, 1.0, 1.0, 1.0),
            &cfg,
        );
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn fit_recovers_generated_portrait() {
        let ex = grid(6);
        let em = grid(6);
        let truth = [0.8, 0.3, 1.0, 0.7];
        let (mex, phex) = (0.5, 0.3);
        let sam = model_surface(&truth, &ex, &em, mex, phex);

        let fit = fit_spot(&sam, &ex, &em, mex, phex, &FunnelSettings::default());
        assert!(fit.residual < 1e-5, "residual {}", fit.residual);
        assert!(
            (fit.et_fraction - truth[3]).abs() < 0.25,
            "et {} too far from {}",
            fit.et_fraction,
            truth[3]
        );
    }

    #[test]
    fn undefined_excitation_depth_skips_the_fit() {
        let ex = grid(4);
        let em = grid(4);
        let sam = DMatrix::from_element(4, 4, 1.0);
        let fit = fit_spot(&sam, &ex, &em, f64::NAN, 0.1, &FunnelSettings::default());
        assert!(fit.depth.is_nan());
        assert!(fit.et_fraction.is_nan());
        assert!(fit.residual.is_nan());
    }
}
