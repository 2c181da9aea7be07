//! FFT-based energy-transfer ruler.
//!
//! The average portrait is resampled along a slanted trajectory through the
//! angular grid, so that both angular dimensions end up interleaved in one
//! 1D signal. Energy transfer erodes the coherence between the excitation
//! and emission responses, which shows up as a changed balance between the
//! difference- and sum-frequency peaks of the power spectrum. Comparing
//! that balance against a no-transfer reference model built from the spot's
//! own excitation modulation yields a bounded score.

use crate::error::Error;
use crate::grid::effective_len;
use crate::movie::Context;
use crate::settings::RulerSettings;
use crate::spot::Spot;
use log::warn;
use nalgebra::DMatrix;
use rustfft::{FftPlanner, num_complex::Complex64};
use std::f64::consts::PI;

pub(crate) fn et_ruler_stage(
    ctx: &Context,
    spots: &mut [Spot],
    targets: &[usize],
) -> Result<(), Error> {
    for &si in targets {
        let spot = &mut spots[si];
        let Some(sam) = &spot.sam else {
            return Err(Error::StageOrder(
                "the ET ruler requires the modulation stage",
            ));
        };
        spot.et_ruler = compute_ruler(
            sam,
            ctx.grid.excitation(),
            ctx.grid.emission(),
            spot.modulation_ex.depth,
            &ctx.settings.ruler,
        );
    }
    Ok(())
}

/// Ruler score for one average portrait. Always inside [0, 1], or NaN when
/// the spectra are unusable or the excitation modulation is undefined.
pub fn compute_ruler(
    sam: &DMatrix<f64>,
    ex_grid: &[f64],
    em_grid: &[f64],
    m_ex: f64,
    cfg: &RulerSettings,
) -> f64 {
    if !m_ex.is_finite() {
        return f64::NAN;
    }

    // A trailing grid value equal to 0 mod π would be sampled twice.
    let n_ex = effective_len(ex_grid);
    let n_em = effective_len(em_grid);
    if n_ex < 2 || n_em < 2 {
        return f64::NAN;
    }

    let signal: Vec<f64> = (0..cfg.data_length)
        .map(|k| sam[(k % n_em, (cfg.slope * k) % n_ex)])
        .collect();
    let Some(peaks) = harmonic_peaks(&signal, n_ex, cfg) else {
        return f64::NAN;
    };
    let cross_diff = peaks[1] - peaks[3];

    // Reference: three dipoles of equal length tilted by ±κ, no transfer,
    // sampled along the same trajectory as the data.
    let kappa = 0.5 * (0.5 * (3.0 * m_ex - 1.0)).acos();
    let alphas = [-kappa, 0.0, kappa];
    let reference: Vec<f64> = (0..cfg.data_length)
        .map(|k| {
            let theta_ex = ((cfg.slope * k) % n_ex) as f64 * PI / n_ex as f64;
            let theta_em = (k % n_em) as f64 * PI / n_em as f64;
            alphas
                .iter()
                .map(|&a| (theta_ex - a).cos().powi(2) * (theta_em - a).cos().powi(2))
                .sum::<f64>()
                / 3.0
        })
        .collect();
    let Some(reference_peaks) = harmonic_peaks(&reference, n_ex, cfg) else {
        return f64::NAN;
    };
    let reference_diff = reference_peaks[1] - reference_peaks[3];

    let ruler = 1.0 - cross_diff / reference_diff;
    if ruler < -cfg.clamp_slack || ruler > 1.0 + cfg.clamp_slack {
        warn!("ET ruler went out of range ({ruler:.3}); clamping into [0, 1]");
    }
    ruler.clamp(0.0, 1.0)
}

/// Normalized power in the four expected harmonic windows: the first
/// emission harmonic at `len/n_ex` and the (slope−1, slope, slope+1)
/// multiples around the excitation harmonic. Returns None when the windows
/// miss too much of the total power, which means the spectrum does not look
/// like a portrait at all.
fn harmonic_peaks(signal: &[f64], n_ex: usize, cfg: &RulerSettings) -> Option<[f64; 4]> {
    let length = signal.len();
    let mut buffer: Vec<Complex64> = signal
        .iter()
        .map(|&value| Complex64::new(value, 0.0))
        .collect();
    FftPlanner::new()
        .plan_fft_forward(length)
        .process(&mut buffer);

    let power: Vec<f64> = buffer
        .iter()
        .map(|c| c.norm_sqr() / length as f64)
        .collect();

    // Normalize over the positive-frequency half, DC excluded.
    let half = length / 2;
    let total: f64 = power[1..half].iter().sum();
    if !(total > 0.0) {
        return None;
    }

    let first = length as f64 / n_ex as f64;
    let window = first / 3.0;
    let mut peaks = [0.0; 4];
    let multiples = [
        1.0,
        (cfg.slope - 1) as f64,
        cfg.slope as f64,
        (cfg.slope + 1) as f64,
    ];
    for (peak, multiple) in peaks.iter_mut().zip(multiples) {
        let center = first * multiple;
        let lo = ((center - window).round() as usize).max(1);
        let hi = (((center + window).round() as usize) + 1).min(half);
        *peak = power[lo..hi].iter().sum::<f64>() / total;
    }

    let sum: f64 = peaks.iter().sum();
    if (sum - 1.0).abs() > cfg.peak_tolerance {
        warn!("harmonic peaks capture {sum:.3} of the power; ruler unusable");
        return None;
    }
    Some(peaks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::funnel::{funnel_surface, no_et_surface};
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn grid(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * PI / n as f64).collect()
    }

    fn cfg() -> RulerSettings {
        RulerSettings {
            data_length: 1000,
            ..RulerSettings::default()
        }
    }

    #[test]
    fn no_transfer_portrait_scores_zero() {
        // The data equals the reference model, so the peak balance matches
        // and the ruler reads no energy transfer.
        let ex = grid(20);
        let em = grid(20);
        let m_ex = 0.5;
        let sam = no_et_surface(&ex, &em, m_ex, 0.0, 1.0);
        let ruler = compute_ruler(&sam, &ex, &em, m_ex, &cfg());
        assert_relative_eq!(ruler, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn full_transfer_portrait_scores_one() {
        // A separable funnel portrait has symmetric cross peaks, so the
        // observed difference vanishes.
        let ex = grid(20);
        let em = grid(20);
        let m_ex = 0.5;
        let sam = funnel_surface(&ex, &em, m_ex, 0.0, 0.7, 0.0);
        let ruler = compute_ruler(&sam, &ex, &em, m_ex, &cfg());
        assert_relative_eq!(ruler, 1.0, epsilon = 1e-6);
    }

    #[rstest]
    #[case(0.9, 0.2)]
    #[case(0.2, 0.9)]
    #[case(0.5, 0.99)]
    #[case(0.7, 0.05)]
    fn ruler_is_clamped_for_mismatched_references(
        #[case] m_data: f64,
        #[case] m_reference: f64,
    ) {
        // A portrait whose coherence disagrees with the reference model can
        // push the raw ruler far outside [0, 1]; the returned value never is.
        let ex = grid(20);
        let em = grid(20);
        let sam = no_et_surface(&ex, &em, m_data, 0.4, 1.0);
        let ruler = compute_ruler(&sam, &ex, &em, m_reference, &cfg());
        assert!(
            ruler.is_nan() || (0.0..=1.0).contains(&ruler),
            "ruler {ruler} escaped [0, 1]"
        );
    }

    #[test]
    fn unstructured_portrait_yields_nan() {
        let ex = grid(20);
        let em = grid(20);
        // Pseudo-noise: power spreads far outside the harmonic windows.
        let sam = DMatrix::from_fn(20, 20, |r, c| ((r * 31 + c * 17) % 13) as f64);
        let ruler = compute_ruler(&sam, &ex, &em, 0.5, &cfg());
        assert!(ruler.is_nan());
    }

    #[test]
    fn undefined_modulation_yields_nan() {
        let ex = grid(20);
        let em = grid(20);
        let sam = no_et_surface(&ex, &em, 0.5, 0.0, 1.0);
        assert!(compute_ruler(&sam, &ex, &em, f64::NAN, &cfg()).is_nan());
    }
}
