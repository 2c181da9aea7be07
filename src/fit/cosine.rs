use crate::error::Error;
use rayon::prelude::*;
use std::f64::consts::{FRAC_PI_2, PI};

/// Parameters of the model `I(θ) = I0 · (1 + M · cos(2(θ − φ)))`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CosineFit {
    /// Phase of peak response, wrapped into (−π/2, π/2].
    pub phase: f64,
    /// Mean intensity.
    pub i0: f64,
    /// Modulation depth. Dimensionless; not clamped into [0, 1].
    pub modulation: f64,
    /// Sum of squared errors of the fit.
    pub residual: f64,
}

impl CosineFit {
    pub const NAN: CosineFit = CosineFit {
        phase: f64::NAN,
        i0: f64::NAN,
        modulation: f64::NAN,
        residual: f64::NAN,
    };

    /// Evaluate the fitted model at `angle` (radians).
    pub fn eval(&self, angle: f64) -> f64 {
        self.i0 * (1.0 + self.modulation * (2.0 * (angle - self.phase)).cos())
    }
}

/// Fit of a single intensity column, with the evaluated curve and the raw
/// phasor of the modulated term for downstream recombination.
#[derive(Clone, Debug)]
pub struct ColumnFit {
    pub params: CosineFit,
    /// The fitted model evaluated at the input angles.
    pub curve: Vec<f64>,
    /// Amplitude of the modulated term, `I0 · M`, after sign folding.
    pub raw_amplitude: f64,
    /// Phase of the modulated term in its complex representation,
    /// `A · cos(2θ − 2φ) = Re(A · e^{i·raw_phase} · e^{i·2θ})`.
    pub raw_phase: f64,
}

impl ColumnFit {
    fn nan(n_angles: usize) -> Self {
        Self {
            params: CosineFit::NAN,
            curve: vec![f64::NAN; n_angles],
            raw_amplitude: f64::NAN,
            raw_phase: f64::NAN,
        }
    }
}

/// Per-phase sums over the shared basis `c_i = cos(2(θ_i − φ))`. These
/// depend only on the angle array and are shared by every column.
struct PhaseBasis {
    phase: f64,
    values: Vec<f64>,
    sum: f64,
    sum_sq: f64,
    /// Determinant of the 2×2 normal equations, `n·Σc² − (Σc)²`.
    det: f64,
}

/// Fit one independent cosine model per column, all columns at once.
///
/// The intensity matrix is given column-wise; every column shares the angle
/// array. The phase is found by scanning `n_phases` candidates over
/// [0, π/2] and solving, per candidate, the two-parameter linear least
/// squares for mean and amplitude in closed form; the candidate with the
/// smallest residual wins. A negative best-fit amplitude is folded away by
/// shifting the phase a quarter turn, which extends the effective phase
/// range to a half turn. This grid/regression hybrid is what makes fitting
/// thousands of columns at once affordable.
///
/// Columns containing non-finite samples produce all-NaN fits rather than
/// an error; a column with zero mean intensity produces a NaN modulation
/// depth. An angle array on which every candidate basis is collinear (all
/// angles equal, or a single angle) cannot be fit at all and is reported as
/// [`Error::DegenerateFit`].
pub fn fit_columns(
    angles: &[f64],
    columns: &[Vec<f64>],
    n_phases: usize,
) -> Result<Vec<ColumnFit>, Error> {
    if n_phases < 2 {
        return Err(Error::InvalidInput(format!(
            "cosine fitter needs at least 2 candidate phases, got {}",
            n_phases
        )));
    }
    if angles.is_empty() {
        return Err(Error::InvalidInput("cosine fitter got no angles".into()));
    }
    for (ci, column) in columns.iter().enumerate() {
        if column.len() != angles.len() {
            return Err(Error::InvalidInput(format!(
                "column {} has {} samples but there are {} angles",
                ci,
                column.len(),
                angles.len()
            )));
        }
    }

    let n = angles.len() as f64;
    let det_floor = 1e-12 * n;

    let bases: Vec<PhaseBasis> = (0..n_phases)
        .map(|pi| {
            let phase = pi as f64 * FRAC_PI_2 / (n_phases - 1) as f64;
            let values: Vec<f64> = angles.iter().map(|&a| (2.0 * (a - phase)).cos()).collect();
            let sum: f64 = values.iter().sum();
            let sum_sq: f64 = values.iter().map(|c| c * c).sum();
            PhaseBasis {
                phase,
                values,
                sum,
                sum_sq,
                det: n * sum_sq - sum * sum,
            }
        })
        .collect();

    if bases.iter().all(|b| b.det.abs() < det_floor) {
        return Err(Error::DegenerateFit(format!(
            "angle array of length {} spans no usable basis",
            angles.len()
        )));
    }

    let fits = columns
        .par_iter()
        .map(|column| fit_one(angles, column, &bases, n, det_floor))
        .collect();

    Ok(fits)
}

fn fit_one(
    angles: &[f64],
    column: &[f64],
    bases: &[PhaseBasis],
    n: f64,
    det_floor: f64,
) -> ColumnFit {
    if column.iter().any(|v| !v.is_finite()) {
        return ColumnFit::nan(column.len());
    }

    let sy: f64 = column.iter().sum();
    let syy: f64 = column.iter().map(|y| y * y).sum();

    let mut best: Option<(f64, f64, f64, f64)> = None; // residual, phase, i0, amplitude
    for basis in bases {
        if basis.det.abs() < det_floor {
            continue;
        }

        let scy: f64 = basis
            .values
            .iter()
            .zip(column)
            .map(|(c, y)| c * y)
            .sum();

        let i0 = (basis.sum_sq * sy - basis.sum * scy) / basis.det;
        let amp = (n * scy - basis.sum * sy) / basis.det;
        let residual = (syy - 2.0 * i0 * sy - 2.0 * amp * scy
            + i0 * i0 * n
            + 2.0 * i0 * amp * basis.sum
            + amp * amp * basis.sum_sq)
            .max(0.0);

        if best.is_none_or(|(r, ..)| residual < r) {
            best = Some((residual, basis.phase, i0, amp));
        }
    }

    let Some((residual, mut phase, i0, mut amplitude)) = best else {
        return ColumnFit::nan(column.len());
    };

    // cos(2(θ − φ − π/2)) = −cos(2(θ − φ)): a negative amplitude is the
    // same model a quarter turn away.
    if amplitude < 0.0 {
        phase += FRAC_PI_2;
        amplitude = -amplitude;
    }
    if phase > FRAC_PI_2 {
        phase -= PI;
    }

    let modulation = if i0 == 0.0 { f64::NAN } else { amplitude / i0 };
    let params = CosineFit {
        phase,
        i0,
        modulation,
        residual,
    };

    // Evaluate as i0 + A·cos rather than through the modulation depth, so
    // a zero-mean column (NaN depth) still gets a finite curve.
    let curve = angles
        .iter()
        .map(|&a| i0 + amplitude * (2.0 * (a - phase)).cos())
        .collect();

    ColumnFit {
        params,
        curve,
        raw_amplitude: amplitude,
        raw_phase: -2.0 * phase,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn angles(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * PI / n as f64).collect()
    }

    fn column(angles: &[f64], i0: f64, m: f64, phase: f64) -> Vec<f64> {
        angles
            .iter()
            .map(|&a| i0 * (1.0 + m * (2.0 * (a - phase)).cos()))
            .collect()
    }

    #[rstest]
    #[case(100.0, 0.6, 0.3)]
    #[case(5.0, 0.95, 1.2)]
    #[case(1.0, 0.0, 0.0)]
    fn round_trip_recovers_parameters(#[case] i0: f64, #[case] m: f64, #[case] phase: f64) {
        let a = angles(8);
        let data = column(&a, i0, m, phase);
        let fits = fit_columns(&a, &[data], 1801).unwrap();
        let p = fits[0].params;

        let wrapped = if phase > FRAC_PI_2 { phase - PI } else { phase };
        assert_relative_eq!(p.i0, i0, max_relative = 1e-3);
        if m > 0.0 {
            assert_relative_eq!(p.phase, wrapped, epsilon = 1e-3);
        }
        assert_relative_eq!(p.modulation, m, epsilon = 1e-3);
        // Residual is bounded by the phase-grid quantization.
        assert!(p.residual / (i0 * i0) < 1e-4);
    }

    #[test]
    fn negative_amplitude_folds_into_phase() {
        // Data with phase π/2 + 0.2 presents as a negative amplitude at
        // phase 0.2; the fold must recover a positive modulation depth.
        let a = angles(8);
        let data = column(&a, 10.0, 0.5, FRAC_PI_2 + 0.2);
        let fits = fit_columns(&a, &[data], 1801).unwrap();
        let p = fits[0].params;

        assert!(p.modulation > 0.0);
        assert_relative_eq!(p.phase, 0.2 - FRAC_PI_2, epsilon = 1e-3);
    }

    #[test]
    fn nan_column_yields_nan_fit_without_error() {
        let a = angles(6);
        let mut data = column(&a, 1.0, 0.5, 0.1);
        data[3] = f64::NAN;
        let fits = fit_columns(&a, &[data], 181).unwrap();
        assert!(fits[0].params.phase.is_nan());
        assert!(fits[0].params.modulation.is_nan());
        assert!(fits[0].curve.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn zero_column_yields_nan_modulation() {
        let a = angles(6);
        let fits = fit_columns(&a, &[vec![0.0; 6]], 181).unwrap();
        assert_eq!(fits[0].params.i0, 0.0);
        assert!(fits[0].params.modulation.is_nan());
    }

    #[test]
    fn identical_angles_are_degenerate() {
        let a = vec![0.3; 5];
        let result = fit_columns(&a, &[vec![1.0; 5]], 181);
        assert!(matches!(result, Err(Error::DegenerateFit(_))));
    }

    #[test]
    fn columns_are_fit_independently() {
        let a = angles(8);
        let c1 = column(&a, 3.0, 0.2, 0.4);
        let c2 = column(&a, 7.0, 0.8, 1.1);
        let fits = fit_columns(&a, &[c1, c2], 1801).unwrap();
        assert_relative_eq!(fits[0].params.modulation, 0.2, epsilon = 1e-3);
        assert_relative_eq!(fits[1].params.modulation, 0.8, epsilon = 1e-3);
    }

    #[test]
    fn curve_matches_model_at_input_angles() {
        let a = angles(8);
        let data = column(&a, 2.0, 0.4, 0.7);
        let fits = fit_columns(&a, &[data.clone()], 1801).unwrap();
        for (got, want) in fits[0].curve.iter().zip(&data) {
            assert_relative_eq!(got, want, epsilon = 1e-2);
        }
    }
}
