#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tunable parameters of the analysis pipeline.
///
/// The defaults reproduce the values used on the instrument. The phase step
/// counts trade accuracy against speed; 181 steps give half-degree phase
/// resolution. Reduce them if the analysis runs too slowly.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Settings {
    /// Number of candidate phases scanned by the cosine fitter along the
    /// excitation axis.
    pub ex_phase_steps: usize,

    /// Number of candidate phases scanned along the emission axis.
    pub em_phase_steps: usize,

    /// Per-frame SNR a spot must reach for the frame to count as valid.
    pub snr_threshold: f64,

    /// Fraction of frames that must pass the SNR threshold before a spot
    /// enters the valid set.
    pub valid_frames_ratio: f64,

    pub ruler: RulerSettings,
    pub funnel: FunnelSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ex_phase_steps: 181,
            em_phase_steps: 181,
            snr_threshold: 10.0,
            valid_frames_ratio: 0.7,
            ruler: RulerSettings::default(),
            funnel: FunnelSettings::default(),
        }
    }
}

/// Parameters of the FFT energy-transfer ruler.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RulerSettings {
    /// Excitation-grid steps advanced per resampled point. The emission
    /// axis always advances one step per point.
    pub slope: usize,

    /// Length of the resampled 1D signal fed to the FFT.
    pub data_length: usize,

    /// Allowed deviation of the summed harmonic-peak power from unity.
    /// Spectra outside the window are unusable and yield a NaN ruler.
    pub peak_tolerance: f64,

    /// Slack outside [0, 1] before a raw ruler value is logged as suspect.
    pub clamp_slack: f64,
}

impl Default for RulerSettings {
    fn default() -> Self {
        Self {
            slope: 7,
            data_length: 1024,
            peak_tolerance: 0.08,
            clamp_slack: 0.1,
        }
    }
}

/// Convergence controls of the bounded funnel-model fit.
///
/// The tolerances were chosen empirically on instrument data; they are
/// exposed here rather than hard-coded.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FunnelSettings {
    /// Relative objective decrease (in units of machine epsilon) below
    /// which the iteration stops.
    pub factr: f64,

    /// Largest projected-gradient component accepted as converged.
    pub pg_tolerance: f64,

    /// Step used by the finite-difference gradient.
    pub gradient_step: f64,

    /// Hard cap on quasi-Newton iterations.
    pub max_iterations: usize,
}

impl Default for FunnelSettings {
    fn default() -> Self {
        Self {
            factr: 1e4,
            pg_tolerance: 1e-9,
            gradient_step: 1e-8,
            max_iterations: 500,
        }
    }
}
