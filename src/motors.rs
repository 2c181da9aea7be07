use crate::error::Error;

/// Synchronized motor positions for every camera frame.
///
/// One excitation and one emission polarizer angle is logged per frame,
/// together with a validity flag (frames taken while the shutter was closed
/// are marked invalid). The phase offset is a property of the optical path
/// and is applied to the excitation angle grid only; NaN means no offset is
/// known and no correction is applied.
///
/// How the log is parsed out of the instrument's text format is not this
/// crate's concern; the arrays arrive here ready-made.
#[derive(Clone, Debug)]
pub struct MotorLog {
    excitation: Vec<f64>,
    emission: Vec<f64>,
    valid: Vec<bool>,
    phase_offset_deg: f64,
}

impl MotorLog {
    /// Create a log from per-frame angle arrays (radians) and validity flags.
    pub fn new(
        excitation: Vec<f64>,
        emission: Vec<f64>,
        valid: Vec<bool>,
        phase_offset_deg: f64,
    ) -> Result<Self, Error> {
        if excitation.len() != emission.len() || excitation.len() != valid.len() {
            return Err(Error::InvalidInput(format!(
                "motor log arrays disagree in length: {} excitation, {} emission, {} validity",
                excitation.len(),
                emission.len(),
                valid.len()
            )));
        }

        Ok(Self {
            excitation,
            emission,
            valid,
            phase_offset_deg,
        })
    }

    /// Create a log where every frame is valid.
    pub fn with_all_valid(
        excitation: Vec<f64>,
        emission: Vec<f64>,
        phase_offset_deg: f64,
    ) -> Result<Self, Error> {
        let valid = vec![true; excitation.len()];
        Self::new(excitation, emission, valid, phase_offset_deg)
    }

    pub fn len(&self) -> usize {
        self.excitation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.excitation.is_empty()
    }

    pub fn excitation(&self) -> &[f64] {
        &self.excitation
    }

    pub fn emission(&self) -> &[f64] {
        &self.emission
    }

    pub fn valid(&self) -> &[bool] {
        &self.valid
    }

    pub fn phase_offset_deg(&self) -> f64 {
        self.phase_offset_deg
    }

    /// Phase offset in radians; an unknown (NaN) offset becomes zero.
    pub fn phase_offset_rad(&self) -> f64 {
        if self.phase_offset_deg.is_nan() {
            0.0
        } else {
            self.phase_offset_deg.to_radians()
        }
    }

    /// Sorted unique excitation angles over the valid frames.
    pub fn unique_excitation(&self) -> Vec<f64> {
        unique_sorted(&self.excitation)
    }

    /// Sorted unique emission angles over the valid frames.
    pub fn unique_emission(&self) -> Vec<f64> {
        unique_sorted(&self.emission)
    }

    /// Drop invalid frames, returning the filtered log and the indices of
    /// the frames that survived.
    pub(crate) fn retain_valid(&self) -> (MotorLog, Vec<usize>) {
        let kept: Vec<usize> = (0..self.len()).filter(|&i| self.valid[i]).collect();
        let log = MotorLog {
            excitation: kept.iter().map(|&i| self.excitation[i]).collect(),
            emission: kept.iter().map(|&i| self.emission[i]).collect(),
            valid: vec![true; kept.len()],
            phase_offset_deg: self.phase_offset_deg,
        };
        (log, kept)
    }
}

fn unique_sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("motor angles are never NaN"));
    sorted.dedup();
    sorted
}
