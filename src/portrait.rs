use crate::error::Error;
use crate::motors::MotorLog;

/// Emission angles are compared after rounding to two decimals; motor
/// repositioning jitter stays well below that.
fn round_two_decimals(angle: f64) -> f64 {
    (angle * 100.0).round() / 100.0
}

/// One line of a portrait: the frames sharing a single emission angle.
#[derive(Clone, Debug)]
pub struct LineIndex {
    /// Absolute frame indices belonging to this line.
    frames: Vec<usize>,
    /// Excitation angle of every frame in the line.
    excitation: Vec<f64>,
    /// The emission angle shared by the whole line.
    emission: f64,
}

impl LineIndex {
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn excitation(&self) -> &[f64] {
        &self.excitation
    }

    pub fn emission(&self) -> f64 {
        self.emission
    }
}

/// Index structures partitioning the frame timeline into portraits and
/// lines.
///
/// A portrait is one full sweep through every excitation×emission angle
/// combination; a line is the run of frames inside a portrait sharing one
/// emission angle. Boundaries are found by edge detection on the rounded
/// emission angle sequence. The first frame always belongs to portrait 0
/// even though the edge detector cannot vouch for it. A trailing stretch of
/// frames shorter than one full portrait is dropped.
#[derive(Clone, Debug)]
pub struct PortraitIndexer {
    /// Frame offsets of portrait boundaries, length `portrait_count() + 1`.
    portrait_indices: Vec<usize>,
    /// Per portrait, the lines ordered by ascending emission angle.
    lines: Vec<Vec<LineIndex>>,
    n_lines: usize,
}

impl PortraitIndexer {
    pub fn new(motors: &MotorLog) -> Result<Self, Error> {
        let emission: Vec<f64> = motors.emission().iter().copied().map(round_two_decimals).collect();
        let n_frames = emission.len();
        if n_frames == 0 {
            return Err(Error::NoPortraits);
        }

        let n_lines = {
            let mut unique = emission.clone();
            unique.sort_by(|a, b| a.partial_cmp(b).expect("rounded angles are never NaN"));
            unique.dedup();
            unique.len()
        };

        // Edge detection: every change of the rounded emission angle starts
        // a new line. Frame 0 is forced in as a run start; the diff view
        // cannot tell it apart from a boundary artifact, but it is data.
        let mut edges = vec![0usize];
        for i in 1..n_frames {
            if emission[i] != emission[i - 1] {
                edges.push(i);
            }
        }
        edges.push(n_frames);

        let n_runs = edges.len() - 1;
        let n_portraits = n_runs / n_lines;
        if n_portraits == 0 {
            return Err(Error::NoPortraits);
        }

        // Runs beyond the last complete portrait are an incomplete trailing
        // sweep and are dropped without comment.
        let portrait_indices: Vec<usize> = (0..=n_portraits).map(|p| edges[p * n_lines]).collect();

        let mut lines = Vec::with_capacity(n_portraits);
        for pi in 0..n_portraits {
            lines.push(index_lines(
                motors,
                &emission,
                portrait_indices[pi],
                portrait_indices[pi + 1],
                pi,
                n_lines,
            )?);
        }

        Ok(Self {
            portrait_indices,
            lines,
            n_lines,
        })
    }

    pub fn portrait_count(&self) -> usize {
        self.portrait_indices.len() - 1
    }

    pub fn line_count(&self) -> usize {
        self.n_lines
    }

    pub fn portrait_indices(&self) -> &[usize] {
        &self.portrait_indices
    }

    pub fn line(&self, portrait: usize, line: usize) -> &LineIndex {
        &self.lines[portrait][line]
    }

    pub fn lines(&self, portrait: usize) -> &[LineIndex] {
        &self.lines[portrait]
    }

    /// Line-center emission angles, one per line (identical across
    /// portraits by construction).
    pub fn line_emission_angles(&self) -> Vec<f64> {
        self.lines[0].iter().map(|l| l.emission()).collect()
    }
}

fn index_lines(
    motors: &MotorLog,
    rounded_emission: &[f64],
    start: usize,
    stop: usize,
    portrait: usize,
    expected_lines: usize,
) -> Result<Vec<LineIndex>, Error> {
    let span = &rounded_emission[start..stop];
    let mut unique: Vec<f64> = span.to_vec();
    unique.sort_by(|a, b| a.partial_cmp(b).expect("rounded angles are never NaN"));
    unique.dedup();

    if unique.len() != expected_lines {
        return Err(Error::LineCountMismatch {
            portrait,
            expected: expected_lines,
            found: unique.len(),
        });
    }

    let lines = unique
        .into_iter()
        .map(|line_angle| {
            let frames: Vec<usize> = (start..stop)
                .filter(|&fi| rounded_emission[fi] == line_angle)
                .collect();
            // All members of a line share the emission angle exactly after
            // rounding; anything else is a broken scan schedule.
            debug_assert!(frames.iter().all(|&fi| rounded_emission[fi] == line_angle));
            let excitation = frames.iter().map(|&fi| motors.excitation()[fi]).collect();
            let emission = motors.emission()[frames[0]];
            LineIndex {
                frames,
                excitation,
                emission,
            }
        })
        .collect();

    Ok(lines)
}
