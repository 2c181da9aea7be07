//! End-to-end pipeline scenarios on synthetic noiseless movies.

use approx::assert_relative_eq;
use polim::settings::Settings;
use polim::spot::SpotProperty;
use polim::{FrameStack, MotorLog, Movie, SpotShape};

const ROWS: usize = 8;
const COLS: usize = 8;

/// Stepwise scan schedule: emission holds for one line while excitation
/// sweeps, `n_portraits` full sweeps in total.
fn schedule(n_ex: usize, n_em: usize, n_portraits: usize) -> (Vec<f64>, Vec<f64>) {
    let ex_step = std::f64::consts::PI / n_ex as f64;
    let em_step = std::f64::consts::PI / n_em as f64;
    let mut ex = Vec::new();
    let mut em = Vec::new();
    for _ in 0..n_portraits {
        for emi in 0..n_em {
            for exi in 0..n_ex {
                ex.push(exi as f64 * ex_step);
                em.push(emi as f64 * em_step);
            }
        }
    }
    (ex, em)
}

/// Noiseless separable cosine response of one emitter.
fn emitter(ex: f64, em: f64, i0: f64, m: f64, phase: f64) -> f64 {
    i0 * (1.0 + m * (2.0 * (ex - phase)).cos()) * (1.0 + m * (2.0 * (em - phase)).cos())
}

/// Frames with a bright emitter at rows/cols 1..=2, a dim one at 4..=5,
/// and a unit-spread background block at rows/cols 5..=6 of columns 5..=6.
fn build_frames(ex: &[f64], em: &[f64], bright_i0: f64, dim_i0: f64, m: f64, phase: f64) -> FrameStack {
    let mut data = Vec::with_capacity(ex.len() * ROWS * COLS);
    for fi in 0..ex.len() {
        let mut frame = vec![0.0; ROWS * COLS];
        for row in 1..=2 {
            for col in 1..=2 {
                frame[row * COLS + col] = emitter(ex[fi], em[fi], bright_i0, m, phase);
            }
        }
        for row in 4..=5 {
            for col in 0..=1 {
                frame[row * COLS + col] = emitter(ex[fi], em[fi], dim_i0, m, phase);
            }
        }
        // Alternating ±1 in the background block: per-frame mean 0, std 1.
        for (k, (row, col)) in [(5, 5), (5, 6), (6, 5), (6, 6)].into_iter().enumerate() {
            frame[row * COLS + col] = if k % 2 == 0 { 1.0 } else { -1.0 };
        }
        data.extend_from_slice(&frame);
    }
    FrameStack::from_frames(ROWS, COLS, data).unwrap()
}

fn settings() -> Settings {
    Settings {
        // Fine phase grids so recovery accuracy is limited by the data,
        // not the scan resolution.
        ex_phase_steps: 2001,
        em_phase_steps: 2001,
        ..Settings::default()
    }
}

fn bright_spot() -> SpotShape {
    SpotShape::Rectangle {
        left: 1,
        right: 2,
        upper: 1,
        lower: 2,
    }
}

fn dim_spot() -> SpotShape {
    SpotShape::Rectangle {
        left: 0,
        right: 1,
        upper: 4,
        lower: 5,
    }
}

fn background() -> SpotShape {
    SpotShape::Rectangle {
        left: 5,
        right: 6,
        upper: 5,
        lower: 6,
    }
}

#[test]
fn noiseless_movie_recovers_modulation_and_phase() {
    let (m, phase) = (0.6, 0.3);
    let (ex, em) = schedule(4, 3, 10);
    let frames = build_frames(&ex, &em, 50.0, 0.5, m, phase);
    let motors = MotorLog::with_all_valid(ex, em, 0.0).unwrap();

    let mut movie = Movie::new(frames, motors, settings()).unwrap();
    movie.define_background_spot(background()).unwrap();
    movie.define_spot(bright_spot(), "bright").unwrap();

    assert_eq!(movie.are_spots_valid(), 1);
    movie.fit_portraits().unwrap();
    movie.find_modulation().unwrap();

    let spot = movie.valid_spots().next().unwrap();
    assert_relative_eq!(spot.modulation_ex().depth, m, epsilon = 1e-3);
    assert_relative_eq!(spot.modulation_ex().phase, phase, epsilon = 1e-3);
    assert_relative_eq!(spot.modulation_em().depth, m, epsilon = 1e-3);
    assert_relative_eq!(spot.modulation_em().phase, phase, epsilon = 1e-3);
    // Excitation and emission were generated with the same phase.
    assert_relative_eq!(spot.line_shift(), 0.0, epsilon = 2e-3);
    // The total residual of a noiseless fit is tiny.
    assert!(spot.residual() < 1e-3 * 50.0 * 50.0);

    // Advanced anisotropy of a single cosine emitter:
    // (1.6 - 0.4) / (1.6 + 0.8) with M = 0.6.
    assert_relative_eq!(spot.property(SpotProperty::Anisotropy), 0.5, epsilon = 1e-2);
}

#[test]
fn low_snr_spot_is_excluded_and_leaves_holes() {
    let (ex, em) = schedule(4, 3, 10);
    let frames = build_frames(&ex, &em, 50.0, 0.5, 0.6, 0.3);
    let motors = MotorLog::with_all_valid(ex, em, 0.0).unwrap();

    let mut movie = Movie::new(frames, motors, settings()).unwrap();
    movie.define_background_spot(background()).unwrap();
    movie.define_spot(bright_spot(), "bright").unwrap();
    movie.define_spot(dim_spot(), "dim").unwrap();

    // The dim emitter never clears SNR 10 against the unit background.
    assert_eq!(movie.are_spots_valid(), 1);
    assert_eq!(movie.valid_indices(), &[0]);

    movie.fit_portraits().unwrap();
    movie.find_modulation().unwrap();

    let image = movie.images().property(SpotProperty::ModulationEx);
    assert_relative_eq!(image.get(1, 1), 0.6, epsilon = 1e-3);
    // Pixels of the discarded spot stay NaN.
    assert!(image.get(4, 0).is_nan());
    assert!(image.get(5, 1).is_nan());
}

#[test]
fn phase_offset_shifts_the_recovered_excitation_phase() {
    // The motor log reports excitation angles that already include the
    // instrument's phase offset; the grid carries the offset too, so the
    // recovered phase comes out in the offset frame.
    let offset_deg: f64 = 9.0;
    let offset = offset_deg.to_radians();
    let (ex_base, em) = schedule(4, 3, 6);
    let ex: Vec<f64> = ex_base
        .iter()
        .map(|a| (a + offset).rem_euclid(std::f64::consts::PI))
        .collect();

    let (m, phase) = (0.5, 0.4);
    let frames = build_frames(&ex, &em, 40.0, 0.0, m, phase);
    let motors = MotorLog::with_all_valid(ex, em, offset_deg).unwrap();

    let mut movie = Movie::new(frames, motors, settings()).unwrap();
    movie.define_spot(bright_spot(), "bright").unwrap();
    movie.are_spots_valid();
    movie.fit_portraits().unwrap();
    movie.find_modulation().unwrap();

    let spot = movie.valid_spots().next().unwrap();
    assert_relative_eq!(spot.modulation_ex().depth, m, epsilon = 1e-3);
    assert_relative_eq!(spot.modulation_ex().phase, phase, epsilon = 1e-3);
}

#[test]
fn export_carries_indices_grids_and_spots() {
    let (ex, em) = schedule(4, 3, 2);
    let frames = build_frames(&ex, &em, 50.0, 0.5, 0.6, 0.3);
    let motors = MotorLog::with_all_valid(ex, em, 0.0).unwrap();

    let mut movie = Movie::new(frames, motors, settings()).unwrap();
    movie.define_background_spot(background()).unwrap();
    movie.define_spot(bright_spot(), "bright").unwrap();
    movie.are_spots_valid();
    movie.fit_portraits().unwrap();
    movie.find_modulation().unwrap();

    let export = movie.export();
    assert_eq!(export.portrait_indices, vec![0, 12, 24]);
    assert_eq!(export.excitation_grid.len(), 4);
    assert_eq!(export.emission_grid.len(), 3);
    assert_eq!(export.line_frames.len(), 2);
    assert_eq!(export.line_frames[0].len(), 3);
    assert_eq!(export.spots.len(), 1);

    let spot = &export.spots[0];
    assert_eq!(spot.label, "bright");
    assert_eq!(spot.line_fits.rows(), 2);
    assert!(spot.average_portrait.is_some());
    assert!(
        spot.scalars
            .iter()
            .any(|(name, value)| name == "modulation_ex" && (value - 0.6).abs() < 1e-3)
    );
}

#[test]
fn invalid_frames_are_dropped_before_indexing() {
    // One full portrait plus a shutter-closed garbage frame in front.
    let (mut ex, mut em) = schedule(4, 3, 3);
    ex.insert(0, 0.123);
    em.insert(0, 0.456);
    let mut valid = vec![true; ex.len()];
    valid[0] = false;

    // Frames built for the valid schedule, with one garbage frame ahead.
    let (ex_valid, em_valid) = schedule(4, 3, 3);
    let clean = build_frames(&ex_valid, &em_valid, 50.0, 0.5, 0.6, 0.3);
    let mut data = vec![7.0; ROWS * COLS];
    for fi in 0..clean.frame_count() {
        data.extend_from_slice(clean.frame(fi));
    }
    let frames = FrameStack::from_frames(ROWS, COLS, data).unwrap();
    let motors = MotorLog::new(ex, em, valid, 0.0).unwrap();

    let mut movie = Movie::new(frames, motors, settings()).unwrap();
    assert_eq!(movie.portraits().portrait_count(), 3);
    assert_eq!(movie.motors().len(), 36);

    movie.define_spot(bright_spot(), "bright").unwrap();
    movie.are_spots_valid();
    movie.fit_portraits().unwrap();
    movie.find_modulation().unwrap();
    let spot = movie.valid_spots().next().unwrap();
    assert_relative_eq!(spot.modulation_ex().depth, 0.6, epsilon = 1e-3);
}
