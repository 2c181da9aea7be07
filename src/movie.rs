//! The movie aggregate: one recorded measurement and everything derived
//! from it.

use crate::camera::FrameStack;
use crate::distributor::{self, StagePlan};
use crate::error::Error;
use crate::fit::funnel::et_model_stage;
use crate::grid::AngleGrid;
use crate::image::{COVERAGE_BACKGROUND, COVERAGE_VALID_SPOT, ContrastImageSet};
use crate::motors::MotorLog;
use crate::portrait::PortraitIndexer;
use crate::settings::Settings;
use crate::spot::{BackgroundReference, FitGrid, Spot, SpotProperty, SpotShape};
use crate::{engine, etruler, modulation};
use log::{debug, info};
use strum::IntoEnumIterator;

/// Read-only inputs shared by every analysis stage and every worker.
pub(crate) struct Context {
    pub(crate) settings: Settings,
    pub(crate) grid: AngleGrid,
    pub(crate) portraits: PortraitIndexer,
}

/// A 2D-POLIM measurement under analysis.
///
/// Construction wires the frame stack to the motor log: invalid frames are
/// dropped from both, the angle grids are derived and validated, and the
/// frame timeline is partitioned into portraits and lines. Spots are then
/// defined on top and pushed through the pipeline stages in dependency
/// order, either directly or through [`Movie::run`].
pub struct Movie {
    ctx: Context,
    frames: FrameStack,
    motors: MotorLog,
    blank: Option<Vec<f64>>,
    background: Option<BackgroundReference>,
    spots: Vec<Spot>,
    valid: Vec<usize>,
    images: ContrastImageSet,
    mean_frame: Vec<f64>,
}

impl Movie {
    pub fn new(frames: FrameStack, motors: MotorLog, settings: Settings) -> Result<Self, Error> {
        if frames.frame_count() != motors.len() {
            return Err(Error::InvalidInput(format!(
                "{} camera frames but {} motor log entries",
                frames.frame_count(),
                motors.len()
            )));
        }

        // Shutter-closed frames carry no signal; drop them from both sides
        // so every remaining frame index means the same thing everywhere.
        let (motors, kept) = motors.retain_valid();
        let frames = if kept.len() == frames.frame_count() {
            frames
        } else {
            debug!(
                "dropping {} invalid frames",
                frames.frame_count() - kept.len()
            );
            frames.select_frames(&kept)
        };

        let grid = AngleGrid::from_motor_log(&motors)?;
        let portraits = PortraitIndexer::new(&motors)?;
        info!(
            "indexed {} portraits of {} lines",
            portraits.portrait_count(),
            portraits.line_count()
        );

        let (rows, cols) = frames.dimensions();
        let mean_frame = frames.mean_frame();

        Ok(Self {
            ctx: Context {
                settings,
                grid,
                portraits,
            },
            frames,
            motors,
            blank: None,
            background: None,
            spots: Vec::new(),
            valid: Vec::new(),
            images: ContrastImageSet::new(rows, cols),
            mean_frame,
        })
    }

    /// Attach a blank (no-sample) recording. Its frames collapse into one
    /// mean frame that is subtracted from every spot's intensity. Must
    /// happen before any spot is defined.
    pub fn set_blank(&mut self, blank: &FrameStack) -> Result<(), Error> {
        if blank.dimensions() != self.frames.dimensions() {
            return Err(Error::InvalidInput(
                "blank frames do not match the sample frame shape".into(),
            ));
        }
        if !self.spots.is_empty() || self.background.is_some() {
            return Err(Error::InvalidInput(
                "the blank must be attached before spots are defined".into(),
            ));
        }
        self.blank = Some(blank.mean_frame());
        Ok(())
    }

    /// Define the background region. Must precede every sample spot, since
    /// spot intensities are corrected against it at definition time.
    pub fn define_background_spot(&mut self, shape: SpotShape) -> Result<(), Error> {
        if !self.spots.is_empty() {
            return Err(Error::BackgroundAfterSpots);
        }
        let (rows, cols) = self.frames.dimensions();
        let pixels = shape.pixels(rows, cols)?;
        self.background = Some(BackgroundReference::new(
            &self.frames,
            &pixels,
            self.blank.as_deref(),
        ));
        self.images
            .coverage_mut()
            .scatter(&pixels, COVERAGE_BACKGROUND);
        Ok(())
    }

    /// Define a sample spot and collect its corrected intensity series.
    /// Returns the spot's index.
    pub fn define_spot(
        &mut self,
        shape: SpotShape,
        label: impl Into<String>,
    ) -> Result<usize, Error> {
        let (rows, cols) = self.frames.dimensions();
        let mut spot = Spot::new(shape, label, rows, cols)?;
        spot.collect_intensity(&self.frames, self.blank.as_deref(), self.background.as_ref());
        self.spots.push(spot);
        Ok(self.spots.len() - 1)
    }

    /// Apply the SNR criterion to every spot and build the valid-spot set.
    ///
    /// Per-frame SNR is the corrected intensity over the background spread;
    /// without a background region it is infinite and every spot passes. A
    /// spot is valid when enough frames clear the threshold. Returns the
    /// number of valid spots.
    pub fn are_spots_valid(&mut self) -> usize {
        let threshold = self.ctx.settings.snr_threshold;
        let ratio = self.ctx.settings.valid_frames_ratio;
        let spread = self
            .background
            .as_ref()
            .map(|bg| bg.std.clone())
            .filter(|std| std.iter().all(|&s| s != 0.0));

        self.valid.clear();
        for (si, spot) in self.spots.iter_mut().enumerate() {
            spot.snr = match &spread {
                Some(std) => spot
                    .intensity
                    .iter()
                    .zip(std)
                    .map(|(value, s)| (value / s).abs())
                    .collect(),
                None => vec![f64::INFINITY; spot.intensity.len()],
            };
            spot.frame_count_snr = spot.snr.iter().filter(|&&snr| snr > threshold).count();
            spot.mean_snr = spot.snr.iter().sum::<f64>() / spot.snr.len().max(1) as f64;

            if spot.frame_count_snr as f64 >= ratio * spot.snr.len() as f64 {
                self.valid.push(si);
            }
        }

        for &si in &self.valid {
            let pixels: Vec<(usize, usize)> = self.spots[si].pixels().to_vec();
            self.images
                .coverage_mut()
                .scatter(&pixels, COVERAGE_VALID_SPOT);
        }

        info!(
            "got {} valid spots (of {} spots total)",
            self.valid.len(),
            self.spots.len()
        );
        self.valid.len()
    }

    /// Stage 1: two-stage portrait fitting over the valid spots.
    pub fn fit_portraits(&mut self) -> Result<(), Error> {
        engine::fit_portraits(&self.ctx, &mut self.spots, &self.valid)?;
        self.update_images();
        Ok(())
    }

    /// Stage 2: modulation depths, phases, line shift and anisotropy.
    pub fn find_modulation(&mut self) -> Result<(), Error> {
        modulation::find_modulation(&self.ctx, &mut self.spots, &self.valid)?;
        self.update_images();
        Ok(())
    }

    /// Stage 3: FFT energy-transfer ruler.
    pub fn et_ruler(&mut self) -> Result<(), Error> {
        etruler::et_ruler_stage(&self.ctx, &mut self.spots, &self.valid)?;
        self.update_images();
        Ok(())
    }

    /// Stage 4: bounded funnel-model fit.
    pub fn et_model(&mut self) -> Result<(), Error> {
        et_model_stage(&self.ctx, &mut self.spots, &self.valid)?;
        self.update_images();
        Ok(())
    }

    /// Run the enabled stages over all valid spots on `workers` parallel
    /// workers, merge the results and refresh the contrast images.
    pub fn run(&mut self, workers: usize, plan: StagePlan) -> Result<(), Error> {
        distributor::run(&self.ctx, &mut self.spots, &self.valid, workers, plan)?;
        self.update_images();
        info!("movie: all done");
        Ok(())
    }

    /// Rewrite every contrast image from the current spot state.
    pub fn update_images(&mut self) {
        self.images.rebuild(&self.spots, &self.valid);
    }

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub fn grid(&self) -> &AngleGrid {
        &self.ctx.grid
    }

    pub fn portraits(&self) -> &PortraitIndexer {
        &self.ctx.portraits
    }

    pub fn motors(&self) -> &MotorLog {
        &self.motors
    }

    pub fn spots(&self) -> &[Spot] {
        &self.spots
    }

    /// Indices of the spots that passed [`Movie::are_spots_valid`].
    pub fn valid_indices(&self) -> &[usize] {
        &self.valid
    }

    pub fn valid_spots(&self) -> impl Iterator<Item = &Spot> {
        self.valid.iter().map(|&si| &self.spots[si])
    }

    pub fn images(&self) -> &ContrastImageSet {
        &self.images
    }

    /// Mean intensity over all frames, camera-shaped.
    pub fn mean_frame(&self) -> &[f64] {
        &self.mean_frame
    }

    /// Everything the persistence collaborator serializes.
    pub fn export(&self) -> AnalysisExport {
        AnalysisExport {
            portrait_indices: self.ctx.portraits.portrait_indices().to_vec(),
            line_frames: (0..self.ctx.portraits.portrait_count())
                .map(|pi| {
                    self.ctx
                        .portraits
                        .lines(pi)
                        .iter()
                        .map(|line| line.frames().to_vec())
                        .collect()
                })
                .collect(),
            excitation_grid: self.ctx.grid.excitation().to_vec(),
            emission_grid: self.ctx.grid.emission().to_vec(),
            spots: self.valid_spots().map(SpotExport::from).collect(),
        }
    }
}

/// Serializable snapshot of an analysis run.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AnalysisExport {
    pub portrait_indices: Vec<usize>,
    /// Per portrait, per line, the absolute frame indices of the line.
    pub line_frames: Vec<Vec<Vec<usize>>>,
    pub excitation_grid: Vec<f64>,
    pub emission_grid: Vec<f64>,
    pub spots: Vec<SpotExport>,
}

/// Per-spot export record.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SpotExport {
    pub label: String,
    pub pixels: Vec<(usize, usize)>,
    pub intensity: Vec<f64>,
    pub snr: Vec<f64>,
    pub line_fits: FitGrid,
    pub vertical_fits: FitGrid,
    pub residual: f64,
    /// Average portrait as rows over the emission grid.
    pub average_portrait: Option<Vec<Vec<f64>>>,
    /// Every derived scalar under its snake_case property name.
    pub scalars: Vec<(String, f64)>,
}

impl From<&Spot> for SpotExport {
    fn from(spot: &Spot) -> Self {
        Self {
            label: spot.label().to_string(),
            pixels: spot.pixels().to_vec(),
            intensity: spot.intensity().to_vec(),
            snr: spot.snr().to_vec(),
            line_fits: spot.line_fits().clone(),
            vertical_fits: spot.vertical_fits().clone(),
            residual: spot.residual(),
            average_portrait: spot
                .average_portrait()
                .map(|sam| sam.row_iter().map(|row| row.iter().copied().collect()).collect()),
            scalars: SpotProperty::iter()
                .map(|property| (property.to_string(), spot.property(property)))
                .collect(),
        }
    }
}
