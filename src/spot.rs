use crate::camera::FrameStack;
use crate::error::Error;
use crate::fit::cosine::CosineFit;
use crate::fit::funnel::FunnelFit;
use crate::portrait::LineIndex;
use nalgebra::DMatrix;
use strum::{Display, EnumCount, EnumIter};

/// Region-of-interest geometry.
///
/// Each variant carries its own typed parameters and resolves to an
/// explicit pixel list; nothing downstream cares which variant a spot
/// started as.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpotShape {
    /// Axis-aligned rectangle, all four edges inclusive. `upper` is the
    /// smaller row index (towards the top of the image).
    Rectangle {
        left: usize,
        right: usize,
        upper: usize,
        lower: usize,
    },
    /// All pixels within `radius` of the center, given as (row, col).
    Circle { center: (usize, usize), radius: f64 },
    /// An explicit list of (row, col) pixels.
    PixelList(Vec<(usize, usize)>),
}

impl SpotShape {
    /// Resolve the shape into pixel coordinates within a rows×cols frame.
    pub fn pixels(&self, rows: usize, cols: usize) -> Result<Vec<(usize, usize)>, Error> {
        match self {
            SpotShape::Rectangle {
                left,
                right,
                upper,
                lower,
            } => {
                if lower < upper || right < left {
                    return Err(Error::InvalidInput(format!(
                        "rectangle edges are inverted: rows {upper}..{lower}, cols {left}..{right}"
                    )));
                }
                if *lower >= rows || *right >= cols {
                    return Err(Error::InvalidInput(format!(
                        "rectangle {upper}..{lower} x {left}..{right} exceeds the {rows}x{cols} frame"
                    )));
                }
                let mut pixels = Vec::with_capacity((lower - upper + 1) * (right - left + 1));
                for row in *upper..=*lower {
                    for col in *left..=*right {
                        pixels.push((row, col));
                    }
                }
                Ok(pixels)
            }
            SpotShape::Circle { center, radius } => {
                let (crow, ccol) = *center;
                if crow >= rows || ccol >= cols {
                    return Err(Error::InvalidInput(format!(
                        "circle center ({crow}, {ccol}) outside the {rows}x{cols} frame"
                    )));
                }
                let r = radius.max(0.0);
                let r2 = r * r;
                let span = r.ceil() as usize;
                let mut pixels = Vec::new();
                for row in crow.saturating_sub(span)..rows.min(crow + span + 1) {
                    for col in ccol.saturating_sub(span)..cols.min(ccol + span + 1) {
                        let dr = row as f64 - crow as f64;
                        let dc = col as f64 - ccol as f64;
                        if dr * dr + dc * dc <= r2 {
                            pixels.push((row, col));
                        }
                    }
                }
                Ok(pixels)
            }
            SpotShape::PixelList(list) => {
                if list.is_empty() {
                    return Err(Error::InvalidInput("empty pixel list".into()));
                }
                let mut pixels = Vec::with_capacity(list.len());
                for &(row, col) in list {
                    if row >= rows || col >= cols {
                        return Err(Error::InvalidInput(format!(
                            "pixel ({row}, {col}) outside the {rows}x{cols} frame"
                        )));
                    }
                    if !pixels.contains(&(row, col)) {
                        pixels.push((row, col));
                    }
                }
                Ok(pixels)
            }
        }
    }
}

/// Cosine-fit parameter grid, one cell per (portrait, line) or
/// (portrait, excitation-grid angle) pair.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FitGrid {
    rows: usize,
    cols: usize,
    cells: Vec<CosineFit>,
}

impl FitGrid {
    pub(crate) fn empty() -> Self {
        Self {
            rows: 0,
            cols: 0,
            cells: Vec::new(),
        }
    }

    pub(crate) fn filled(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![CosineFit::NAN; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> &CosineFit {
        &self.cells[row * self.cols + col]
    }

    pub(crate) fn set(&mut self, row: usize, col: usize, fit: CosineFit) {
        self.cells[row * self.cols + col] = fit;
    }

    pub fn residual_sum(&self) -> f64 {
        self.cells.iter().map(|c| c.residual).sum()
    }
}

/// One axis of the modulation analysis: depth, phase, mean intensity and
/// fit residual of the marginal cosine fit.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Modulation {
    pub depth: f64,
    pub phase: f64,
    pub intensity: f64,
    pub residual: f64,
}

impl Modulation {
    pub const NAN: Modulation = Modulation {
        depth: f64::NAN,
        phase: f64::NAN,
        intensity: f64::NAN,
        residual: f64::NAN,
    };
}

/// The closed set of per-spot scalars that can be scattered into contrast
/// images. Replaces ad-hoc string keys with something the compiler checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumCount, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpotProperty {
    MeanIntensity,
    MeanSnr,
    FrameCountSnr,
    ModulationEx,
    ModulationEm,
    PhaseEx,
    PhaseEm,
    LineShift,
    Anisotropy,
    AnisotropyNormal,
    EtRuler,
    FunnelDepth,
    FunnelPhase,
    FunnelGeometricRatio,
    EtFraction,
    FunnelResidual,
}

/// A region of interest tracked through the whole pipeline.
///
/// Created when the region is defined, then mutated in place by each
/// analysis stage; all derived scalars start as NaN and stay NaN until
/// their stage has run (or forever, if the stage could not compute them).
#[derive(Clone, Debug)]
pub struct Spot {
    shape: SpotShape,
    label: String,
    pixels: Vec<(usize, usize)>,

    /// Background/blank-corrected intensity, one value per frame.
    pub(crate) intensity: Vec<f64>,
    pub(crate) mean_intensity: f64,

    pub(crate) snr: Vec<f64>,
    pub(crate) mean_snr: f64,
    pub(crate) frame_count_snr: usize,

    pub(crate) line_fits: FitGrid,
    pub(crate) vertical_fits: FitGrid,
    pub(crate) residual: f64,

    /// Reconstructed average portrait, emission angles × excitation angles.
    pub(crate) sam: Option<DMatrix<f64>>,
    pub(crate) modulation_ex: Modulation,
    pub(crate) modulation_em: Modulation,
    pub(crate) line_shift: f64,
    pub(crate) anisotropy: f64,
    pub(crate) anisotropy_normal: f64,

    pub(crate) et_ruler: f64,
    pub(crate) et_model: FunnelFit,
}

impl Spot {
    pub(crate) fn new(
        shape: SpotShape,
        label: impl Into<String>,
        rows: usize,
        cols: usize,
    ) -> Result<Self, Error> {
        let pixels = shape.pixels(rows, cols)?;
        Ok(Self {
            shape,
            label: label.into(),
            pixels,
            intensity: Vec::new(),
            mean_intensity: f64::NAN,
            snr: Vec::new(),
            mean_snr: f64::NAN,
            frame_count_snr: 0,
            line_fits: FitGrid::empty(),
            vertical_fits: FitGrid::empty(),
            residual: f64::NAN,
            sam: None,
            modulation_ex: Modulation::NAN,
            modulation_em: Modulation::NAN,
            line_shift: f64::NAN,
            anisotropy: f64::NAN,
            anisotropy_normal: f64::NAN,
            et_ruler: f64::NAN,
            et_model: FunnelFit::NAN,
        })
    }

    pub fn shape(&self) -> &SpotShape {
        &self.shape
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pixels(&self) -> &[(usize, usize)] {
        &self.pixels
    }

    pub fn intensity(&self) -> &[f64] {
        &self.intensity
    }

    pub fn snr(&self) -> &[f64] {
        &self.snr
    }

    pub fn line_fits(&self) -> &FitGrid {
        &self.line_fits
    }

    pub fn vertical_fits(&self) -> &FitGrid {
        &self.vertical_fits
    }

    pub fn residual(&self) -> f64 {
        self.residual
    }

    /// Reconstructed average portrait matrix, if the modulation stage ran.
    pub fn average_portrait(&self) -> Option<&DMatrix<f64>> {
        self.sam.as_ref()
    }

    pub fn modulation_ex(&self) -> Modulation {
        self.modulation_ex
    }

    pub fn modulation_em(&self) -> Modulation {
        self.modulation_em
    }

    pub fn line_shift(&self) -> f64 {
        self.line_shift
    }

    pub fn et_ruler(&self) -> f64 {
        self.et_ruler
    }

    pub fn et_model(&self) -> FunnelFit {
        self.et_model
    }

    /// Value of one derived scalar, NaN while unassigned.
    pub fn property(&self, property: SpotProperty) -> f64 {
        match property {
            SpotProperty::MeanIntensity => self.mean_intensity,
            SpotProperty::MeanSnr => self.mean_snr,
            SpotProperty::FrameCountSnr => self.frame_count_snr as f64,
            SpotProperty::ModulationEx => self.modulation_ex.depth,
            SpotProperty::ModulationEm => self.modulation_em.depth,
            SpotProperty::PhaseEx => self.modulation_ex.phase,
            SpotProperty::PhaseEm => self.modulation_em.phase,
            SpotProperty::LineShift => self.line_shift,
            SpotProperty::Anisotropy => self.anisotropy,
            SpotProperty::AnisotropyNormal => self.anisotropy_normal,
            SpotProperty::EtRuler => self.et_ruler,
            SpotProperty::FunnelDepth => self.et_model.depth,
            SpotProperty::FunnelPhase => self.et_model.phase,
            SpotProperty::FunnelGeometricRatio => self.et_model.geometric_ratio,
            SpotProperty::EtFraction => self.et_model.et_fraction,
            SpotProperty::FunnelResidual => self.et_model.residual,
        }
    }

    /// The spot's corrected intensity over the frames of one line.
    pub fn line_intensity(&self, line: &LineIndex) -> Vec<f64> {
        line.frames().iter().map(|&fi| self.intensity[fi]).collect()
    }

    /// Aggregate raw frames into the corrected per-frame intensity series.
    pub(crate) fn collect_intensity(
        &mut self,
        frames: &FrameStack,
        blank: Option<&[f64]>,
        background: Option<&BackgroundReference>,
    ) {
        let raw = pixel_mean_series(frames, &self.pixels);
        let spot_blank = blank.map_or(0.0, |b| pixel_mean(b, frames.dimensions().1, &self.pixels));
        let bg_blank = background.map_or(0.0, |b| b.blank_mean);

        self.intensity = raw
            .iter()
            .enumerate()
            .map(|(fi, &value)| {
                let bg = background.map_or(0.0, |b| b.mean[fi]);
                value - spot_blank - (bg - bg_blank)
            })
            .collect();
        self.mean_intensity =
            self.intensity.iter().sum::<f64>() / self.intensity.len().max(1) as f64;
    }
}

/// Per-frame mean and spread of a background region, plus its level in the
/// collapsed blank frame. The spread is what SNR validation divides by.
#[derive(Clone, Debug)]
pub struct BackgroundReference {
    pub(crate) mean: Vec<f64>,
    pub(crate) std: Vec<f64>,
    pub(crate) blank_mean: f64,
}

impl BackgroundReference {
    pub(crate) fn new(
        frames: &FrameStack,
        pixels: &[(usize, usize)],
        blank: Option<&[f64]>,
    ) -> Self {
        let cols = frames.dimensions().1;
        let n = pixels.len().max(1) as f64;
        let mut mean = Vec::with_capacity(frames.frame_count());
        let mut std = Vec::with_capacity(frames.frame_count());
        for fi in 0..frames.frame_count() {
            let frame = frames.frame(fi);
            let values: Vec<f64> = pixels.iter().map(|&(r, c)| frame[r * cols + c]).collect();
            let m = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / n;
            mean.push(m);
            std.push(var.sqrt());
        }
        let blank_mean = blank.map_or(0.0, |b| pixel_mean(b, cols, pixels));
        Self {
            mean,
            std,
            blank_mean,
        }
    }
}

fn pixel_mean(frame: &[f64], cols: usize, pixels: &[(usize, usize)]) -> f64 {
    pixels
        .iter()
        .map(|&(r, c)| frame[r * cols + c])
        .sum::<f64>()
        / pixels.len().max(1) as f64
}

fn pixel_mean_series(frames: &FrameStack, pixels: &[(usize, usize)]) -> Vec<f64> {
    let cols = frames.dimensions().1;
    (0..frames.frame_count())
        .map(|fi| pixel_mean(frames.frame(fi), cols, pixels))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    #[test]
    fn rectangle_includes_its_edges() {
        let shape = SpotShape::Rectangle {
            left: 1,
            right: 2,
            upper: 0,
            lower: 1,
        };
        let pixels = shape.pixels(4, 4).unwrap();
        assert_eq!(pixels, vec![(0, 1), (0, 2), (1, 1), (1, 2)]);
    }

    #[rstest]
    #[case(SpotShape::Rectangle { left: 2, right: 1, upper: 0, lower: 1 })]
    #[case(SpotShape::Rectangle { left: 0, right: 5, upper: 0, lower: 1 })]
    #[case(SpotShape::Circle { center: (9, 0), radius: 1.0 })]
    #[case(SpotShape::PixelList(vec![]))]
    fn bad_shapes_are_rejected(#[case] shape: SpotShape) {
        assert!(shape.pixels(4, 4).is_err());
    }

    #[test]
    fn circle_covers_center_cross() {
        let shape = SpotShape::Circle {
            center: (2, 2),
            radius: 1.0,
        };
        let mut pixels = shape.pixels(5, 5).unwrap();
        pixels.sort();
        assert_eq!(pixels, vec![(1, 2), (2, 1), (2, 2), (2, 3), (3, 2)]);
    }

    #[test]
    fn pixel_list_drops_duplicates() {
        let shape = SpotShape::PixelList(vec![(0, 0), (1, 1), (0, 0)]);
        assert_eq!(shape.pixels(2, 2).unwrap().len(), 2);
    }

    #[test]
    fn intensity_is_background_corrected() {
        // 1x2 frames: spot pixel carries signal+bg, bg pixel carries bg.
        let data = vec![11.0, 1.0, 22.0, 2.0];
        let frames = FrameStack::from_frames(1, 2, data).unwrap();
        let bg = BackgroundReference::new(&frames, &[(0, 1)], None);

        let mut spot = Spot::new(SpotShape::PixelList(vec![(0, 0)]), "", 1, 2).unwrap();
        spot.collect_intensity(&frames, None, Some(&bg));
        assert_relative_eq!(spot.intensity()[0], 10.0);
        assert_relative_eq!(spot.intensity()[1], 20.0);
        assert_relative_eq!(spot.mean_intensity, 15.0);
    }

    #[test]
    fn every_property_starts_nan_or_zero() {
        let spot = Spot::new(SpotShape::PixelList(vec![(0, 0)]), "", 1, 1).unwrap();
        for property in SpotProperty::iter() {
            let value = spot.property(property);
            assert!(
                value.is_nan() || value == 0.0,
                "{property} started as {value}"
            );
        }
    }

    #[test]
    fn property_names_serialize_to_snake_case() {
        assert_eq!(SpotProperty::ModulationEx.to_string(), "modulation_ex");
        assert_eq!(SpotProperty::EtRuler.to_string(), "et_ruler");
    }
}
