use crate::spot::{Spot, SpotProperty};
use strum::{EnumCount, IntoEnumIterator};

/// Sentinel marking background-region pixels in the coverage image.
pub const COVERAGE_BACKGROUND: f64 = -1.0;
/// Marker for pixels belonging to a valid spot in the coverage image.
pub const COVERAGE_VALID_SPOT: f64 = 1.0;

/// A camera-shaped scalar image.
///
/// Pixels start as NaN and are overwritten as spots report values; holes in
/// the final image are how per-spot soft failures surface to the user.
#[derive(Clone, Debug)]
pub struct ContrastImage {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl ContrastImage {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![f64::NAN; rows * cols],
        }
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Overwrite every listed pixel with `value`.
    pub(crate) fn scatter(&mut self, pixels: &[(usize, usize)], value: f64) {
        for &(row, col) in pixels {
            self.data[row * self.cols + col] = value;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.data.fill(f64::NAN);
    }
}

/// One contrast image per derived spot property, plus the coverage image.
#[derive(Clone, Debug)]
pub struct ContrastImageSet {
    coverage: ContrastImage,
    images: Vec<ContrastImage>,
}

impl ContrastImageSet {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            coverage: ContrastImage::new(rows, cols),
            images: (0..SpotProperty::COUNT)
                .map(|_| ContrastImage::new(rows, cols))
                .collect(),
        }
    }

    pub fn coverage(&self) -> &ContrastImage {
        &self.coverage
    }

    pub(crate) fn coverage_mut(&mut self) -> &mut ContrastImage {
        &mut self.coverage
    }

    pub fn property(&self, property: SpotProperty) -> &ContrastImage {
        &self.images[property as usize]
    }

    /// Rebuild every property image from the given spots. Properties a spot
    /// has not been assigned yet stay NaN on its pixels.
    pub(crate) fn rebuild(&mut self, spots: &[Spot], indices: &[usize]) {
        for image in &mut self.images {
            image.clear();
        }
        for &si in indices {
            let spot = &spots[si];
            for property in SpotProperty::iter() {
                let value = spot.property(property);
                self.images[property as usize].scatter(spot.pixels(), value);
            }
        }
    }
}
