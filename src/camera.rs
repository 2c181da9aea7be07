use crate::error::Error;
use chrono::{DateTime, TimeZone, Utc};

/// A stack of camera frames.
///
/// Holds the per-frame pixel intensities of a recorded movie in a single
/// row-major buffer, one frame after another, together with the acquisition
/// timestamp of each frame. The stack is read-only once constructed; every
/// analysis stage only ever samples it.
///
/// Decoding camera files into this structure is the job of an external
/// reader; synthetic stacks for testing are built through [`FrameStack::new`].
#[derive(Clone, Debug)]
pub struct FrameStack {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
    timestamps: Vec<DateTime<Utc>>,
}

impl FrameStack {
    /// Create a stack from a flat buffer of `frames * rows * cols` values,
    /// frame-major and row-major within each frame.
    pub fn new(
        rows: usize,
        cols: usize,
        data: Vec<f64>,
        timestamps: Vec<DateTime<Utc>>,
    ) -> Result<Self, Error> {
        let frame_size = rows * cols;
        if frame_size == 0 {
            return Err(Error::InvalidInput("frame dimensions are zero".into()));
        }
        if data.len() % frame_size != 0 {
            return Err(Error::InvalidInput(format!(
                "buffer of {} values does not divide into {}x{} frames",
                data.len(),
                rows,
                cols
            )));
        }
        if data.len() / frame_size != timestamps.len() {
            return Err(Error::InvalidInput(format!(
                "{} frames but {} timestamps",
                data.len() / frame_size,
                timestamps.len()
            )));
        }

        Ok(Self {
            rows,
            cols,
            data,
            timestamps,
        })
    }

    /// Create a stack with synthetic one-second-spaced timestamps.
    pub fn from_frames(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, Error> {
        let frame_size = rows * cols;
        let count = if frame_size == 0 {
            0
        } else {
            data.len() / frame_size
        };
        let timestamps = (0..count)
            .map(|i| Utc.timestamp_opt(i as i64, 0).unwrap())
            .collect();
        Self::new(rows, cols, data, timestamps)
    }

    pub fn frame_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Frame dimensions as (rows, cols).
    pub fn dimensions(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    /// Single pixel value of one frame.
    pub fn pixel(&self, frame: usize, row: usize, col: usize) -> f64 {
        self.data[frame * self.rows * self.cols + row * self.cols + col]
    }

    /// One frame as a row-major slice.
    pub fn frame(&self, frame: usize) -> &[f64] {
        let size = self.rows * self.cols;
        &self.data[frame * size..(frame + 1) * size]
    }

    /// Mean over all frames, returned as one row-major frame.
    pub fn mean_frame(&self) -> Vec<f64> {
        let size = self.rows * self.cols;
        let count = self.frame_count().max(1) as f64;
        let mut mean = vec![0.0; size];
        for fi in 0..self.frame_count() {
            for (acc, value) in mean.iter_mut().zip(self.frame(fi)) {
                *acc += value;
            }
        }
        for acc in &mut mean {
            *acc /= count;
        }
        mean
    }

    /// New stack containing only the selected frames, in the given order.
    pub(crate) fn select_frames(&self, kept: &[usize]) -> FrameStack {
        let size = self.rows * self.cols;
        let mut data = Vec::with_capacity(kept.len() * size);
        let mut timestamps = Vec::with_capacity(kept.len());
        for &fi in kept {
            data.extend_from_slice(self.frame(fi));
            timestamps.push(self.timestamps[fi]);
        }
        FrameStack {
            rows: self.rows,
            cols: self.cols,
            data,
            timestamps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stack() -> FrameStack {
        // two 2x2 frames
        FrameStack::from_frames(2, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap()
    }

    #[test]
    fn indexing_is_frame_then_row_major() {
        let s = stack();
        assert_eq!(s.frame_count(), 2);
        assert_eq!(s.pixel(0, 0, 1), 2.0);
        assert_eq!(s.pixel(1, 1, 0), 7.0);
    }

    #[test]
    fn mean_frame_averages_over_frames() {
        let mean = stack().mean_frame();
        assert_relative_eq!(mean[0], 3.0);
        assert_relative_eq!(mean[3], 6.0);
    }

    #[test]
    fn ragged_buffer_is_rejected() {
        assert!(FrameStack::from_frames(2, 2, vec![1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn select_frames_reorders() {
        let s = stack().select_frames(&[1]);
        assert_eq!(s.frame_count(), 1);
        assert_eq!(s.pixel(0, 0, 0), 5.0);
    }
}
