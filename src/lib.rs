//! Two-dimensional polarization imaging (2D-POLIM) analysis.
//!
//! A 2D-POLIM measurement steps the excitation and emission polarizer
//! angles through a fixed schedule while the camera records; one full sweep
//! through every angle combination is a *portrait*. This crate rebuilds
//! portraits from the frame stream and motor log, runs the batched
//! two-stage cosine fit over any number of regions of interest, and derives
//! modulation depths, phases, anisotropy and two energy-transfer estimates
//! per region, scattered into camera-shaped contrast images.
//!
//! Camera file decoding, motor-log text parsing, plotting and persistence
//! live outside this crate; see [`camera::FrameStack`] and
//! [`motors::MotorLog`] for the expected inputs and
//! [`movie::Movie::export`] for the serializable output.

pub mod camera;
pub mod distributor;
pub mod error;
pub mod fit;
pub mod grid;
pub mod image;
pub mod motors;
pub mod movie;
pub mod portrait;
pub mod settings;
pub mod spot;

mod engine;
mod etruler;
mod modulation;

pub use camera::FrameStack;
pub use distributor::StagePlan;
pub use error::Error;
pub use etruler::compute_ruler;
pub use grid::AngleGrid;
pub use motors::MotorLog;
pub use movie::Movie;
pub use settings::Settings;
pub use spot::{Spot, SpotProperty, SpotShape};
