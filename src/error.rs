use thiserror::Error;

/// Errors raised by the analysis pipeline.
///
/// Every variant here is fatal for the running stage. Per-spot numerical
/// failures (undefined modulation depth, unusable ruler peaks, ...) are not
/// errors; they are recorded as NaN on the spot and the run continues.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("observed {axis} angle {angle} rad does not land on the {axis} angle grid")]
    GridMismatch { axis: &'static str, angle: f64 },

    #[error("motor log does not contain a single complete portrait")]
    NoPortraits,

    #[error("expected {expected} lines in portrait {portrait} but found {found}")]
    LineCountMismatch {
        portrait: usize,
        expected: usize,
        found: usize,
    },

    #[error("the background spot must be defined before any sample spot")]
    BackgroundAfterSpots,

    #[error("degenerate cosine fit: {0}")]
    DegenerateFit(String),

    #[error("stage dependency order violated: {0}")]
    StageOrder(&'static str),

    #[error("result channel integrity: {0}")]
    MergeIntegrity(String),

    #[error("a worker terminated without publishing its results")]
    WorkerLost,
}
