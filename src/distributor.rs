//! Parallel spot analysis with a merge barrier.
//!
//! The valid-spot set is partitioned into contiguous blocks, one per
//! worker. Each worker owns clones of its spots, runs the enabled stages to
//! completion and publishes one result record per spot over a channel; the
//! shared inputs (grids, portrait index, settings) are only ever read.
//! The coordinator drains exactly as many records as it dispatched, merges
//! them back by spot index and then verifies the channel is empty. Records
//! touch disjoint spots by construction, so arrival order does not matter.

use crate::error::Error;
use crate::fit::funnel::{FunnelFit, et_model_stage};
use crate::movie::Context;
use crate::spot::{FitGrid, Modulation, Spot};
use crate::{engine, etruler, modulation};
use nalgebra::DMatrix;
use std::ops::Range;
use std::sync::mpsc::{self, Sender, TryRecvError};
use std::thread;

/// Which pipeline stages a run should execute.
///
/// Later stages consume what earlier stages produce, so enabling a stage
/// without its prerequisite is a precondition failure, caught before any
/// worker is spawned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagePlan {
    pub fits: bool,
    pub mods: bool,
    pub ruler: bool,
    pub model: bool,
}

impl StagePlan {
    /// Every stage enabled.
    pub fn all() -> Self {
        Self {
            fits: true,
            mods: true,
            ruler: true,
            model: true,
        }
    }

    /// Portrait fits and modulation analysis only.
    pub fn fits_and_mods() -> Self {
        Self {
            fits: true,
            mods: true,
            ruler: false,
            model: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.mods && !self.fits {
            return Err(Error::StageOrder(
                "modulation analysis requires the portrait fits",
            ));
        }
        if self.ruler && !self.mods {
            return Err(Error::StageOrder(
                "the ET ruler requires the modulation analysis",
            ));
        }
        if self.model && !self.ruler {
            return Err(Error::StageOrder(
                "the funnel-model fit requires the ET ruler",
            ));
        }
        Ok(())
    }
}

/// The fields one worker computed for one spot. Only the sections of the
/// enabled stages are present; the merge writes nothing else.
pub(crate) struct SpotRecord {
    ordinal: usize,
    fits: Option<FitSection>,
    mods: Option<ModSection>,
    ruler: Option<f64>,
    model: Option<FunnelFit>,
}

struct FitSection {
    line_fits: FitGrid,
    vertical_fits: FitGrid,
    residual: f64,
}

struct ModSection {
    sam: DMatrix<f64>,
    modulation_ex: Modulation,
    modulation_em: Modulation,
    line_shift: f64,
    anisotropy: f64,
    anisotropy_normal: f64,
}

impl SpotRecord {
    fn extract(ordinal: usize, spot: &Spot, plan: StagePlan) -> Self {
        Self {
            ordinal,
            fits: plan.fits.then(|| FitSection {
                line_fits: spot.line_fits.clone(),
                vertical_fits: spot.vertical_fits.clone(),
                residual: spot.residual,
            }),
            mods: plan.mods.then(|| ModSection {
                sam: spot.sam.clone().expect("modulation stage populated sam"),
                modulation_ex: spot.modulation_ex,
                modulation_em: spot.modulation_em,
                line_shift: spot.line_shift,
                anisotropy: spot.anisotropy,
                anisotropy_normal: spot.anisotropy_normal,
            }),
            ruler: plan.ruler.then_some(spot.et_ruler),
            model: plan.model.then_some(spot.et_model),
        }
    }

    fn apply(self, spot: &mut Spot) {
        if let Some(fits) = self.fits {
            spot.line_fits = fits.line_fits;
            spot.vertical_fits = fits.vertical_fits;
            spot.residual = fits.residual;
        }
        if let Some(mods) = self.mods {
            spot.sam = Some(mods.sam);
            spot.modulation_ex = mods.modulation_ex;
            spot.modulation_em = mods.modulation_em;
            spot.line_shift = mods.line_shift;
            spot.anisotropy = mods.anisotropy;
            spot.anisotropy_normal = mods.anisotropy_normal;
        }
        if let Some(ruler) = self.ruler {
            spot.et_ruler = ruler;
        }
        if let Some(model) = self.model {
            spot.et_model = model;
        }
    }
}

/// Near-equal contiguous blocks covering `0..count`, the first `count %
/// workers` blocks one element longer.
pub(crate) fn split_blocks(count: usize, workers: usize) -> Vec<Range<usize>> {
    let base = count / workers;
    let extra = count % workers;
    let mut blocks = Vec::with_capacity(workers);
    let mut start = 0;
    for wi in 0..workers {
        let len = base + usize::from(wi < extra);
        blocks.push(start..start + len);
        start += len;
    }
    blocks
}

pub(crate) fn run(
    ctx: &Context,
    spots: &mut [Spot],
    valid: &[usize],
    workers: usize,
    plan: StagePlan,
) -> Result<(), Error> {
    plan.validate()?;
    if workers == 0 {
        return Err(Error::InvalidInput("at least one worker is required".into()));
    }

    let batches: Vec<Vec<(usize, Spot)>> = split_blocks(valid.len(), workers)
        .into_iter()
        .map(|block| {
            block
                .map(|ordinal| (ordinal, spots[valid[ordinal]].clone()))
                .collect()
        })
        .collect();

    let expected = valid.len();
    let (tx, rx) = mpsc::channel::<Result<SpotRecord, Error>>();
    let mut failure = None;

    thread::scope(|scope| {
        for batch in batches {
            let tx = tx.clone();
            scope.spawn(move || worker(ctx, batch, plan, tx));
        }
        drop(tx);

        let mut merged = 0;
        while merged < expected {
            match rx.recv() {
                Ok(Ok(record)) => {
                    let target = valid[record.ordinal];
                    record.apply(&mut spots[target]);
                    merged += 1;
                }
                Ok(Err(error)) => {
                    failure = Some(error);
                    break;
                }
                // Every sender hung up before delivering all records.
                Err(_) => {
                    failure = Some(Error::WorkerLost);
                    break;
                }
            }
        }
    });

    if let Some(error) = failure {
        return Err(error);
    }

    // All workers have terminated; anything still queued means a spot was
    // dispatched twice or counted wrong.
    match rx.try_recv() {
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(()),
        Ok(_) => Err(Error::MergeIntegrity(
            "result channel still holds records after draining the expected count".into(),
        )),
    }
}

fn worker(
    ctx: &Context,
    batch: Vec<(usize, Spot)>,
    plan: StagePlan,
    tx: Sender<Result<SpotRecord, Error>>,
) {
    let (ordinals, mut local): (Vec<usize>, Vec<Spot>) = batch.into_iter().unzip();
    let everything: Vec<usize> = (0..local.len()).collect();

    let outcome = (|| -> Result<(), Error> {
        if plan.fits {
            engine::fit_portraits(ctx, &mut local, &everything)?;
        }
        if plan.mods {
            modulation::find_modulation(ctx, &mut local, &everything)?;
        }
        if plan.ruler {
            etruler::et_ruler_stage(ctx, &mut local, &everything)?;
        }
        if plan.model {
            et_model_stage(ctx, &mut local, &everything)?;
        }
        Ok(())
    })();

    if let Err(error) = outcome {
        let _ = tx.send(Err(error));
        return;
    }

    for (ordinal, spot) in ordinals.into_iter().zip(local) {
        let _ = tx.send(Ok(SpotRecord::extract(ordinal, &spot, plan)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn blocks_cover_every_index_exactly_once(count: u16, workers: u8) -> bool {
        let count = count as usize % 500;
        let workers = workers as usize % 8 + 1;
        let blocks = split_blocks(count, workers);

        let mut seen = vec![0u8; count];
        for block in &blocks {
            for i in block.clone() {
                seen[i] += 1;
            }
        }
        blocks.len() == workers && seen.iter().all(|&c| c == 1)
    }

    #[test]
    fn blocks_are_near_equal() {
        let blocks = split_blocks(10, 3);
        let lengths: Vec<usize> = blocks.iter().map(|b| b.len()).collect();
        assert_eq!(lengths, vec![4, 3, 3]);
    }

    #[test]
    fn stage_order_is_enforced() {
        let plan = StagePlan {
            fits: false,
            mods: true,
            ruler: false,
            model: false,
        };
        assert!(matches!(plan.validate(), Err(Error::StageOrder(_))));

        let plan = StagePlan {
            fits: true,
            mods: true,
            ruler: false,
            model: true,
        };
        assert!(matches!(plan.validate(), Err(Error::StageOrder(_))));

        assert!(StagePlan::all().validate().is_ok());
        assert!(StagePlan::fits_and_mods().validate().is_ok());
    }
}
