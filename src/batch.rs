//! Whole-volume proximity tracking on a rayon worker pool.

use crate::config::TrackingParameters;
use crate::error::{EngineError, ErrorCode};
use crate::proximity::track_from;
use crate::tracks::{CellPosition, TrackId, TrackPoint, TrackTable, Trajectory};
use crate::volume::{LabelId, LabelVolume};
use rayon::prelude::*;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed {
    pub slice: usize,
    pub label: LabelId,
}

/// Outcome of tracking a single seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSearch {
    Found(Trajectory),
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct BatchTracker {
    params: TrackingParameters,
    cancel: Arc<AtomicBool>,
}

impl BatchTracker {
    pub fn new(params: TrackingParameters) -> Self {
        Self {
            params,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares a cancellation flag with the caller. Setting it stops the run at
    /// the next seed boundary; seeds already being tracked finish normally.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Every non-background label of every slice that still leaves room for a
    /// trajectory of `min_track_length` slices, in enqueue order.
    pub fn seeds(&self, volume: &LabelVolume) -> Vec<Seed> {
        let last_start = volume
            .num_slices()
            .saturating_sub(self.params.min_track_length);
        (0..last_start)
            .filter_map(|z| volume.slice(z).map(|s| (z, s)))
            .flat_map(|(z, s)| {
                s.labels()
                    .into_iter()
                    .map(move |label| Seed { slice: z, label })
            })
            .collect()
    }

    fn search_seed(&self, volume: &LabelVolume, seed: Seed) -> TrackSearch {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            track_from(volume, seed.slice, seed.label, &self.params)
        }));
        match outcome {
            Ok(Ok(Some(trajectory))) => TrackSearch::Found(trajectory),
            Ok(Ok(None)) => TrackSearch::NotFound,
            Ok(Err(e)) => {
                warn!(slice = seed.slice, label = seed.label, error = %e, "seed failed");
                TrackSearch::NotFound
            }
            Err(_) => {
                warn!(slice = seed.slice, label = seed.label, "seed worker panicked");
                TrackSearch::NotFound
            }
        }
    }

    /// Tracks every seed on a pool sized by the configured worker tier.
    ///
    /// Results come back in seed order once all workers have joined.
    pub fn search_all(&self, volume: &LabelVolume) -> Result<Vec<TrackSearch>, EngineError> {
        self.search_seeds(volume, &self.seeds(volume))
    }

    /// Tracks the given seeds in order. A seed that fails or panics yields
    /// `NotFound` and does not stop the others.
    pub fn search_seeds(
        &self,
        volume: &LabelVolume,
        seeds: &[Seed],
    ) -> Result<Vec<TrackSearch>, EngineError> {
        let workers = self.params.worker_tier.worker_count_for_host();
        info!(seeds = seeds.len(), workers, "running batch tracking");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| EngineError {
                code: ErrorCode::Internal,
                message: format!("Could not build tracking worker pool: {e}"),
            })?;

        let results: Vec<Option<TrackSearch>> = pool.install(|| {
            seeds
                .par_iter()
                .map(|seed| {
                    if self.cancel.load(Ordering::Relaxed) {
                        return None;
                    }
                    Some(self.search_seed(volume, *seed))
                })
                .collect()
        });

        if self.cancel.load(Ordering::Relaxed) {
            return Err(EngineError::new(
                ErrorCode::Cancelled,
                "Batch tracking was cancelled",
            ));
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Accepts trajectories first-seen-first and numbers them 1, 2, 3, ...
    ///
    /// A trajectory is dropped when its starting position is already a point
    /// of an accepted trajectory.
    pub fn assemble(results: Vec<TrackSearch>) -> TrackTable {
        let mut table = TrackTable::new();
        let mut recorded: HashSet<CellPosition> = HashSet::new();
        let mut track_id: TrackId = 1;
        for result in results {
            let TrackSearch::Found(trajectory) = result else {
                continue;
            };
            let Some(start) = trajectory.first() else {
                continue;
            };
            if recorded.contains(start) {
                continue;
            }
            for position in trajectory {
                recorded.insert(position);
                table.push(TrackPoint::new(track_id, position));
            }
            track_id += 1;
        }
        table.sort();
        table
    }

    /// Full replacement track table for `volume`.
    pub fn run(&self, volume: Option<&LabelVolume>) -> Result<TrackTable, EngineError> {
        let volume = volume.ok_or_else(|| EngineError::missing_layer("label layer"))?;
        let results = self.search_all(volume)?;
        let found = results
            .iter()
            .filter(|r| matches!(r, TrackSearch::Found(_)))
            .count();
        let table = Self::assemble(results);
        info!(
            candidates = found,
            tracks = table.track_count(),
            "batch tracking finished"
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proximity::tests::persistent_cell;

    /// A 3x5 cell drifting one column per slice, a fixed cell relabeled every
    /// slice and a single-pixel blip in slice 0.
    fn two_cells(n_slices: usize) -> LabelVolume {
        let mut slices = vec![];
        for z in 0..n_slices {
            let mut rows = vec![vec![0; 24]; 12];
            for r in 1..4 {
                for c in 0..5 {
                    rows[r][c + z] = 1;
                }
            }
            for r in 7..10 {
                for c in 10..13 {
                    rows[r][c] = 2 + z as i32;
                }
            }
            if z == 0 {
                rows[11][20] = 9;
            }
            slices.push(rows);
        }
        LabelVolume::from_slices(slices).unwrap()
    }

    #[test]
    fn test_seeds_cover_leading_slices_only() {
        let vol = two_cells(8);
        let tracker = BatchTracker::new(TrackingParameters::default());
        let seeds = tracker.seeds(&vol);
        assert!(seeds.iter().all(|s| s.slice < 3));
        assert_eq!(seeds[0], Seed { slice: 0, label: 1 });
        assert_eq!(seeds.len(), 3 + 2 + 2);
    }

    #[test]
    fn test_run_builds_deduplicated_tracks() {
        let vol = two_cells(8);
        let table = BatchTracker::new(TrackingParameters::default())
            .run(Some(&vol))
            .unwrap();
        assert_eq!(table.track_ids(), vec![1, 2]);
        assert_eq!(table.track(1).count(), 8);
        assert_eq!(table.track(2).count(), 8);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_run_is_deterministic() {
        let vol = two_cells(9);
        let tracker = BatchTracker::new(TrackingParameters::default());
        let a = tracker.run(Some(&vol)).unwrap();
        let b = tracker.run(Some(&vol)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_volume_aborts() {
        let err = BatchTracker::new(TrackingParameters::default())
            .run(None)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingLayer);
    }

    #[test]
    fn test_cancelled_run_reports_cancelled() {
        let vol = persistent_cell(7, &[]);
        let flag = Arc::new(AtomicBool::new(true));
        let tracker = BatchTracker::new(TrackingParameters::default()).with_cancel_flag(flag);
        let err = tracker.run(Some(&vol)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
    }

    #[test]
    fn test_absent_seed_label_is_not_found() {
        let vol = persistent_cell(6, &[]);
        let tracker = BatchTracker::new(TrackingParameters::default());
        assert_eq!(
            tracker.search_seed(&vol, Seed { slice: 0, label: 42 }),
            TrackSearch::NotFound
        );
        assert_eq!(
            tracker.search_seed(&vol, Seed { slice: 99, label: 1 }),
            TrackSearch::NotFound
        );
    }

    #[test]
    fn test_bad_seed_does_not_stop_the_batch() {
        let vol = two_cells(8);
        let tracker = BatchTracker::new(TrackingParameters::default());
        let seeds = [
            Seed { slice: 0, label: 42 },
            Seed { slice: 0, label: 1 },
            Seed { slice: 0, label: 0 },
            Seed { slice: 0, label: 2 },
        ];
        let results = tracker.search_seeds(&vol, &seeds).unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0], TrackSearch::NotFound);
        assert_eq!(results[2], TrackSearch::NotFound);
        let table = BatchTracker::assemble(results);
        assert_eq!(table.track_ids(), vec![1, 2]);
        assert_eq!(table.track(1).count(), 8);
        assert_eq!(table.track(2).count(), 8);
    }

    #[test]
    fn test_assemble_first_seen_wins() {
        let a = vec![
            CellPosition::new(0, 1, 1),
            CellPosition::new(1, 1, 1),
            CellPosition::new(2, 1, 1),
        ];
        let b = a[1..].to_vec();
        let c = vec![CellPosition::new(0, 5, 5), CellPosition::new(1, 5, 5)];
        let table = BatchTracker::assemble(vec![
            TrackSearch::Found(a),
            TrackSearch::NotFound,
            TrackSearch::Found(b),
            TrackSearch::Found(c),
        ]);
        assert_eq!(table.track_ids(), vec![1, 2]);
        assert_eq!(table.track(1).count(), 3);
        assert_eq!(table.track(2).next().unwrap().row, 5);
    }
}
