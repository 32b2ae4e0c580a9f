//! Greedy forward tracking by label overlap between consecutive slices.

use crate::centroid::centroid;
use crate::config::TrackingParameters;
use crate::error::{EngineError, ErrorCode};
use crate::tracks::{CellPosition, Trajectory};
use crate::volume::{LabelId, LabelVolume, BACKGROUND};
use std::collections::BTreeMap;
use tracing::debug;

/// Most frequent label among `samples`; ties go to the smallest label.
fn majority_label(samples: impl Iterator<Item = LabelId>) -> Option<(LabelId, usize, usize)> {
    let mut histogram: BTreeMap<LabelId, usize> = BTreeMap::new();
    let mut total = 0usize;
    for label in samples {
        *histogram.entry(label).or_insert(0) += 1;
        total += 1;
    }
    let mut best: Option<(LabelId, usize)> = None;
    for (label, count) in histogram {
        if best.is_none_or(|(_, c)| count > c) {
            best = Some((label, count));
        }
    }
    best.map(|(label, count)| (label, count, total))
}

/// Follows the cell `seed` from `start_slice` towards the end of the volume.
///
/// At every step the pixels of the current cell are looked up in the next
/// slice; the walk continues with the majority label there if it is not
/// background and covers strictly more than `min_overlap_fraction` of the
/// sampled pixels. Returns `Ok(None)` when the trajectory ends up shorter than
/// `min_track_length` points.
pub fn track_from(
    volume: &LabelVolume,
    start_slice: usize,
    seed: LabelId,
    params: &TrackingParameters,
) -> Result<Option<Trajectory>, EngineError> {
    let first = volume.slice(start_slice).ok_or_else(|| {
        EngineError::invalid_input(format!(
            "Start slice {start_slice} is outside the volume ({} slices)",
            volume.num_slices()
        ))
    })?;
    if seed == BACKGROUND {
        return Err(EngineError::new(
            ErrorCode::BackgroundClick,
            "Can not track the background",
        ));
    }

    let mut current_id = seed;
    let mut current_slice = start_slice;
    let mut pixels = first.indices_of(current_id);
    if pixels.is_empty() {
        return Err(EngineError::new(
            ErrorCode::LabelNotFound,
            format!("Label {seed} does not occur in slice {start_slice}"),
        ));
    }

    let mut trajectory: Trajectory = vec![];
    while current_slice + 1 < volume.num_slices() {
        let Some(next) = volume.slice(current_slice + 1) else {
            break;
        };
        let Some((best, count, total)) =
            majority_label(pixels.iter().map(|idx| next.data()[*idx]))
        else {
            break;
        };
        if best == BACKGROUND || count as f64 <= params.min_overlap_fraction * total as f64 {
            debug!(
                slice = current_slice,
                label = current_id,
                best,
                count,
                total,
                "successor broken"
            );
            break;
        }

        if trajectory.is_empty() {
            let here = volume
                .slice(current_slice)
                .ok_or_else(|| EngineError::invalid_input("slice vanished"))?;
            let (row, col) = centroid(here, current_id)?;
            trajectory.push(CellPosition::new(current_slice as i32, row, col));
        }
        let (row, col) = centroid(next, best)?;
        trajectory.push(CellPosition::new(current_slice as i32 + 1, row, col));

        current_id = best;
        current_slice += 1;
        pixels = next.indices_of(current_id);
    }

    if trajectory.len() < params.min_track_length {
        return Ok(None);
    }
    Ok(Some(trajectory))
}
