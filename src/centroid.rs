//! Centroid extraction for labeled cells.
//!
//! Coordinates are rounded half to even (`0.5 -> 0`, `1.5 -> 2`), the same
//! rule the host viewer applies when it rounds click positions. Link and
//! unlink find existing track points by exact coordinate equality, so every
//! position written to a track table must come through [`centroid`].

use crate::error::{EngineError, ErrorCode};
use crate::tracks::CellPosition;
use crate::volume::{LabelId, LabelSlice, LabelVolume, VoxelPoint, BACKGROUND};

pub fn round_half_even(value: f64) -> i32 {
    value.round_ties_even() as i32
}

/// Pixel-count-weighted centroid `(row, col)` of `label` in `slice`.
pub fn centroid(slice: LabelSlice<'_>, label: LabelId) -> Result<(i32, i32), EngineError> {
    let cols = slice.cols();
    let mut count: u64 = 0;
    let mut row_sum: u64 = 0;
    let mut col_sum: u64 = 0;
    for (idx, value) in slice.data().iter().enumerate() {
        if *value != label {
            continue;
        }
        count += 1;
        row_sum += (idx / cols) as u64;
        col_sum += (idx % cols) as u64;
    }
    if count == 0 {
        return Err(EngineError::new(
            ErrorCode::LabelNotFound,
            format!("Label {label} does not occur in the slice"),
        ));
    }
    let n = count as f64;
    Ok((
        round_half_even(row_sum as f64 / n),
        round_half_even(col_sum as f64 / n),
    ))
}

/// Resolves a click to the centroid of the cell under it.
///
/// Returns `Ok(None)` for background clicks.
pub fn cell_at(volume: &LabelVolume, point: &VoxelPoint) -> Result<Option<CellPosition>, EngineError> {
    let label = volume.label_at(point)?;
    if label == BACKGROUND {
        return Ok(None);
    }
    let slice = volume
        .slice(point.slice)
        .ok_or_else(|| EngineError::invalid_input(format!("No slice {}", point.slice)))?;
    let (row, col) = centroid(slice, label)?;
    Ok(Some(CellPosition::new(point.slice as i32, row, col)))
}
