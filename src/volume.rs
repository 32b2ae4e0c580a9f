//! Dense 3D label and intensity volumes, stored slice-major.

use crate::error::{EngineError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type LabelId = i32;

pub const BACKGROUND: LabelId = 0;

/// A pixel position inside a volume, as produced by a click on the host viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelPoint {
    pub slice: usize,
    pub row: usize,
    pub col: usize,
}

impl VoxelPoint {
    pub fn new(slice: usize, row: usize, col: usize) -> Self {
        Self { slice, row, col }
    }
}

/// Serialized form of a volume; checked against its shape on the way in.
#[derive(Deserialize)]
struct RawVolume<T> {
    shape: [usize; 3],
    data: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawVolume<LabelId>")]
pub struct LabelVolume {
    shape: [usize; 3],
    data: Vec<LabelId>,
}

impl LabelVolume {
    pub fn new(slices: usize, rows: usize, cols: usize) -> Self {
        Self {
            shape: [slices, rows, cols],
            data: vec![BACKGROUND; slices * rows * cols],
        }
    }

    pub fn from_raw(shape: [usize; 3], data: Vec<LabelId>) -> Result<Self, EngineError> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(EngineError::invalid_input(format!(
                "Label data has {} values but shape {:?} needs {expected}",
                data.len(),
                shape
            )));
        }
        Ok(Self { shape, data })
    }

    /// Builds a volume from nested `[slice][row][col]` vectors.
    pub fn from_slices(slices: Vec<Vec<Vec<LabelId>>>) -> Result<Self, EngineError> {
        let n_slices = slices.len();
        let rows = slices.first().map(|s| s.len()).unwrap_or(0);
        let cols = slices
            .first()
            .and_then(|s| s.first())
            .map(|r| r.len())
            .unwrap_or(0);
        let mut data = Vec::with_capacity(n_slices * rows * cols);
        for (z, slice) in slices.into_iter().enumerate() {
            if slice.len() != rows {
                return Err(EngineError::invalid_input(format!(
                    "Slice {z} has {} rows, expected {rows}",
                    slice.len()
                )));
            }
            for (r, row) in slice.into_iter().enumerate() {
                if row.len() != cols {
                    return Err(EngineError::invalid_input(format!(
                        "Row {r} of slice {z} has {} columns, expected {cols}",
                        row.len()
                    )));
                }
                data.extend(row);
            }
        }
        Ok(Self {
            shape: [n_slices, rows, cols],
            data,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn num_slices(&self) -> usize {
        self.shape[0]
    }

    pub fn rows(&self) -> usize {
        self.shape[1]
    }

    pub fn cols(&self) -> usize {
        self.shape[2]
    }

    pub fn as_raw(&self) -> &[LabelId] {
        &self.data
    }

    fn slice_len(&self) -> usize {
        self.shape[1] * self.shape[2]
    }

    pub fn slice(&self, z: usize) -> Option<LabelSlice<'_>> {
        if z >= self.num_slices() {
            return None;
        }
        let len = self.slice_len();
        Some(LabelSlice {
            rows: self.rows(),
            cols: self.cols(),
            data: &self.data[z * len..(z + 1) * len],
        })
    }

    pub fn slice_mut(&mut self, z: usize) -> Option<LabelSliceMut<'_>> {
        if z >= self.num_slices() {
            return None;
        }
        let len = self.slice_len();
        let (rows, cols) = (self.rows(), self.cols());
        Some(LabelSliceMut {
            rows,
            cols,
            data: &mut self.data[z * len..(z + 1) * len],
        })
    }

    pub fn contains(&self, point: &VoxelPoint) -> bool {
        point.slice < self.shape[0] && point.row < self.shape[1] && point.col < self.shape[2]
    }

    pub fn get(&self, point: &VoxelPoint) -> Option<LabelId> {
        if !self.contains(point) {
            return None;
        }
        let idx = (point.slice * self.rows() + point.row) * self.cols() + point.col;
        self.data.get(idx).copied()
    }

    /// Label under `point`, failing with `InvalidInput` outside the volume.
    pub fn label_at(&self, point: &VoxelPoint) -> Result<LabelId, EngineError> {
        self.get(point).ok_or_else(|| {
            EngineError::new(
                ErrorCode::InvalidInput,
                format!(
                    "Position ({}, {}, {}) is outside the volume {:?}",
                    point.slice, point.row, point.col, self.shape
                ),
            )
        })
    }

    pub fn max_label(&self) -> LabelId {
        self.data.iter().copied().max().unwrap_or(BACKGROUND).max(BACKGROUND)
    }

    /// Next unused label id (always `max + 1`).
    pub fn next_free_label(&self) -> LabelId {
        self.max_label() + 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LabelSlice<'a> {
    rows: usize,
    cols: usize,
    data: &'a [LabelId],
}

impl<'a> LabelSlice<'a> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &'a [LabelId] {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> Option<LabelId> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        Some(self.data[row * self.cols + col])
    }

    /// Flat indices of every pixel carrying `label`.
    pub fn indices_of(&self, label: LabelId) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == label)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn pixel_count(&self, label: LabelId) -> usize {
        self.data.iter().filter(|v| **v == label).count()
    }

    /// Sorted, non-background labels present in the slice.
    pub fn labels(&self) -> BTreeSet<LabelId> {
        self.data
            .iter()
            .copied()
            .filter(|v| *v != BACKGROUND)
            .collect()
    }
}

#[derive(Debug)]
pub struct LabelSliceMut<'a> {
    rows: usize,
    cols: usize,
    data: &'a mut [LabelId],
}

impl LabelSliceMut<'_> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> Option<LabelId> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        Some(self.data[row * self.cols + col])
    }

    pub fn set(&mut self, row: usize, col: usize, label: LabelId) {
        if row < self.rows && col < self.cols {
            self.data[row * self.cols + col] = label;
        }
    }

    /// Replaces every pixel equal to `from`; returns the number of pixels changed.
    pub fn replace(&mut self, from: LabelId, to: LabelId) -> usize {
        let mut changed = 0;
        for v in self.data.iter_mut().filter(|v| **v == from) {
            *v = to;
            changed += 1;
        }
        changed
    }
}

impl TryFrom<RawVolume<LabelId>> for LabelVolume {
    type Error = EngineError;

    fn try_from(raw: RawVolume<LabelId>) -> Result<Self, Self::Error> {
        Self::from_raw(raw.shape, raw.data)
    }
}

/// Raw intensity data, carried alongside the labels so the three arrays can
/// be persisted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawVolume<f64>")]
pub struct IntensityVolume {
    shape: [usize; 3],
    data: Vec<f64>,
}

impl IntensityVolume {
    pub fn from_raw(shape: [usize; 3], data: Vec<f64>) -> Result<Self, EngineError> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(EngineError::invalid_input(format!(
                "Intensity data has {} values but shape {:?} needs {expected}",
                data.len(),
                shape
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn as_raw(&self) -> &[f64] {
        &self.data
    }
}

impl TryFrom<RawVolume<f64>> for IntensityVolume {
    type Error = EngineError;

    fn try_from(raw: RawVolume<f64>) -> Result<Self, Self::Error> {
        Self::from_raw(raw.shape, raw.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_slices() -> LabelVolume {
        LabelVolume::from_slices(vec![
            vec![vec![0, 1, 1], vec![0, 2, 0]],
            vec![vec![3, 3, 0], vec![0, 0, 0]],
        ])
        .unwrap()
    }

    #[test]
    fn test_from_slices_shape_and_lookup() {
        let vol = two_slices();
        assert_eq!(vol.shape(), [2, 2, 3]);
        assert_eq!(vol.get(&VoxelPoint::new(0, 1, 1)), Some(2));
        assert_eq!(vol.get(&VoxelPoint::new(1, 0, 0)), Some(3));
        assert_eq!(vol.get(&VoxelPoint::new(2, 0, 0)), None);
        assert_eq!(vol.max_label(), 3);
        assert_eq!(vol.next_free_label(), 4);
    }

    #[test]
    fn test_from_slices_rejects_ragged_rows() {
        let err = LabelVolume::from_slices(vec![vec![vec![0, 1], vec![0]]]).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[test]
    fn test_from_raw_checks_length() {
        assert!(LabelVolume::from_raw([1, 2, 2], vec![0; 4]).is_ok());
        assert!(LabelVolume::from_raw([1, 2, 2], vec![0; 3]).is_err());
    }

    #[test]
    fn test_deserialize_checks_shape() {
        let vol: LabelVolume =
            serde_json::from_str(r#"{"shape":[1,2,2],"data":[0,1,1,0]}"#).unwrap();
        assert_eq!(vol.get(&VoxelPoint::new(0, 0, 1)), Some(1));

        let err = serde_json::from_str::<LabelVolume>(r#"{"shape":[6,3,3],"data":[1,1,1]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("shape [6, 3, 3] needs 54"));
        assert!(
            serde_json::from_str::<IntensityVolume>(r#"{"shape":[1,1,2],"data":[0.5]}"#).is_err()
        );
    }

    #[test]
    fn test_slice_labels_exclude_background() {
        let vol = two_slices();
        let labels: Vec<_> = vol.slice(0).unwrap().labels().into_iter().collect();
        assert_eq!(labels, vec![1, 2]);
        assert_eq!(vol.slice(0).unwrap().pixel_count(1), 2);
    }

    #[test]
    fn test_slice_mut_replace_stays_in_slice() {
        let mut vol = two_slices();
        let changed = vol.slice_mut(1).unwrap().replace(3, 0);
        assert_eq!(changed, 2);
        assert_eq!(vol.slice(1).unwrap().labels().len(), 0);
        assert_eq!(vol.slice(0).unwrap().pixel_count(1), 2);
    }

    #[test]
    fn test_label_at_out_of_bounds_is_invalid_input() {
        let vol = two_slices();
        let err = vol.label_at(&VoxelPoint::new(0, 5, 0)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }
}
