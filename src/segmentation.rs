//! Edits of the labeled volume that keep the track store consistent.
//!
//! All edits work on a single slice. Label 0 stays reserved for background:
//! no edit ever writes 0 except `remove`, and no edit assigns a cell to 0.

use crate::centroid::{cell_at, centroid};
use crate::error::{EngineError, ErrorCode};
use crate::track_store::{DetachOutcome, TrackStore};
use crate::tracks::{CellPosition, TrackTable};
use crate::volume::{LabelId, LabelVolume, VoxelPoint, BACKGROUND};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOutcome {
    pub label: LabelId,
    pub cleared_pixels: usize,
    pub track_change: Option<DetachOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentationEditor {
    labels: LabelVolume,
}

impl SegmentationEditor {
    pub fn new(labels: LabelVolume) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> &LabelVolume {
        &self.labels
    }

    pub fn label_at(&self, point: &VoxelPoint) -> Result<LabelId, EngineError> {
        self.labels.label_at(point)
    }

    pub fn cell_at(&self, point: &VoxelPoint) -> Result<Option<CellPosition>, EngineError> {
        cell_at(&self.labels, point)
    }

    pub fn next_free_label(&self) -> LabelId {
        self.labels.next_free_label()
    }

    /// Deletes the cell under `point` from its slice, detaching its track
    /// point first. Background clicks change nothing and return `None`.
    pub fn remove(
        &mut self,
        point: &VoxelPoint,
        tracks: &mut TrackStore,
    ) -> Result<Option<RemoveOutcome>, EngineError> {
        let label = self.labels.label_at(point)?;
        if label == BACKGROUND {
            debug!(?point, "remove on background ignored");
            return Ok(None);
        }
        let slice = self
            .labels
            .slice(point.slice)
            .ok_or_else(|| EngineError::invalid_input(format!("No slice {}", point.slice)))?;
        let (row, col) = centroid(slice, label)?;
        let position = CellPosition::new(point.slice as i32, row, col);
        let track_change = tracks.detach_point(&position);

        let cleared_pixels = self
            .labels
            .slice_mut(point.slice)
            .map(|mut s| s.replace(label, BACKGROUND))
            .unwrap_or(0);
        info!(
            label,
            slice = point.slice,
            cleared_pixels,
            track = ?track_change.as_ref().map(|t| t.track_id),
            "removed cell"
        );
        Ok(Some(RemoveOutcome {
            label,
            cleared_pixels,
            track_change,
        }))
    }

    /// Gives the 4-connected region under `point` a new label, `max + 1` when
    /// `new_id` is not given. Used to separate two touching cells that share
    /// one label. Returns the label written.
    pub fn recolor(&mut self, point: &VoxelPoint, new_id: Option<LabelId>) -> Result<LabelId, EngineError> {
        let old = self.labels.label_at(point)?;
        if old == BACKGROUND {
            return Err(EngineError::new(
                ErrorCode::BackgroundClick,
                "Can not separate the background",
            ));
        }
        let new_id = match new_id {
            Some(id) => Self::check_target(id)?,
            None => self.next_free_label(),
        };
        let filled = self.flood_fill(point, new_id);
        info!(old, new_id, filled, slice = point.slice, "recolored region");
        Ok(new_id)
    }

    /// Replaces every pixel of the label under `point` (in that slice) with
    /// `new_id`, merging a falsely cut cell into another.
    pub fn replace_whole_label(&mut self, point: &VoxelPoint, new_id: LabelId) -> Result<usize, EngineError> {
        let old = self.labels.label_at(point)?;
        if old == BACKGROUND {
            return Err(EngineError::new(
                ErrorCode::BackgroundClick,
                "Can not merge the background",
            ));
        }
        let new_id = Self::check_target(new_id)?;
        let changed = self
            .labels
            .slice_mut(point.slice)
            .map(|mut s| s.replace(old, new_id))
            .unwrap_or(0);
        info!(old, new_id, changed, slice = point.slice, "merged label");
        Ok(changed)
    }

    /// Relabels the cell under every track point with its track id.
    ///
    /// All other labels are first shifted above the largest track id so the
    /// written ids can not collide with an existing cell. Returns the number
    /// of cells relabeled.
    pub fn relabel_to_tracks(&mut self, tracks: &TrackTable) -> Result<usize, EngineError> {
        let offset = tracks.max_id() + 1;
        if self.labels.max_label().checked_add(offset).is_none() {
            return Err(EngineError::invalid_input(
                "Label ids would overflow when shifted above the track ids",
            ));
        }
        let [n_slices, _, _] = self.labels.shape();
        for z in 0..n_slices {
            if let Some(mut s) = self.labels.slice_mut(z) {
                for row in 0..s.rows() {
                    for col in 0..s.cols() {
                        if let Some(v) = s.get(row, col).filter(|v| *v != BACKGROUND) {
                            s.set(row, col, v + offset);
                        }
                    }
                }
            }
        }

        let mut relabeled = 0usize;
        for p in tracks.points() {
            let (Ok(slice), Ok(row), Ok(col)) = (
                usize::try_from(p.slice),
                usize::try_from(p.row),
                usize::try_from(p.col),
            ) else {
                continue;
            };
            let point = VoxelPoint::new(slice, row, col);
            match self.labels.get(&point) {
                Some(v) if v != BACKGROUND && v != p.track_id => {
                    self.flood_fill(&point, p.track_id);
                    relabeled += 1;
                }
                _ => {}
            }
        }
        Ok(relabeled)
    }

    fn check_target(id: LabelId) -> Result<LabelId, EngineError> {
        if id <= BACKGROUND {
            return Err(EngineError::invalid_input(format!(
                "Label {id} is reserved for background"
            )));
        }
        Ok(id)
    }

    /// 4-connected fill of the region under `point` within its slice.
    fn flood_fill(&mut self, point: &VoxelPoint, new_id: LabelId) -> usize {
        let Some(mut s) = self.labels.slice_mut(point.slice) else {
            return 0;
        };
        let Some(old) = s.get(point.row, point.col) else {
            return 0;
        };
        if old == new_id {
            return 0;
        }
        let (rows, cols) = (s.rows(), s.cols());
        let mut queue = VecDeque::from([(point.row, point.col)]);
        s.set(point.row, point.col, new_id);
        let mut filled = 1;
        while let Some((r, c)) = queue.pop_front() {
            let neighbours = [
                (r.wrapping_sub(1), c),
                (r + 1, c),
                (r, c.wrapping_sub(1)),
                (r, c + 1),
            ];
            for (nr, nc) in neighbours {
                if nr >= rows || nc >= cols {
                    continue;
                }
                if s.get(nr, nc) == Some(old) {
                    s.set(nr, nc, new_id);
                    filled += 1;
                    queue.push_back((nr, nc));
                }
            }
        }
        filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor() -> SegmentationEditor {
        // slice 0: label 1 split into two disconnected blobs, label 2 beside
        SegmentationEditor::new(
            LabelVolume::from_slices(vec![
                vec![
                    vec![1, 1, 0, 1, 1],
                    vec![1, 1, 0, 1, 1],
                    vec![0, 0, 0, 0, 0],
                    vec![2, 2, 2, 0, 0],
                ],
                vec![
                    vec![1, 1, 0, 0, 0],
                    vec![1, 1, 0, 0, 0],
                    vec![0, 0, 0, 0, 0],
                    vec![0, 0, 0, 0, 0],
                ],
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_remove_background_is_noop() {
        let mut ed = editor();
        let mut tracks = TrackStore::new(TrackTable::from_rows(&[[1, 0, 3, 1], [1, 1, 0, 0]]));
        let before = (ed.clone(), tracks.clone());
        assert_eq!(ed.remove(&VoxelPoint::new(0, 2, 2), &mut tracks).unwrap(), None);
        assert_eq!((ed, tracks), before);
    }

    #[test]
    fn test_remove_clears_label_in_slice_only() {
        let mut ed = editor();
        let mut tracks = TrackStore::default();
        let out = ed
            .remove(&VoxelPoint::new(0, 0, 0), &mut tracks)
            .unwrap()
            .unwrap();
        assert_eq!(out.label, 1);
        assert_eq!(out.cleared_pixels, 8);
        assert_eq!(ed.labels().slice(0).unwrap().pixel_count(1), 0);
        assert_eq!(ed.labels().slice(1).unwrap().pixel_count(1), 4);
        assert!(out.track_change.is_none());
    }

    #[test]
    fn test_remove_detaches_track_point() {
        let mut ed = editor();
        // label 2 in slice 0 has centroid (3, 1)
        let mut tracks = TrackStore::new(TrackTable::from_rows(&[
            [4, 0, 3, 1],
            [4, 1, 0, 0],
            [4, 2, 0, 0],
        ]));
        let out = ed
            .remove(&VoxelPoint::new(0, 3, 2), &mut tracks)
            .unwrap()
            .unwrap();
        let change = out.track_change.unwrap();
        assert_eq!(change.track_id, 4);
        assert_eq!(tracks.cached().to_rows(), vec![[4, 1, 0, 0], [4, 2, 0, 0]]);
    }

    #[test]
    fn test_recolor_fills_connected_region_only() {
        let mut ed = editor();
        let new_id = ed.recolor(&VoxelPoint::new(0, 0, 4), None).unwrap();
        assert_eq!(new_id, 3);
        let s = ed.labels().slice(0).unwrap();
        assert_eq!(s.pixel_count(1), 4);
        assert_eq!(s.pixel_count(3), 4);
        assert_eq!(s.get(0, 0), Some(1));
    }

    #[test]
    fn test_recolor_rejects_background_and_zero() {
        let mut ed = editor();
        assert_eq!(
            ed.recolor(&VoxelPoint::new(0, 2, 2), None).unwrap_err().code,
            ErrorCode::BackgroundClick
        );
        assert_eq!(
            ed.recolor(&VoxelPoint::new(0, 0, 0), Some(0)).unwrap_err().code,
            ErrorCode::InvalidInput
        );
    }

    #[test]
    fn test_replace_whole_label_merges_both_blobs() {
        let mut ed = editor();
        let changed = ed.replace_whole_label(&VoxelPoint::new(0, 0, 0), 2).unwrap();
        assert_eq!(changed, 8);
        let s = ed.labels().slice(0).unwrap();
        assert_eq!(s.pixel_count(2), 11);
        assert_eq!(ed.labels().slice(1).unwrap().pixel_count(1), 4);
    }

    #[test]
    fn test_relabel_to_tracks() {
        let mut ed = editor();
        let table = TrackTable::from_rows(&[[1, 0, 3, 1], [1, 1, 0, 0]]);
        let n = ed.relabel_to_tracks(&table).unwrap();
        assert_eq!(n, 2);
        let s0 = ed.labels().slice(0).unwrap();
        assert_eq!(s0.get(3, 0), Some(1));
        // untouched cells are shifted above the track ids
        assert_eq!(s0.get(0, 0), Some(3));
        assert_eq!(ed.labels().slice(1).unwrap().get(1, 1), Some(1));
    }
}
