//! The track table: rows of `[track_id, slice, row, col]`.

use crate::error::{EngineError, ErrorCode};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type TrackId = i32;

/// Position of one cell: the slice it lives in and its rounded centroid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPosition {
    pub slice: i32,
    pub row: i32,
    pub col: i32,
}

impl CellPosition {
    pub fn new(slice: i32, row: i32, col: i32) -> Self {
        Self { slice, row, col }
    }
}

pub type Trajectory = Vec<CellPosition>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct TrackPoint {
    pub track_id: TrackId,
    pub slice: i32,
    pub row: i32,
    pub col: i32,
}

impl TrackPoint {
    pub fn new(track_id: TrackId, position: CellPosition) -> Self {
        Self {
            track_id,
            slice: position.slice,
            row: position.row,
            col: position.col,
        }
    }

    pub fn position(&self) -> CellPosition {
        CellPosition::new(self.slice, self.row, self.col)
    }
}

impl From<[i32; 4]> for TrackPoint {
    fn from(row: [i32; 4]) -> Self {
        Self {
            track_id: row[0],
            slice: row[1],
            row: row[2],
            col: row[3],
        }
    }
}

impl From<TrackPoint> for [i32; 4] {
    fn from(p: TrackPoint) -> Self {
        [p.track_id, p.slice, p.row, p.col]
    }
}

/// Track points ordered by `(track_id, slice)`.
///
/// Mutators that can reorder rows re-sort before returning; `push` does not,
/// call [`TrackTable::sort`] after a batch of pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TrackPoint>", into = "Vec<TrackPoint>")]
pub struct TrackTable {
    points: Vec<TrackPoint>,
}

impl From<Vec<TrackPoint>> for TrackTable {
    fn from(points: Vec<TrackPoint>) -> Self {
        Self::from_points(points)
    }
}

impl From<TrackTable> for Vec<TrackPoint> {
    fn from(table: TrackTable) -> Self {
        table.points
    }
}

impl TrackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: Vec<TrackPoint>) -> Self {
        let mut ret = Self { points };
        ret.sort();
        ret
    }

    pub fn from_rows(rows: &[[i32; 4]]) -> Self {
        Self::from_points(rows.iter().copied().map(TrackPoint::from).collect())
    }

    pub fn to_rows(&self) -> Vec<[i32; 4]> {
        self.points.iter().copied().map(<[i32; 4]>::from).collect()
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, point: TrackPoint) {
        self.points.push(point);
    }

    pub fn sort(&mut self) {
        self.points.sort_by_key(|p| (p.track_id, p.slice));
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.points.iter().map(|p| p.track_id).unique().sorted().collect()
    }

    pub fn track_count(&self) -> usize {
        self.points.iter().map(|p| p.track_id).unique().count()
    }

    pub fn max_id(&self) -> TrackId {
        self.points.iter().map(|p| p.track_id).max().unwrap_or(0)
    }

    /// Id for a newly minted track.
    pub fn next_id(&self) -> TrackId {
        self.max_id() + 1
    }

    pub fn track(&self, id: TrackId) -> impl Iterator<Item = &TrackPoint> + '_ {
        self.points.iter().filter(move |p| p.track_id == id)
    }

    pub fn contains_track(&self, id: TrackId) -> bool {
        self.points.iter().any(|p| p.track_id == id)
    }

    pub fn slices_of(&self, id: TrackId) -> BTreeSet<i32> {
        self.track(id).map(|p| p.slice).collect()
    }

    /// Id of the first track holding a point at exactly `position`.
    pub fn track_at(&self, position: &CellPosition) -> Option<TrackId> {
        self.points
            .iter()
            .find(|p| p.position() == *position)
            .map(|p| p.track_id)
    }

    pub fn relabel(&mut self, from: TrackId, to: TrackId) -> usize {
        let mut changed = 0;
        for p in self.points.iter_mut().filter(|p| p.track_id == from) {
            p.track_id = to;
            changed += 1;
        }
        if changed > 0 {
            self.sort();
        }
        changed
    }

    pub fn retain(&mut self, f: impl FnMut(&TrackPoint) -> bool) {
        self.points.retain(f);
    }

    pub fn remove_tracks(&mut self, ids: &[TrackId]) -> usize {
        let before = self.points.len();
        self.points.retain(|p| !ids.contains(&p.track_id));
        before - self.points.len()
    }

    /// Cuts track `id` between the slices `first` and `last`.
    ///
    /// Points strictly between the two slices are removed and points at or
    /// after `last` move to `new_id`. Returns the number of removed points.
    pub fn split_track(&mut self, id: TrackId, first: i32, last: i32, new_id: TrackId) -> usize {
        let before = self.points.len();
        self.points
            .retain(|p| !(p.track_id == id && p.slice > first && p.slice < last));
        let removed = before - self.points.len();
        for p in self
            .points
            .iter_mut()
            .filter(|p| p.track_id == id && p.slice >= last)
        {
            p.track_id = new_id;
        }
        self.sort();
        removed
    }

    /// Drops every track with fewer than two points; returns the dropped ids.
    pub fn prune_short_tracks(&mut self) -> Vec<TrackId> {
        let counts = self.points.iter().counts_by(|p| p.track_id);
        let short: Vec<TrackId> = counts
            .into_iter()
            .filter(|(_, n)| *n < 2)
            .map(|(id, _)| id)
            .sorted()
            .collect();
        if !short.is_empty() {
            self.points.retain(|p| !short.contains(&p.track_id));
        }
        short
    }

    /// Subset holding only the given track ids.
    pub fn filtered(&self, ids: &[TrackId]) -> TrackTable {
        TrackTable {
            points: self
                .points
                .iter()
                .filter(|p| ids.contains(&p.track_id))
                .copied()
                .collect(),
        }
    }

    /// Replaces the reserved track id 0 with a fresh id; returns the new id
    /// when a replacement happened.
    pub fn reassign_zero_ids(&mut self) -> Option<TrackId> {
        if !self.contains_track(0) {
            return None;
        }
        let new_id = self.next_id().max(1);
        self.relabel(0, new_id);
        Some(new_id)
    }

    pub fn trajectories(&self) -> BTreeMap<TrackId, Trajectory> {
        let mut ret: BTreeMap<TrackId, Trajectory> = BTreeMap::new();
        for p in &self.points {
            ret.entry(p.track_id).or_default().push(p.position());
        }
        ret
    }

    /// Checks the structural invariants: positive ids, at least two points per
    /// track and strictly increasing slices within a track.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (id, group) in &self.points.iter().chunk_by(|p| p.track_id) {
            if id <= 0 {
                return Err(EngineError::new(
                    ErrorCode::InvalidInput,
                    format!("Track id {id} is reserved"),
                ));
            }
            let slices: Vec<i32> = group.map(|p| p.slice).collect();
            if slices.len() < 2 {
                return Err(EngineError::new(
                    ErrorCode::InsufficientPoints,
                    format!("Track {id} has fewer than two points"),
                ));
            }
            if slices.iter().tuple_windows().any(|(a, b)| a >= b) {
                return Err(EngineError::new(
                    ErrorCode::DuplicateSlice,
                    format!("Track {id} has slices out of order or repeated: {slices:?}"),
                ));
            }
        }
        Ok(())
    }
}
