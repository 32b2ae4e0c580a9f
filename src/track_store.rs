//! Cached and displayed track tables and the edits that keep them consistent.
//!
//! The cached table is authoritative. The displayed table is either equal to
//! it or a subset filtered by track id; every edit is applied to the cached
//! table and mirrored to the displayed one.

use crate::error::{EngineError, ErrorCode};
use crate::tracks::{CellPosition, TrackId, TrackPoint, TrackTable};
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOutcome {
    pub track_id: TrackId,
    pub added_points: usize,
    /// Track that was folded into `track_id`, when both ends of the selection
    /// belonged to different tracks.
    pub merged_from: Option<TrackId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkOutcome {
    pub track_id: TrackId,
    pub new_track_id: TrackId,
    pub deleted_points: usize,
    pub pruned: Vec<TrackId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachOutcome {
    pub track_id: TrackId,
    pub new_track_id: TrackId,
    pub pruned: Vec<TrackId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackStore {
    cached: TrackTable,
    displayed: TrackTable,
    #[serde(default)]
    filter: Vec<TrackId>,
}

fn has_duplicate_slices(points: &[CellPosition]) -> bool {
    points.iter().map(|p| p.slice).duplicates().next().is_some()
}

impl TrackStore {
    pub fn new(table: TrackTable) -> Self {
        Self {
            displayed: table.clone(),
            cached: table,
            filter: vec![],
        }
    }

    pub fn cached(&self) -> &TrackTable {
        &self.cached
    }

    pub fn displayed(&self) -> &TrackTable {
        &self.displayed
    }

    pub fn filter(&self) -> &[TrackId] {
        &self.filter
    }

    pub fn is_in_sync(&self) -> bool {
        self.displayed == self.cached
    }

    /// Replaces both tables wholesale, e.g. after batch tracking.
    pub fn replace_all(&mut self, table: TrackTable) {
        self.cached = table;
        self.show_all();
    }

    pub fn show_all(&mut self) {
        self.displayed = self.cached.clone();
        self.filter.clear();
    }

    pub fn track_at(&self, position: &CellPosition) -> Option<TrackId> {
        self.cached.track_at(position)
    }

    /// Displays only the given ids. Negative ids and duplicates are dropped;
    /// when nothing is left, or none of the ids has data, all tracks are shown.
    pub fn filter_ids(&mut self, ids: &[i64]) -> Vec<TrackId> {
        let ids: Vec<TrackId> = ids
            .iter()
            .filter(|id| **id >= 0)
            .filter_map(|id| TrackId::try_from(*id).ok())
            .unique()
            .collect();
        if ids.is_empty() {
            self.show_all();
            return ids;
        }
        let subset = self.cached.filtered(&ids);
        if subset.is_empty() {
            warn!(?ids, "no tracking data for ids, displaying all tracks instead");
            self.show_all();
        } else {
            debug!(?ids, "displaying tracks");
            self.displayed = subset;
            self.filter = ids.clone();
        }
        ids
    }

    /// Parses a filter such as `"3, 5,7"`; an empty text shows all tracks.
    /// Returns the normalized filter text.
    pub fn filter_display(&mut self, text: &str) -> Result<String, EngineError> {
        let text = text.trim();
        if text.is_empty() {
            self.show_all();
            return Ok(String::new());
        }
        let parsed: Result<Vec<i64>, _> = text.split(',').map(|s| s.trim().parse::<i64>()).collect();
        let parsed = parsed.map_err(|_| {
            EngineError::invalid_input(
                "Please use a single integer (whole number) or a comma separated list of integers",
            )
        })?;
        let ids = self.filter_ids(&parsed);
        Ok(ids.iter().join(","))
    }

    /// Removes every displayed track from the store. Refused when the
    /// displayed tracks are all tracks.
    pub fn delete_displayed(&mut self) -> Result<Vec<TrackId>, EngineError> {
        let to_remove = self.displayed.track_ids();
        if to_remove.is_empty() {
            return Err(EngineError::new(ErrorCode::NotFound, "No tracks are displayed"));
        }
        if to_remove == self.cached.track_ids() {
            return Err(EngineError::invalid_input("Can not delete whole tracks layer"));
        }
        let removed = self.cached.remove_tracks(&to_remove);
        info!(tracks = ?to_remove, points = removed, "deleted displayed tracks");
        self.show_all();
        Ok(to_remove)
    }

    /// Links the recorded positions into one track.
    ///
    /// Positions whose first or last entry already belongs to a track extend
    /// that track; when both ends belong to different tracks the two are
    /// joined under the smaller id. The displayed table must show all tracks;
    /// pass `reveal_hidden` to reset the filter instead of failing.
    pub fn commit_link(
        &mut self,
        buffer: &[CellPosition],
        reveal_hidden: bool,
    ) -> Result<LinkOutcome, EngineError> {
        if buffer.len() < 2 {
            return Err(EngineError::new(
                ErrorCode::InsufficientPoints,
                "Less than two cells can not be tracked",
            ));
        }
        let mut points = buffer.to_vec();
        points.sort_by_key(|p| p.slice);
        if has_duplicate_slices(&points) {
            return Err(EngineError::new(
                ErrorCode::DuplicateSlice,
                "More than one cell was selected in the same slice",
            ));
        }
        if !self.is_in_sync() {
            if !reveal_hidden {
                return Err(EngineError::new(
                    ErrorCode::TracksHidden,
                    "All tracks need to be visible, but some tracks are hidden",
                ));
            }
            self.show_all();
        }

        let first_match = points.first().and_then(|p| self.cached.track_at(p));
        let last_match = points.last().and_then(|p| self.cached.track_at(p));
        let (track_id, merged_from) = match (first_match, last_match) {
            (None, None) => (self.cached.next_id(), None),
            (Some(id), None) => {
                points.remove(0);
                (id, None)
            }
            (None, Some(id)) => {
                points.pop();
                (id, None)
            }
            (Some(a), Some(b)) => {
                points.remove(0);
                points.pop();
                if a == b {
                    (a, None)
                } else {
                    (a.min(b), Some(a.max(b)))
                }
            }
        };

        let mut occupied: BTreeSet<i32> = self.cached.slices_of(track_id);
        if let Some(other) = merged_from {
            for slice in self.cached.slices_of(other) {
                if !occupied.insert(slice) {
                    return Err(EngineError::new(
                        ErrorCode::DuplicateSlice,
                        format!("Tracks {track_id} and {other} both have a cell in slice {slice}"),
                    ));
                }
            }
        }
        if let Some(p) = points.iter().find(|p| occupied.contains(&p.slice)) {
            return Err(EngineError::new(
                ErrorCode::DuplicateSlice,
                format!("Track {track_id} already has a cell in slice {}", p.slice),
            ));
        }

        if let Some(other) = merged_from {
            self.cached.relabel(other, track_id);
        }
        for p in &points {
            self.cached.push(TrackPoint::new(track_id, *p));
        }
        self.cached.sort();
        let pruned = self.cached.prune_short_tracks();
        if !pruned.is_empty() {
            debug!(?pruned, "pruned short tracks after link");
        }
        self.show_all();
        info!(
            track_id,
            added = points.len(),
            merged_from = ?merged_from,
            "linked cells"
        );
        Ok(LinkOutcome {
            track_id,
            added_points: points.len(),
            merged_from,
        })
    }

    /// Cuts a track at the selected positions.
    ///
    /// Points strictly between the earliest and latest selected slice are
    /// deleted and the points from the latest selected slice on move to a new
    /// track. Tracks left with fewer than two points are pruned.
    pub fn commit_unlink(&mut self, selection: &[CellPosition]) -> Result<UnlinkOutcome, EngineError> {
        let MinMaxResult::MinMax(first, last) = selection.iter().map(|p| p.slice).minmax() else {
            return Err(EngineError::new(
                ErrorCode::InsufficientPoints,
                "Please select more than one cell to disconnect",
            ));
        };
        let ids: Vec<Option<TrackId>> = selection
            .iter()
            .map(|p| self.displayed.track_at(p))
            .collect();
        if ids.iter().all(|id| id.is_none()) {
            return Err(EngineError::new(
                ErrorCode::NotFound,
                "Please select cells that are on any track",
            ));
        }
        let track_id = match ids.iter().copied().all_equal_value() {
            Ok(Some(id)) => id,
            _ => {
                return Err(EngineError::new(
                    ErrorCode::CrossTrackSelection,
                    "Please select cells that are on the same track",
                ));
            }
        };

        let new_track_id = self.cached.next_id();

        let deleted_points = self.cached.split_track(track_id, first, last, new_track_id);
        self.displayed.split_track(track_id, first, last, new_track_id);
        if !self.filter.is_empty() {
            self.filter.push(new_track_id);
        }
        let pruned = self.prune_both();
        info!(
            track_id,
            new_track_id, deleted_points, "unlinked track between slices {first} and {last}"
        );
        Ok(UnlinkOutcome {
            track_id,
            new_track_id,
            deleted_points,
            pruned,
        })
    }

    /// Removes the point at `position` from its track, as when the cell under
    /// it is deleted from the segmentation. The rest of the track after that
    /// slice moves to a new id; remnants shorter than two points are pruned.
    ///
    /// Returns `None` when no track has a point at `position`.
    pub fn detach_point(&mut self, position: &CellPosition) -> Option<DetachOutcome> {
        let track_id = self.cached.track_at(position)?;
        let slice = position.slice;
        let has_earlier = self.cached.track(track_id).any(|p| p.slice < slice);
        let new_track_id = if has_earlier {
            self.cached.next_id()
        } else {
            track_id
        };
        for table in [&mut self.cached, &mut self.displayed] {
            if has_earlier {
                table.split_track(track_id, slice, slice, new_track_id);
            }
            table.retain(|p| !(p.track_id == new_track_id && p.position() == *position));
        }
        if has_earlier && self.filter.contains(&track_id) {
            self.filter.push(new_track_id);
        }
        let pruned = self.prune_both();
        debug!(track_id, new_track_id, ?pruned, "detached point from track");
        Some(DetachOutcome {
            track_id,
            new_track_id,
            pruned,
        })
    }

    /// Sanitizes the reserved track id 0 in both tables.
    pub fn reassign_zero_ids(&mut self) -> Option<TrackId> {
        let new_id = self.cached.reassign_zero_ids()?;
        self.displayed.relabel(0, new_id);
        Some(new_id)
    }

    fn prune_both(&mut self) -> Vec<TrackId> {
        let pruned = self.cached.prune_short_tracks();
        self.displayed.prune_short_tracks();
        self.filter.retain(|id| !pruned.contains(id));
        pruned
    }
}
