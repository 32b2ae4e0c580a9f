use crate::batch::BatchTracker;
use crate::config::TrackingParameters;
use crate::dataset::{Dataset, SaveSelection};
use crate::error::{EngineError, ErrorCode};
use crate::metrics::{write_csv_file, MetricSelection};
use crate::proximity::track_from;
use crate::segmentation::SegmentationEditor;
use crate::track_store::TrackStore;
use crate::tracks::{CellPosition, TrackId, TrackTable};
use crate::volume::{IntensityVolume, LabelId, LabelVolume, VoxelPoint, BACKGROUND};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub type OpId = String;
pub type RunId = String;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub raw_data: Option<IntensityVolume>,
    #[serde(default)]
    pub segmentation: Option<SegmentationEditor>,
    #[serde(default)]
    pub tracks: TrackStore,
    #[serde(default)]
    pub parameters: TrackingParameters,
}

impl ProjectState {
    pub fn load_from_path(path: &str) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError {
            code: ErrorCode::Io,
            message: format!("Could not read state file '{path}': {e}"),
        })?;
        let state: Self = serde_json::from_str(&text).map_err(|e| EngineError {
            code: ErrorCode::InvalidInput,
            message: format!("Could not parse state JSON '{path}': {e}"),
        })?;
        state.parameters.validate()?;
        Ok(state)
    }

    pub fn save_to_path(&self, path: &str) -> Result<(), EngineError> {
        let text = serde_json::to_string_pretty(self).map_err(|e| EngineError {
            code: ErrorCode::Internal,
            message: format!("Could not serialize state: {e}"),
        })?;
        std::fs::write(path, text).map_err(|e| EngineError {
            code: ErrorCode::Io,
            message: format!("Could not write state file '{path}': {e}"),
        })
    }

    pub fn labels(&self) -> Option<&LabelVolume> {
        self.segmentation.as_ref().map(|s| s.labels())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    LoadDataset {
        path: String,
    },
    SaveDataset {
        path: String,
        selection: Option<SaveSelection>,
    },
    Link {
        points: Vec<CellPosition>,
        #[serde(default)]
        reveal_hidden: bool,
    },
    Unlink {
        points: Vec<CellPosition>,
    },
    RemoveCell {
        point: VoxelPoint,
    },
    RecolorRegion {
        point: VoxelPoint,
        new_id: Option<LabelId>,
    },
    MergeLabels {
        point: VoxelPoint,
        into: LabelId,
    },
    AutoTrackCell {
        point: VoxelPoint,
        #[serde(default)]
        reveal_hidden: bool,
    },
    TrackAll,
    FilterTracks {
        text: String,
    },
    ShowAllTracks,
    DeleteDisplayedTracks,
    AdjustIds {
        #[serde(default)]
        relabel_segmentation: bool,
    },
    ExportCsv {
        path: String,
        #[serde(default)]
        metrics: MetricSelection,
    },
    SetParameter {
        name: String,
        value: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub run_id: RunId,
    pub ops: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub op_id: OpId,
    pub changed_track_ids: Vec<TrackId>,
    pub warnings: Vec<String>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub run_id: RunId,
    pub op: Operation,
    pub result: OpResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_version: String,
    pub supported_operations: Vec<String>,
    pub supported_parameters: Vec<String>,
    pub deterministic_operation_log: bool,
}

pub trait Engine {
    fn apply(&mut self, op: Operation) -> Result<OpResult, EngineError>;
    fn apply_workflow(&mut self, wf: Workflow) -> Result<Vec<OpResult>, EngineError>;
    fn snapshot(&self) -> &ProjectState;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurationEngine {
    state: ProjectState,
    journal: Vec<OperationRecord>,
    op_counter: u64,
    #[serde(skip)]
    cancel: Arc<AtomicBool>,
}

impl CurationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: ProjectState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProjectState {
        &mut self.state
    }

    pub fn into_state(self) -> ProjectState {
        self.state
    }

    /// Flag that stops a running `TrackAll` at the next seed. It is reset
    /// when the run returns.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn capabilities() -> Capabilities {
        Capabilities {
            protocol_version: "v1".to_string(),
            supported_operations: vec![
                "LoadDataset".to_string(),
                "SaveDataset".to_string(),
                "Link".to_string(),
                "Unlink".to_string(),
                "RemoveCell".to_string(),
                "RecolorRegion".to_string(),
                "MergeLabels".to_string(),
                "AutoTrackCell".to_string(),
                "TrackAll".to_string(),
                "FilterTracks".to_string(),
                "ShowAllTracks".to_string(),
                "DeleteDisplayedTracks".to_string(),
                "AdjustIds".to_string(),
                "ExportCsv".to_string(),
                "SetParameter".to_string(),
            ],
            supported_parameters: vec![
                "min_overlap_fraction".to_string(),
                "min_track_length".to_string(),
                "worker_tier".to_string(),
            ],
            deterministic_operation_log: true,
        }
    }

    pub fn operation_log(&self) -> &[OperationRecord] {
        &self.journal
    }

    fn next_op_id(&mut self) -> OpId {
        self.op_counter += 1;
        format!("op-{}", self.op_counter)
    }

    fn segmentation_mut(&mut self) -> Result<&mut SegmentationEditor, EngineError> {
        self.state
            .segmentation
            .as_mut()
            .ok_or_else(|| EngineError::missing_layer("label layer"))
    }

    fn labels(&self) -> Result<&LabelVolume, EngineError> {
        self.state
            .labels()
            .ok_or_else(|| EngineError::missing_layer("label layer"))
    }

    fn apply_internal(&mut self, op: Operation, run_id: &str) -> Result<OpResult, EngineError> {
        let op_id = self.next_op_id();
        debug!(op_id = %op_id, run_id, ?op, "applying operation");
        let mut result = OpResult {
            op_id,
            changed_track_ids: vec![],
            warnings: vec![],
            messages: vec![],
        };

        match op {
            Operation::LoadDataset { path } => {
                let loaded = Dataset::open(&path)?.load()?;
                let mut tracks = TrackStore::new(loaded.tracks);
                if let Some(id) = tracks.reassign_zero_ids() {
                    result
                        .warnings
                        .push(format!("Track id 0 found in '{path}', renumbered to {id}"));
                }
                if loaded.segmentation.is_none() {
                    result
                        .warnings
                        .push(format!("'{path}' has no segmentation data"));
                }
                result.changed_track_ids = tracks.cached().track_ids();
                result.messages.push(format!(
                    "Loaded '{path}' with {} tracks",
                    tracks.cached().track_count()
                ));
                self.state.raw_data = loaded.raw;
                self.state.segmentation = loaded.segmentation.map(SegmentationEditor::new);
                self.state.tracks = tracks;
            }
            Operation::SaveDataset { path, selection } => {
                let dataset = Dataset::create(&path)?;
                let points = dataset.save(
                    self.state.raw_data.as_ref(),
                    self.state.labels(),
                    &self.state.tracks,
                    selection,
                )?;
                result
                    .messages
                    .push(format!("Saved {points} track points to '{path}'"));
            }
            Operation::Link {
                points,
                reveal_hidden,
            } => {
                let outcome = self.state.tracks.commit_link(&points, reveal_hidden)?;
                result.changed_track_ids.push(outcome.track_id);
                if let Some(merged) = outcome.merged_from {
                    result.changed_track_ids.push(merged);
                    result
                        .messages
                        .push(format!("Merged track {merged} into {}", outcome.track_id));
                }
                result.messages.push(format!(
                    "Linked {} points to track {}",
                    outcome.added_points, outcome.track_id
                ));
            }
            Operation::Unlink { points } => {
                let outcome = self.state.tracks.commit_unlink(&points)?;
                result.changed_track_ids = vec![outcome.track_id, outcome.new_track_id];
                result.messages.push(format!(
                    "Split track {} ({} points deleted, later part is track {})",
                    outcome.track_id, outcome.deleted_points, outcome.new_track_id
                ));
                if !outcome.pruned.is_empty() {
                    result
                        .warnings
                        .push(format!("Removed single-point tracks {:?}", outcome.pruned));
                }
            }
            Operation::RemoveCell { point } => {
                let editor = self
                    .state
                    .segmentation
                    .as_mut()
                    .ok_or_else(|| EngineError::missing_layer("label layer"))?;
                match editor.remove(&point, &mut self.state.tracks)? {
                    None => result.messages.push("Clicked on background".to_string()),
                    Some(removed) => {
                        if let Some(change) = removed.track_change {
                            result.changed_track_ids.push(change.track_id);
                            if change.new_track_id != change.track_id {
                                result.changed_track_ids.push(change.new_track_id);
                            }
                        }
                        result.messages.push(format!(
                            "Removed label {} from slice {}",
                            removed.label, point.slice
                        ));
                    }
                }
            }
            Operation::RecolorRegion { point, new_id } => {
                let written = self.segmentation_mut()?.recolor(&point, new_id)?;
                result.messages.push(format!(
                    "Region at {:?} is now label {written}",
                    (point.slice, point.row, point.col)
                ));
            }
            Operation::MergeLabels { point, into } => {
                let changed = self.segmentation_mut()?.replace_whole_label(&point, into)?;
                result
                    .messages
                    .push(format!("Merged {changed} pixels into label {into}"));
            }
            Operation::AutoTrackCell {
                point,
                reveal_hidden,
            } => {
                let labels = self.labels()?;
                let label = labels.label_at(&point)?;
                if label == BACKGROUND {
                    return Err(EngineError::new(
                        ErrorCode::BackgroundClick,
                        "Can not track the background",
                    ));
                }
                let trajectory = track_from(labels, point.slice, label, &self.state.parameters)?
                    .ok_or_else(|| {
                        EngineError::new(
                            ErrorCode::NotFound,
                            format!(
                                "No trajectory of at least {} slices starts at this cell",
                                self.state.parameters.min_track_length
                            ),
                        )
                    })?;
                let outcome = self.state.tracks.commit_link(&trajectory, reveal_hidden)?;
                result.changed_track_ids.push(outcome.track_id);
                result.changed_track_ids.extend(outcome.merged_from);
                result.messages.push(format!(
                    "Tracked label {label} over {} slices as track {}",
                    trajectory.len(),
                    outcome.track_id
                ));
            }
            Operation::TrackAll => {
                let tracker = BatchTracker::new(self.state.parameters.clone())
                    .with_cancel_flag(self.cancel.clone());
                let outcome = tracker.run(self.state.labels());
                self.cancel.store(false, Ordering::Relaxed);
                let table = outcome?;
                result.changed_track_ids = table.track_ids();
                result
                    .messages
                    .push(format!("Found {} tracks", table.track_count()));
                self.state.tracks.replace_all(table);
            }
            Operation::FilterTracks { text } => {
                let shown = self.state.tracks.filter_display(&text)?;
                result.changed_track_ids = self.state.tracks.displayed().track_ids();
                if shown.is_empty() {
                    result.messages.push("Showing all tracks".to_string());
                } else {
                    result.messages.push(format!("Showing tracks {shown}"));
                }
            }
            Operation::ShowAllTracks => {
                self.state.tracks.show_all();
                result.messages.push("Showing all tracks".to_string());
            }
            Operation::DeleteDisplayedTracks => {
                let removed = self.state.tracks.delete_displayed()?;
                result
                    .messages
                    .push(format!("Deleted tracks {removed:?}"));
                result.changed_track_ids = removed;
            }
            Operation::AdjustIds {
                relabel_segmentation,
            } => {
                if let Some(id) = self.state.tracks.reassign_zero_ids() {
                    result.changed_track_ids.push(id);
                    result.messages.push(format!("Track id 0 renumbered to {id}"));
                }
                if relabel_segmentation {
                    let table: TrackTable = self.state.tracks.cached().clone();
                    let relabeled = self.segmentation_mut()?.relabel_to_tracks(&table)?;
                    result.messages.push(format!(
                        "Relabeled {relabeled} cells to their track ids"
                    ));
                }
            }
            Operation::ExportCsv { path, metrics } => {
                write_csv_file(
                    &path,
                    self.state.tracks.cached(),
                    self.state.labels(),
                    metrics,
                )?;
                result.messages.push(format!("Exported metrics to '{path}'"));
            }
            Operation::SetParameter { name, value } => {
                let message = self.state.parameters.set(&name, &value)?;
                result.messages.push(message);
            }
        }

        info!(
            op_id = %result.op_id,
            changed = ?result.changed_track_ids,
            "operation applied"
        );
        Ok(result)
    }
}

impl Engine for CurationEngine {
    fn apply(&mut self, op: Operation) -> Result<OpResult, EngineError> {
        let run_id = "interactive".to_string();
        let result = self.apply_internal(op.clone(), &run_id)?;
        self.journal.push(OperationRecord {
            run_id,
            op,
            result: result.clone(),
        });
        Ok(result)
    }

    fn apply_workflow(&mut self, wf: Workflow) -> Result<Vec<OpResult>, EngineError> {
        let mut results = Vec::new();
        for op in &wf.ops {
            let result = self.apply_internal(op.clone(), &wf.run_id)?;
            self.journal.push(OperationRecord {
                run_id: wf.run_id.clone(),
                op: op.clone(),
                result: result.clone(),
            });
            results.push(result);
        }
        Ok(results)
    }

    fn snapshot(&self) -> &ProjectState {
        &self.state
    }
}
