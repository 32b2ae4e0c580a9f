//! Interactive curation on top of a [`CurationEngine`].
//!
//! The session owns the click state; every edit it triggers goes through
//! `Engine::apply`, so interactive work ends up in the operation log the same
//! way scripted work does.

use crate::engine::{CurationEngine, Engine, OpResult, Operation};
use crate::error::EngineError;
use crate::interaction::{handle_click, Effect, InteractionState, SelectionPurpose};
use crate::tracks::CellPosition;
use crate::volume::{LabelId, VoxelPoint};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Ignored,
    RecordingStarted,
    PointRecorded(CellPosition),
    AwaitingClick(SelectionPurpose),
    MergeSourcePicked(LabelId),
    LabelGrabbed(LabelId),
    Applied(OpResult),
    Cancelled,
}

pub struct CurationSession<'a> {
    engine: &'a mut CurationEngine,
    state: InteractionState,
}

impl<'a> CurationSession<'a> {
    pub fn new(engine: &'a mut CurationEngine) -> Self {
        Self {
            engine,
            state: InteractionState::Idle,
        }
    }

    pub fn state(&self) -> &InteractionState {
        &self.state
    }

    pub fn engine(&self) -> &CurationEngine {
        self.engine
    }

    /// First press starts recording a link; the second commits the recorded
    /// points. The buffer is cleared before committing, so a failed commit
    /// also leaves the session idle.
    pub fn link_button(&mut self, reveal_hidden: bool) -> Result<SessionEvent, EngineError> {
        match std::mem::take(&mut self.state) {
            InteractionState::RecordingLink { buffer } => self.apply(Operation::Link {
                points: buffer,
                reveal_hidden,
            }),
            _ => {
                self.state = InteractionState::RecordingLink { buffer: vec![] };
                Ok(SessionEvent::RecordingStarted)
            }
        }
    }

    pub fn unlink_button(&mut self) -> Result<SessionEvent, EngineError> {
        match std::mem::take(&mut self.state) {
            InteractionState::RecordingUnlink { buffer } => {
                self.apply(Operation::Unlink { points: buffer })
            }
            _ => {
                self.state = InteractionState::RecordingUnlink { buffer: vec![] };
                Ok(SessionEvent::RecordingStarted)
            }
        }
    }

    /// Arms a single-click action, dropping any recording in progress.
    pub fn select(&mut self, purpose: SelectionPurpose) -> SessionEvent {
        self.state = InteractionState::AwaitingSelection(purpose);
        SessionEvent::AwaitingClick(purpose)
    }

    pub fn cancel(&mut self) -> SessionEvent {
        self.state = InteractionState::Idle;
        SessionEvent::Cancelled
    }

    pub fn click(&mut self, point: VoxelPoint) -> Result<SessionEvent, EngineError> {
        let state = std::mem::take(&mut self.state);
        let (next, effect) = handle_click(state, self.engine.state().labels(), point);
        self.state = next;
        debug!(?point, ?effect, "click handled");
        match effect {
            Effect::Nothing => Ok(SessionEvent::Ignored),
            Effect::PointRecorded(p) => Ok(SessionEvent::PointRecorded(p)),
            Effect::Rejected(e) | Effect::Aborted(e) => Err(e),
            Effect::RemoveCell(point) => self.apply(Operation::RemoveCell { point }),
            Effect::RecolorRegion(point) => self.apply(Operation::RecolorRegion {
                point,
                new_id: None,
            }),
            Effect::MergeSourcePicked(label) => Ok(SessionEvent::MergeSourcePicked(label)),
            Effect::MergeInto { point, target } => self.apply(Operation::MergeLabels {
                point,
                into: target,
            }),
            Effect::LabelGrabbed(label) => Ok(SessionEvent::LabelGrabbed(label)),
            Effect::AutoTrack {
                point,
                reveal_hidden,
            } => self.apply(Operation::AutoTrackCell {
                point,
                reveal_hidden,
            }),
        }
    }

    fn apply(&mut self, op: Operation) -> Result<SessionEvent, EngineError> {
        self.engine.apply(op).map(SessionEvent::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProjectState;
    use crate::error::ErrorCode;
    use crate::proximity::tests::persistent_cell;
    use crate::segmentation::SegmentationEditor;

    fn engine(slices: usize) -> CurationEngine {
        CurationEngine::from_state(ProjectState {
            segmentation: Some(SegmentationEditor::new(persistent_cell(slices, &[]))),
            ..ProjectState::default()
        })
    }

    #[test]
    fn test_link_recording_and_commit() {
        let mut engine = engine(4);
        let mut session = CurationSession::new(&mut engine);
        assert_eq!(session.link_button(false).unwrap(), SessionEvent::RecordingStarted);
        for z in [2, 0, 1] {
            session.click(VoxelPoint::new(z, 3, 3)).unwrap();
        }
        assert_eq!(session.state().buffer().len(), 3);
        let event = session.link_button(false).unwrap();
        assert!(matches!(event, SessionEvent::Applied(ref r) if r.changed_track_ids == vec![1]));
        assert!(session.state().is_idle());
        assert_eq!(engine.state().tracks.cached().len(), 3);
    }

    #[test]
    fn test_failed_commit_clears_buffer() {
        let mut engine = engine(4);
        let mut session = CurationSession::new(&mut engine);
        session.link_button(false).unwrap();
        session.click(VoxelPoint::new(0, 3, 3)).unwrap();
        session.click(VoxelPoint::new(0, 2, 2)).unwrap();
        let err = session.link_button(false).unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateSlice);
        assert!(session.state().is_idle());
        assert!(engine.state().tracks.cached().is_empty());
    }

    #[test]
    fn test_background_click_keeps_recording() {
        let mut engine = engine(4);
        let mut session = CurationSession::new(&mut engine);
        session.unlink_button().unwrap();
        let err = session.click(VoxelPoint::new(0, 0, 0)).unwrap_err();
        assert_eq!(err.code, ErrorCode::BackgroundClick);
        assert!(matches!(
            session.state(),
            InteractionState::RecordingUnlink { .. }
        ));
        assert_eq!(session.cancel(), SessionEvent::Cancelled);
        assert!(session.state().is_idle());
    }

    #[test]
    fn test_merge_through_session() {
        let mut engine = engine(2);
        if let Some(s) = engine.state_mut().segmentation.as_mut() {
            s.recolor(&VoxelPoint::new(0, 2, 2), Some(7)).unwrap();
        }
        let mut session = CurationSession::new(&mut engine);
        session.select(SelectionPurpose::MergeSource);
        // slice 1 still carries label 1
        assert_eq!(
            session.click(VoxelPoint::new(1, 3, 3)).unwrap(),
            SessionEvent::MergeSourcePicked(1)
        );
        let event = session.click(VoxelPoint::new(0, 3, 3)).unwrap();
        assert!(matches!(event, SessionEvent::Applied(_)));
        let labels = engine.state().labels().unwrap();
        assert_eq!(labels.slice(0).unwrap().pixel_count(1), 9);
        assert_eq!(labels.slice(0).unwrap().pixel_count(7), 0);
    }

    #[test]
    fn test_auto_track_selection() {
        let mut engine = engine(6);
        let mut session = CurationSession::new(&mut engine);
        session.select(SelectionPurpose::AutoTrack {
            reveal_hidden: false,
        });
        let event = session.click(VoxelPoint::new(0, 3, 3)).unwrap();
        assert!(matches!(event, SessionEvent::Applied(_)));
        assert_eq!(engine.state().tracks.cached().track(1).count(), 6);
        assert_eq!(engine.operation_log().len(), 1);
    }
}
