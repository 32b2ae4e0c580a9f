//! Click state machine for the interactive curation modes.
//!
//! `handle_click` is pure: it resolves a click against the label volume and
//! says what should happen next. Applying the resulting [`Effect`] is left to
//! [`crate::session::CurationSession`].

use crate::centroid::cell_at;
use crate::error::{EngineError, ErrorCode};
use crate::tracks::CellPosition;
use crate::volume::{LabelId, LabelVolume, VoxelPoint, BACKGROUND};
use serde::{Deserialize, Serialize};

/// What the next single click is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPurpose {
    RemoveCell,
    Recolor,
    MergeSource,
    GrabLabel,
    AutoTrack { reveal_hidden: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionState {
    #[default]
    Idle,
    RecordingLink {
        buffer: Vec<CellPosition>,
    },
    RecordingUnlink {
        buffer: Vec<CellPosition>,
    },
    AwaitingMergeTarget {
        source: LabelId,
    },
    AwaitingSelection(SelectionPurpose),
}

impl InteractionState {
    pub fn buffer(&self) -> &[CellPosition] {
        match self {
            InteractionState::RecordingLink { buffer }
            | InteractionState::RecordingUnlink { buffer } => buffer,
            _ => &[],
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, InteractionState::Idle)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Nothing,
    PointRecorded(CellPosition),
    /// The click was refused; the state is unchanged.
    Rejected(EngineError),
    /// The pending action was abandoned; the state is back to idle.
    Aborted(EngineError),
    RemoveCell(VoxelPoint),
    RecolorRegion(VoxelPoint),
    MergeSourcePicked(LabelId),
    MergeInto {
        point: VoxelPoint,
        target: LabelId,
    },
    LabelGrabbed(LabelId),
    AutoTrack {
        point: VoxelPoint,
        reveal_hidden: bool,
    },
}

fn background_error(action: &str) -> EngineError {
    EngineError::new(
        ErrorCode::BackgroundClick,
        format!("Can not {action} the background"),
    )
}

fn record(mut buffer: Vec<CellPosition>, labels: &LabelVolume, point: &VoxelPoint) -> (Vec<CellPosition>, Effect) {
    match cell_at(labels, point) {
        Ok(Some(position)) => {
            let at = buffer.partition_point(|p| p.slice <= position.slice);
            buffer.insert(at, position);
            (buffer, Effect::PointRecorded(position))
        }
        Ok(None) => (buffer, Effect::Rejected(background_error("select"))),
        Err(e) => (buffer, Effect::Rejected(e)),
    }
}

/// Resolves a click at `point` in `state`. Returns the follow-up state and
/// the effect to apply.
pub fn handle_click(
    state: InteractionState,
    labels: Option<&LabelVolume>,
    point: VoxelPoint,
) -> (InteractionState, Effect) {
    if state.is_idle() {
        return (state, Effect::Nothing);
    }
    let Some(labels) = labels else {
        return (
            InteractionState::Idle,
            Effect::Aborted(EngineError::missing_layer("label layer")),
        );
    };

    match state {
        InteractionState::Idle => (InteractionState::Idle, Effect::Nothing),
        InteractionState::RecordingLink { buffer } => {
            let (buffer, effect) = record(buffer, labels, &point);
            (InteractionState::RecordingLink { buffer }, effect)
        }
        InteractionState::RecordingUnlink { buffer } => {
            let (buffer, effect) = record(buffer, labels, &point);
            (InteractionState::RecordingUnlink { buffer }, effect)
        }
        InteractionState::AwaitingMergeTarget { source } => match labels.label_at(&point) {
            Ok(BACKGROUND) => (
                InteractionState::Idle,
                Effect::Aborted(background_error("merge into")),
            ),
            Ok(_) => (
                InteractionState::Idle,
                Effect::MergeInto {
                    point,
                    target: source,
                },
            ),
            Err(e) => (InteractionState::Idle, Effect::Aborted(e)),
        },
        InteractionState::AwaitingSelection(purpose) => {
            let label = match labels.label_at(&point) {
                Ok(label) => label,
                Err(e) => return (InteractionState::Idle, Effect::Aborted(e)),
            };
            match purpose {
                SelectionPurpose::RemoveCell => (InteractionState::Idle, Effect::RemoveCell(point)),
                SelectionPurpose::GrabLabel => {
                    let label = if label == BACKGROUND {
                        labels.next_free_label()
                    } else {
                        label
                    };
                    (InteractionState::Idle, Effect::LabelGrabbed(label))
                }
                _ if label == BACKGROUND => {
                    let action = match purpose {
                        SelectionPurpose::Recolor => "separate",
                        SelectionPurpose::MergeSource => "merge",
                        _ => "track",
                    };
                    (InteractionState::Idle, Effect::Aborted(background_error(action)))
                }
                SelectionPurpose::Recolor => (InteractionState::Idle, Effect::RecolorRegion(point)),
                SelectionPurpose::MergeSource => (
                    InteractionState::AwaitingMergeTarget { source: label },
                    Effect::MergeSourcePicked(label),
                ),
                SelectionPurpose::AutoTrack { reveal_hidden } => (
                    InteractionState::Idle,
                    Effect::AutoTrack {
                        point,
                        reveal_hidden,
                    },
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelVolume {
        LabelVolume::from_slices(vec![
            vec![vec![1, 1, 0], vec![0, 0, 2]],
            vec![vec![0, 3, 3], vec![0, 0, 0]],
            vec![vec![4, 0, 0], vec![0, 0, 0]],
        ])
        .unwrap()
    }

    fn link() -> InteractionState {
        InteractionState::RecordingLink { buffer: vec![] }
    }

    #[test]
    fn test_idle_ignores_clicks() {
        let (state, effect) = handle_click(InteractionState::Idle, None, VoxelPoint::new(0, 0, 0));
        assert_eq!(state, InteractionState::Idle);
        assert_eq!(effect, Effect::Nothing);
    }

    #[test]
    fn test_recording_keeps_buffer_sorted_by_slice() {
        let l = labels();
        let (s, _) = handle_click(link(), Some(&l), VoxelPoint::new(2, 0, 0));
        let (s, _) = handle_click(s, Some(&l), VoxelPoint::new(0, 0, 1));
        let (s, e) = handle_click(s, Some(&l), VoxelPoint::new(1, 0, 2));
        assert_eq!(e, Effect::PointRecorded(CellPosition::new(1, 0, 2)));
        let slices: Vec<i32> = s.buffer().iter().map(|p| p.slice).collect();
        assert_eq!(slices, vec![0, 1, 2]);
        // centroid of label 1 in slice 0 is (0, 0.5) -> (0, 0)
        assert_eq!(s.buffer()[0], CellPosition::new(0, 0, 0));
    }

    #[test]
    fn test_background_click_while_recording_is_rejected() {
        let l = labels();
        let (s, e) = handle_click(link(), Some(&l), VoxelPoint::new(0, 0, 2));
        assert!(matches!(e, Effect::Rejected(ref err) if err.code == ErrorCode::BackgroundClick));
        assert_eq!(s, link());
    }

    #[test]
    fn test_missing_labels_abort() {
        let (s, e) = handle_click(link(), None, VoxelPoint::new(0, 0, 0));
        assert!(s.is_idle());
        assert!(matches!(e, Effect::Aborted(ref err) if err.code == ErrorCode::MissingLayer));
    }

    #[test]
    fn test_two_step_merge() {
        let l = labels();
        let (s, e) = handle_click(
            InteractionState::AwaitingSelection(SelectionPurpose::MergeSource),
            Some(&l),
            VoxelPoint::new(0, 1, 2),
        );
        assert_eq!(e, Effect::MergeSourcePicked(2));
        assert_eq!(s, InteractionState::AwaitingMergeTarget { source: 2 });

        let (s2, e2) = handle_click(s.clone(), Some(&l), VoxelPoint::new(0, 1, 0));
        assert!(s2.is_idle());
        assert!(matches!(e2, Effect::Aborted(_)));

        let (s3, e3) = handle_click(s, Some(&l), VoxelPoint::new(0, 0, 1));
        assert!(s3.is_idle());
        assert_eq!(
            e3,
            Effect::MergeInto {
                point: VoxelPoint::new(0, 0, 1),
                target: 2
            }
        );
    }

    #[test]
    fn test_grab_label_on_background_yields_free_label() {
        let l = labels();
        let grab = InteractionState::AwaitingSelection(SelectionPurpose::GrabLabel);
        let (_, e) = handle_click(grab.clone(), Some(&l), VoxelPoint::new(1, 0, 1));
        assert_eq!(e, Effect::LabelGrabbed(3));
        let (_, e) = handle_click(grab, Some(&l), VoxelPoint::new(1, 1, 1));
        assert_eq!(e, Effect::LabelGrabbed(5));
    }

    #[test]
    fn test_recolor_background_aborts() {
        let l = labels();
        let (s, e) = handle_click(
            InteractionState::AwaitingSelection(SelectionPurpose::Recolor),
            Some(&l),
            VoxelPoint::new(1, 1, 1),
        );
        assert!(s.is_idle());
        assert!(matches!(e, Effect::Aborted(ref err) if err.code == ErrorCode::BackgroundClick));
    }

    #[test]
    fn test_remove_passes_background_through() {
        let l = labels();
        let (_, e) = handle_click(
            InteractionState::AwaitingSelection(SelectionPurpose::RemoveCell),
            Some(&l),
            VoxelPoint::new(1, 1, 1),
        );
        assert_eq!(e, Effect::RemoveCell(VoxelPoint::new(1, 1, 1)));
    }
}
