//! On-disk dataset: a directory holding the raw intensity volume, the
//! segmentation and the tracking table as three independent JSON arrays.
//!
//! Each array file carries `shape`, `dtype` and the flattened `data`, so the
//! tracking array can be rewritten (and change its row count) without touching
//! the two volumes.

use crate::error::{EngineError, ErrorCode};
use crate::track_store::TrackStore;
use crate::tracks::TrackTable;
use crate::volume::{IntensityVolume, LabelVolume};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const RAW_DATA: &str = "raw_data.json";
pub const SEGMENTATION_DATA: &str = "segmentation_data.json";
pub const TRACKING_DATA: &str = "tracking_data.json";

/// Which track table to persist while a filter hides some tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveSelection {
    Displayed,
    All,
}

#[derive(Deserialize)]
struct StoredArray<T> {
    shape: Vec<usize>,
    dtype: String,
    data: Vec<T>,
}

#[derive(Serialize)]
struct StoredArrayRef<'a, T> {
    shape: &'a [usize],
    dtype: &'a str,
    data: &'a [T],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedDataset {
    pub raw: Option<IntensityVolume>,
    pub segmentation: Option<LabelVolume>,
    pub tracks: TrackTable,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
}

impl Dataset {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            EngineError::io(format!("Could not create dataset '{}': {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(EngineError::new(
                ErrorCode::NotFound,
                format!("Dataset '{}' does not exist", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_array<T: for<'de> Deserialize<'de>>(
        &self,
        name: &str,
        dtype: &str,
    ) -> Result<Option<StoredArray<T>>, EngineError> {
        let path = self.root.join(name);
        if !path.exists() {
            debug!(path = %path.display(), "array not present");
            return Ok(None);
        }
        let file = File::open(&path)
            .map_err(|e| EngineError::io(format!("Could not read '{}': {e}", path.display())))?;
        let array: StoredArray<T> = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            EngineError::invalid_input(format!(
                "'{}' does not adhere to the dataset structure: {e}",
                path.display()
            ))
        })?;
        if array.dtype != dtype {
            return Err(EngineError::invalid_input(format!(
                "'{}' has dtype {}, expected {dtype}",
                path.display(),
                array.dtype
            )));
        }
        if array.shape.iter().product::<usize>() != array.data.len() {
            return Err(EngineError::invalid_input(format!(
                "'{}' has {} values for shape {:?}",
                path.display(),
                array.data.len(),
                array.shape
            )));
        }
        Ok(Some(array))
    }

    fn write_array<T: Serialize>(
        &self,
        name: &str,
        shape: &[usize],
        dtype: &str,
        data: &[T],
    ) -> Result<(), EngineError> {
        let path = self.root.join(name);
        let file = File::create(&path)
            .map_err(|e| EngineError::io(format!("Could not write '{}': {e}", path.display())))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &StoredArrayRef { shape, dtype, data }).map_err(
            |e| EngineError {
                code: ErrorCode::Internal,
                message: format!("Could not serialize '{}': {e}", path.display()),
            },
        )?;
        writer.flush()?;
        Ok(())
    }

    fn volume_shape(shape: &[usize], name: &str) -> Result<[usize; 3], EngineError> {
        <[usize; 3]>::try_from(shape).map_err(|_| {
            EngineError::invalid_input(format!("{name} must be 3-dimensional, got {shape:?}"))
        })
    }

    pub fn load(&self) -> Result<LoadedDataset, EngineError> {
        let raw = match self.read_array::<f64>(RAW_DATA, "f8")? {
            Some(a) => Some(IntensityVolume::from_raw(
                Self::volume_shape(&a.shape, "raw_data")?,
                a.data,
            )?),
            None => None,
        };
        let segmentation = match self.read_array::<i32>(SEGMENTATION_DATA, "i4")? {
            Some(a) => Some(LabelVolume::from_raw(
                Self::volume_shape(&a.shape, "segmentation_data")?,
                a.data,
            )?),
            None => None,
        };
        if let (Some(r), Some(s)) = (&raw, &segmentation)
            && r.shape() != s.shape()
        {
            return Err(EngineError::invalid_input(format!(
                "raw_data shape {:?} does not match segmentation_data shape {:?}",
                r.shape(),
                s.shape()
            )));
        }
        let tracks = match self.read_array::<i32>(TRACKING_DATA, "i4")? {
            Some(a) => {
                let rows: Vec<[i32; 4]> = match a.shape.as_slice() {
                    [_, 4] => a
                        .data
                        .chunks_exact(4)
                        .map(|c| [c[0], c[1], c[2], c[3]])
                        .collect(),
                    [0] | [0, _] => vec![],
                    other => {
                        return Err(EngineError::invalid_input(format!(
                            "tracking_data must have 4 columns, got shape {other:?}"
                        )));
                    }
                };
                TrackTable::from_rows(&rows)
            }
            None => TrackTable::new(),
        };
        info!(
            dataset = %self.root.display(),
            has_raw = raw.is_some(),
            has_segmentation = segmentation.is_some(),
            tracks = tracks.track_count(),
            "loaded dataset"
        );
        Ok(LoadedDataset {
            raw,
            segmentation,
            tracks,
        })
    }

    pub fn write_raw(&self, raw: &IntensityVolume) -> Result<(), EngineError> {
        self.write_array(RAW_DATA, &raw.shape(), "f8", raw.as_raw())
    }

    pub fn write_segmentation(&self, labels: &LabelVolume) -> Result<(), EngineError> {
        self.write_array(SEGMENTATION_DATA, &labels.shape(), "i4", labels.as_raw())
    }

    /// Overwrites the tracking array, resizing it to the table's row count.
    pub fn write_tracks(&self, tracks: &TrackTable) -> Result<(), EngineError> {
        let data: Vec<i32> = tracks.to_rows().into_iter().flatten().collect();
        self.write_array(TRACKING_DATA, &[tracks.len(), 4], "i4", &data)
    }

    /// Persists all arrays. While a filter hides tracks the caller must say
    /// whether the displayed subset or every cached track is written.
    /// Returns the number of track points written.
    pub fn save(
        &self,
        raw: Option<&IntensityVolume>,
        labels: Option<&LabelVolume>,
        tracks: &TrackStore,
        selection: Option<SaveSelection>,
    ) -> Result<usize, EngineError> {
        let labels = labels.ok_or_else(|| EngineError::missing_layer("segmentation data"))?;
        let table = match (tracks.is_in_sync(), selection) {
            (true, _) | (false, Some(SaveSelection::All)) => tracks.cached(),
            (false, Some(SaveSelection::Displayed)) => tracks.displayed(),
            (false, None) => {
                return Err(EngineError::new(
                    ErrorCode::TracksHidden,
                    "Only some tracks are displayed; choose to save the selected ones or all of them",
                ));
            }
        };
        if let Some(raw) = raw {
            self.write_raw(raw)?;
        }
        self.write_segmentation(labels)?;
        self.write_tracks(table)?;
        info!(
            dataset = %self.root.display(),
            points = table.len(),
            tracks = table.track_count(),
            "saved dataset"
        );
        Ok(table.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelVolume {
        LabelVolume::from_slices(vec![vec![vec![1, 0]], vec![vec![1, 2]]]).unwrap()
    }

    fn store() -> TrackStore {
        TrackStore::new(TrackTable::from_rows(&[
            [1, 0, 0, 0],
            [1, 1, 0, 0],
            [2, 0, 0, 1],
            [2, 1, 0, 1],
        ]))
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let ds = Dataset::create(dir.path().join("set")).unwrap();
        let raw = IntensityVolume::from_raw([2, 1, 2], vec![0.5, 1.0, 1.5, 2.0]).unwrap();
        let n = ds.save(Some(&raw), Some(&labels()), &store(), None).unwrap();
        assert_eq!(n, 4);

        let loaded = Dataset::open(ds.root()).unwrap().load().unwrap();
        assert_eq!(loaded.raw, Some(raw));
        assert_eq!(loaded.segmentation, Some(labels()));
        assert_eq!(loaded.tracks, store().cached().clone());
    }

    #[test]
    fn test_save_with_hidden_tracks_requires_choice() {
        let dir = tempfile::tempdir().unwrap();
        let ds = Dataset::create(dir.path()).unwrap();
        let mut tracks = store();
        tracks.filter_ids(&[2]);
        let err = ds.save(None, Some(&labels()), &tracks, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::TracksHidden);

        assert_eq!(
            ds.save(None, Some(&labels()), &tracks, Some(SaveSelection::Displayed))
                .unwrap(),
            2
        );
        assert_eq!(ds.load().unwrap().tracks.track_ids(), vec![2]);

        assert_eq!(
            ds.save(None, Some(&labels()), &tracks, Some(SaveSelection::All))
                .unwrap(),
            4
        );
        assert_eq!(ds.load().unwrap().tracks.track_ids(), vec![1, 2]);
    }

    #[test]
    fn test_tracking_array_resizes_independently() {
        let dir = tempfile::tempdir().unwrap();
        let ds = Dataset::create(dir.path()).unwrap();
        ds.save(None, Some(&labels()), &store(), None).unwrap();
        let seg_before = std::fs::read(dir.path().join(SEGMENTATION_DATA)).unwrap();
        ds.write_tracks(&TrackTable::new()).unwrap();
        let loaded = ds.load().unwrap();
        assert!(loaded.tracks.is_empty());
        assert_eq!(
            std::fs::read(dir.path().join(SEGMENTATION_DATA)).unwrap(),
            seg_before
        );
    }

    #[test]
    fn test_save_without_segmentation_is_missing_layer() {
        let dir = tempfile::tempdir().unwrap();
        let ds = Dataset::create(dir.path()).unwrap();
        let err = ds.save(None, None, &store(), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingLayer);
    }

    #[test]
    fn test_load_rejects_malformed_tracks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(TRACKING_DATA),
            r#"{"shape":[1,3],"dtype":"i4","data":[1,2,3]}"#,
        )
        .unwrap();
        let err = Dataset::open(dir.path()).unwrap().load().unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[test]
    fn test_open_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = Dataset::open(dir.path().join("nope")).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
