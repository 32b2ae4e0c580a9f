//! Per-track speed and size statistics and their CSV export.

use crate::error::EngineError;
use crate::tracks::{TrackId, TrackTable};
use crate::volume::{LabelVolume, VoxelPoint, BACKGROUND};
use csv::WriterBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSelection {
    pub speed: bool,
    pub size: bool,
}

impl MetricSelection {
    pub fn any(&self) -> bool {
        self.speed || self.size
    }
}

/// Mean and population standard deviation of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackStats {
    pub mean: f64,
    pub std_dev: f64,
}

impl TrackStats {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std_dev: var.sqrt(),
        })
    }
}

pub type MetricTable = BTreeMap<TrackId, Option<TrackStats>>;

/// Euclidean (row, col) distance between consecutive points of every track.
pub fn speed_per_track(tracks: &TrackTable) -> MetricTable {
    tracks
        .trajectories()
        .into_iter()
        .map(|(id, trajectory)| {
            let steps: Vec<f64> = trajectory
                .iter()
                .tuple_windows()
                .map(|(a, b)| f64::from(a.row - b.row).hypot(f64::from(a.col - b.col)))
                .collect();
            (id, TrackStats::from_samples(&steps))
        })
        .collect()
}

/// Pixel count of the cell under every track point, in that point's slice.
/// Points on background or outside the volume are skipped.
pub fn size_per_track(tracks: &TrackTable, labels: &LabelVolume) -> MetricTable {
    tracks
        .trajectories()
        .into_iter()
        .map(|(id, trajectory)| {
            let sizes: Vec<f64> = trajectory
                .iter()
                .filter_map(|p| {
                    let point = VoxelPoint::new(
                        usize::try_from(p.slice).ok()?,
                        usize::try_from(p.row).ok()?,
                        usize::try_from(p.col).ok()?,
                    );
                    let label = labels.get(&point).filter(|l| *l != BACKGROUND)?;
                    let slice = labels.slice(point.slice)?;
                    Some(slice.pixel_count(label) as f64)
                })
                .collect();
            (id, TrackStats::from_samples(&sizes))
        })
        .collect()
}

/// Mean and population std of the per-track means.
fn aggregate(table: &MetricTable) -> Option<TrackStats> {
    let means: Vec<f64> = table.values().flatten().map(|s| s.mean).collect();
    TrackStats::from_samples(&means)
}

fn push_stats(record: &mut Vec<String>, stats: Option<TrackStats>) {
    match stats {
        Some(s) => {
            record.push(s.mean.to_string());
            record.push(s.std_dev.to_string());
        }
        None => {
            record.push(String::new());
            record.push(String::new());
        }
    }
}

/// Writes the summary block and, when any metric is selected, one row per
/// track. Size needs the labeled volume.
pub fn export_csv<W: Write>(
    writer: W,
    tracks: &TrackTable,
    labels: Option<&LabelVolume>,
    selection: MetricSelection,
) -> Result<(), EngineError> {
    let speed = selection.speed.then(|| speed_per_track(tracks));
    let size = match (selection.size, labels) {
        (false, _) => None,
        (true, Some(labels)) => Some(size_per_track(tracks, labels)),
        (true, None) => return Err(EngineError::missing_layer("label layer")),
    };

    let mut wtr = WriterBuilder::new().flexible(true).from_writer(writer);
    let mut header = vec!["Number of cells".to_string()];
    let mut values = vec![tracks.track_count().to_string()];
    let mut per_track_header = vec!["ID".to_string()];
    for (metric, table) in [("speed", &speed), ("size", &size)] {
        let Some(table) = table else {
            continue;
        };
        for h in [&mut header, &mut per_track_header] {
            h.push(format!("Average {metric}"));
            h.push(format!("Standard deviation of {metric}"));
        }
        push_stats(&mut values, aggregate(table));
    }
    wtr.write_record(&header)?;
    wtr.write_record(&values)?;

    if selection.any() {
        wtr.write_record([""])?;
        wtr.write_record([""])?;
        wtr.write_record(&per_track_header)?;
        for id in tracks.track_ids() {
            let mut record = vec![id.to_string()];
            for table in [&speed, &size].into_iter().flatten() {
                push_stats(&mut record, table.get(&id).copied().flatten());
            }
            wtr.write_record(&record)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_csv_file(
    path: &str,
    tracks: &TrackTable,
    labels: Option<&LabelVolume>,
    selection: MetricSelection,
) -> Result<(), EngineError> {
    let file = std::fs::File::create(path).map_err(|e| {
        EngineError::io(format!("Could not create CSV file '{path}': {e}"))
    })?;
    export_csv(file, tracks, labels, selection)?;
    info!(path, tracks = tracks.track_count(), ?selection, "exported metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks() -> TrackTable {
        TrackTable::from_rows(&[
            [1, 0, 0, 0],
            [1, 1, 3, 4],
            [1, 2, 3, 4],
            [2, 0, 1, 1],
            [2, 1, 1, 2],
        ])
    }

    fn export(selection: MetricSelection, labels: Option<&LabelVolume>) -> String {
        let mut buf = vec![];
        export_csv(&mut buf, &tracks(), labels, selection).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_stats_population_std() {
        let s = TrackStats::from_samples(&[5.0, 0.0]).unwrap();
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.std_dev, 2.5);
        assert!(TrackStats::from_samples(&[]).is_none());
    }

    #[test]
    fn test_speed_per_track() {
        let speed = speed_per_track(&tracks());
        assert_eq!(speed[&1].unwrap().mean, 2.5);
        assert_eq!(speed[&2].unwrap().mean, 1.0);
        assert_eq!(speed[&2].unwrap().std_dev, 0.0);
    }

    #[test]
    fn test_no_metrics_is_single_row() {
        let text = export(MetricSelection::default(), None);
        assert_eq!(text, "Number of cells\n2\n");
    }

    #[test]
    fn test_speed_export_has_per_track_section() {
        let text = export(
            MetricSelection {
                speed: true,
                size: false,
            },
            None,
        );
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Number of cells,Average speed,Standard deviation of speed"
        );
        assert_eq!(lines[1], "2,1.75,0.75");
        assert_eq!(lines[2], "\"\"");
        assert_eq!(lines[3], "\"\"");
        assert_eq!(lines[4], "ID,Average speed,Standard deviation of speed");
        assert_eq!(lines[5], "1,2.5,2.5");
        assert_eq!(lines[6], "2,1,0");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn test_size_needs_labels() {
        let mut buf = vec![];
        let err = export_csv(
            &mut buf,
            &tracks(),
            None,
            MetricSelection {
                speed: false,
                size: true,
            },
        )
        .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::MissingLayer);
    }

    #[test]
    fn test_size_skips_background_points() {
        let mut labels = LabelVolume::new(3, 5, 5);
        for z in 0..3 {
            let mut s = labels.slice_mut(z).unwrap();
            s.set(3, 4, 1);
            s.set(3, 3, 1);
        }
        labels.slice_mut(0).unwrap().set(0, 0, 4);
        let size = size_per_track(&tracks(), &labels);
        let t1 = size[&1].unwrap();
        assert_eq!(t1.mean, 5.0 / 3.0);
        // track 2 only touches background
        assert!(size[&2].is_none());
    }

    #[test]
    fn test_write_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let path = path.to_str().unwrap();
        write_csv_file(path, &tracks(), None, MetricSelection::default()).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("Number of cells"));
    }
}
