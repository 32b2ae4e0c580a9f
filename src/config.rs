use crate::error::{EngineError, ErrorCode};
use serde::{Deserialize, Serialize};

/// Size of the batch tracking worker pool relative to the available cores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerTier {
    /// About 40% of the cores.
    #[default]
    Economical,
    /// About 80% of the cores.
    Performance,
}

impl WorkerTier {
    pub fn core_fraction(self) -> f64 {
        match self {
            WorkerTier::Economical => 0.4,
            WorkerTier::Performance => 0.8,
        }
    }

    pub fn worker_count(self, available_cores: usize) -> usize {
        ((available_cores as f64 * self.core_fraction()).floor() as usize).max(1)
    }

    pub fn worker_count_for_host(self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.worker_count(cores)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingParameters {
    /// A successor label must cover strictly more than this share of the
    /// sampled pixels.
    pub min_overlap_fraction: f64,
    /// Shorter trajectories are discarded by the proximity tracker.
    pub min_track_length: usize,
    pub worker_tier: WorkerTier,
}

impl Default for TrackingParameters {
    fn default() -> Self {
        Self {
            min_overlap_fraction: 0.7,
            min_track_length: 5,
            worker_tier: WorkerTier::Economical,
        }
    }
}

impl TrackingParameters {
    pub fn load_from_path(path: &str) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError {
            code: ErrorCode::Io,
            message: format!("Could not read config file '{path}': {e}"),
        })?;
        let params: Self = serde_json::from_str(&text).map_err(|e| EngineError {
            code: ErrorCode::InvalidInput,
            message: format!("Could not parse config JSON '{path}': {e}"),
        })?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..1.0).contains(&self.min_overlap_fraction) {
            return Err(EngineError::invalid_input(format!(
                "min_overlap_fraction must be in [0, 1), got {}",
                self.min_overlap_fraction
            )));
        }
        if self.min_track_length < 2 {
            return Err(EngineError::invalid_input(format!(
                "min_track_length must be at least 2, got {}",
                self.min_track_length
            )));
        }
        Ok(())
    }

    /// Sets one parameter from a JSON value; returns a short description of
    /// the change.
    pub fn set(&mut self, name: &str, value: &serde_json::Value) -> Result<String, EngineError> {
        let mut next = self.clone();
        match name {
            "min_overlap_fraction" => {
                next.min_overlap_fraction = value.as_f64().ok_or_else(|| {
                    EngineError::invalid_input("min_overlap_fraction expects a number")
                })?;
            }
            "min_track_length" => {
                let raw = value.as_u64().ok_or_else(|| {
                    EngineError::invalid_input("min_track_length expects a non-negative integer")
                })?;
                next.min_track_length = raw as usize;
            }
            "worker_tier" => {
                next.worker_tier = serde_json::from_value(value.clone()).map_err(|e| {
                    EngineError::invalid_input(format!(
                        "worker_tier expects \"Economical\" or \"Performance\": {e}"
                    ))
                })?;
            }
            other => {
                return Err(EngineError::new(
                    ErrorCode::Unsupported,
                    format!("Unknown parameter '{other}'"),
                ));
            }
        }
        next.validate()?;
        *self = next;
        Ok(format!("Set parameter '{name}' to {value}"))
    }
}
