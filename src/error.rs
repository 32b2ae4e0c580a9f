use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The segmentation volume (or another required array) is not loaded.
    MissingLayer,
    /// A click resolved to label 0.
    BackgroundClick,
    InsufficientPoints,
    DuplicateSlice,
    CrossTrackSelection,
    /// A centroid was requested for a label that does not occur in the slice.
    LabelNotFound,
    /// The displayed tracks are a filtered subset and the caller did not
    /// agree to reveal the hidden ones.
    TracksHidden,
    Cancelled,
    InvalidInput,
    NotFound,
    Unsupported,
    Io,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn missing_layer(layer: &str) -> Self {
        Self::new(
            ErrorCode::MissingLayer,
            format!("Please make sure the {layer} exists"),
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Io, message)
    }

    /// True for failures the user can recover from by repeating the action
    /// with different input.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::BackgroundClick
                | ErrorCode::InsufficientPoints
                | ErrorCode::DuplicateSlice
                | ErrorCode::CrossTrackSelection
                | ErrorCode::InvalidInput
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::io(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::new(ErrorCode::InvalidInput, err.to_string())
    }
}

impl From<csv::Error> for EngineError {
    fn from(err: csv::Error) -> Self {
        EngineError::io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_and_message() {
        let err = EngineError::missing_layer("label layer");
        assert_eq!(
            err.to_string(),
            "MissingLayer: Please make sure the label layer exists"
        );
    }

    #[test]
    fn test_input_errors_are_recoverable() {
        assert!(EngineError::new(ErrorCode::DuplicateSlice, "x").is_input_error());
        assert!(!EngineError::new(ErrorCode::Io, "x").is_input_error());
    }
}
