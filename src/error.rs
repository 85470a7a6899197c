// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Fatal, user-visible configuration errors. Everything recoverable
/// (malformed records, thin calibration data, missing gate metrics) is
/// counted and reported instead of raised.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Trip {trip_id} has no front stream; front is the mandatory sync anchor")]
    MissingAnchorStream { trip_id: String },

    #[error("Ground truth source unavailable at {path}: {reason}")]
    GroundTruthUnavailable { path: PathBuf, reason: String },

    #[error("Predictions source unavailable at {path}: {reason}")]
    PredictionsUnavailable { path: PathBuf, reason: String },

    #[error("Config file {path} could not be loaded: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Invalid configuration: {field} - {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
