//! Error types for the relay engine

use crate::model::ActuatorId;
use thiserror::Error;

/// Errors that can occur in the relay engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Rule rejected at registration; never reaches a timer
    #[error("Invalid rule configuration: {0}")]
    Configuration(String),

    /// Actuator write failed
    #[error("Actuator {actuator_id} write failed: {reason}")]
    Actuation {
        actuator_id: ActuatorId,
        reason: String,
    },

    /// Sensor sample failed or was unusable
    #[error("Sensing failed: {0}")]
    Sensing(String),

    /// Rule store or audit log unavailable
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Rule not found
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// Engine was asked to start while not stopped
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Operation needs a running engine
    #[error("Scheduler is not running")]
    NotRunning,

    /// IO error (persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
