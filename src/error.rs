use thiserror::Error;

/// Motors synchronization error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("motors_sync: {0}")]
    Config(String),

    #[error("motors_sync: No data from {sensor}")]
    SensorTimeout { sensor: String },

    #[error("motors_sync: Unusable sensor data: {0}")]
    Sensor(String),

    #[error("Too many retries on {axis} axis ({retries} retries)")]
    TooManyRetries { axis: String, retries: u32 },

    /// Corrections moved the second stepper more than two full steps
    #[error("{axis} axis drifted by {msteps} microsteps, aborting")]
    Diverged { axis: String, msteps: i64 },

    #[error("Invalid parameters: {0}")]
    InvalidArgument(String),

    #[error("Host error: {0}")]
    Host(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}
