//! Drone pool error types.

use thiserror::Error;

pub type DroneResult<T> = Result<T, DroneError>;

#[derive(Debug, Error)]
pub enum DroneError {
    /// The drone could not be reached; it is skipped for this tick.
    #[error("drone {hostname} unreachable: {reason}")]
    Unreachable { hostname: String, reason: String },

    /// The transport did not finish within the call timeout.
    #[error("drone {hostname} timed out after {secs}s")]
    Timeout { hostname: String, secs: u64 },

    /// The drone answered with something that is not a valid reply.
    #[error("protocol corruption from drone {hostname}: {detail}")]
    Protocol { hostname: String, detail: String },

    #[error("unknown drone: {0}")]
    UnknownDrone(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DroneError {
    /// The drone itself is suspect, not just one call.
    pub fn is_protocol(&self) -> bool {
        matches!(self, DroneError::Protocol { .. })
    }
}
