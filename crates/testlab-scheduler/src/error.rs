//! Dispatcher error types.

use thiserror::Error;

/// Errors that stop a dispatcher tick.
///
/// Per-drone failures are not errors here; they are logged and the affected
/// work is retried on a later tick.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] testlab_state::StateError),

    #[error("host matching error: {0}")]
    Rdb(#[from] testlab_rdb::RdbError),

    #[error("drone error: {0}")]
    Drone(#[from] testlab_drone::DroneError),

    #[error("runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
