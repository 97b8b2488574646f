//! testlab-drone — the drone pool.
//!
//! A drone is a worker machine that runs job and maintenance processes on
//! the scheduler's behalf. The scheduler queues [`RemoteCall`]s against a
//! [`Drone`], then sends each drone's whole queue as one batch; every drone
//! in a [`DronePool`] is contacted concurrently within a tick.

pub mod drone;
pub mod error;
pub mod executor;
pub mod pool;
pub mod protocol;
pub mod settings;
pub mod utility;

pub use drone::{Drone, FileTransfer, UsedCapacity, get_drone};
pub use error::{DroneError, DroneResult};
pub use executor::{BoxFuture, CallExecutor, LocalExecutor, SshExecutor};
pub use pool::{DronePool, ExecutionReport, FinishedProcess, RefreshReport, TrackedProcess};
pub use protocol::{CallBatch, CallOutcome, CallValue, DroneReply, RemoteCall};
pub use settings::DroneSettings;
pub use utility::DroneUtility;
