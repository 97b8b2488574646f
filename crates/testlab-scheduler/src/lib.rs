//! testlab-scheduler — the dispatch loop.
//!
//! Ties the matching engine (`testlab-rdb`) to the drone pool
//! (`testlab-drone`). A [`Dispatcher`] owns both and advances the lab one
//! tick at a time: finished processes are settled, hosts are leased to
//! pending work, and special tasks and jobs are started on drones.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher
//!   ├── StateStore      (hosts, jobs, entries, special tasks)
//!   ├── HostScheduler   (matching + leasing, one batch per tick)
//!   ├── DronePool       (queued calls, executed concurrently per tick)
//!   ├── AgentTable      (processes started on drones, by pid)
//!   └── NotificationQueue → NotificationSinks
//! ```

pub mod agent;
pub mod command;
pub mod dispatcher;
pub mod error;

pub use agent::{Agent, AgentTable, AgentTask};
pub use command::{CommandBuilder, Launch};
pub use dispatcher::{Dispatcher, DispatcherSettings, RecoveryReport, SCHEDULER_USER, TickReport};
pub use error::{SchedulerError, SchedulerResult};
