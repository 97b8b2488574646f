//! testlab-rdb — the host/job matching engine.
//!
//! Decides which pending host queue entry gets which host. A host is only
//! ever handed out through a lease taken inside a store write transaction,
//! so an entry becomes active if and only if its host lease committed.
//! Special-task ordering relative to active jobs also lives here.

pub mod error;
pub mod host_scheduler;
pub mod lease;
pub mod matching;
pub mod query;

pub use error::{RdbError, RdbResult};
pub use host_scheduler::{HostScheduler, ScheduleSummary};
pub use lease::{AcquireOutcome, AcquireRequest, HostUsage};
pub use matching::{JobInfo, MatchContext, Mismatch};
pub use query::{JobQueryManager, Overlap};
