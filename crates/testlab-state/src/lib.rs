//! testlab-state — embedded record store for the lab control plane.
//!
//! Backed by [redb](https://docs.rs/redb), holds hosts, jobs, host queue
//! entries, special tasks, labels and ACL groups.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by a `u64` id allocated per table. Multi-record invariants (a host
//! is leased to at most one entry) are maintained by doing the check and
//! the mutation inside one [`StateStore::write`] transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ReadScope, RecordReader, RecordTable, StateStore, WriteScope};
pub use types::*;

/// Unix timestamp (seconds).
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
