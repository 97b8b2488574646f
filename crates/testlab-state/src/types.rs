//! Domain types for the lab state store.
//!
//! Hosts, jobs, host queue entries, special tasks, labels and ACL groups.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type HostId = u64;
pub type JobId = u64;
pub type EntryId = u64;
pub type TaskId = u64;
pub type LabelId = u64;
pub type AclGroupId = u64;

// ── Labels & ACLs ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
}

/// A named set of users. Jobs may only run on hosts sharing a group with
/// the job owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclGroup {
    pub id: AclGroupId,
    pub name: String,
    pub users: BTreeSet<String>,
}

// ── Host ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Ready,
    Verifying,
    Cleaning,
    Resetting,
    Repairing,
    RepairFailed,
    Running,
}

impl HostStatus {
    /// Statuses a host only passes through while work is running on it.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            HostStatus::Verifying
                | HostStatus::Cleaning
                | HostStatus::Resetting
                | HostStatus::Repairing
                | HostStatus::Running
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    pub status: HostStatus,
    /// Reserved for exactly one HQE or special task.
    pub leased: bool,
    /// User holding the lock, if any. Locked hosts are never scheduled.
    pub locked_by: Option<String>,
    /// Soft-deleted hosts stay in the table but are never scheduled.
    #[serde(default)]
    pub invalid: bool,
    pub labels: BTreeSet<LabelId>,
    pub acl_groups: BTreeSet<AclGroupId>,
}

impl Host {
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Free for a new lease: unleased, unlocked, valid and Ready.
    pub fn is_available(&self) -> bool {
        !self.leased && !self.is_locked() && !self.invalid && self.status == HostStatus::Ready
    }
}

/// Fields the frontend supplies when registering a host.
#[derive(Debug, Clone, Default)]
pub struct NewHost {
    pub hostname: String,
    pub labels: BTreeSet<LabelId>,
    pub acl_groups: BTreeSet<AclGroupId>,
    pub locked_by: Option<String>,
}

// ── Job ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    pub priority: i32,
    pub dependency_labels: BTreeSet<LabelId>,
    /// Suite job that spawned this one.
    pub parent_job_id: Option<JobId>,
    #[serde(default)]
    pub run_verify: bool,
    #[serde(default)]
    pub run_reset: bool,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

/// Fields the frontend supplies when creating a job. One HQE is created per
/// entry in `hosts`, or a single hostless entry when `hosts` is empty.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub name: String,
    pub owner: String,
    pub priority: i32,
    pub dependency_labels: BTreeSet<LabelId>,
    pub parent_job_id: Option<JobId>,
    pub run_verify: bool,
    pub run_reset: bool,
    pub hosts: Vec<HostId>,
}

// ── Host queue entry ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Queued,
    Verifying,
    Starting,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Binding of one job to (at most) one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostQueueEntry {
    pub id: EntryId,
    pub job_id: JobId,
    pub host_id: Option<HostId>,
    /// Created without a specific host; the host binding may be undone.
    pub metahost: bool,
    pub status: EntryStatus,
    pub active: bool,
    pub complete: bool,
    /// Drone the job process was started on.
    pub started_on: Option<String>,
    /// Set by the frontend; the dispatcher stops the entry on its next tick.
    #[serde(default)]
    pub aborted: bool,
}

impl HostQueueEntry {
    /// Active and not yet finished: this entry owns its host.
    pub fn holds_host(&self) -> bool {
        self.active && !self.complete && self.host_id.is_some()
    }

    pub fn is_pending(&self) -> bool {
        !self.active && !self.complete && !self.aborted && self.status == EntryStatus::Queued
    }

    /// Marked for abort and not yet stopped.
    pub fn is_aborting(&self) -> bool {
        self.aborted && !self.complete
    }
}

// ── Special task ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Verify,
    Cleanup,
    Reset,
    Repair,
}

impl TaskKind {
    /// Host status while this task runs.
    pub fn host_status(self) -> HostStatus {
        match self {
            TaskKind::Verify => HostStatus::Verifying,
            TaskKind::Cleanup => HostStatus::Cleaning,
            TaskKind::Reset => HostStatus::Resetting,
            TaskKind::Repair => HostStatus::Repairing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Verify => "verify",
            TaskKind::Cleanup => "cleanup",
            TaskKind::Reset => "reset",
            TaskKind::Repair => "repair",
        }
    }
}

/// Maintenance operation targeting one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialTask {
    pub id: TaskId,
    pub host_id: HostId,
    pub queue_entry_id: Option<EntryId>,
    pub kind: TaskKind,
    pub is_active: bool,
    pub is_complete: bool,
    pub success: bool,
    pub requested_by: Option<String>,
    /// Unix timestamp (seconds).
    pub created_at: u64,
    #[serde(default)]
    pub is_aborted: bool,
}

impl SpecialTask {
    pub fn is_pending(&self) -> bool {
        !self.is_active && !self.is_complete && !self.is_aborted
    }

    pub fn is_aborting(&self) -> bool {
        self.is_aborted && !self.is_complete
    }
}
