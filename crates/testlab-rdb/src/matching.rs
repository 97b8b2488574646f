//! Host/job compatibility.
//!
//! A host can run a job when it carries every dependency label of the job
//! and shares at least one ACL group with the job owner. Labels the job
//! runner provisions itself (e.g. `cros-version:`) are not dependencies.

use std::collections::{BTreeSet, HashSet};

use testlab_state::*;

/// Everything the engine needs to know about an HQE to match it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub entry_id: EntryId,
    pub job_id: JobId,
    pub owner: String,
    pub priority: i32,
    pub parent_job_id: Option<JobId>,
    /// Pre-assigned host, if any.
    pub host_id: Option<HostId>,
    pub deps: BTreeSet<LabelId>,
    pub acls: BTreeSet<AclGroupId>,
    pub run_verify: bool,
    pub run_reset: bool,
}

/// Why a host cannot run a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    MissingLabels(BTreeSet<LabelId>),
    NoSharedAcl,
}

impl JobInfo {
    pub fn check(&self, host: &Host) -> Result<(), Mismatch> {
        let missing: BTreeSet<LabelId> = self.deps.difference(&host.labels).copied().collect();
        if !missing.is_empty() {
            return Err(Mismatch::MissingLabels(missing));
        }
        if self.acls.is_disjoint(&host.acl_groups) {
            return Err(Mismatch::NoSharedAcl);
        }
        Ok(())
    }

    pub fn is_satisfied_by(&self, host: &Host) -> bool {
        self.check(host).is_ok()
    }

    /// Maintenance the host gets before this job runs on it.
    pub fn pre_job_task(&self) -> Option<TaskKind> {
        if self.run_reset {
            Some(TaskKind::Reset)
        } else if self.run_verify {
            Some(TaskKind::Verify)
        } else {
            None
        }
    }
}

/// Labels and ACL groups, loaded once per matching pass.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    provisionable: HashSet<LabelId>,
    acl_groups: Vec<AclGroup>,
}

impl MatchContext {
    pub fn load<R: RecordReader>(reader: &R, provisionable_prefixes: &[String]) -> StateResult<Self> {
        let provisionable = reader
            .labels()?
            .into_iter()
            .filter(|label| {
                provisionable_prefixes
                    .iter()
                    .any(|prefix| label.name.starts_with(prefix.as_str()))
            })
            .map(|label| label.id)
            .collect();
        Ok(Self {
            provisionable,
            acl_groups: reader.acl_groups()?,
        })
    }

    pub fn acls_of(&self, user: &str) -> BTreeSet<AclGroupId> {
        self.acl_groups
            .iter()
            .filter(|group| group.users.contains(user))
            .map(|group| group.id)
            .collect()
    }

    pub fn job_info(&self, entry: &HostQueueEntry, job: &Job) -> JobInfo {
        JobInfo {
            entry_id: entry.id,
            job_id: job.id,
            owner: job.owner.clone(),
            priority: job.priority,
            parent_job_id: job.parent_job_id,
            host_id: entry.host_id,
            deps: job
                .dependency_labels
                .iter()
                .filter(|id| !self.provisionable.contains(*id))
                .copied()
                .collect(),
            acls: self.acls_of(&job.owner),
            run_verify: job.run_verify,
            run_reset: job.run_reset,
        }
    }

    pub fn job_info_for<R: RecordReader>(&self, reader: &R, entry: &HostQueueEntry) -> StateResult<JobInfo> {
        let job = reader.require_job(entry.job_id)?;
        Ok(self.job_info(entry, &job))
    }
}
