//! Lease mutations. Every check-then-set happens inside one write
//! transaction, so two passes can never both lease the same host.

use std::collections::HashSet;

use testlab_state::*;
use tracing::{debug, info};

use crate::error::RdbResult;
use crate::matching::{MatchContext, Mismatch};

/// One `(entry, candidate host)` pair submitted for leasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireRequest {
    pub entry_id: EntryId,
    pub host_id: HostId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Host leased, entry bound and activated.
    Acquired,
    /// Someone else holds the lease.
    AlreadyLeased,
    /// Locked, invalid or not Ready.
    HostUnavailable,
    HostMissing,
    Mismatch(Mismatch),
    /// The entry is no longer pending, or is bound to a different host.
    EntryChanged,
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired)
    }
}

/// Hosts some active entry or unfinished special task still needs.
#[derive(Debug, Default)]
pub struct HostUsage {
    busy: HashSet<HostId>,
}

impl HostUsage {
    pub fn load<R: RecordReader>(reader: &R) -> StateResult<Self> {
        let mut busy = HashSet::new();
        for entry in reader.entries()?.into_iter().filter(HostQueueEntry::holds_host) {
            busy.extend(entry.host_id);
        }
        for task in reader.special_tasks()?.into_iter().filter(|t| !t.is_complete) {
            busy.insert(task.host_id);
        }
        Ok(Self { busy })
    }

    pub fn is_used(&self, host_id: HostId) -> bool {
        self.busy.contains(&host_id)
    }

    /// A leased host may be released once it is Ready and nothing uses it.
    pub fn is_releasable(&self, host: &Host) -> bool {
        host.leased && host.status == HostStatus::Ready && !self.is_used(host.id)
    }
}

/// Lease each requested host to its entry, in order, in one transaction.
///
/// The outcome list is aligned with `requests`. Contention (a host leased
/// meanwhile, an entry that moved on) is an outcome, not an error; only
/// storage failures are errors, and they roll the whole batch back.
pub fn batch_acquire_hosts(
    store: &StateStore,
    provisionable_prefixes: &[String],
    requests: &[AcquireRequest],
) -> RdbResult<Vec<AcquireOutcome>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    let outcomes = store.write(|w| {
        let ctx = MatchContext::load(w, provisionable_prefixes)?;
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(acquire_one(w, &ctx, request)?);
        }
        Ok(outcomes)
    })?;
    let acquired = outcomes.iter().filter(|o| o.is_acquired()).count();
    info!(requested = requests.len(), acquired, "batch host acquisition finished");
    Ok(outcomes)
}

fn acquire_one(
    w: &WriteScope<'_>,
    ctx: &MatchContext,
    request: &AcquireRequest,
) -> StateResult<AcquireOutcome> {
    let Some(mut entry) = w.entry(request.entry_id)? else {
        return Ok(AcquireOutcome::EntryChanged);
    };
    if !entry.is_pending() || entry.host_id.is_some_and(|id| id != request.host_id) {
        return Ok(AcquireOutcome::EntryChanged);
    }
    let Some(mut host) = w.host(request.host_id)? else {
        return Ok(AcquireOutcome::HostMissing);
    };
    if host.leased {
        return Ok(AcquireOutcome::AlreadyLeased);
    }
    if !host.is_available() {
        return Ok(AcquireOutcome::HostUnavailable);
    }
    let info = ctx.job_info_for(w, &entry)?;
    if let Err(mismatch) = info.check(&host) {
        debug!(entry_id = entry.id, host_id = host.id, ?mismatch, "host rejected for entry");
        return Ok(AcquireOutcome::Mismatch(mismatch));
    }

    host.leased = true;
    w.put_host(&host)?;

    entry.host_id = Some(host.id);
    entry.active = true;
    match info.pre_job_task() {
        Some(kind) => {
            w.create_special_task(host.id, kind, Some(entry.id), Some(&info.owner))?;
        }
        None => entry.status = EntryStatus::Starting,
    }
    w.put_entry(&entry)?;
    debug!(entry_id = entry.id, host_id = host.id, hostname = %host.hostname, "host leased");
    Ok(AcquireOutcome::Acquired)
}

/// Release the lease on every host that is Ready and no longer used by an
/// active entry or an unfinished special task.
pub fn release_unused_hosts(store: &StateStore) -> RdbResult<Vec<HostId>> {
    let released = store.write(|w| {
        let usage = HostUsage::load(w)?;
        let mut released = Vec::new();
        for mut host in w.hosts()?.into_iter().filter(|h| usage.is_releasable(h)) {
            host.leased = false;
            w.put_host(&host)?;
            released.push(host.id);
        }
        Ok(released)
    })?;
    if !released.is_empty() {
        debug!(count = released.len(), ?released, "released unused hosts");
    }
    Ok(released)
}

/// Release one host if nothing uses it. Returns whether it was released.
pub fn release_host_if_unused(store: &StateStore, host_id: HostId) -> RdbResult<bool> {
    let released = store.write(|w| {
        let Some(mut host) = w.host(host_id)? else {
            return Ok(false);
        };
        if !HostUsage::load(w)?.is_releasable(&host) {
            return Ok(false);
        }
        host.leased = false;
        w.put_host(&host)?;
        Ok(true)
    })?;
    Ok(released)
}

/// Lease the hosts of pending host-only special tasks so that jobs cannot
/// take them first.
pub fn lease_hosts_of_frontend_tasks(store: &StateStore) -> RdbResult<Vec<HostId>> {
    let leased = store.write(|w| {
        let mut leased = Vec::new();
        for task in w.special_tasks()? {
            if !task.is_pending() || task.queue_entry_id.is_some() || leased.contains(&task.host_id) {
                continue;
            }
            let Some(mut host) = w.host(task.host_id)? else {
                continue;
            };
            if host.leased || host.is_locked() || host.invalid {
                continue;
            }
            host.leased = true;
            w.put_host(&host)?;
            leased.push(host.id);
        }
        Ok(leased)
    })?;
    if !leased.is_empty() {
        debug!(count = leased.len(), "leased hosts of frontend tasks");
    }
    Ok(leased)
}
