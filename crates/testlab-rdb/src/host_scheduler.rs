//! HostScheduler — one assignment pass over the pending queue.
//!
//! Pre-assigned and hostless entries go through the same path: a
//! candidate host is picked for each entry, the pairs are submitted as one
//! batch to [`batch_acquire_hosts`], and only entries whose lease committed
//! become active.

use std::collections::{HashMap, HashSet};

use testlab_state::*;
use tracing::{debug, info, warn};

use crate::error::RdbResult;
use crate::lease::{self, AcquireOutcome, AcquireRequest};
use crate::matching::MatchContext;
use crate::query::{JobQueryManager, Overlap, available_hosts};

/// What one scheduling pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScheduleSummary {
    pub pending: usize,
    /// Pairs submitted for leasing.
    pub requested: usize,
    pub acquired: Vec<(EntryId, HostId)>,
    pub rejected: Vec<(EntryId, HostId, AcquireOutcome)>,
    /// Hostless entries with no free matching host.
    pub unmatched: usize,
    /// Pre-assigned entries whose host is leased to someone else.
    pub waiting_on_lease: usize,
    /// Speculative leases dropped while validating pre-assigned entries.
    pub released: Vec<HostId>,
}

#[derive(Clone)]
pub struct HostScheduler {
    store: StateStore,
    queries: JobQueryManager,
}

impl HostScheduler {
    pub fn new(store: StateStore, provisionable_prefixes: Vec<String>) -> Self {
        let queries = JobQueryManager::new(store.clone(), provisionable_prefixes);
        Self { store, queries }
    }

    pub fn queries(&self) -> &JobQueryManager {
        &self.queries
    }

    pub fn batch_acquire_hosts(&self, requests: &[AcquireRequest]) -> RdbResult<Vec<AcquireOutcome>> {
        lease::batch_acquire_hosts(&self.store, self.queries.provisionable_prefixes(), requests)
    }

    pub fn release_unused_hosts(&self) -> RdbResult<Vec<HostId>> {
        lease::release_unused_hosts(&self.store)
    }

    pub fn lease_hosts_of_frontend_tasks(&self) -> RdbResult<Vec<HostId>> {
        lease::lease_hosts_of_frontend_tasks(&self.store)
    }

    /// Active entries sharing a host.
    pub fn check_host_assignments(&self) -> RdbResult<Vec<Overlap>> {
        let overlaps = self.queries.get_overlapping_jobs()?;
        for overlap in &overlaps {
            warn!(host_id = overlap.host_id, hostname = %overlap.hostname, entries = ?overlap.entries, "host assigned to more than one active entry");
        }
        Ok(overlaps)
    }

    /// Match every pending entry to a host and lease what can be leased.
    pub fn schedule_jobs(&self) -> RdbResult<ScheduleSummary> {
        let pending = self.queries.get_pending_queue_entries(false)?;
        let mut summary = ScheduleSummary {
            pending: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(summary);
        }

        let prefixes = self.queries.provisionable_prefixes();
        let (requests, to_release) = self.store.read(|r| {
            let ctx = MatchContext::load(r, prefixes)?;
            let mut hosts = r.hosts()?;
            hosts.sort_by_key(|h| h.id);
            let by_id: HashMap<HostId, &Host> = hosts.iter().map(|h| (h.id, h)).collect();

            let mut claimed = HashSet::new();
            let mut requests = Vec::new();
            let mut to_release = Vec::new();
            for entry in &pending {
                let info = ctx.job_info_for(r, entry)?;
                match entry.host_id {
                    Some(host_id) => {
                        let Some(host) = by_id.get(&host_id) else {
                            warn!(entry_id = entry.id, host_id, "entry pre-assigned to unknown host");
                            continue;
                        };
                        if host.leased {
                            summary.waiting_on_lease += 1;
                            if !info.is_satisfied_by(host) {
                                to_release.push(host_id);
                            }
                            continue;
                        }
                        if claimed.insert(host_id) {
                            requests.push(AcquireRequest {
                                entry_id: entry.id,
                                host_id,
                            });
                        }
                    }
                    None => {
                        let candidate = available_hosts(&hosts, &info, &claimed)
                            .next()
                            .map(|h| h.id);
                        match candidate {
                            Some(host_id) => {
                                claimed.insert(host_id);
                                requests.push(AcquireRequest {
                                    entry_id: entry.id,
                                    host_id,
                                });
                            }
                            None => summary.unmatched += 1,
                        }
                    }
                }
            }
            Ok((requests, to_release))
        })?;

        for host_id in to_release {
            if lease::release_host_if_unused(&self.store, host_id)? {
                info!(host_id, "released speculative lease on host that fails validation");
                summary.released.push(host_id);
            }
        }

        summary.requested = requests.len();
        if !requests.is_empty() {
            let outcomes = self.batch_acquire_hosts(&requests)?;
            for (request, outcome) in requests.iter().zip(outcomes) {
                if outcome.is_acquired() {
                    summary.acquired.push((request.entry_id, request.host_id));
                } else {
                    debug!(entry_id = request.entry_id, host_id = request.host_id, ?outcome, "host not acquired");
                    summary.rejected.push((request.entry_id, request.host_id, outcome));
                }
            }
        }
        info!(
            pending = summary.pending,
            acquired = summary.acquired.len(),
            rejected = summary.rejected.len(),
            unmatched = summary.unmatched,
            "scheduling pass complete"
        );
        Ok(summary)
    }
}
