//! Read-side queries over the scheduling tables.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use testlab_state::*;

use crate::error::RdbResult;
use crate::matching::{JobInfo, MatchContext};

/// Two or more active entries claiming the same host.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlap {
    pub host_id: HostId,
    pub hostname: String,
    pub entries: Vec<EntryId>,
    pub jobs: Vec<JobId>,
}

#[derive(Clone)]
pub struct JobQueryManager {
    store: StateStore,
    provisionable_prefixes: Vec<String>,
}

impl JobQueryManager {
    pub fn new(store: StateStore, provisionable_prefixes: Vec<String>) -> Self {
        Self {
            store,
            provisionable_prefixes,
        }
    }

    pub fn provisionable_prefixes(&self) -> &[String] {
        &self.provisionable_prefixes
    }

    /// Inactive, incomplete, queued entries in the order they should be
    /// considered: higher job priority first, pre-assigned before hostless,
    /// older suites first, then job and entry id.
    pub fn get_pending_queue_entries(&self, only_hostless: bool) -> RdbResult<Vec<HostQueueEntry>> {
        let entries = self.store.read(|r| {
            let jobs: HashMap<JobId, Job> = r.jobs()?.into_iter().map(|j| (j.id, j)).collect();
            let mut pending: Vec<(HostQueueEntry, i32, JobId)> = Vec::new();
            for entry in r.entries()? {
                if !entry.is_pending() || (only_hostless && entry.host_id.is_some()) {
                    continue;
                }
                let Some(job) = jobs.get(&entry.job_id) else {
                    tracing::warn!(entry_id = entry.id, job_id = entry.job_id, "queue entry references missing job");
                    continue;
                };
                pending.push((entry, job.priority, job.parent_job_id.unwrap_or(job.id)));
            }
            pending.sort_by_key(|(entry, priority, suite)| {
                (
                    Reverse(*priority),
                    entry.host_id.is_none(),
                    *suite,
                    entry.job_id,
                    entry.id,
                )
            });
            Ok(pending.into_iter().map(|(entry, _, _)| entry).collect::<Vec<_>>())
        })?;
        Ok(entries)
    }

    pub fn get_job_info(&self, entry: &HostQueueEntry) -> RdbResult<JobInfo> {
        let info = self.store.read(|r| {
            let ctx = MatchContext::load(r, &self.provisionable_prefixes)?;
            ctx.job_info_for(r, entry)
        })?;
        Ok(info)
    }

    /// Hosts free for a new lease that satisfy `info`, lowest id first.
    pub fn find_available_hosts(&self, info: &JobInfo) -> RdbResult<Vec<Host>> {
        let mut hosts = self.store.read(|r| r.hosts())?;
        hosts.sort_by_key(|h| h.id);
        Ok(available_hosts(&hosts, info, &HashSet::new())
            .cloned()
            .collect())
    }

    /// Pending special tasks that may run now.
    ///
    /// Tasks on locked hosts, and tasks whose host is held by an active
    /// entry other than the task's own, are left out. Host-only tasks come
    /// before entry-bound tasks; within each class tasks run in creation
    /// order.
    pub fn get_prioritized_special_tasks(
        &self,
        only_tasks_with_leased_hosts: bool,
    ) -> RdbResult<Vec<SpecialTask>> {
        let tasks = self.store.read(|r| {
            let hosts: HashMap<HostId, Host> = r.hosts()?.into_iter().map(|h| (h.id, h)).collect();
            let mut holders: HashMap<HostId, Vec<EntryId>> = HashMap::new();
            for entry in r.entries()?.into_iter().filter(HostQueueEntry::holds_host) {
                if let Some(host_id) = entry.host_id {
                    holders.entry(host_id).or_default().push(entry.id);
                }
            }

            let mut tasks: Vec<SpecialTask> = r
                .special_tasks()?
                .into_iter()
                .filter(SpecialTask::is_pending)
                .filter(|task| match hosts.get(&task.host_id) {
                    Some(host) => {
                        !host.is_locked() && (!only_tasks_with_leased_hosts || host.leased)
                    }
                    None => false,
                })
                .filter(|task| {
                    holders.get(&task.host_id).is_none_or(|ids| {
                        ids.iter().all(|id| Some(*id) == task.queue_entry_id)
                    })
                })
                .collect();
            tasks.sort_by_key(|task| (task.queue_entry_id.is_some(), task.id));
            Ok(tasks)
        })?;
        Ok(tasks)
    }

    /// Hosts with more than one active entry. Should never happen.
    pub fn get_overlapping_jobs(&self) -> RdbResult<Vec<Overlap>> {
        let overlaps = self.store.read(|r| {
            let mut by_host: BTreeMap<HostId, Vec<HostQueueEntry>> = BTreeMap::new();
            for entry in r.entries()?.into_iter().filter(HostQueueEntry::holds_host) {
                if let Some(host_id) = entry.host_id {
                    by_host.entry(host_id).or_default().push(entry);
                }
            }
            let mut overlaps = Vec::new();
            for (host_id, entries) in by_host.into_iter().filter(|(_, e)| e.len() > 1) {
                let hostname = r
                    .host(host_id)?
                    .map(|h| h.hostname)
                    .unwrap_or_else(|| format!("host-{host_id}"));
                overlaps.push(Overlap {
                    host_id,
                    hostname,
                    entries: entries.iter().map(|e| e.id).collect(),
                    jobs: entries.iter().map(|e| e.job_id).collect(),
                });
            }
            Ok(overlaps)
        })?;
        Ok(overlaps)
    }
}

/// Hosts in `hosts` free for a new lease that satisfy `info`, skipping
/// `excluded`. Keeps the order of `hosts`.
pub(crate) fn available_hosts<'h>(
    hosts: &'h [Host],
    info: &JobInfo,
    excluded: &HashSet<HostId>,
) -> impl Iterator<Item = &'h Host> {
    hosts
        .iter()
        .filter(move |h| !excluded.contains(&h.id) && h.is_available() && info.is_satisfied_by(h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn setup() -> (StateStore, JobQueryManager) {
        let store = StateStore::open_in_memory().unwrap();
        let queries = JobQueryManager::new(store.clone(), vec!["cros-version:".into()]);
        (store, queries)
    }

    fn host(store: &StateStore, name: &str) -> Host {
        store
            .create_host(NewHost {
                hostname: name.into(),
                ..Default::default()
            })
            .unwrap()
    }

    fn job(store: &StateStore, priority: i32, hosts: Vec<HostId>) -> HostQueueEntry {
        let (_, entries) = store
            .create_job(NewJob {
                name: format!("job-p{priority}"),
                owner: "alice".into(),
                priority,
                hosts,
                ..Default::default()
            })
            .unwrap();
        entries.into_iter().next().unwrap()
    }

    #[test]
    fn test_pending_entries_ordering() {
        let (store, queries) = setup();
        let h1 = host(&store, "h1");
        let low = job(&store, 0, vec![]);
        let high = job(&store, 10, vec![]);
        let high_assigned = job(&store, 10, vec![h1.id]);
        let low_later = job(&store, 0, vec![]);

        let ids: Vec<EntryId> = queries
            .get_pending_queue_entries(false)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![high_assigned.id, high.id, low.id, low_later.id]);

        let hostless: Vec<EntryId> = queries
            .get_pending_queue_entries(true)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(hostless, vec![high.id, low.id, low_later.id]);
    }

    #[test]
    fn test_older_suite_goes_first() {
        let (store, queries) = setup();
        let (suite_old, _) = store
            .create_job(NewJob {
                name: "suite-old".into(),
                owner: "alice".into(),
                hosts: vec![],
                ..Default::default()
            })
            .unwrap();
        let (suite_new, _) = store
            .create_job(NewJob {
                name: "suite-new".into(),
                owner: "alice".into(),
                ..Default::default()
            })
            .unwrap();
        let (_, newer_child) = store
            .create_job(NewJob {
                name: "child-of-new".into(),
                owner: "alice".into(),
                parent_job_id: Some(suite_new.id),
                ..Default::default()
            })
            .unwrap();
        let (_, older_child) = store
            .create_job(NewJob {
                name: "child-of-old".into(),
                owner: "alice".into(),
                parent_job_id: Some(suite_old.id),
                ..Default::default()
            })
            .unwrap();

        let pending = queries.get_pending_queue_entries(true).unwrap();
        let pos = |id: EntryId| pending.iter().position(|e| e.id == id).unwrap();
        assert!(pos(older_child[0].id) < pos(newer_child[0].id));
    }

    #[test]
    fn test_active_and_complete_entries_are_not_pending() {
        let (store, queries) = setup();
        let mut active = job(&store, 0, vec![]);
        active.active = true;
        store.put_entry(&active).unwrap();
        let mut done = job(&store, 0, vec![]);
        done.complete = true;
        done.status = EntryStatus::Completed;
        store.put_entry(&done).unwrap();
        let pending = job(&store, 0, vec![]);

        let ids: Vec<EntryId> = queries
            .get_pending_queue_entries(false)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![pending.id]);
    }

    #[test]
    fn test_host_only_tasks_come_first() {
        let (store, queries) = setup();
        let h1 = host(&store, "h1");
        let h2 = host(&store, "h2");
        let entry = job(&store, 0, vec![h2.id]);
        let bound = store
            .create_special_task(h2.id, TaskKind::Verify, Some(entry.id), None)
            .unwrap();
        let host_only = store
            .create_special_task(h1.id, TaskKind::Repair, None, Some("admin"))
            .unwrap();

        let ids: Vec<TaskId> = queries
            .get_prioritized_special_tasks(false)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![host_only.id, bound.id]);
    }

    #[test]
    fn test_tasks_filtered_by_host_state() {
        let (store, queries) = setup();
        let busy = host(&store, "busy");
        let locked = store
            .create_host(NewHost {
                hostname: "locked".into(),
                locked_by: Some("admin".into()),
                ..Default::default()
            })
            .unwrap();
        let mut unleased_host = host(&store, "free");

        let mut holder = job(&store, 0, vec![busy.id]);
        holder.active = true;
        store.put_entry(&holder).unwrap();

        let other_task = store
            .create_special_task(busy.id, TaskKind::Cleanup, None, None)
            .unwrap();
        let own_task = store
            .create_special_task(busy.id, TaskKind::Verify, Some(holder.id), None)
            .unwrap();
        store
            .create_special_task(locked.id, TaskKind::Verify, None, None)
            .unwrap();
        let free_task = store
            .create_special_task(unleased_host.id, TaskKind::Verify, None, None)
            .unwrap();

        let ids: BTreeSet<TaskId> = queries
            .get_prioritized_special_tasks(false)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert!(!ids.contains(&other_task.id));
        assert!(ids.contains(&own_task.id));
        assert!(ids.contains(&free_task.id));
        assert_eq!(ids.len(), 2);

        // Only hosts already leased when asked to.
        let leased_only: Vec<TaskId> = queries
            .get_prioritized_special_tasks(true)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert!(leased_only.is_empty());
        unleased_host.leased = true;
        store.put_host(&unleased_host).unwrap();
        let leased_only: Vec<TaskId> = queries
            .get_prioritized_special_tasks(true)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(leased_only, vec![free_task.id]);
    }

    #[test]
    fn test_find_available_hosts() {
        let (store, queries) = setup();
        let label = store.create_label("board:x").unwrap();
        let acl = store.create_acl_group("Everyone", &["alice"]).unwrap();
        let good = store
            .create_host(NewHost {
                hostname: "good".into(),
                labels: BTreeSet::from([label.id]),
                acl_groups: BTreeSet::from([acl.id]),
                ..Default::default()
            })
            .unwrap();
        let mut leased = store
            .create_host(NewHost {
                hostname: "leased".into(),
                labels: BTreeSet::from([label.id]),
                acl_groups: BTreeSet::from([acl.id]),
                ..Default::default()
            })
            .unwrap();
        leased.leased = true;
        store.put_host(&leased).unwrap();
        store
            .create_host(NewHost {
                hostname: "unlabelled".into(),
                acl_groups: BTreeSet::from([acl.id]),
                ..Default::default()
            })
            .unwrap();

        let (_, entries) = store
            .create_job(NewJob {
                name: "j".into(),
                owner: "alice".into(),
                dependency_labels: BTreeSet::from([label.id]),
                ..Default::default()
            })
            .unwrap();
        let info = queries.get_job_info(&entries[0]).unwrap();
        let hosts = queries.find_available_hosts(&info).unwrap();
        assert_eq!(hosts.iter().map(|h| h.id).collect::<Vec<_>>(), vec![good.id]);

        let all = store.list_hosts().unwrap();
        let claimed = HashSet::from([good.id]);
        assert_eq!(available_hosts(&all, &info, &claimed).count(), 0);
    }

    #[test]
    fn test_overlapping_jobs() {
        let (store, queries) = setup();
        let h1 = host(&store, "h1");
        for _ in 0..2 {
            let mut e = job(&store, 0, vec![h1.id]);
            e.active = true;
            store.put_entry(&e).unwrap();
        }
        let overlaps = queries.get_overlapping_jobs().unwrap();
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].hostname, "h1");
        assert_eq!(overlaps[0].entries.len(), 2);
    }
}
