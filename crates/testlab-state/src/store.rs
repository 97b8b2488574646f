//! StateStore — redb-backed record persistence for the lab.
//!
//! Every operation runs inside one redb transaction. Callers that must
//! observe and mutate several records atomically (host leasing, lease
//! release) use [`StateStore::write`] and get a [`WriteScope`]; the per-record
//! helpers on `StateStore` are single-transaction shorthands. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A JSON record table keyed by id.
pub type RecordTable = TableDefinition<'static, u64, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [HOSTS, JOBS, QUEUE_ENTRIES, SPECIAL_TASKS, LABELS, ACL_GROUPS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` against a consistent snapshot.
    pub fn read<R>(&self, f: impl FnOnce(&ReadScope) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&ReadScope { txn })
    }

    /// Run `f` in a write transaction. Commits when `f` returns `Ok`,
    /// aborts (leaving every table untouched) when it returns `Err`.
    pub fn write<R>(&self, f: impl FnOnce(&WriteScope<'_>) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = f(&WriteScope { txn: &txn });
        match result {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(error = %abort_err, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    // ── Labels & ACL groups ────────────────────────────────────────

    /// Create a label, or return the existing one with the same name.
    pub fn create_label(&self, name: &str) -> StateResult<Label> {
        self.write(|w| w.create_label(name))
    }

    pub fn list_labels(&self) -> StateResult<Vec<Label>> {
        self.read(|r| r.labels())
    }

    pub fn create_acl_group(&self, name: &str, users: &[&str]) -> StateResult<AclGroup> {
        self.write(|w| {
            let group = AclGroup {
                id: w.next_id("acl_groups")?,
                name: name.to_string(),
                users: users.iter().map(|u| u.to_string()).collect(),
            };
            w.put_acl_group(&group)?;
            Ok(group)
        })
    }

    pub fn list_acl_groups(&self) -> StateResult<Vec<AclGroup>> {
        self.read(|r| r.acl_groups())
    }

    // ── Hosts ──────────────────────────────────────────────────────

    pub fn create_host(&self, new: NewHost) -> StateResult<Host> {
        let host = self.write(|w| w.create_host(new))?;
        debug!(host_id = host.id, hostname = %host.hostname, "host created");
        Ok(host)
    }

    pub fn get_host(&self, id: HostId) -> StateResult<Option<Host>> {
        self.read(|r| r.host(id))
    }

    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.read(|r| r.hosts())
    }

    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.write(|w| w.put_host(host))
    }

    // ── Jobs & queue entries ───────────────────────────────────────

    /// Create a job and its host queue entries.
    pub fn create_job(&self, new: NewJob) -> StateResult<(Job, Vec<HostQueueEntry>)> {
        let (job, entries) = self.write(|w| w.create_job(new))?;
        debug!(job_id = job.id, entries = entries.len(), "job created");
        Ok((job, entries))
    }

    pub fn get_job(&self, id: JobId) -> StateResult<Option<Job>> {
        self.read(|r| r.job(id))
    }

    pub fn get_entry(&self, id: EntryId) -> StateResult<Option<HostQueueEntry>> {
        self.read(|r| r.entry(id))
    }

    pub fn list_entries(&self) -> StateResult<Vec<HostQueueEntry>> {
        self.read(|r| r.entries())
    }

    pub fn put_entry(&self, entry: &HostQueueEntry) -> StateResult<()> {
        self.write(|w| w.put_entry(entry))
    }

    /// Mark every unfinished entry of a job for abort. Returns the marked ids.
    pub fn abort_job(&self, job_id: JobId) -> StateResult<Vec<EntryId>> {
        let marked = self.write(|w| {
            w.require_job(job_id)?;
            let mut marked = Vec::new();
            for mut entry in w.entries()? {
                if entry.job_id == job_id && !entry.complete && !entry.aborted {
                    entry.aborted = true;
                    w.put_entry(&entry)?;
                    marked.push(entry.id);
                }
            }
            Ok(marked)
        })?;
        debug!(job_id, entries = marked.len(), "job marked for abort");
        Ok(marked)
    }

    // ── Special tasks ──────────────────────────────────────────────

    pub fn create_special_task(
        &self,
        host_id: HostId,
        kind: TaskKind,
        queue_entry_id: Option<EntryId>,
        requested_by: Option<&str>,
    ) -> StateResult<SpecialTask> {
        self.write(|w| w.create_special_task(host_id, kind, queue_entry_id, requested_by))
    }

    pub fn get_special_task(&self, id: TaskId) -> StateResult<Option<SpecialTask>> {
        self.read(|r| r.special_task(id))
    }

    pub fn list_special_tasks(&self) -> StateResult<Vec<SpecialTask>> {
        self.read(|r| r.special_tasks())
    }

    /// Mark a special task for abort. Finished tasks are left alone.
    pub fn abort_special_task(&self, id: TaskId) -> StateResult<bool> {
        self.write(|w| {
            let mut task = w.require_special_task(id)?;
            if task.is_complete || task.is_aborted {
                return Ok(false);
            }
            task.is_aborted = true;
            w.put_special_task(&task)?;
            Ok(true)
        })
    }
}

/// Typed record lookups shared by read and write transactions.
pub trait RecordReader {
    fn fetch<T: DeserializeOwned>(&self, table: RecordTable, id: u64) -> StateResult<Option<T>>;

    fn fetch_all<T: DeserializeOwned>(&self, table: RecordTable) -> StateResult<Vec<T>>;

    fn host(&self, id: HostId) -> StateResult<Option<Host>> {
        self.fetch(HOSTS, id)
    }

    fn require_host(&self, id: HostId) -> StateResult<Host> {
        self.host(id)?
            .ok_or_else(|| StateError::NotFound(format!("host {id}")))
    }

    fn hosts(&self) -> StateResult<Vec<Host>> {
        self.fetch_all(HOSTS)
    }

    fn job(&self, id: JobId) -> StateResult<Option<Job>> {
        self.fetch(JOBS, id)
    }

    fn require_job(&self, id: JobId) -> StateResult<Job> {
        self.job(id)?
            .ok_or_else(|| StateError::NotFound(format!("job {id}")))
    }

    fn jobs(&self) -> StateResult<Vec<Job>> {
        self.fetch_all(JOBS)
    }

    fn entry(&self, id: EntryId) -> StateResult<Option<HostQueueEntry>> {
        self.fetch(QUEUE_ENTRIES, id)
    }

    fn require_entry(&self, id: EntryId) -> StateResult<HostQueueEntry> {
        self.entry(id)?
            .ok_or_else(|| StateError::NotFound(format!("queue entry {id}")))
    }

    fn entries(&self) -> StateResult<Vec<HostQueueEntry>> {
        self.fetch_all(QUEUE_ENTRIES)
    }

    fn special_task(&self, id: TaskId) -> StateResult<Option<SpecialTask>> {
        self.fetch(SPECIAL_TASKS, id)
    }

    fn require_special_task(&self, id: TaskId) -> StateResult<SpecialTask> {
        self.special_task(id)?
            .ok_or_else(|| StateError::NotFound(format!("special task {id}")))
    }

    fn special_tasks(&self) -> StateResult<Vec<SpecialTask>> {
        self.fetch_all(SPECIAL_TASKS)
    }

    fn labels(&self) -> StateResult<Vec<Label>> {
        self.fetch_all(LABELS)
    }

    fn acl_groups(&self) -> StateResult<Vec<AclGroup>> {
        self.fetch_all(ACL_GROUPS)
    }
}

fn get_record<T, Tbl>(table: &Tbl, id: u64) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: T =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn list_records<T, Tbl>(table: &Tbl) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<u64, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(record);
    }
    Ok(results)
}

/// Read-only view over one snapshot.
pub struct ReadScope {
    txn: ReadTransaction,
}

impl RecordReader for ReadScope {
    fn fetch<T: DeserializeOwned>(&self, table: RecordTable, id: u64) -> StateResult<Option<T>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    fn fetch_all<T: DeserializeOwned>(&self, table: RecordTable) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        list_records(&table)
    }
}

/// Mutable view inside one write transaction.
pub struct WriteScope<'txn> {
    txn: &'txn WriteTransaction,
}

impl RecordReader for WriteScope<'_> {
    fn fetch<T: DeserializeOwned>(&self, table: RecordTable, id: u64) -> StateResult<Option<T>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    fn fetch_all<T: DeserializeOwned>(&self, table: RecordTable) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        list_records(&table)
    }
}

impl WriteScope<'_> {
    fn store<T: Serialize>(&self, table: RecordTable, id: u64, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table
            .insert(id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Allocate the next id for the named record table.
    pub fn next_id(&self, counter: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        let current = table
            .get(counter)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(counter, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.store(HOSTS, host.id, host)
    }

    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        self.store(JOBS, job.id, job)
    }

    pub fn put_entry(&self, entry: &HostQueueEntry) -> StateResult<()> {
        self.store(QUEUE_ENTRIES, entry.id, entry)
    }

    pub fn put_special_task(&self, task: &SpecialTask) -> StateResult<()> {
        self.store(SPECIAL_TASKS, task.id, task)
    }

    pub fn put_label(&self, label: &Label) -> StateResult<()> {
        self.store(LABELS, label.id, label)
    }

    pub fn put_acl_group(&self, group: &AclGroup) -> StateResult<()> {
        self.store(ACL_GROUPS, group.id, group)
    }

    pub fn create_label(&self, name: &str) -> StateResult<Label> {
        if let Some(existing) = self.labels()?.into_iter().find(|l| l.name == name) {
            return Ok(existing);
        }
        let label = Label {
            id: self.next_id("labels")?,
            name: name.to_string(),
        };
        self.put_label(&label)?;
        Ok(label)
    }

    pub fn create_host(&self, new: NewHost) -> StateResult<Host> {
        if new.hostname.is_empty() {
            return Err(StateError::Invalid("hostname must not be empty".into()));
        }
        if self.hosts()?.iter().any(|h| h.hostname == new.hostname) {
            return Err(StateError::Invalid(format!(
                "host '{}' already exists",
                new.hostname
            )));
        }
        let host = Host {
            id: self.next_id("hosts")?,
            hostname: new.hostname,
            status: HostStatus::Ready,
            leased: false,
            locked_by: new.locked_by,
            invalid: false,
            labels: new.labels,
            acl_groups: new.acl_groups,
        };
        self.put_host(&host)?;
        Ok(host)
    }

    pub fn create_job(&self, new: NewJob) -> StateResult<(Job, Vec<HostQueueEntry>)> {
        for host_id in &new.hosts {
            self.require_host(*host_id)?;
        }
        let job = Job {
            id: self.next_id("jobs")?,
            name: new.name,
            owner: new.owner,
            priority: new.priority,
            dependency_labels: new.dependency_labels,
            parent_job_id: new.parent_job_id,
            run_verify: new.run_verify,
            run_reset: new.run_reset,
            created_at: crate::unix_now(),
        };
        self.put_job(&job)?;

        let targets: Vec<Option<HostId>> = if new.hosts.is_empty() {
            vec![None]
        } else {
            new.hosts.into_iter().map(Some).collect()
        };
        let mut entries = Vec::with_capacity(targets.len());
        for host_id in targets {
            let entry = HostQueueEntry {
                id: self.next_id("queue_entries")?,
                job_id: job.id,
                host_id,
                metahost: host_id.is_none(),
                status: EntryStatus::Queued,
                active: false,
                complete: false,
                started_on: None,
                aborted: false,
            };
            self.put_entry(&entry)?;
            entries.push(entry);
        }
        Ok((job, entries))
    }

    pub fn create_special_task(
        &self,
        host_id: HostId,
        kind: TaskKind,
        queue_entry_id: Option<EntryId>,
        requested_by: Option<&str>,
    ) -> StateResult<SpecialTask> {
        self.require_host(host_id)?;
        let task = SpecialTask {
            id: self.next_id("special_tasks")?,
            host_id,
            queue_entry_id,
            kind,
            is_active: false,
            is_complete: false,
            success: false,
            requested_by: requested_by.map(str::to_string),
            created_at: crate::unix_now(),
            is_aborted: false,
        };
        self.put_special_task(&task)?;
        Ok(task)
    }
}
