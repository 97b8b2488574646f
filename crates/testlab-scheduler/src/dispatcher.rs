//! Dispatcher — the scheduler's tick loop.
//!
//! Each tick the dispatcher:
//! - polls every drone and finishes agents whose process exited
//! - gives up on agents whose drone was disabled
//! - stops entries and special tasks marked for abort
//! - runs one host scheduling pass and leases hosts of frontend tasks
//! - starts pending special tasks, then jobs whose entry reached `Starting`,
//!   up to the per-tick process limit
//! - sends every drone its queued calls and records the started pids
//! - releases hosts nothing uses any more
//!
//! All record changes go through [`StateStore::write`]; drone calls are
//! queued while records are updated and executed together in one step, so a
//! drone that fails only rolls back the launches queued on it.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use testlab_core::config::SchedulerSection;
use testlab_core::{NotificationQueue, NotificationSink};
use testlab_drone::{CallOutcome, DronePool, RemoteCall};
use testlab_rdb::{HostScheduler, ScheduleSummary};
use testlab_state::*;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentTable, AgentTask, PendingLaunch, Restore};
use crate::command::{CommandBuilder, Launch};
use crate::error::SchedulerResult;

/// Recorded as `requested_by` on tasks the dispatcher creates itself.
pub const SCHEDULER_USER: &str = "scheduler";

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub tick_pause: Duration,
    pub results_dir: PathBuf,
    /// Drone owner for work not attached to a job.
    pub default_user: String,
    pub job_runner: String,
    pub provisionable_label_prefixes: Vec<String>,
    /// Drone that finished results are copied to.
    pub results_host: Option<String>,
    pub max_processes_started_per_cycle: u32,
}

impl From<&SchedulerSection> for DispatcherSettings {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            tick_pause: Duration::from_secs(section.tick_pause_secs),
            results_dir: section.results_dir.clone(),
            default_user: section.default_user.clone(),
            job_runner: section.job_runner.clone(),
            provisionable_label_prefixes: section.provisionable_label_prefixes.clone(),
            results_host: section.results_host.clone(),
            max_processes_started_per_cycle: section.max_processes_started_per_cycle,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    /// Agents whose process exited.
    pub finished: usize,
    /// Agents given up with their disabled drone.
    pub lost_agents: usize,
    pub aborted_entries: Vec<EntryId>,
    pub aborted_tasks: Vec<TaskId>,
    pub scheduled: ScheduleSummary,
    pub leased_for_tasks: Vec<HostId>,
    pub started_tasks: Vec<TaskId>,
    pub started_jobs: Vec<EntryId>,
    /// Launches rolled back because the drone did not start the process.
    pub launch_failures: usize,
    pub released: Vec<HostId>,
    pub overlaps: usize,
    pub notifications_sent: usize,
}

/// What startup recovery found.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    pub requeued_tasks: Vec<TaskId>,
    pub lost_entries: Vec<EntryId>,
    pub cleanup_tasks: Vec<TaskId>,
    pub failed_drones: usize,
}

pub struct Dispatcher {
    store: StateStore,
    host_scheduler: HostScheduler,
    pool: DronePool,
    commands: CommandBuilder,
    settings: DispatcherSettings,
    agents: AgentTable,
    notifications: NotificationQueue,
    sinks: Vec<Box<dyn NotificationSink>>,
    ticks: u64,
}

impl Dispatcher {
    /// The dispatcher shares the pool's notification queue.
    pub fn new(
        store: StateStore,
        pool: DronePool,
        settings: DispatcherSettings,
        sinks: Vec<Box<dyn NotificationSink>>,
    ) -> Self {
        let host_scheduler =
            HostScheduler::new(store.clone(), settings.provisionable_label_prefixes.clone());
        let commands = CommandBuilder::new(settings.job_runner.clone(), settings.results_dir.clone());
        let notifications = pool.notifications().clone();
        Self {
            store,
            host_scheduler,
            pool,
            commands,
            settings,
            agents: AgentTable::new(),
            notifications,
            sinks,
            ticks: 0,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn pool(&self) -> &DronePool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut DronePool {
        &mut self.pool
    }

    pub fn agents(&self) -> &AgentTable {
        &self.agents
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Prepare drones and repair records left behind by a previous run.
    ///
    /// Processes from a previous run are not tracked any more: their special
    /// tasks go back to pending, their job entries fail, and hosts left in a
    /// transient status get a `Cleanup` task. With `recover_hosts`,
    /// `RepairFailed` hosts get one too.
    pub async fn initialize(&mut self, recover_hosts: bool) -> SchedulerResult<RecoveryReport> {
        let results_dir = self.settings.results_dir.to_string_lossy().into_owned();
        self.pool
            .queue_on_all(&RemoteCall::new("initialize").arg(results_dir));
        let execution = self.pool.execute_all().await;
        for (hostname, e) in &execution.failed {
            warn!(%hostname, error = %e, "drone failed to initialize");
        }
        for (hostname, outcomes) in &execution.results {
            for outcome in outcomes {
                if let CallOutcome::Error(message) = outcome {
                    warn!(%hostname, %message, "drone initialize call failed");
                }
            }
        }

        let mut report = self
            .store
            .write(|w| recover_records(w, recover_hosts))?;
        report.failed_drones = execution.failed.len();

        if !report.lost_entries.is_empty() {
            self.notifications.enqueue(
                format!("{} job entries lost on restart", report.lost_entries.len()),
                format!(
                    "entries {:?} were running when the scheduler stopped and have been marked failed",
                    report.lost_entries
                ),
            );
        }
        info!(
            requeued_tasks = report.requeued_tasks.len(),
            lost_entries = report.lost_entries.len(),
            cleanup_tasks = report.cleanup_tasks.len(),
            failed_drones = report.failed_drones,
            recover_hosts,
            "dispatcher initialized"
        );
        Ok(report)
    }

    /// Run one scheduling cycle.
    pub async fn tick(&mut self) -> SchedulerResult<TickReport> {
        self.ticks += 1;
        let mut report = TickReport {
            tick: self.ticks,
            ..Default::default()
        };

        report.finished = self.handle_finished_agents().await?;
        report.lost_agents = self.handle_lost_agents()?;
        report.aborted_entries = self.abort_entries()?;
        report.aborted_tasks = self.abort_special_tasks()?;
        report.scheduled = self.host_scheduler.schedule_jobs()?;
        report.leased_for_tasks = self.host_scheduler.lease_hosts_of_frontend_tasks()?;
        report.started_tasks = self.schedule_special_tasks()?;
        report.started_jobs = self.schedule_starting_entries(report.started_tasks.len())?;
        report.launch_failures = self.execute_drone_calls().await?;
        report.released = self.host_scheduler.release_unused_hosts()?;
        report.overlaps = self.check_host_assignments()?;
        report.notifications_sent = self.notifications.flush(&self.sinks);

        debug!(
            tick = report.tick,
            finished = report.finished,
            acquired = report.scheduled.acquired.len(),
            started_tasks = report.started_tasks.len(),
            started_jobs = report.started_jobs.len(),
            released = report.released.len(),
            agents = self.agents.len(),
            "tick complete"
        );
        Ok(report)
    }

    /// Tick until `shutdown` flips. A failed tick stops the loop.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        info!(
            tick_pause_secs = self.settings.tick_pause.as_secs(),
            drones = self.pool.len(),
            "dispatcher started"
        );

        loop {
            if let Err(e) = self.tick().await {
                error!(tick = self.ticks, error = %e, "dispatcher tick failed, exiting");
                self.notifications
                    .enqueue("scheduler exiting on uncaught error", e.to_string());
                self.notifications.flush(&self.sinks);
                return Err(e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.tick_pause) => {}
                _ = shutdown.changed() => {
                    info!(ticks = self.ticks, agents = self.agents.len(), "dispatcher shutting down");
                    break;
                }
            }
        }

        self.notifications.flush(&self.sinks);
        Ok(())
    }

    async fn handle_finished_agents(&mut self) -> SchedulerResult<usize> {
        let tracked = self.agents.tracked_processes();
        let refresh = self.pool.refresh(&tracked).await;
        for (hostname, e) in &refresh.failed {
            warn!(%hostname, error = %e, "drone refresh failed, its agents stay pending");
        }

        let mut finished = 0;
        for (drone, processes) in refresh.finished {
            for process in processes {
                let Some(agent) = self.agents.take_running(&drone, process.pid) else {
                    debug!(%drone, pid = process.pid, "finished process has no agent");
                    continue;
                };
                self.finish_agent(agent, process.exit_code)?;
                finished += 1;
            }
        }
        Ok(finished)
    }

    /// A disabled drone is never polled again, so its agents are given up:
    /// special tasks go back to pending, job entries fail and their host
    /// gets a `Cleanup`.
    fn handle_lost_agents(&mut self) -> SchedulerResult<usize> {
        let pool = &self.pool;
        let lost = self
            .agents
            .take_where(|a| !pool.drone(&a.drone).is_some_and(|d| d.enabled()));
        if lost.is_empty() {
            return Ok(0);
        }

        let mut lines = Vec::with_capacity(lost.len());
        for agent in &lost {
            self.store.write(|w| abandon_agent(w, agent))?;
            warn!(drone = %agent.drone, hostname = %agent.hostname, task = ?agent.task, "agent lost with its drone");
            lines.push(format!("{:?} on {} (drone {})", agent.task, agent.hostname, agent.drone));
        }
        let drones: BTreeSet<&str> = lost.iter().map(|a| a.drone.as_str()).collect();
        self.notifications.enqueue(
            format!("{} processes lost on disabled drones {:?}", lost.len(), drones),
            lines.join("\n"),
        );
        Ok(lost.len())
    }

    /// Stop entries marked for abort. Their processes get a `kill_process`
    /// call in this tick's drone batch.
    fn abort_entries(&mut self) -> SchedulerResult<Vec<EntryId>> {
        let aborting: Vec<EntryId> = self.store.read(|r| {
            Ok(r.entries()?
                .into_iter()
                .filter(HostQueueEntry::is_aborting)
                .map(|e| e.id)
                .collect())
        })?;
        for &entry_id in &aborting {
            for agent in self.agents.take_for_entry(entry_id) {
                self.kill_agent(&agent);
            }
            let cleanup = self.store.write(|w| abort_entry(w, entry_id))?;
            info!(entry_id, cleanup_task = ?cleanup, "queue entry aborted");
        }
        Ok(aborting)
    }

    /// Stop special tasks marked for abort. An active task is finished as a
    /// failure, so its host and entry follow the usual failure path.
    fn abort_special_tasks(&mut self) -> SchedulerResult<Vec<TaskId>> {
        let aborting: Vec<SpecialTask> = self.store.read(|r| {
            Ok(r.special_tasks()?
                .into_iter()
                .filter(SpecialTask::is_aborting)
                .collect())
        })?;
        let mut aborted = Vec::with_capacity(aborting.len());
        for task in aborting {
            let agents = self.agents.take_for_task(task.id);
            for agent in &agents {
                self.kill_agent(agent);
            }
            if task.is_active {
                let repair_failed = self.store.write(|w| {
                    complete_special_task(w, task.id, task.kind, task.queue_entry_id, false)
                })?;
                if repair_failed {
                    self.notifications.enqueue(
                        format!("repair aborted on host {}", task.host_id),
                        format!("special task {} was aborted, host left in repair_failed", task.id),
                    );
                }
            } else {
                self.store.write(|w| abort_pending_task(w, task.id))?;
            }
            info!(task_id = task.id, kind = task.kind.as_str(), active = task.is_active, "special task aborted");
            aborted.push(task.id);
        }
        Ok(aborted)
    }

    fn kill_agent(&mut self, agent: &Agent) {
        let Some(pid) = agent.pid else {
            return;
        };
        match self
            .pool
            .queue_call(&agent.drone, RemoteCall::new("kill_process").arg(pid))
        {
            Ok(_) => debug!(drone = %agent.drone, pid, "kill queued"),
            Err(e) => warn!(drone = %agent.drone, pid, error = %e, "cannot queue kill"),
        }
    }

    /// The first process of a tick always starts; after that the per-tick
    /// limit applies.
    fn can_start_process(&self, started_this_tick: usize) -> bool {
        started_this_tick == 0
            || started_this_tick < self.settings.max_processes_started_per_cycle as usize
    }

    fn finish_agent(&mut self, agent: Agent, exit_code: Option<i64>) -> SchedulerResult<()> {
        let success = exit_code == Some(0);
        match agent.task {
            AgentTask::Special {
                task_id,
                kind,
                entry_id,
            } => {
                let repair_failed = self
                    .store
                    .write(|w| complete_special_task(w, task_id, kind, entry_id, success))?;
                info!(
                    task_id,
                    kind = kind.as_str(),
                    hostname = %agent.hostname,
                    success,
                    ?exit_code,
                    "special task finished"
                );
                if repair_failed {
                    self.notifications.enqueue(
                        format!("repair failed on {}", agent.hostname),
                        format!(
                            "special task {task_id} exited with {exit_code:?}, host left in repair_failed"
                        ),
                    );
                }
            }
            AgentTask::Job { entry_id, job_id } => {
                self.store
                    .write(|w| complete_job_entry(w, entry_id, agent.host_id, success))?;
                info!(entry_id, job_id, hostname = %agent.hostname, success, ?exit_code, "job finished");
            }
        }
        self.collect_results(&agent);
        Ok(())
    }

    fn collect_results(&mut self, agent: &Agent) {
        let Some(results_host) = self.settings.results_host.as_deref() else {
            return;
        };
        if results_host == agent.drone {
            return;
        }
        if let Err(e) = self.pool.send_file(
            &agent.drone,
            results_host,
            &agent.results_dir,
            &agent.results_dir,
            true,
        ) {
            warn!(drone = %agent.drone, %results_host, error = %e, "cannot queue results copy");
        }
    }

    /// Start pending special tasks on leased hosts, most urgent first.
    fn schedule_special_tasks(&mut self) -> SchedulerResult<Vec<TaskId>> {
        let tasks = self
            .host_scheduler
            .queries()
            .get_prioritized_special_tasks(true)?;
        let mut started = Vec::new();
        for task in tasks {
            if !self.can_start_process(started.len()) {
                debug!(started = started.len(), "per-tick process limit reached");
                break;
            }
            if self.agents.has_host(task.host_id) {
                continue;
            }
            let (host, owner) = self.store.read(|r| {
                let host = r.require_host(task.host_id)?;
                let owner = match task.queue_entry_id {
                    Some(entry_id) => Some(r.require_job(r.require_entry(entry_id)?.job_id)?.owner),
                    None => None,
                };
                Ok((host, owner))
            })?;
            let owner = owner.unwrap_or_else(|| self.settings.default_user.clone());
            let Some(drone) = self.pool.choose_drone(&owner).map(str::to_string) else {
                debug!(task_id = task.id, %owner, "no drone capacity for special task");
                continue;
            };

            let launch = self.commands.special_task(&task, &host);
            let call_index = self.queue_launch(&drone, &launch)?;
            let restore = self.store.write(|w| {
                let mut current = w.require_special_task(task.id)?;
                current.is_active = true;
                w.put_special_task(&current)?;

                let mut host = w.require_host(task.host_id)?;
                let host_status = host.status;
                host.status = task.kind.host_status();
                w.put_host(&host)?;

                let entry_status = match task.queue_entry_id {
                    Some(entry_id) => {
                        let mut entry = w.require_entry(entry_id)?;
                        let previous = entry.status;
                        entry.status = EntryStatus::Verifying;
                        w.put_entry(&entry)?;
                        Some(previous)
                    }
                    None => None,
                };
                Ok(Restore {
                    host_status,
                    entry_status,
                })
            })?;

            info!(task_id = task.id, kind = task.kind.as_str(), hostname = %host.hostname, %drone, "starting special task");
            self.agents.push(Agent {
                task: AgentTask::Special {
                    task_id: task.id,
                    kind: task.kind,
                    entry_id: task.queue_entry_id,
                },
                host_id: host.id,
                hostname: host.hostname.clone(),
                drone,
                results_dir: launch.working_directory.clone(),
                exit_file: launch.exit_file.clone(),
                pid: None,
                pending_launch: Some(PendingLaunch {
                    call_index,
                    restore,
                }),
            });
            started.push(task.id);
        }
        Ok(started)
    }

    /// Start the job process for active entries that finished their
    /// pre-job task, or had none.
    fn schedule_starting_entries(
        &mut self,
        started_this_tick: usize,
    ) -> SchedulerResult<Vec<EntryId>> {
        let starting = self.store.read(|r| {
            let mut starting = Vec::new();
            for entry in r.entries()? {
                if !entry.holds_host() || entry.status != EntryStatus::Starting {
                    continue;
                }
                let Some(host_id) = entry.host_id else {
                    continue;
                };
                let job = r.require_job(entry.job_id)?;
                let host = r.require_host(host_id)?;
                starting.push((entry, job, host));
            }
            Ok(starting)
        })?;

        let mut started = Vec::new();
        for (entry, job, host) in starting {
            if !self.can_start_process(started_this_tick + started.len()) {
                debug!(started = started_this_tick + started.len(), "per-tick process limit reached");
                break;
            }
            if self.agents.has_host(host.id) {
                continue;
            }
            let Some(drone) = self.pool.choose_drone(&job.owner).map(str::to_string) else {
                debug!(entry_id = entry.id, owner = %job.owner, "no drone capacity for job");
                continue;
            };

            let launch = self.commands.job(&job, &host);
            let call_index = self.queue_launch(&drone, &launch)?;
            let restore = self.store.write(|w| {
                let mut current = w.require_entry(entry.id)?;
                let entry_status = current.status;
                current.status = EntryStatus::Running;
                current.started_on = Some(drone.clone());
                w.put_entry(&current)?;

                let mut host = w.require_host(host.id)?;
                let host_status = host.status;
                host.status = HostStatus::Running;
                w.put_host(&host)?;
                Ok(Restore {
                    host_status,
                    entry_status: Some(entry_status),
                })
            })?;

            info!(entry_id = entry.id, job_id = job.id, hostname = %host.hostname, %drone, "starting job");
            self.agents.push(Agent {
                task: AgentTask::Job {
                    entry_id: entry.id,
                    job_id: job.id,
                },
                host_id: host.id,
                hostname: host.hostname.clone(),
                drone,
                results_dir: launch.working_directory.clone(),
                exit_file: launch.exit_file.clone(),
                pid: None,
                pending_launch: Some(PendingLaunch {
                    call_index,
                    restore,
                }),
            });
            started.push(entry.id);
        }
        Ok(started)
    }

    fn queue_launch(&mut self, drone: &str, launch: &Launch) -> SchedulerResult<usize> {
        let call_index = self.pool.queue_call(drone, launch.to_call())?;
        self.pool.note_process_started(drone)?;
        Ok(call_index)
    }

    /// Send every queued call and settle the agents launched this tick.
    async fn execute_drone_calls(&mut self) -> SchedulerResult<usize> {
        let execution = self.pool.execute_all().await;
        for (hostname, e) in &execution.failed {
            warn!(%hostname, error = %e, "drone call batch failed");
        }

        let mut failures = 0;
        for mut agent in self.agents.take_launching() {
            let Some(launch) = agent.pending_launch.take() else {
                continue;
            };
            let started = match execution
                .results
                .get(&agent.drone)
                .and_then(|outcomes| outcomes.get(launch.call_index))
            {
                Some(CallOutcome::Ok(value)) => value
                    .as_int()
                    .ok_or_else(|| "execute_command returned no pid".to_string()),
                Some(CallOutcome::Error(message)) => Err(message.clone()),
                None => Err(execution
                    .failed
                    .get(&agent.drone)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "launch call was not executed".to_string())),
            };
            match started {
                Ok(pid) => {
                    debug!(drone = %agent.drone, hostname = %agent.hostname, pid, "process started");
                    agent.pid = Some(pid);
                    self.agents.push(agent);
                }
                Err(reason) => {
                    warn!(drone = %agent.drone, hostname = %agent.hostname, %reason, "launch failed, reverting");
                    self.store
                        .write(|w| revert_launch(w, &agent, launch.restore))?;
                    failures += 1;
                }
            }
        }
        Ok(failures)
    }

    fn check_host_assignments(&mut self) -> SchedulerResult<usize> {
        let overlaps = self.host_scheduler.check_host_assignments()?;
        if !overlaps.is_empty() {
            let body = overlaps
                .iter()
                .map(|o| {
                    format!(
                        "host {} ({}): entries {:?} of jobs {:?}",
                        o.hostname, o.host_id, o.entries, o.jobs
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            self.notifications.enqueue(
                format!("{} hosts assigned to more than one job", overlaps.len()),
                body,
            );
        }
        Ok(overlaps.len())
    }
}

fn recover_records(w: &WriteScope<'_>, recover_hosts: bool) -> StateResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for mut task in w.special_tasks()? {
        if task.is_active && !task.is_complete {
            task.is_active = false;
            w.put_special_task(&task)?;
            report.requeued_tasks.push(task.id);
        }
    }

    for mut entry in w.entries()? {
        if entry.holds_host() && entry.status == EntryStatus::Running {
            entry.status = EntryStatus::Failed;
            entry.active = false;
            entry.complete = true;
            w.put_entry(&entry)?;
            report.lost_entries.push(entry.id);
        }
    }

    let busy: HashSet<HostId> = w
        .special_tasks()?
        .into_iter()
        .filter(|t| !t.is_complete)
        .map(|t| t.host_id)
        .collect();
    for host in w.hosts()? {
        if host.invalid || busy.contains(&host.id) {
            continue;
        }
        let stuck = host.status.is_transient()
            || (recover_hosts && host.status == HostStatus::RepairFailed && !host.is_locked());
        if stuck {
            let task = w.create_special_task(host.id, TaskKind::Cleanup, None, Some(SCHEDULER_USER))?;
            debug!(hostname = %host.hostname, status = ?host.status, task_id = task.id, "queued cleanup for stuck host");
            report.cleanup_tasks.push(task.id);
        }
    }
    Ok(report)
}

/// Returns true when a repair failed and the host is now `RepairFailed`.
fn complete_special_task(
    w: &WriteScope<'_>,
    task_id: TaskId,
    kind: TaskKind,
    entry_id: Option<EntryId>,
    success: bool,
) -> StateResult<bool> {
    let mut task = w.require_special_task(task_id)?;
    task.is_active = false;
    task.is_complete = true;
    task.success = success;
    w.put_special_task(&task)?;

    let mut host = w.require_host(task.host_id)?;
    let mut repair_failed = false;
    if success {
        host.status = HostStatus::Ready;
    } else if kind == TaskKind::Repair {
        host.status = HostStatus::RepairFailed;
        repair_failed = true;
    } else {
        host.status = HostStatus::Repairing;
        w.create_special_task(host.id, TaskKind::Repair, None, Some(SCHEDULER_USER))?;
    }
    w.put_host(&host)?;

    if let Some(entry_id) = entry_id {
        let mut entry = w.require_entry(entry_id)?;
        if entry.active && !entry.complete {
            if success {
                entry.status = EntryStatus::Starting;
            } else {
                requeue(&mut entry);
            }
            w.put_entry(&entry)?;
        }
    }
    Ok(repair_failed)
}

fn complete_job_entry(
    w: &WriteScope<'_>,
    entry_id: EntryId,
    host_id: HostId,
    success: bool,
) -> StateResult<()> {
    let mut entry = w.require_entry(entry_id)?;
    entry.status = if success {
        EntryStatus::Completed
    } else {
        EntryStatus::Failed
    };
    entry.active = false;
    entry.complete = true;
    w.put_entry(&entry)?;

    let mut host = w.require_host(host_id)?;
    host.status = HostStatus::Ready;
    w.put_host(&host)
}

fn revert_launch(w: &WriteScope<'_>, agent: &Agent, restore: Restore) -> StateResult<()> {
    let mut host = w.require_host(agent.host_id)?;
    host.status = restore.host_status;
    w.put_host(&host)?;

    let entry_id = match agent.task {
        AgentTask::Special {
            task_id, entry_id, ..
        } => {
            let mut task = w.require_special_task(task_id)?;
            task.is_active = false;
            w.put_special_task(&task)?;
            entry_id
        }
        AgentTask::Job { entry_id, .. } => Some(entry_id),
    };
    if let (Some(entry_id), Some(status)) = (entry_id, restore.entry_status) {
        let mut entry = w.require_entry(entry_id)?;
        entry.status = status;
        if matches!(agent.task, AgentTask::Job { .. }) {
            entry.started_on = None;
        }
        w.put_entry(&entry)?;
    }
    Ok(())
}

/// Give up on an agent whose process can no longer be observed.
fn abandon_agent(w: &WriteScope<'_>, agent: &Agent) -> StateResult<()> {
    match agent.task {
        AgentTask::Special { task_id, .. } => {
            let mut task = w.require_special_task(task_id)?;
            if !task.is_complete {
                task.is_active = false;
                w.put_special_task(&task)?;
            }
        }
        AgentTask::Job { entry_id, .. } => {
            let mut entry = w.require_entry(entry_id)?;
            if !entry.complete {
                entry.status = EntryStatus::Failed;
                entry.active = false;
                entry.complete = true;
                w.put_entry(&entry)?;
            }
            queue_cleanup(w, agent.host_id)?;
        }
    }
    Ok(())
}

/// Finish an aborted entry and its unfinished pre-job tasks. A host that was
/// in use gets a `Cleanup`, returned here.
fn abort_entry(w: &WriteScope<'_>, entry_id: EntryId) -> StateResult<Option<TaskId>> {
    let mut entry = w.require_entry(entry_id)?;
    let held = entry.holds_host();
    entry.status = EntryStatus::Aborted;
    entry.active = false;
    entry.complete = true;
    w.put_entry(&entry)?;

    for mut task in w.special_tasks()? {
        if task.queue_entry_id == Some(entry_id) && !task.is_complete {
            task.is_active = false;
            task.is_complete = true;
            task.success = false;
            w.put_special_task(&task)?;
        }
    }

    let Some(host_id) = entry.host_id.filter(|_| held) else {
        return Ok(None);
    };
    if w.require_host(host_id)?.status == HostStatus::Ready {
        return Ok(None);
    }
    queue_cleanup(w, host_id)
}

/// A task aborted before it started leaves the host alone; its entry goes
/// back to the queue.
fn abort_pending_task(w: &WriteScope<'_>, task_id: TaskId) -> StateResult<()> {
    let mut task = w.require_special_task(task_id)?;
    task.is_active = false;
    task.is_complete = true;
    task.success = false;
    w.put_special_task(&task)?;

    if let Some(entry_id) = task.queue_entry_id {
        let mut entry = w.require_entry(entry_id)?;
        if entry.active && !entry.complete {
            requeue(&mut entry);
            w.put_entry(&entry)?;
        }
    }
    Ok(())
}

/// Queue a host-only `Cleanup` unless the host already has unfinished tasks.
fn queue_cleanup(w: &WriteScope<'_>, host_id: HostId) -> StateResult<Option<TaskId>> {
    let busy = w
        .special_tasks()?
        .iter()
        .any(|t| t.host_id == host_id && !t.is_complete);
    if busy {
        return Ok(None);
    }
    let task = w.create_special_task(host_id, TaskKind::Cleanup, None, Some(SCHEDULER_USER))?;
    Ok(Some(task.id))
}

/// Hand an entry back to the queue; a metahost entry may land elsewhere.
fn requeue(entry: &mut HostQueueEntry) {
    entry.active = false;
    entry.status = EntryStatus::Queued;
    entry.started_on = None;
    if entry.metahost {
        entry.host_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn store_with_host(status: HostStatus) -> (StateStore, Host) {
        let store = StateStore::open_in_memory().unwrap();
        let mut host = store
            .create_host(NewHost {
                hostname: "h1".into(),
                ..Default::default()
            })
            .unwrap();
        host.status = status;
        host.leased = true;
        store.put_host(&host).unwrap();
        (store, host)
    }

    fn job_entry(store: &StateStore, host_id: HostId, metahost: bool) -> HostQueueEntry {
        let (_, mut entries) = store
            .create_job(NewJob {
                name: "dummy_Pass".into(),
                owner: "alice".into(),
                hosts: if metahost { vec![] } else { vec![host_id] },
                ..Default::default()
            })
            .unwrap();
        let mut entry = entries.remove(0);
        entry.host_id = Some(host_id);
        entry.active = true;
        entry.status = EntryStatus::Verifying;
        store.put_entry(&entry).unwrap();
        entry
    }

    #[test]
    fn test_verify_success_moves_entry_to_starting() {
        let (store, host) = store_with_host(HostStatus::Verifying);
        let entry = job_entry(&store, host.id, false);
        let task = store
            .create_special_task(host.id, TaskKind::Verify, Some(entry.id), None)
            .unwrap();

        let repair_failed = store
            .write(|w| complete_special_task(w, task.id, TaskKind::Verify, Some(entry.id), true))
            .unwrap();

        assert!(!repair_failed);
        assert_eq!(store.get_host(host.id).unwrap().unwrap().status, HostStatus::Ready);
        assert_eq!(
            store.get_entry(entry.id).unwrap().unwrap().status,
            EntryStatus::Starting
        );
        let task = store.get_special_task(task.id).unwrap().unwrap();
        assert!(task.is_complete && task.success);
    }

    #[test]
    fn test_verify_failure_requeues_metahost_and_schedules_repair() {
        let (store, host) = store_with_host(HostStatus::Verifying);
        let entry = job_entry(&store, host.id, true);
        let task = store
            .create_special_task(host.id, TaskKind::Verify, Some(entry.id), None)
            .unwrap();

        store
            .write(|w| complete_special_task(w, task.id, TaskKind::Verify, Some(entry.id), false))
            .unwrap();

        let entry = store.get_entry(entry.id).unwrap().unwrap();
        assert!(entry.is_pending());
        assert_eq!(entry.host_id, None);
        assert_eq!(store.get_host(host.id).unwrap().unwrap().status, HostStatus::Repairing);
        let repairs: Vec<_> = store
            .list_special_tasks()
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TaskKind::Repair)
            .collect();
        assert_eq!(repairs.len(), 1);
        assert!(repairs[0].is_pending());
        assert_eq!(repairs[0].queue_entry_id, None);
        assert_eq!(repairs[0].requested_by.as_deref(), Some(SCHEDULER_USER));
    }

    #[test]
    fn test_repair_failure_marks_host() {
        let (store, host) = store_with_host(HostStatus::Repairing);
        let task = store
            .create_special_task(host.id, TaskKind::Repair, None, None)
            .unwrap();
        let repair_failed = store
            .write(|w| complete_special_task(w, task.id, TaskKind::Repair, None, false))
            .unwrap();
        assert!(repair_failed);
        assert_eq!(
            store.get_host(host.id).unwrap().unwrap().status,
            HostStatus::RepairFailed
        );
    }

    #[test]
    fn test_recover_records() {
        let store = StateStore::open_in_memory().unwrap();
        let mut hosts = Vec::new();
        for (name, status) in [
            ("running", HostStatus::Running),
            ("cleaning", HostStatus::Cleaning),
            ("broken", HostStatus::RepairFailed),
            ("ready", HostStatus::Ready),
        ] {
            let mut host = store
                .create_host(NewHost {
                    hostname: name.into(),
                    labels: BTreeSet::new(),
                    ..Default::default()
                })
                .unwrap();
            host.status = status;
            host.leased = status != HostStatus::Ready;
            store.put_host(&host).unwrap();
            hosts.push(host);
        }
        let mut entry = job_entry(&store, hosts[0].id, false);
        entry.status = EntryStatus::Running;
        store.put_entry(&entry).unwrap();
        let mut active_task = store
            .create_special_task(hosts[1].id, TaskKind::Cleanup, None, None)
            .unwrap();
        active_task.is_active = true;
        store
            .write(|w| w.put_special_task(&active_task))
            .unwrap();

        let report = store.write(|w| recover_records(w, false)).unwrap();
        assert_eq!(report.requeued_tasks, vec![active_task.id]);
        assert_eq!(report.lost_entries, vec![entry.id]);
        // Only the running host needs a new cleanup; the cleaning host
        // already has its task back in the queue.
        assert_eq!(report.cleanup_tasks.len(), 1);
        let cleanup = store.get_special_task(report.cleanup_tasks[0]).unwrap().unwrap();
        assert_eq!(cleanup.host_id, hosts[0].id);
        let entry = store.get_entry(entry.id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(entry.complete && !entry.active);

        let report = store.write(|w| recover_records(w, true)).unwrap();
        assert_eq!(report.cleanup_tasks.len(), 1);
        let cleanup = store.get_special_task(report.cleanup_tasks[0]).unwrap().unwrap();
        assert_eq!(cleanup.host_id, hosts[2].id);
    }

    #[test]
    fn test_settings_from_section() {
        let section = SchedulerSection {
            tick_pause_secs: 3,
            results_host: Some("results1".into()),
            ..Default::default()
        };
        let settings = DispatcherSettings::from(&section);
        assert_eq!(settings.tick_pause, Duration::from_secs(3));
        assert_eq!(settings.results_host.as_deref(), Some("results1"));
        assert_eq!(settings.default_user, "testlab_system");
        assert_eq!(settings.max_processes_started_per_cycle, 100);
    }

    #[test]
    fn test_abort_pending_task_requeues_its_entry() {
        let (store, host) = store_with_host(HostStatus::Ready);
        let mut entry = job_entry(&store, host.id, false);
        entry.status = EntryStatus::Queued;
        store.put_entry(&entry).unwrap();
        let task = store
            .create_special_task(host.id, TaskKind::Verify, Some(entry.id), None)
            .unwrap();

        store.write(|w| abort_pending_task(w, task.id)).unwrap();

        let task = store.get_special_task(task.id).unwrap().unwrap();
        assert!(task.is_complete && !task.success);
        let entry = store.get_entry(entry.id).unwrap().unwrap();
        assert!(entry.is_pending());
        assert_eq!(entry.host_id, Some(host.id));
        assert_eq!(store.get_host(host.id).unwrap().unwrap().status, HostStatus::Ready);
    }

    #[test]
    fn test_abort_entry_on_ready_host_needs_no_cleanup() {
        let (store, host) = store_with_host(HostStatus::Ready);
        let mut entry = job_entry(&store, host.id, false);
        entry.status = EntryStatus::Starting;
        store.put_entry(&entry).unwrap();

        let cleanup = store.write(|w| abort_entry(w, entry.id)).unwrap();
        assert_eq!(cleanup, None);
        let entry = store.get_entry(entry.id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Aborted);
        assert!(entry.complete);
    }

    #[test]
    fn test_abandoned_job_fails_and_queues_one_cleanup() {
        let (store, host) = store_with_host(HostStatus::Running);
        let mut entry = job_entry(&store, host.id, false);
        entry.status = EntryStatus::Running;
        store.put_entry(&entry).unwrap();
        let agent = Agent {
            task: AgentTask::Job {
                entry_id: entry.id,
                job_id: entry.job_id,
            },
            host_id: host.id,
            hostname: host.hostname.clone(),
            drone: "drone1".into(),
            results_dir: "/r".into(),
            exit_file: "/r/.exit_code".into(),
            pid: Some(42),
            pending_launch: None,
        };

        store.write(|w| abandon_agent(w, &agent)).unwrap();
        store.write(|w| abandon_agent(w, &agent)).unwrap();

        let entry = store.get_entry(entry.id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        let cleanups = store
            .list_special_tasks()
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TaskKind::Cleanup)
            .count();
        assert_eq!(cleanups, 1);
    }
}
