//! In-memory bookkeeping for processes the dispatcher started on drones.

use std::collections::BTreeMap;

use testlab_drone::TrackedProcess;
use testlab_state::*;

/// What a process is doing on behalf of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentTask {
    Special {
        task_id: TaskId,
        kind: TaskKind,
        entry_id: Option<EntryId>,
    },
    Job {
        entry_id: EntryId,
        job_id: JobId,
    },
}

impl AgentTask {
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            AgentTask::Special { entry_id, .. } => *entry_id,
            AgentTask::Job { entry_id, .. } => Some(*entry_id),
        }
    }
}

/// Record statuses to put back if the launch call never ran.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Restore {
    pub host_status: HostStatus,
    pub entry_status: Option<EntryStatus>,
}

/// A launch queued on a drone but not yet executed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLaunch {
    /// Position of the `execute_command` call in the drone's batch.
    pub call_index: usize,
    pub restore: Restore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub task: AgentTask,
    pub host_id: HostId,
    pub hostname: String,
    pub drone: String,
    pub results_dir: String,
    pub exit_file: String,
    pub pid: Option<i64>,
    pub pending_launch: Option<PendingLaunch>,
}

#[derive(Debug, Default)]
pub struct AgentTable {
    agents: Vec<Agent>,
}

impl AgentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter()
    }

    pub fn push(&mut self, agent: Agent) {
        self.agents.push(agent);
    }

    /// At most one agent runs against a host at a time.
    pub fn has_host(&self, host_id: HostId) -> bool {
        self.agents.iter().any(|a| a.host_id == host_id)
    }

    /// Running processes grouped by drone, for a refresh.
    pub fn tracked_processes(&self) -> BTreeMap<String, Vec<TrackedProcess>> {
        let mut tracked: BTreeMap<String, Vec<TrackedProcess>> = BTreeMap::new();
        for agent in &self.agents {
            if let Some(pid) = agent.pid {
                tracked.entry(agent.drone.clone()).or_default().push(TrackedProcess {
                    pid,
                    exit_file: agent.exit_file.clone(),
                });
            }
        }
        tracked
    }

    /// Remove and return the running agent for `pid` on `drone`.
    pub fn take_running(&mut self, drone: &str, pid: i64) -> Option<Agent> {
        let index = self
            .agents
            .iter()
            .position(|a| a.drone == drone && a.pid == Some(pid))?;
        Some(self.agents.remove(index))
    }

    /// Remove and return every agent whose launch call is still pending.
    pub fn take_launching(&mut self) -> Vec<Agent> {
        self.take_where(|a| a.pending_launch.is_some())
    }

    /// Remove and return the agents working for `entry_id`, including its
    /// pre-job task.
    pub fn take_for_entry(&mut self, entry_id: EntryId) -> Vec<Agent> {
        self.take_where(|a| a.task.entry_id() == Some(entry_id))
    }

    pub fn take_for_task(&mut self, task_id: TaskId) -> Vec<Agent> {
        self.take_where(
            |a| matches!(a.task, AgentTask::Special { task_id: id, .. } if id == task_id),
        )
    }

    pub fn take_where(&mut self, mut predicate: impl FnMut(&Agent) -> bool) -> Vec<Agent> {
        let (taken, kept): (Vec<Agent>, Vec<Agent>) = std::mem::take(&mut self.agents)
            .into_iter()
            .partition(|a| predicate(a));
        self.agents = kept;
        taken
    }
}
