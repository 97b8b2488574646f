//! A single worker machine and its queue of pending remote calls.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use testlab_core::NotificationQueue;
use testlab_core::config::DroneSection;
use tracing::{debug, error, warn};

use crate::error::{DroneError, DroneResult};
use crate::executor::{CallExecutor, LocalExecutor, SshExecutor};
use crate::protocol::{CallBatch, CallOutcome, RemoteCall};
use crate::settings::DroneSettings;
use crate::utility::is_local_hostname;

pub const DEFAULT_MAX_PROCESSES: u32 = 20;

/// How busy a drone is. Smaller is freer.
///
/// Ordered by load fraction, then by the negated process limit so that at
/// equal load the drone with more headroom wins.
#[derive(Debug, Clone, Copy)]
pub struct UsedCapacity {
    pub load: f64,
    pub neg_max_processes: i64,
}

impl UsedCapacity {
    /// What a drone with `max_processes == 0` reports.
    pub const SATURATED: UsedCapacity = UsedCapacity {
        load: 1.0,
        neg_max_processes: 0,
    };
}

impl PartialEq for UsedCapacity {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for UsedCapacity {}

impl PartialOrd for UsedCapacity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UsedCapacity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.load
            .total_cmp(&other.load)
            .then(self.neg_max_processes.cmp(&other.neg_max_processes))
    }
}

/// A transfer resolved to the drone that must run it.
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransfer {
    pub queue_on: String,
    pub call: RemoteCall,
}

pub struct Drone {
    hostname: String,
    enabled: bool,
    max_processes: u32,
    active_processes: u32,
    allowed_users: Option<BTreeSet<String>>,
    call_queue: Vec<RemoteCall>,
    executor: Box<dyn CallExecutor>,
    notifications: NotificationQueue,
}

impl fmt::Debug for Drone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drone")
            .field("hostname", &self.hostname)
            .field("enabled", &self.enabled)
            .field("max_processes", &self.max_processes)
            .field("active_processes", &self.active_processes)
            .field("queued_calls", &self.call_queue.len())
            .finish()
    }
}

/// Build a drone for `hostname`. `localhost` runs calls in-process; any other
/// host is probed over ssh and fails with [`DroneError::Unreachable`] if the
/// probe does not succeed.
pub async fn get_drone(hostname: &str, settings: &DroneSettings) -> DroneResult<Drone> {
    let executor: Box<dyn CallExecutor> = if is_local_hostname(hostname) {
        Box::new(LocalExecutor)
    } else {
        Box::new(SshExecutor::connect(hostname, settings).await?)
    };
    Ok(Drone::new(hostname, executor))
}

impl Drone {
    pub fn new(hostname: impl Into<String>, executor: Box<dyn CallExecutor>) -> Self {
        Self {
            hostname: hostname.into(),
            enabled: true,
            max_processes: DEFAULT_MAX_PROCESSES,
            active_processes: 0,
            allowed_users: None,
            call_queue: Vec::new(),
            executor,
            notifications: NotificationQueue::new(),
        }
    }

    /// Route drone warnings into a shared alert queue.
    pub fn with_notifications(mut self, notifications: NotificationQueue) -> Self {
        self.notifications = notifications;
        self
    }

    pub(crate) fn set_notifications(&mut self, notifications: NotificationQueue) {
        self.notifications = notifications;
    }

    pub fn configure(&mut self, section: &DroneSection) {
        self.enabled = section.enabled;
        self.max_processes = section.max_processes;
        self.allowed_users = section.allowed_users.clone();
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_local(&self) -> bool {
        is_local_hostname(&self.hostname)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn max_processes(&self) -> u32 {
        self.max_processes
    }

    pub fn set_max_processes(&mut self, max_processes: u32) {
        self.max_processes = max_processes;
    }

    pub fn active_processes(&self) -> u32 {
        self.active_processes
    }

    pub fn set_active_processes(&mut self, active: u32) {
        self.active_processes = active;
    }

    /// Advisory bump after starting a process; corrected by the next refresh.
    pub fn note_process_started(&mut self) {
        self.active_processes = self.active_processes.saturating_add(1);
    }

    pub fn set_allowed_users(&mut self, users: Option<BTreeSet<String>>) {
        self.allowed_users = users;
    }

    pub fn queue_call(&mut self, call: RemoteCall) -> usize {
        self.call_queue.push(call);
        self.call_queue.len() - 1
    }

    pub fn queued_calls(&self) -> &[RemoteCall] {
        &self.call_queue
    }

    pub fn clear_call_queue(&mut self) {
        if !self.call_queue.is_empty() {
            debug!(hostname = %self.hostname, dropped = self.call_queue.len(), "call queue cleared");
        }
        self.call_queue.clear();
    }

    /// Send every queued call in one transport operation.
    ///
    /// The queue is empty afterwards whether or not the call succeeds.
    /// Results are aligned with the order the calls were queued in.
    pub async fn execute_queued_calls(&mut self) -> DroneResult<Vec<CallOutcome>> {
        if self.call_queue.is_empty() {
            return Ok(Vec::new());
        }
        let batch = CallBatch::new(std::mem::take(&mut self.call_queue));
        debug!(hostname = %self.hostname, calls = batch.calls.len(), "executing queued calls");

        let reply = match self.executor.execute(&batch).await {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_protocol() {
                    error!(severity = "critical", hostname = %self.hostname, error = %e, "drone protocol corruption");
                } else {
                    warn!(hostname = %self.hostname, error = %e, "drone call batch failed");
                }
                return Err(e);
            }
        };

        if reply.results.len() != batch.calls.len() {
            let e = DroneError::Protocol {
                hostname: self.hostname.clone(),
                detail: format!(
                    "expected {} results, got {}",
                    batch.calls.len(),
                    reply.results.len()
                ),
            };
            error!(severity = "critical", hostname = %self.hostname, error = %e, "drone protocol corruption");
            return Err(e);
        }

        for warning in &reply.warnings {
            warn!(hostname = %self.hostname, %warning, "drone warning");
            self.notifications
                .enqueue(format!("warning from drone {}", self.hostname), warning.clone());
        }
        Ok(reply.results)
    }

    pub fn used_capacity(&self) -> UsedCapacity {
        if self.max_processes == 0 {
            return UsedCapacity::SATURATED;
        }
        UsedCapacity {
            load: f64::from(self.active_processes) / f64::from(self.max_processes),
            neg_max_processes: -i64::from(self.max_processes),
        }
    }

    pub fn is_full(&self) -> bool {
        self.active_processes >= self.max_processes
    }

    pub fn usable_by(&self, user: &str) -> bool {
        match &self.allowed_users {
            None => true,
            Some(users) => users.contains(user),
        }
    }

    /// Work out which drone must run a transfer of `source` on this drone to
    /// `destination` on `other`.
    pub fn send_file_to(
        &self,
        other: &Drone,
        source: &str,
        destination: &str,
        can_fail: bool,
    ) -> FileTransfer {
        if self.hostname == other.hostname {
            return FileTransfer {
                queue_on: self.hostname.clone(),
                call: RemoteCall::new("copy_file")
                    .arg(source)
                    .arg(destination)
                    .arg(can_fail),
            };
        }
        if !self.is_local() && other.is_local() {
            // Pull from the local side; the scheduler host holds the keys.
            return FileTransfer {
                queue_on: other.hostname.clone(),
                call: RemoteCall::new("get_file_from")
                    .arg(self.hostname.as_str())
                    .arg(source)
                    .arg(destination)
                    .arg(can_fail),
            };
        }
        FileTransfer {
            queue_on: self.hostname.clone(),
            call: RemoteCall::new("send_file_to")
                .arg(other.hostname.as_str())
                .arg(source)
                .arg(destination)
                .arg(can_fail),
        }
    }
}
