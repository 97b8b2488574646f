//! The set of drones a scheduler dispatches work to.

use std::collections::BTreeMap;

use futures_util::future::join_all;
use testlab_core::NotificationQueue;
use testlab_core::config::DroneSection;
use tracing::{debug, info, warn};

use crate::drone::{Drone, get_drone};
use crate::error::{DroneError, DroneResult};
use crate::protocol::{CallOutcome, CallValue, RemoteCall};
use crate::settings::DroneSettings;

/// A process the scheduler started and is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedProcess {
    pub pid: i64,
    pub exit_file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinishedProcess {
    pub pid: i64,
    /// `None` when the process vanished without recording an exit code.
    pub exit_code: Option<i64>,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub finished: BTreeMap<String, Vec<FinishedProcess>>,
    pub failed: BTreeMap<String, DroneError>,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub results: BTreeMap<String, Vec<CallOutcome>>,
    pub failed: BTreeMap<String, DroneError>,
}

#[derive(Debug, Default)]
pub struct DronePool {
    drones: BTreeMap<String, Drone>,
    notifications: NotificationQueue,
}

impl DronePool {
    pub fn new(notifications: NotificationQueue) -> Self {
        Self {
            drones: BTreeMap::new(),
            notifications,
        }
    }

    /// Connect to every configured drone concurrently. Drones that cannot be
    /// reached are left out and reported; the rest of the pool still comes up.
    pub async fn initialize(
        sections: &[DroneSection],
        settings: &DroneSettings,
        notifications: NotificationQueue,
    ) -> Self {
        let mut pool = Self::new(notifications);
        let connects = sections.iter().map(|section| async move {
            (section, get_drone(&section.hostname, settings).await)
        });
        for (section, result) in join_all(connects).await {
            match result {
                Ok(mut drone) => {
                    drone.configure(section);
                    pool.add_drone(drone);
                }
                Err(e) => {
                    warn!(hostname = %section.hostname, error = %e, "skipping unreachable drone");
                    pool.notifications.enqueue(
                        format!("drone {} unavailable", section.hostname),
                        e.to_string(),
                    );
                }
            }
        }
        info!(drones = pool.len(), configured = sections.len(), "drone pool initialized");
        pool
    }

    pub fn add_drone(&mut self, mut drone: Drone) {
        drone.set_notifications(self.notifications.clone());
        self.drones.insert(drone.hostname().to_string(), drone);
    }

    pub fn drone(&self, hostname: &str) -> Option<&Drone> {
        self.drones.get(hostname)
    }

    pub fn drone_mut(&mut self, hostname: &str) -> Option<&mut Drone> {
        self.drones.get_mut(hostname)
    }

    pub fn drones(&self) -> impl Iterator<Item = &Drone> {
        self.drones.values()
    }

    pub fn len(&self) -> usize {
        self.drones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drones.is_empty()
    }

    /// Whether any enabled drone can run processes at all.
    pub fn has_process_slots(&self) -> bool {
        self.drones
            .values()
            .any(|d| d.enabled() && d.max_processes() > 0)
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    fn require(&mut self, hostname: &str) -> DroneResult<&mut Drone> {
        self.drones
            .get_mut(hostname)
            .ok_or_else(|| DroneError::UnknownDrone(hostname.to_string()))
    }

    /// Least-used enabled drone `user` may run on, or `None` when even that
    /// one is at capacity.
    pub fn choose_drone(&self, user: &str) -> Option<&str> {
        let best = self
            .drones
            .values()
            .filter(|d| d.enabled() && d.usable_by(user))
            .min_by_key(|d| d.used_capacity())?;
        if best.is_full() {
            debug!(%user, hostname = best.hostname(), "all usable drones at capacity");
            return None;
        }
        Some(best.hostname())
    }

    /// Queue `call` on `hostname`, returning its position in that drone's batch.
    pub fn queue_call(&mut self, hostname: &str, call: RemoteCall) -> DroneResult<usize> {
        Ok(self.require(hostname)?.queue_call(call))
    }

    /// Queue `call` on every enabled drone.
    pub fn queue_on_all(&mut self, call: &RemoteCall) {
        for drone in self.drones.values_mut().filter(|d| d.enabled()) {
            drone.queue_call(call.clone());
        }
    }

    pub fn note_process_started(&mut self, hostname: &str) -> DroneResult<()> {
        self.require(hostname)?.note_process_started();
        Ok(())
    }

    /// Queue a copy of `source` on `source_host` to `destination` on
    /// `destination_host`, on whichever drone has to run it.
    pub fn send_file(
        &mut self,
        source_host: &str,
        destination_host: &str,
        source: &str,
        destination: &str,
        can_fail: bool,
    ) -> DroneResult<()> {
        let from = self
            .drones
            .get(source_host)
            .ok_or_else(|| DroneError::UnknownDrone(source_host.to_string()))?;
        let to = self
            .drones
            .get(destination_host)
            .ok_or_else(|| DroneError::UnknownDrone(destination_host.to_string()))?;
        let transfer = from.send_file_to(to, source, destination, can_fail);
        self.require(&transfer.queue_on)?.queue_call(transfer.call);
        Ok(())
    }

    /// Execute every enabled drone's queue concurrently.
    ///
    /// A drone that fails is reported in `failed` and does not affect the
    /// others. A drone that returns a corrupt reply is disabled until an
    /// operator re-enables it.
    pub async fn execute_all(&mut self) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let mut runs = Vec::new();
        for drone in self.drones.values_mut() {
            if drone.queued_calls().is_empty() {
                continue;
            }
            if !drone.enabled() {
                warn!(hostname = drone.hostname(), dropped = drone.queued_calls().len(), "discarding calls queued on disabled drone");
                drone.clear_call_queue();
                continue;
            }
            runs.push(async move {
                let result = drone.execute_queued_calls().await;
                (drone.hostname().to_string(), result)
            });
        }

        let mut corrupted = Vec::new();
        for (hostname, result) in join_all(runs).await {
            match result {
                Ok(results) => {
                    report.results.insert(hostname, results);
                }
                Err(e) => {
                    if e.is_protocol() {
                        corrupted.push((hostname.clone(), e.to_string()));
                    }
                    report.failed.insert(hostname, e);
                }
            }
        }

        for (hostname, detail) in corrupted {
            if let Some(drone) = self.drones.get_mut(&hostname) {
                drone.set_enabled(false);
            }
            warn!(%hostname, "drone disabled after protocol corruption");
            self.notifications
                .enqueue(format!("drone {hostname} disabled"), detail);
        }
        report
    }

    /// Poll every enabled drone for the state of the processes it runs and
    /// update the capacity estimates.
    pub async fn refresh(
        &mut self,
        tracked: &BTreeMap<String, Vec<TrackedProcess>>,
    ) -> RefreshReport {
        let mut positions = BTreeMap::new();
        for drone in self.drones.values_mut().filter(|d| d.enabled()) {
            let processes: Vec<CallValue> = tracked
                .get(drone.hostname())
                .map(|list| {
                    list.iter()
                        .map(|p| {
                            CallValue::map([
                                ("pid", CallValue::Int(p.pid)),
                                ("exit_file", CallValue::from(p.exit_file.as_str())),
                            ])
                        })
                        .collect()
                })
                .unwrap_or_default();
            let position = drone.queue_call(RemoteCall::new("refresh").arg(processes));
            positions.insert(drone.hostname().to_string(), position);
        }

        let execution = self.execute_all().await;
        let mut report = RefreshReport {
            finished: BTreeMap::new(),
            failed: execution.failed,
        };
        for (hostname, results) in execution.results {
            let Some(position) = positions.get(&hostname) else {
                continue;
            };
            match results.get(*position).map(parse_refresh) {
                Some(Ok((active, finished))) => {
                    if let Some(drone) = self.drones.get_mut(&hostname) {
                        drone.set_active_processes(active);
                    }
                    if !finished.is_empty() {
                        report.finished.insert(hostname, finished);
                    }
                }
                Some(Err(detail)) => {
                    warn!(%hostname, %detail, "drone refresh failed");
                    report.failed.insert(
                        hostname.clone(),
                        DroneError::Protocol { hostname, detail },
                    );
                }
                None => {}
            }
        }
        report
    }
}

fn parse_refresh(outcome: &CallOutcome) -> Result<(u32, Vec<FinishedProcess>), String> {
    let map = match outcome {
        CallOutcome::Ok(value) => value.as_map().ok_or("refresh returned a non-map")?,
        CallOutcome::Error(message) => return Err(message.clone()),
    };
    let active = map
        .get("active_processes")
        .and_then(CallValue::as_int)
        .ok_or("refresh reply without active_processes")?;
    let mut finished = Vec::new();
    for entry in map
        .get("finished")
        .and_then(CallValue::as_list)
        .ok_or("refresh reply without finished list")?
    {
        let entry = entry.as_map().ok_or("finished entry is not a map")?;
        finished.push(FinishedProcess {
            pid: entry
                .get("pid")
                .and_then(CallValue::as_int)
                .ok_or("finished entry without pid")?,
            exit_code: entry.get("exit_code").and_then(CallValue::as_int),
        });
    }
    Ok((u32::try_from(active).unwrap_or(0), finished))
}
