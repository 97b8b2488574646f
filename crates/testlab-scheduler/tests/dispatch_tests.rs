//! Dispatcher tick tests.
//!
//! Drones are simulated by an in-process executor that hands out pids and
//! reports them finished when the test says so; one test runs real
//! processes through the local drone utility.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use testlab_core::{NotificationQueue, NotificationSink};
use testlab_drone::*;
use testlab_scheduler::*;
use testlab_state::*;

#[derive(Default)]
struct FakeLab {
    next_pid: i64,
    running: BTreeSet<i64>,
    exited: BTreeMap<i64, i64>,
    commands: Vec<Vec<String>>,
    methods: Vec<String>,
    fail_launches: bool,
    corrupt_replies: bool,
}

/// Simulated drone: `execute_command` returns a fresh pid, `refresh`
/// reports pids the test finished via [`FakeDrone::exit_all`].
#[derive(Clone, Default)]
struct FakeDrone {
    lab: Arc<Mutex<FakeLab>>,
}

impl FakeDrone {
    fn exit_all(&self, code: i64) {
        let mut lab = self.lab.lock().unwrap();
        let pids: Vec<i64> = lab.running.iter().copied().collect();
        for pid in pids {
            lab.exited.insert(pid, code);
        }
        lab.running.clear();
    }

    fn set_fail_launches(&self, fail: bool) {
        self.lab.lock().unwrap().fail_launches = fail;
    }

    /// Answer every batch with no results, which the pool treats as a
    /// corrupt reply.
    fn set_corrupt_replies(&self, corrupt: bool) {
        self.lab.lock().unwrap().corrupt_replies = corrupt;
    }

    fn commands(&self) -> Vec<Vec<String>> {
        self.lab.lock().unwrap().commands.clone()
    }

    fn methods(&self) -> Vec<String> {
        self.lab.lock().unwrap().methods.clone()
    }
}

impl CallExecutor for FakeDrone {
    fn execute<'a>(&'a self, batch: &'a CallBatch) -> BoxFuture<'a, DroneResult<DroneReply>> {
        let mut lab = self.lab.lock().unwrap();
        let mut results = Vec::new();
        for call in &batch.calls {
            lab.methods.push(call.method.clone());
            let outcome = match call.method.as_str() {
                "execute_command" if lab.fail_launches => {
                    CallOutcome::Error("cannot fork".to_string())
                }
                "execute_command" => {
                    lab.next_pid += 1;
                    let pid = 1000 + lab.next_pid;
                    let command = call
                        .param(0, "command")
                        .and_then(CallValue::as_list)
                        .unwrap_or(&[])
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                    lab.commands.push(command);
                    lab.running.insert(pid);
                    CallOutcome::Ok(CallValue::Int(pid))
                }
                "kill_process" => {
                    if let Some(pid) = call.param(0, "pid").and_then(CallValue::as_int) {
                        if lab.running.remove(&pid) {
                            lab.exited.insert(pid, 143);
                        }
                    }
                    CallOutcome::Ok(CallValue::Null)
                }
                "refresh" => {
                    let finished: Vec<CallValue> = call
                        .param(0, "processes")
                        .and_then(CallValue::as_list)
                        .unwrap_or(&[])
                        .iter()
                        .filter_map(|p| p.as_map()?.get("pid")?.as_int())
                        .filter_map(|pid| {
                            let code = *lab.exited.get(&pid)?;
                            Some(CallValue::map([
                                ("pid", CallValue::Int(pid)),
                                ("exit_code", CallValue::Int(code)),
                            ]))
                        })
                        .collect();
                    CallOutcome::Ok(CallValue::map([
                        ("active_processes", CallValue::Int(lab.running.len() as i64)),
                        ("finished", CallValue::List(finished)),
                    ]))
                }
                _ => CallOutcome::Ok(CallValue::Null),
            };
            results.push(outcome);
        }
        if lab.corrupt_replies {
            results.clear();
        }
        drop(lab);
        Box::pin(async move {
            Ok(DroneReply {
                results,
                warnings: Vec::new(),
            })
        })
    }
}

struct Fixture {
    dispatcher: Dispatcher,
    drone: FakeDrone,
    extra_drones: BTreeMap<String, FakeDrone>,
    host: Host,
}

fn fixture(settings: DispatcherSettings, extra_drones: &[(&str, u32)]) -> Fixture {
    let store = StateStore::open_in_memory().unwrap();
    let acl = store.create_acl_group("Everyone", &["alice"]).unwrap().id;
    let host = store
        .create_host(NewHost {
            hostname: "chromeos1-row1-host1".into(),
            acl_groups: BTreeSet::from([acl]),
            ..Default::default()
        })
        .unwrap();

    let drone = FakeDrone::default();
    let mut pool = DronePool::new(NotificationQueue::new());
    pool.add_drone(Drone::new("drone1", Box::new(drone.clone())));
    let mut extras = BTreeMap::new();
    for (hostname, max_processes) in extra_drones {
        let fake = FakeDrone::default();
        let mut extra = Drone::new(*hostname, Box::new(fake.clone()));
        extra.set_max_processes(*max_processes);
        pool.add_drone(extra);
        extras.insert(hostname.to_string(), fake);
    }
    let sinks: Vec<Box<dyn NotificationSink>> = Vec::new();
    Fixture {
        dispatcher: Dispatcher::new(store, pool, settings, sinks),
        drone,
        extra_drones: extras,
        host,
    }
}

fn settings() -> DispatcherSettings {
    DispatcherSettings {
        tick_pause: Duration::from_millis(10),
        results_dir: "/results".into(),
        job_runner: "/opt/lab/run-job".into(),
        ..Default::default()
    }
}

fn hostless_job(store: &StateStore, run_verify: bool) -> HostQueueEntry {
    let (_, entries) = store
        .create_job(NewJob {
            name: "dummy_Pass".into(),
            owner: "alice".into(),
            run_verify,
            ..Default::default()
        })
        .unwrap();
    entries.into_iter().next().unwrap()
}

fn entry(store: &StateStore, id: EntryId) -> HostQueueEntry {
    store.get_entry(id).unwrap().unwrap()
}

fn host(store: &StateStore, id: HostId) -> Host {
    store.get_host(id).unwrap().unwrap()
}

#[tokio::test]
async fn verify_then_job_then_release() {
    let mut f = fixture(settings(), &[]);
    let queued = hostless_job(f.dispatcher.store(), true);

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.scheduled.acquired, vec![(queued.id, f.host.id)]);
    assert_eq!(report.started_tasks.len(), 1);
    assert_eq!(report.launch_failures, 0);
    let store = f.dispatcher.store().clone();
    assert_eq!(entry(&store, queued.id).status, EntryStatus::Verifying);
    let h = host(&store, f.host.id);
    assert!(h.leased);
    assert_eq!(h.status, HostStatus::Verifying);
    assert!(f.drone.commands()[0].contains(&"--verify".to_string()));

    f.drone.exit_all(0);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.finished, 1);
    assert_eq!(report.started_jobs, vec![queued.id]);
    let running = entry(&store, queued.id);
    assert_eq!(running.status, EntryStatus::Running);
    assert_eq!(running.started_on.as_deref(), Some("drone1"));
    assert_eq!(host(&store, f.host.id).status, HostStatus::Running);
    assert!(f.drone.commands()[1].contains(&"dummy_Pass".to_string()));

    f.drone.exit_all(0);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.finished, 1);
    assert_eq!(report.released, vec![f.host.id]);
    let done = entry(&store, queued.id);
    assert_eq!(done.status, EntryStatus::Completed);
    assert!(done.complete && !done.active);
    let h = host(&store, f.host.id);
    assert!(!h.leased);
    assert_eq!(h.status, HostStatus::Ready);
    assert!(f.dispatcher.agents().is_empty());
}

#[tokio::test]
async fn job_without_pre_job_task_starts_in_same_tick() {
    let mut f = fixture(settings(), &[]);
    let queued = hostless_job(f.dispatcher.store(), false);

    let report = f.dispatcher.tick().await.unwrap();
    assert!(report.started_tasks.is_empty());
    assert_eq!(report.started_jobs, vec![queued.id]);
    assert_eq!(
        entry(f.dispatcher.store(), queued.id).status,
        EntryStatus::Running
    );

    f.drone.exit_all(1);
    f.dispatcher.tick().await.unwrap();
    let failed = entry(f.dispatcher.store(), queued.id);
    assert_eq!(failed.status, EntryStatus::Failed);
    assert!(failed.complete);
    assert!(!host(f.dispatcher.store(), f.host.id).leased);
}

#[tokio::test]
async fn failed_launch_reverts_and_retries() {
    let mut f = fixture(settings(), &[]);
    let queued = hostless_job(f.dispatcher.store(), true);
    f.drone.set_fail_launches(true);

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.started_tasks.len(), 1);
    assert_eq!(report.launch_failures, 1);
    let store = f.dispatcher.store().clone();
    let tasks = store.list_special_tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].is_pending());
    assert_eq!(host(&store, f.host.id).status, HostStatus::Ready);
    // The lease survives so the retry does not go through matching again.
    assert!(host(&store, f.host.id).leased);
    let e = entry(&store, queued.id);
    assert!(e.active);
    assert_eq!(e.status, EntryStatus::Queued);
    assert!(f.dispatcher.agents().is_empty());

    f.drone.set_fail_launches(false);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.scheduled.requested, 0);
    assert_eq!(report.started_tasks, vec![tasks[0].id]);
    assert_eq!(report.launch_failures, 0);
    assert_eq!(f.dispatcher.agents().len(), 1);
}

#[tokio::test]
async fn failed_verify_requeues_entry_and_repairs_host() {
    let mut f = fixture(settings(), &[]);
    let queued = hostless_job(f.dispatcher.store(), true);
    f.dispatcher.tick().await.unwrap();

    f.drone.exit_all(1);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.finished, 1);
    let store = f.dispatcher.store().clone();

    let e = entry(&store, queued.id);
    assert!(!e.active);
    assert_eq!(e.status, EntryStatus::Queued);
    assert_eq!(e.host_id, None);

    // The repair task keeps the host leased and starts right away.
    let repair = store
        .list_special_tasks()
        .unwrap()
        .into_iter()
        .find(|t| t.kind == TaskKind::Repair)
        .unwrap();
    assert!(report.started_tasks.contains(&repair.id));
    let h = host(&store, f.host.id);
    assert!(h.leased);
    assert_eq!(h.status, HostStatus::Repairing);

    f.drone.exit_all(0);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.released, vec![f.host.id]);
    assert_eq!(host(&store, f.host.id).status, HostStatus::Ready);

    // The repaired host goes back to the requeued entry, which verifies again.
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.scheduled.acquired, vec![(queued.id, f.host.id)]);
    assert_eq!(entry(&store, queued.id).status, EntryStatus::Verifying);
}

#[tokio::test]
async fn frontend_task_is_leased_and_run() {
    let mut f = fixture(settings(), &[]);
    let store = f.dispatcher.store().clone();
    let task = store
        .create_special_task(f.host.id, TaskKind::Cleanup, None, Some("alice"))
        .unwrap();

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.leased_for_tasks, vec![f.host.id]);
    assert_eq!(report.started_tasks, vec![task.id]);
    assert_eq!(host(&store, f.host.id).status, HostStatus::Cleaning);

    f.drone.exit_all(0);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.released, vec![f.host.id]);
    let task = store.get_special_task(task.id).unwrap().unwrap();
    assert!(task.is_complete && task.success);
}

#[tokio::test]
async fn finished_results_are_sent_to_results_host() {
    let settings = DispatcherSettings {
        results_host: Some("results1".into()),
        ..settings()
    };
    let mut f = fixture(settings, &[("results1", 0)]);
    hostless_job(f.dispatcher.store(), false);

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.started_jobs.len(), 1);
    // A drone with no process slots never gets work.
    assert_eq!(f.dispatcher.pool().drone("results1").unwrap().active_processes(), 0);

    f.drone.exit_all(0);
    f.dispatcher.tick().await.unwrap();
    assert!(f.drone.methods().contains(&"send_file_to".to_string()));
}

#[tokio::test]
async fn no_capacity_leaves_task_pending() {
    let mut f = fixture(settings(), &[]);
    f.dispatcher
        .pool_mut()
        .drone_mut("drone1")
        .unwrap()
        .set_max_processes(0);
    let queued = hostless_job(f.dispatcher.store(), true);

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.scheduled.acquired.len(), 1);
    assert!(report.started_tasks.is_empty());
    let store = f.dispatcher.store();
    assert!(entry(store, queued.id).active);
    assert!(store.list_special_tasks().unwrap()[0].is_pending());
    assert!(host(store, f.host.id).leased);
}

#[tokio::test]
async fn overlapping_assignments_raise_one_notification() {
    let mut f = fixture(settings(), &[]);
    let store = f.dispatcher.store().clone();
    for _ in 0..2 {
        let mut e = hostless_job(&store, false);
        e.host_id = Some(f.host.id);
        e.active = true;
        e.status = EntryStatus::Running;
        store.put_entry(&e).unwrap();
    }
    let mut h = host(&store, f.host.id);
    h.leased = true;
    store.put_host(&h).unwrap();

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.overlaps, 1);
    // No sinks are configured; the queue is drained regardless.
    assert_eq!(report.notifications_sent, 1);
    assert!(f.dispatcher.notifications().is_empty());
}

#[tokio::test]
async fn disabled_drone_gives_up_its_agents() {
    let mut f = fixture(settings(), &[("drone2", 20)]);
    let store = f.dispatcher.store().clone();
    let queued = hostless_job(&store, false);

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.started_jobs, vec![queued.id]);
    assert_eq!(entry(&store, queued.id).started_on.as_deref(), Some("drone1"));

    f.drone.set_corrupt_replies(true);
    let report = f.dispatcher.tick().await.unwrap();
    assert!(!f.dispatcher.pool().drone("drone1").unwrap().enabled());
    assert_eq!(report.lost_agents, 1);
    // Drone disabled, agents lost.
    assert!(report.notifications_sent >= 2);

    let lost = entry(&store, queued.id);
    assert_eq!(lost.status, EntryStatus::Failed);
    assert!(lost.complete && !lost.active);

    // The host is cleaned up on the healthy drone in the same tick.
    let cleanup = store
        .list_special_tasks()
        .unwrap()
        .into_iter()
        .find(|t| t.kind == TaskKind::Cleanup)
        .unwrap();
    assert_eq!(report.started_tasks, vec![cleanup.id]);
    assert!(f.dispatcher.agents().iter().all(|a| a.drone == "drone2"));
    assert_eq!(host(&store, f.host.id).status, HostStatus::Cleaning);

    f.extra_drones["drone2"].exit_all(0);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.released, vec![f.host.id]);
    assert_eq!(host(&store, f.host.id).status, HostStatus::Ready);
    assert!(f.dispatcher.agents().is_empty());
}

#[tokio::test]
async fn aborted_running_job_is_killed_and_host_cleaned() {
    let mut f = fixture(settings(), &[]);
    let store = f.dispatcher.store().clone();
    let queued = hostless_job(&store, false);
    f.dispatcher.tick().await.unwrap();
    assert_eq!(entry(&store, queued.id).status, EntryStatus::Running);

    assert_eq!(store.abort_job(queued.job_id).unwrap(), vec![queued.id]);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.aborted_entries, vec![queued.id]);
    assert!(f.drone.methods().contains(&"kill_process".to_string()));
    let aborted = entry(&store, queued.id);
    assert_eq!(aborted.status, EntryStatus::Aborted);
    assert!(aborted.complete && !aborted.active);

    let cleanup = store
        .list_special_tasks()
        .unwrap()
        .into_iter()
        .find(|t| t.kind == TaskKind::Cleanup)
        .unwrap();
    assert_eq!(report.started_tasks, vec![cleanup.id]);
    assert_eq!(host(&store, f.host.id).status, HostStatus::Cleaning);

    f.drone.exit_all(0);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.finished, 1);
    assert_eq!(report.released, vec![f.host.id]);
    assert_eq!(entry(&store, queued.id).status, EntryStatus::Aborted);
}

#[tokio::test]
async fn aborted_queued_entry_is_never_scheduled() {
    let mut f = fixture(settings(), &[]);
    let store = f.dispatcher.store().clone();
    let queued = hostless_job(&store, true);
    store.abort_job(queued.job_id).unwrap();

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.aborted_entries, vec![queued.id]);
    assert!(report.scheduled.acquired.is_empty());
    assert!(report.started_tasks.is_empty());
    assert!(store.list_special_tasks().unwrap().is_empty());
    assert!(!host(&store, f.host.id).leased);
}

#[tokio::test]
async fn aborted_active_task_fails_into_repair() {
    let mut f = fixture(settings(), &[]);
    let store = f.dispatcher.store().clone();
    let task = store
        .create_special_task(f.host.id, TaskKind::Cleanup, None, Some("alice"))
        .unwrap();
    f.dispatcher.tick().await.unwrap();
    assert_eq!(host(&store, f.host.id).status, HostStatus::Cleaning);

    assert!(store.abort_special_task(task.id).unwrap());
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.aborted_tasks, vec![task.id]);
    assert!(f.drone.methods().contains(&"kill_process".to_string()));
    let task = store.get_special_task(task.id).unwrap().unwrap();
    assert!(task.is_complete && !task.success);

    let repair = store
        .list_special_tasks()
        .unwrap()
        .into_iter()
        .find(|t| t.kind == TaskKind::Repair)
        .unwrap();
    assert_eq!(report.started_tasks, vec![repair.id]);
    assert_eq!(host(&store, f.host.id).status, HostStatus::Repairing);
}

#[tokio::test]
async fn per_tick_process_limit_defers_launches() {
    let settings = DispatcherSettings {
        max_processes_started_per_cycle: 1,
        ..settings()
    };
    let mut f = fixture(settings, &[]);
    let store = f.dispatcher.store().clone();
    store
        .create_host(NewHost {
            hostname: "chromeos1-row1-host2".into(),
            acl_groups: f.host.acl_groups.clone(),
            ..Default::default()
        })
        .unwrap();
    let first = hostless_job(&store, false);
    let second = hostless_job(&store, false);

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.scheduled.acquired.len(), 2);
    assert_eq!(report.started_jobs, vec![first.id]);
    assert_eq!(entry(&store, second.id).status, EntryStatus::Starting);

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.started_jobs, vec![second.id]);
    assert_eq!(f.dispatcher.agents().len(), 2);
}

#[tokio::test]
async fn first_launch_of_a_tick_ignores_the_limit() {
    let settings = DispatcherSettings {
        max_processes_started_per_cycle: 0,
        ..settings()
    };
    let mut f = fixture(settings, &[]);
    let queued = hostless_job(f.dispatcher.store(), true);

    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.started_tasks.len(), 1);
    f.drone.exit_all(0);
    let report = f.dispatcher.tick().await.unwrap();
    assert_eq!(report.started_jobs, vec![queued.id]);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let mut f = fixture(settings(), &[]);
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move {
        f.dispatcher.run(rx).await.unwrap();
        f.dispatcher.ticks()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    let ticks = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(ticks >= 1);
}

#[tokio::test]
async fn local_drone_runs_real_processes() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open_in_memory().unwrap();
    let acl = store.create_acl_group("Everyone", &["alice"]).unwrap().id;
    let lab_host = store
        .create_host(NewHost {
            hostname: "dut1".into(),
            acl_groups: BTreeSet::from([acl]),
            ..Default::default()
        })
        .unwrap();
    let (_, entries) = store
        .create_job(NewJob {
            name: "dummy_Pass".into(),
            owner: "alice".into(),
            run_verify: true,
            ..Default::default()
        })
        .unwrap();

    let mut pool = DronePool::new(NotificationQueue::new());
    pool.add_drone(Drone::new("localhost", Box::new(LocalExecutor)));
    let settings = DispatcherSettings {
        tick_pause: Duration::from_millis(20),
        results_dir: dir.path().join("results"),
        job_runner: "true".into(),
        ..Default::default()
    };
    let mut dispatcher = Dispatcher::new(store.clone(), pool, settings, Vec::new());
    dispatcher.initialize(false).await.unwrap();
    assert!(dir.path().join("results").is_dir());

    for _ in 0..100 {
        dispatcher.tick().await.unwrap();
        if entry(&store, entries[0].id).complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let done = entry(&store, entries[0].id);
    assert_eq!(done.status, EntryStatus::Completed);
    assert_eq!(done.started_on.as_deref(), Some("localhost"));
    let verify = store.list_special_tasks().unwrap();
    assert_eq!(verify.len(), 1);
    assert!(verify[0].success);
    assert!(dir
        .path()
        .join("results/hosts/dut1")
        .join(format!("{}-verify", verify[0].id))
        .join(".exit_code")
        .is_file());
    assert_eq!(host(&store, lab_host.id).status, HostStatus::Ready);
}
