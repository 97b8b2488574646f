//! Scheduler process assembly.

use std::path::PathBuf;

use testlab_core::config::NotifySection;
use testlab_core::{LabConfig, LogSink, NotificationQueue, NotificationSink, OutboxSink};
use testlab_drone::{DronePool, DroneSettings, get_drone};
use testlab_scheduler::{Dispatcher, DispatcherSettings};
use testlab_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub async fn run_scheduler(
    config: LabConfig,
    data_dir: PathBuf,
    recover_hosts: bool,
) -> anyhow::Result<()> {
    info!("test lab scheduler starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("testlab.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Drones ─────────────────────────────────────────────────

    let drone_settings = DroneSettings::from(&config.drone_settings);
    let mut pool =
        DronePool::initialize(&config.drones, &drone_settings, NotificationQueue::new()).await;
    add_results_drone(
        &mut pool,
        config.scheduler.results_host.as_deref(),
        &drone_settings,
    )
    .await;
    ensure_process_slots(&pool, config.drones.len())?;
    info!(drones = pool.len(), "drone pool ready");

    // ── Dispatcher ─────────────────────────────────────────────

    let sinks = build_sinks(&config.notify);
    let mut dispatcher = Dispatcher::new(
        store,
        pool,
        DispatcherSettings::from(&config.scheduler),
        sinks,
    );
    dispatcher.initialize(recover_hosts).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for shutdown signal");
            // Keep the sender alive so the dispatcher does not stop.
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await?;

    info!("test lab scheduler stopped");
    Ok(())
}

/// Results are copied to `results_host` after every process. When it is not
/// one of the configured drones it joins the pool with no process slots, so
/// it receives files but never work.
async fn add_results_drone(
    pool: &mut DronePool,
    results_host: Option<&str>,
    settings: &DroneSettings,
) {
    let Some(hostname) = results_host else {
        return;
    };
    if pool.drone(hostname).is_some() {
        return;
    }
    match get_drone(hostname, settings).await {
        Ok(mut drone) => {
            drone.set_max_processes(0);
            pool.add_drone(drone);
            info!(%hostname, "results host added to drone pool");
        }
        Err(e) => {
            warn!(%hostname, error = %e, "results host unreachable, results stay on drones");
            pool.notifications()
                .enqueue(format!("results host {hostname} unavailable"), e.to_string());
        }
    }
}

/// The results host alone never runs work, so it does not count.
fn ensure_process_slots(pool: &DronePool, configured: usize) -> anyhow::Result<()> {
    if !pool.has_process_slots() {
        anyhow::bail!("none of the {configured} configured drones can run processes");
    }
    Ok(())
}

fn build_sinks(section: &NotifySection) -> Vec<Box<dyn NotificationSink>> {
    let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(LogSink)];
    if let Some(path) = &section.outbox {
        sinks.push(Box::new(OutboxSink::new(path.clone())));
    }
    sinks
}
