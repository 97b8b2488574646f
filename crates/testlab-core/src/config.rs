//! testlab.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub drone_settings: DroneSettingsSection,
    #[serde(default)]
    pub drones: Vec<DroneSection>,
    #[serde(default)]
    pub notify: NotifySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Seconds to sleep between dispatcher ticks.
    pub tick_pause_secs: u64,
    pub results_dir: PathBuf,
    /// Owner used for work that is not attached to a job.
    pub default_user: String,
    /// Executable launched on drones for jobs and special tasks.
    pub job_runner: String,
    /// Label name prefixes the runner provisions itself; never matched against hosts.
    pub provisionable_label_prefixes: Vec<String>,
    /// Machine that collects finished results. Unset leaves them on the drone.
    pub results_host: Option<String>,
    /// New processes a single tick may start. The first one always starts.
    pub max_processes_started_per_cycle: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_pause_secs: 5,
            results_dir: PathBuf::from("/usr/local/testlab/results"),
            default_user: "testlab_system".to_string(),
            job_runner: "/usr/local/testlab/bin/run-job".to_string(),
            provisionable_label_prefixes: vec!["cros-version:".to_string()],
            results_host: None,
            max_processes_started_per_cycle: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneSettingsSection {
    pub install_dir: PathBuf,
    /// Command run on remote drones, relative to `install_dir` unless absolute.
    pub utility_command: String,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for DroneSettingsSection {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("/usr/local/testlab"),
            utility_command: "bin/testlabd drone-utility".to_string(),
            ssh_user: None,
            ssh_port: None,
            connect_timeout_secs: 30,
            call_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DroneSection {
    pub hostname: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,
    /// Unset means any user may run work on this drone.
    pub allowed_users: Option<BTreeSet<String>>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_processes() -> u32 {
    20
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifySection {
    /// JSON-lines file an external mailer consumes. Unset logs only.
    pub outbox: Option<PathBuf>,
}

impl LabConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: LabConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.drones.is_empty() {
            anyhow::bail!("at least one [[drones]] entry is required");
        }
        let mut seen = HashSet::new();
        for drone in &self.drones {
            if drone.hostname.trim().is_empty() {
                anyhow::bail!("drone hostname must not be empty");
            }
            if !seen.insert(drone.hostname.as_str()) {
                anyhow::bail!("duplicate drone hostname '{}'", drone.hostname);
            }
        }
        if self.scheduler.tick_pause_secs == 0 {
            anyhow::bail!("scheduler.tick_pause_secs must be positive");
        }
        if self.scheduler.max_processes_started_per_cycle == 0 {
            anyhow::bail!("scheduler.max_processes_started_per_cycle must be positive");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
