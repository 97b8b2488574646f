//! Connection settings shared by every drone in a pool.

use std::path::PathBuf;
use std::time::Duration;

use testlab_core::config::DroneSettingsSection;

#[derive(Debug, Clone, PartialEq)]
pub struct DroneSettings {
    pub install_dir: PathBuf,
    /// Relative to `install_dir` unless it starts with `/`.
    pub utility_command: String,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl DroneSettings {
    /// Shell command that runs the drone utility on a remote drone.
    pub fn remote_utility_command(&self) -> String {
        if self.utility_command.starts_with('/') {
            self.utility_command.clone()
        } else {
            format!(
                "{}/{}",
                self.install_dir.display().to_string().trim_end_matches('/'),
                self.utility_command
            )
        }
    }
}

impl Default for DroneSettings {
    fn default() -> Self {
        Self::from(&DroneSettingsSection::default())
    }
}

impl From<&DroneSettingsSection> for DroneSettings {
    fn from(section: &DroneSettingsSection) -> Self {
        Self {
            install_dir: section.install_dir.clone(),
            utility_command: section.utility_command.clone(),
            ssh_user: section.ssh_user.clone(),
            ssh_port: section.ssh_port,
            connect_timeout: Duration::from_secs(section.connect_timeout_secs),
            call_timeout: Duration::from_secs(section.call_timeout_secs),
        }
    }
}
