//! Command lines and result paths for processes started on drones.

use std::path::{Path, PathBuf};

use testlab_drone::RemoteCall;
use testlab_state::*;

/// Everything a drone needs to start one process.
#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub command: Vec<String>,
    pub working_directory: String,
    pub log_file: String,
    pub exit_file: String,
}

impl Launch {
    fn in_dir(dir: &Path, command: Vec<String>) -> Self {
        Self {
            command,
            working_directory: path_string(dir),
            log_file: path_string(&dir.join("debug").join("runner.log")),
            exit_file: path_string(&dir.join(".exit_code")),
        }
    }

    pub fn to_call(&self) -> RemoteCall {
        RemoteCall::new("execute_command")
            .kwarg("command", self.command.clone())
            .kwarg("working_directory", self.working_directory.as_str())
            .kwarg("log_file", self.log_file.as_str())
            .kwarg("exit_file", self.exit_file.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    job_runner: String,
    results_dir: PathBuf,
}

impl CommandBuilder {
    pub fn new(job_runner: impl Into<String>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_runner: job_runner.into(),
            results_dir: results_dir.into(),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// `<results>/hosts/<hostname>/<task id>-<kind>`
    pub fn special_task(&self, task: &SpecialTask, host: &Host) -> Launch {
        let dir = self
            .results_dir
            .join("hosts")
            .join(&host.hostname)
            .join(format!("{}-{}", task.id, task.kind.as_str()));
        let command = vec![
            self.job_runner.clone(),
            format!("--{}", task.kind.as_str()),
            "-m".to_string(),
            host.hostname.clone(),
            "-r".to_string(),
            path_string(&dir),
        ];
        Launch::in_dir(&dir, command)
    }

    /// `<results>/<job id>-<owner>/<hostname>`
    pub fn job(&self, job: &Job, host: &Host) -> Launch {
        let dir = self
            .results_dir
            .join(format!("{}-{}", job.id, job.owner))
            .join(&host.hostname);
        let command = vec![
            self.job_runner.clone(),
            "-m".to_string(),
            host.hostname.clone(),
            "-u".to_string(),
            job.owner.clone(),
            "-l".to_string(),
            job.name.clone(),
            "--job-id".to_string(),
            job.id.to_string(),
            "-r".to_string(),
            path_string(&dir),
        ];
        Launch::in_dir(&dir, command)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
