//! Transports that carry a [`CallBatch`] to a drone utility.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{DroneError, DroneResult};
use crate::protocol::{CallBatch, DroneReply};
use crate::settings::DroneSettings;
use crate::utility::DroneUtility;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs one batch against one drone and returns the parsed reply.
pub trait CallExecutor: Send + Sync {
    fn execute<'a>(&'a self, batch: &'a CallBatch) -> BoxFuture<'a, DroneResult<DroneReply>>;
}

/// Runs the utility in this process on a blocking thread.
#[derive(Debug, Default)]
pub struct LocalExecutor;

impl CallExecutor for LocalExecutor {
    fn execute<'a>(&'a self, batch: &'a CallBatch) -> BoxFuture<'a, DroneResult<DroneReply>> {
        let batch = batch.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || DroneUtility::new().execute_batch(&batch))
                .await
                .map_err(|e| DroneError::Unreachable {
                    hostname: "localhost".to_string(),
                    reason: format!("local utility task failed: {e}"),
                })
        })
    }
}

/// Pipes the batch through `ssh <host> <utility>`.
#[derive(Debug)]
pub struct SshExecutor {
    hostname: String,
    settings: DroneSettings,
}

/// ssh reserves this exit status for its own failures.
const SSH_FAILURE: i32 = 255;

impl SshExecutor {
    /// Probe the host once; fails with `Unreachable` if a trivial command
    /// cannot run within the connect timeout.
    pub async fn connect(hostname: &str, settings: &DroneSettings) -> DroneResult<Self> {
        let executor = Self {
            hostname: hostname.to_string(),
            settings: settings.clone(),
        };
        executor.probe().await?;
        info!(%hostname, "drone reachable over ssh");
        Ok(executor)
    }

    fn ssh_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-x", "-a", "-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout.as_secs().max(1)
            ));
        if let Some(user) = &self.settings.ssh_user {
            cmd.arg("-l").arg(user);
        }
        if let Some(port) = self.settings.ssh_port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(&self.hostname)
            .arg(remote_command)
            .kill_on_drop(true);
        cmd
    }

    fn unreachable(&self, reason: impl Into<String>) -> DroneError {
        DroneError::Unreachable {
            hostname: self.hostname.clone(),
            reason: reason.into(),
        }
    }

    async fn probe(&self) -> DroneResult<()> {
        let mut cmd = self.ssh_command("true");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let output = match timeout(self.settings.connect_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| self.unreachable(e.to_string()))?,
            Err(_) => return Err(self.unreachable("connection probe timed out")),
        };
        if !output.status.success() {
            return Err(self.unreachable(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(())
    }

    async fn run(&self, batch: &CallBatch) -> DroneResult<DroneReply> {
        let payload =
            serde_json::to_vec(batch).map_err(|e| DroneError::Serialize(e.to_string()))?;
        let mut cmd = self.ssh_command(&self.settings.remote_utility_command());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.unreachable(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| self.unreachable(format!("writing call batch: {e}")))?;
            stdin.shutdown().await?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.unreachable(e.to_string()))?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(0) => {}
            Some(SSH_FAILURE) | None => return Err(self.unreachable(stderr)),
            Some(code) => {
                return Err(DroneError::Protocol {
                    hostname: self.hostname.clone(),
                    detail: format!("utility exited with {code}: {stderr}"),
                });
            }
        }
        debug!(hostname = %self.hostname, bytes = output.stdout.len(), "drone reply received");
        serde_json::from_slice(&output.stdout).map_err(|e| DroneError::Protocol {
            hostname: self.hostname.clone(),
            detail: format!(
                "{e}; raw reply: {}",
                String::from_utf8_lossy(&output.stdout)
            ),
        })
    }
}

impl CallExecutor for SshExecutor {
    fn execute<'a>(&'a self, batch: &'a CallBatch) -> BoxFuture<'a, DroneResult<DroneReply>> {
        Box::pin(async move {
            match timeout(self.settings.call_timeout, self.run(batch)).await {
                Ok(result) => result,
                Err(_) => Err(DroneError::Timeout {
                    hostname: self.hostname.clone(),
                    secs: self.settings.call_timeout.as_secs(),
                }),
            }
        })
    }
}
