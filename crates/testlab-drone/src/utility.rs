//! Worker side of the drone protocol.
//!
//! [`DroneUtility`] runs one [`CallBatch`] in order on the machine it lives
//! on. A failing call becomes [`CallOutcome::Error`] and the rest of the
//! batch still runs. The same code serves the in-process executor and the
//! `testlabd drone-utility` entry point reached over ssh.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, anyhow, bail};
use tracing::{debug, warn};

use crate::protocol::{CallBatch, CallOutcome, CallValue, DroneReply, PROTOCOL_VERSION, RemoteCall};

/// Starts `"$@"` detached, records its exit code, and prints the wrapper pid.
const LAUNCH_SCRIPT: &str = r#"("$@" >"$TESTLAB_LOG" 2>&1; echo $? >"$TESTLAB_EXIT") </dev/null >/dev/null 2>&1 & echo $!"#;

#[derive(Debug, Default)]
pub struct DroneUtility {
    warnings: Vec<String>,
}

impl DroneUtility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute_batch(mut self, batch: &CallBatch) -> DroneReply {
        if batch.version != PROTOCOL_VERSION {
            let message = format!(
                "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
                batch.version
            );
            return DroneReply {
                results: batch
                    .calls
                    .iter()
                    .map(|_| CallOutcome::Error(message.clone()))
                    .collect(),
                warnings: vec![message],
            };
        }

        let mut results = Vec::with_capacity(batch.calls.len());
        for call in &batch.calls {
            match self.dispatch(call) {
                Ok(value) => results.push(CallOutcome::Ok(value)),
                Err(e) => {
                    warn!(method = %call.method, error = %e, "drone call failed");
                    results.push(CallOutcome::Error(format!("{e:#}")));
                }
            }
        }
        DroneReply {
            results,
            warnings: self.warnings,
        }
    }

    fn dispatch(&mut self, call: &RemoteCall) -> anyhow::Result<CallValue> {
        debug!(method = %call.method, "executing drone call");
        match call.method.as_str() {
            "initialize" => {
                fs::create_dir_all(str_param(call, 0, "results_dir")?)?;
                Ok(CallValue::Null)
            }
            "refresh" => refresh(call),
            "execute_command" => execute_command(call),
            "kill_process" => {
                kill_process(int_param(call, 0, "pid")?)?;
                Ok(CallValue::Null)
            }
            "write_to_file" => {
                let path = Path::new(str_param(call, 0, "path")?);
                let contents = str_param(call, 1, "contents")?;
                ensure_parent(path)?;
                if bool_param(call, 2, "append", false)? {
                    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
                    file.write_all(contents.as_bytes())?;
                } else {
                    fs::write(path, contents)?;
                }
                Ok(CallValue::Null)
            }
            "copy_file" => {
                let source = Path::new(str_param(call, 0, "source")?);
                let destination = Path::new(str_param(call, 1, "destination")?);
                let can_fail = bool_param(call, 2, "can_fail", false)?;
                let result = copy_path(source, destination);
                self.tolerate(result, can_fail, || {
                    format!("copy {} to {}", source.display(), destination.display())
                })
            }
            "delete_file" => {
                delete_path(Path::new(str_param(call, 0, "path")?))?;
                Ok(CallValue::Null)
            }
            "send_file_to" => {
                let hostname = str_param(call, 0, "hostname")?;
                let source = str_param(call, 1, "source")?;
                let destination = str_param(call, 2, "destination")?;
                let can_fail = bool_param(call, 3, "can_fail", false)?;
                let result = if is_local_hostname(hostname) {
                    copy_path(Path::new(source), Path::new(destination))
                } else {
                    scp(source, &format!("{hostname}:{destination}"))
                };
                self.tolerate(result, can_fail, || format!("send {source} to {hostname}:{destination}"))
            }
            "get_file_from" => {
                let hostname = str_param(call, 0, "hostname")?;
                let source = str_param(call, 1, "source")?;
                let destination = str_param(call, 2, "destination")?;
                let can_fail = bool_param(call, 3, "can_fail", false)?;
                ensure_parent(Path::new(destination))?;
                let result = if is_local_hostname(hostname) {
                    copy_path(Path::new(source), Path::new(destination))
                } else {
                    scp(&format!("{hostname}:{source}"), destination)
                };
                self.tolerate(result, can_fail, || format!("fetch {hostname}:{source} to {destination}"))
            }
            other => bail!("unknown method '{other}'"),
        }
    }

    /// With `can_fail`, a transport failure is downgraded to a warning.
    fn tolerate(
        &mut self,
        result: anyhow::Result<()>,
        can_fail: bool,
        describe: impl FnOnce() -> String,
    ) -> anyhow::Result<CallValue> {
        match result {
            Ok(()) => Ok(CallValue::Null),
            Err(e) if can_fail => {
                self.warnings.push(format!("{} failed: {e:#}", describe()));
                Ok(CallValue::Null)
            }
            Err(e) => Err(e.context(describe())),
        }
    }
}

/// Read one batch from `input`, execute it, write the reply to `output`.
pub fn serve(mut input: impl Read, mut output: impl Write) -> anyhow::Result<()> {
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let batch: CallBatch = serde_json::from_slice(&raw).context("malformed call batch")?;
    let reply = DroneUtility::new().execute_batch(&batch);
    serde_json::to_writer(&mut output, &reply)?;
    output.flush()?;
    Ok(())
}

pub fn is_local_hostname(hostname: &str) -> bool {
    hostname == "localhost" || hostname == "127.0.0.1"
}

fn str_param<'a>(call: &'a RemoteCall, index: usize, name: &str) -> anyhow::Result<&'a str> {
    call.param(index, name)
        .and_then(CallValue::as_str)
        .ok_or_else(|| anyhow!("{}: missing string argument '{name}'", call.method))
}

fn int_param(call: &RemoteCall, index: usize, name: &str) -> anyhow::Result<i64> {
    call.param(index, name)
        .and_then(CallValue::as_int)
        .ok_or_else(|| anyhow!("{}: missing integer argument '{name}'", call.method))
}

fn bool_param(call: &RemoteCall, index: usize, name: &str, default: bool) -> anyhow::Result<bool> {
    match call.param(index, name) {
        None | Some(CallValue::Null) => Ok(default),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| anyhow!("{}: argument '{name}' must be a bool", call.method)),
    }
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn execute_command(call: &RemoteCall) -> anyhow::Result<CallValue> {
    let argv: Vec<&str> = call
        .param(0, "command")
        .and_then(CallValue::as_list)
        .ok_or_else(|| anyhow!("execute_command: missing list argument 'command'"))?
        .iter()
        .map(|v| v.as_str().ok_or_else(|| anyhow!("execute_command: command items must be strings")))
        .collect::<anyhow::Result<_>>()?;
    if argv.is_empty() {
        bail!("execute_command: empty command");
    }
    let working_directory = Path::new(str_param(call, 1, "working_directory")?);
    let log_file = Path::new(str_param(call, 2, "log_file")?);
    let exit_file = Path::new(str_param(call, 3, "exit_file")?);

    fs::create_dir_all(working_directory)?;
    ensure_parent(log_file)?;
    ensure_parent(exit_file)?;
    delete_path(exit_file)?;

    let output = Command::new("sh")
        .arg("-c")
        .arg(LAUNCH_SCRIPT)
        .arg("sh")
        .args(&argv)
        .current_dir(working_directory)
        .env("TESTLAB_LOG", log_file)
        .env("TESTLAB_EXIT", exit_file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;
    if !output.status.success() {
        bail!(
            "launcher exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let pid: i64 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .context("launcher did not report a pid")?;
    debug!(pid, command = %argv.join(" "), "process started");
    Ok(CallValue::Int(pid))
}

/// Report which tracked processes are still alive and which have exited.
fn refresh(call: &RemoteCall) -> anyhow::Result<CallValue> {
    let processes = match call.param(0, "processes") {
        None | Some(CallValue::Null) => &[][..],
        Some(value) => value
            .as_list()
            .ok_or_else(|| anyhow!("refresh: 'processes' must be a list"))?,
    };

    let mut active = 0i64;
    let mut finished = Vec::new();
    for process in processes {
        let map = process
            .as_map()
            .ok_or_else(|| anyhow!("refresh: process entries must be maps"))?;
        let pid = map
            .get("pid")
            .and_then(CallValue::as_int)
            .ok_or_else(|| anyhow!("refresh: process entry without pid"))?;
        let exit_file = map
            .get("exit_file")
            .and_then(CallValue::as_str)
            .map(Path::new)
            .ok_or_else(|| anyhow!("refresh: process entry without exit_file"))?;

        let exit_code = match read_exit_code(exit_file) {
            Some(code) => Some(code),
            None if process_alive(pid) => {
                active += 1;
                continue;
            }
            // It may have written the file between the two checks.
            None => read_exit_code(exit_file),
        };
        finished.push(CallValue::map([
            ("pid", CallValue::Int(pid)),
            ("exit_code", CallValue::from(exit_code)),
        ]));
    }
    Ok(CallValue::map([
        ("active_processes", CallValue::Int(active)),
        ("finished", CallValue::List(finished)),
    ]))
}

fn read_exit_code(path: &Path) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: i64) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence.
    // SAFETY: kill(2) takes plain integers and touches no memory of ours;
    // pid is known to be positive.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn kill_process(pid: i64) -> anyhow::Result<()> {
    let target = libc::pid_t::try_from(pid).context("pid out of range")?;
    if target <= 0 {
        bail!("refusing to signal pid {pid}");
    }
    // Signalling only the wrapper's children lets the wrapper record the
    // exit code. The wrapper itself is signalled when it has no children.
    match Command::new("pkill")
        .args(["-TERM", "-P", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => return Ok(()),
        Ok(status) => debug!(pid, code = ?status.code(), "no children signalled"),
        Err(e) => debug!(pid, error = %e, "cannot run pkill for children"),
    }
    // SAFETY: kill(2) takes plain integers and touches no memory of ours;
    // target is known to be positive.
    let rc = unsafe { libc::kill(target, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
    }
    Ok(())
}

fn copy_path(source: &Path, destination: &Path) -> anyhow::Result<()> {
    if source.is_dir() {
        fs::create_dir_all(destination)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_path(&entry.path(), &destination.join(entry.file_name()))?;
        }
    } else {
        ensure_parent(destination)?;
        fs::copy(source, destination)?;
    }
    Ok(())
}

fn delete_path(path: &Path) -> anyhow::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn scp(source: &str, destination: &str) -> anyhow::Result<()> {
    let output = Command::new("scp")
        .args(["-q", "-r", "-o", "BatchMode=yes", source, destination])
        .stdin(Stdio::null())
        .output()?;
    if !output.status.success() {
        bail!(
            "scp exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
