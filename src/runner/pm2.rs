//! pm2-backed supervisor. Talks to the pm2 daemon through its CLI.
//!
//! Processes belong to the pm2 daemon and outlive the orchestrator, which is
//! what makes recovery on restart possible.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use super::supervisor::{
    LOG_BUS_CAPACITY, LogStream, ProcessInfo, ProcessLog, ProcessStatus, ProcessSupervisor,
    StartSpec,
};
use crate::env::EnvMap;
use crate::errors::SupervisorError;

pub struct Pm2Supervisor {
    binary: String,
    bus: broadcast::Sender<ProcessLog>,
    tail: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Pm2Supervisor {
    fn default() -> Self {
        Self::new("pm2")
    }
}

struct Pm2Output {
    success: bool,
    stdout: String,
    stderr: String,
}

impl Pm2Output {
    fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

impl Pm2Supervisor {
    pub fn new(binary: impl Into<String>) -> Self {
        let (bus, _) = broadcast::channel(LOG_BUS_CAPACITY);
        Self {
            binary: binary.into(),
            bus,
            tail: Mutex::new(None),
        }
    }

    async fn run(&self, args: &[String], env: Option<&EnvMap>) -> std::io::Result<Pm2Output> {
        let mut command = Command::new(&self.binary);
        command.args(args).stdin(Stdio::null());
        if let Some(env) = env {
            command.envs(env);
        }
        tracing::debug!(binary = %self.binary, ?args, "running pm2");
        let output = command.output().await?;
        Ok(Pm2Output {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Start `pm2 logs --json` and feed its lines into the bus.
    async fn ensure_tail(&self) -> Result<(), SupervisorError> {
        let mut tail = self.tail.lock().await;
        if tail.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let mut child = Command::new(&self.binary)
            .args(["logs", "--json", "--lines", "0"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::LogBus(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::LogBus("pm2 logs has no stdout".into()))?;

        let bus = self.bus.clone();
        *tail = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(log) = parse_log_line(&line) {
                    let _ = bus.send(log);
                }
            }
            // Keep the child alive until its output ends.
            drop(child);
            tracing::debug!("pm2 log stream ended");
        }));
        Ok(())
    }
}

#[derive(Deserialize)]
struct JlistEntry {
    name: String,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    pm2_env: Option<JlistEnv>,
}

#[derive(Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: Option<String>,
}

/// Parse the output of `pm2 jlist`.
pub fn parse_jlist(raw: &str) -> Result<Vec<ProcessInfo>, String> {
    let entries: Vec<JlistEntry> = serde_json::from_str(raw.trim()).map_err(|e| e.to_string())?;
    Ok(entries
        .into_iter()
        .map(|entry| ProcessInfo {
            status: entry
                .pm2_env
                .and_then(|env| env.status)
                .map(|s| ProcessStatus::parse(&s))
                .unwrap_or(ProcessStatus::Unknown),
            pid: entry.pid.filter(|pid| *pid != 0),
            name: entry.name,
        })
        .collect())
}

#[derive(Deserialize)]
struct LogLine {
    message: String,
    #[serde(rename = "type")]
    kind: String,
    app_name: String,
}

/// Parse one line of `pm2 logs --json`. Non-JSON lines are ignored.
pub fn parse_log_line(line: &str) -> Option<ProcessLog> {
    let parsed: LogLine = serde_json::from_str(line).ok()?;
    let stream = match parsed.kind.as_str() {
        "out" => LogStream::Out,
        "err" => LogStream::Err,
        _ => return None,
    };
    Some(ProcessLog {
        name: parsed.app_name,
        stream,
        message: parsed.message.trim_end_matches('\n').to_string(),
    })
}

/// Arguments for `pm2 start`.
pub fn start_args(spec: &StartSpec) -> Vec<String> {
    let mut args = vec![
        "start".to_string(),
        spec.script.clone(),
        "--name".to_string(),
        spec.name.clone(),
        "--cwd".to_string(),
        spec.cwd.display().to_string(),
        "--interpreter".to_string(),
        spec.interpreter.clone(),
    ];
    if !spec.args.is_empty() {
        args.push("--".to_string());
        args.extend(spec.args.iter().cloned());
    }
    args
}

#[async_trait]
impl ProcessSupervisor for Pm2Supervisor {
    async fn connect(&self) -> Result<(), SupervisorError> {
        let output = self
            .run(&["ping".to_string()], None)
            .await
            .map_err(|e| SupervisorError::Connect(format!("cannot run {}: {}", self.binary, e)))?;
        if !output.success {
            return Err(SupervisorError::Connect(output.failure_message()));
        }
        tracing::info!("connected to pm2");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
        let output = self
            .run(&["jlist".to_string()], None)
            .await
            .map_err(|e| SupervisorError::List(e.to_string()))?;
        if !output.success {
            return Err(SupervisorError::List(output.failure_message()));
        }
        parse_jlist(&output.stdout).map_err(SupervisorError::List)
    }

    async fn start(&self, spec: StartSpec) -> Result<(), SupervisorError> {
        let output = self
            .run(&start_args(&spec), Some(&spec.env))
            .await
            .map_err(|e| SupervisorError::Start {
                name: spec.name.clone(),
                message: e.to_string(),
            })?;
        if !output.success {
            return Err(SupervisorError::Start {
                name: spec.name,
                message: output.failure_message(),
            });
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SupervisorError> {
        let output = self
            .run(&["delete".to_string(), name.to_string()], None)
            .await
            .map_err(|e| SupervisorError::Delete {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        if !output.success {
            return Err(SupervisorError::Delete {
                name: name.to_string(),
                message: output.failure_message(),
            });
        }
        Ok(())
    }

    async fn subscribe_logs(&self) -> Result<broadcast::Receiver<ProcessLog>, SupervisorError> {
        let rx = self.bus.subscribe();
        self.ensure_tail().await?;
        Ok(rx)
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.tail.lock().await.take() {
            handle.abort();
        }
        tracing::debug!("disconnected from pm2");
    }
}
