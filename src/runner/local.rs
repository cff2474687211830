//! In-process supervisor for hosts without pm2.
//!
//! Children are owned by the orchestrator and do not survive it; they are
//! killed on `disconnect`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};

use super::supervisor::{
    LOG_BUS_CAPACITY, LogStream, ProcessInfo, ProcessLog, ProcessStatus, ProcessSupervisor,
    StartSpec,
};
use crate::errors::SupervisorError;

pub struct LocalSupervisor {
    children: Mutex<HashMap<String, Child>>,
    bus: broadcast::Sender<ProcessLog>,
}

impl Default for LocalSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSupervisor {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(LOG_BUS_CAPACITY);
        Self {
            children: Mutex::new(HashMap::new()),
            bus,
        }
    }
}

fn command_for(spec: &StartSpec) -> Command {
    let script = if Path::new(&spec.script).is_absolute() {
        Path::new(&spec.script).to_path_buf()
    } else {
        spec.cwd.join(&spec.script)
    };
    let mut command = if spec.interpreter == "none" {
        Command::new(&script)
    } else {
        let mut command = Command::new(&spec.interpreter);
        command.arg(&script);
        command
    };
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

async fn publish<R>(reader: R, name: String, stream: LogStream, bus: broadcast::Sender<ProcessLog>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        // No subscribers is fine.
        let _ = bus.send(ProcessLog {
            name: name.clone(),
            stream,
            message: line,
        });
    }
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn connect(&self) -> Result<(), SupervisorError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
        let mut children = self.children.lock().await;
        let mut infos = Vec::with_capacity(children.len());
        for (name, child) in children.iter_mut() {
            let status = match child.try_wait() {
                Ok(None) => ProcessStatus::Online,
                Ok(Some(exit)) if exit.success() => ProcessStatus::Stopped,
                Ok(Some(_)) => ProcessStatus::Errored,
                Err(_) => ProcessStatus::Unknown,
            };
            infos.push(ProcessInfo {
                name: name.clone(),
                status,
                pid: child.id(),
            });
        }
        Ok(infos)
    }

    async fn start(&self, spec: StartSpec) -> Result<(), SupervisorError> {
        let mut children = self.children.lock().await;
        if let Some(existing) = children.get_mut(&spec.name)
            && matches!(existing.try_wait(), Ok(None))
        {
            return Err(SupervisorError::Start {
                name: spec.name.clone(),
                message: "a process with this name is already running".into(),
            });
        }

        let mut child = command_for(&spec)
            .spawn()
            .map_err(|e| SupervisorError::Start {
                name: spec.name.clone(),
                message: e.to_string(),
            })?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(publish(stdout, spec.name.clone(), LogStream::Out, self.bus.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(publish(stderr, spec.name.clone(), LogStream::Err, self.bus.clone()));
        }
        tracing::debug!(name = %spec.name, pid = ?child.id(), "local process started");
        children.insert(spec.name, child);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SupervisorError> {
        let mut children = self.children.lock().await;
        let Some(mut child) = children.remove(name) else {
            return Err(SupervisorError::Delete {
                name: name.to_string(),
                message: "process not found".into(),
            });
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        child.kill().await.map_err(|e| SupervisorError::Delete {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    async fn subscribe_logs(&self) -> Result<broadcast::Receiver<ProcessLog>, SupervisorError> {
        Ok(self.bus.subscribe())
    }

    async fn disconnect(&self) {
        let mut children = self.children.lock().await;
        for (name, mut child) in children.drain() {
            if let Err(e) = child.kill().await {
                tracing::warn!(%name, "cannot kill local process: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn spec(dir: &TempDir, name: &str, body: &str) -> StartSpec {
        std::fs::write(dir.path().join("app.sh"), body).unwrap();
        let mut env = EnvMap::new();
        env.insert("APP_MODE".into(), "test".into());
        StartSpec {
            name: name.into(),
            script: "app.sh".into(),
            interpreter: "sh".into(),
            args: vec!["first".into()],
            cwd: dir.path().to_path_buf(),
            env,
        }
    }

    #[tokio::test]
    async fn test_start_list_delete() {
        let dir = TempDir::new().unwrap();
        let supervisor = LocalSupervisor::new();
        supervisor
            .start(spec(&dir, "bm.a", "sleep 30\n"))
            .await
            .unwrap();

        let listed = supervisor.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].status.is_alive());

        let again = supervisor.start(spec(&dir, "bm.a", "sleep 30\n")).await;
        assert!(matches!(again, Err(SupervisorError::Start { .. })));

        supervisor.delete("bm.a").await.unwrap();
        assert!(supervisor.list().await.unwrap().is_empty());
        assert!(supervisor.delete("bm.a").await.is_err());
    }

    #[tokio::test]
    async fn test_output_is_published() {
        let dir = TempDir::new().unwrap();
        let supervisor = LocalSupervisor::new();
        let mut rx = supervisor.subscribe_logs().await.unwrap();
        supervisor
            .start(spec(
                &dir,
                "bm.b",
                "echo \"$1 $APP_MODE\"\necho oops 1>&2\nsleep 30\n",
            ))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let log = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push((log.stream, log.message));
        }
        assert!(seen.contains(&(LogStream::Out, "first test".to_string())));
        assert!(seen.contains(&(LogStream::Err, "oops".to_string())));
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn test_exited_process_is_not_alive() {
        let dir = TempDir::new().unwrap();
        let supervisor = LocalSupervisor::new();
        supervisor.start(spec(&dir, "bm.c", "exit 4\n")).await.unwrap();

        let mut status = ProcessStatus::Online;
        for _ in 0..50 {
            status = supervisor.list().await.unwrap()[0].status;
            if !status.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ProcessStatus::Errored);
        supervisor.delete("bm.c").await.unwrap();
    }
}
