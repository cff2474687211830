//! The process supervisor seam.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::env::EnvMap;
use crate::errors::SupervisorError;

/// Capacity of the log bus. Slow subscribers lose the oldest lines.
pub const LOG_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Online,
    Launching,
    Stopping,
    Stopped,
    Errored,
    Unknown,
}

impl ProcessStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Online | Self::Launching)
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            "launching" => Self::Launching,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "errored" => Self::Errored,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
}

/// A process to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSpec {
    pub name: String,
    pub script: String,
    /// `"none"` runs the script directly
    pub interpreter: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: EnvMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Out,
    Err,
}

/// One line of output from a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLog {
    pub name: String,
    pub stream: LogStream,
    pub message: String,
}

/// Starts, lists and deletes named OS processes and publishes their output.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn connect(&self) -> Result<(), SupervisorError>;

    async fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError>;

    async fn start(&self, spec: StartSpec) -> Result<(), SupervisorError>;

    /// Stop and forget the process called `name`.
    async fn delete(&self, name: &str) -> Result<(), SupervisorError>;

    async fn subscribe_logs(&self) -> Result<broadcast::Receiver<ProcessLog>, SupervisorError>;

    async fn disconnect(&self);
}
