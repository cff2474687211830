//! Subprocess capability handed to build functions.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::env::EnvMap;
use crate::errors::BuildFailure;
use crate::log_store::LogChannel;

/// A command as either a whitespace-separated line or an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnCommand {
    Line(String),
    Argv(Vec<String>),
}

impl SpawnCommand {
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Self::Argv(argv) => argv.clone(),
        }
    }

    pub fn display(&self) -> String {
        self.argv().join(" ")
    }
}

impl From<&str> for SpawnCommand {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

impl From<String> for SpawnCommand {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<Vec<String>> for SpawnCommand {
    fn from(argv: Vec<String>) -> Self {
        Self::Argv(argv)
    }
}

impl<const N: usize> From<[&str; N]> for SpawnCommand {
    fn from(argv: [&str; N]) -> Self {
        Self::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Working directory; defaults to the build directory
    pub cwd: Option<PathBuf>,
    /// Bytes written to the child's stdin before it is closed
    pub stdin: Option<Vec<u8>>,
    /// Extra environment on top of the orchestrator's own
    pub env: EnvMap,
}

/// Runs commands inside one build's directory, forwarding their output into
/// the build's log: stdout to the log channel, stderr to the error channel.
#[derive(Clone)]
pub struct Spawner {
    cwd: PathBuf,
    console: LogChannel,
}

impl Spawner {
    pub fn new(cwd: impl Into<PathBuf>, console: LogChannel) -> Self {
        Self {
            cwd: cwd.into(),
            console,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Run `command` to completion and return its exit code (`-1` when it was
    /// killed by a signal). Resolves only after both output streams have
    /// ended and the process has exited.
    pub async fn spawn(
        &self,
        command: impl Into<SpawnCommand>,
        options: SpawnOptions,
    ) -> Result<i32, BuildFailure> {
        let command = command.into();
        let argv = command.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(BuildFailure::Spawn {
                command: command.display(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut child = Command::new(program)
            .args(args)
            .current_dir(options.cwd.as_deref().unwrap_or(&self.cwd))
            .envs(&options.env)
            .stdin(if options.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuildFailure::Spawn {
                command: command.display(),
                source,
            })?;

        let stdin = options.stdin.zip(child.stdin.take());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_console = self.console.clone();
        let err_console = self.console.clone();
        // Feed stdin while the readers drain, or a chatty child deadlocks on
        // a full pipe.
        let feed = async {
            let Some((bytes, mut pipe)) = stdin else {
                return;
            };
            match pipe.write_all(&bytes).await {
                Ok(()) => {}
                // The child stopped reading; only its exit code matters.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => self
                    .console
                    .warn(format!("cannot write stdin of `{}`: {}", command.display(), e)),
            }
            // pipe is dropped here, closing the child's stdin
        };
        tokio::join!(
            feed,
            forward(stdout, move |chunk| out_console.log(chunk)),
            forward(stderr, move |chunk| err_console.error(chunk)),
        );

        let status = child
            .wait()
            .await
            .map_err(|e| BuildFailure::Other(anyhow::anyhow!("Failed to wait for `{}`: {}", command.display(), e)))?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Forward raw chunks from a pipe until it closes. A UTF-8 sequence split
/// across two reads is held back until it is complete.
async fn forward<R, F>(reader: Option<R>, sink: F)
where
    R: AsyncRead + Unpin,
    F: Fn(&str),
{
    let Some(mut reader) = reader else {
        return;
    };
    let emit = |bytes: &[u8]| {
        let chunk = String::from_utf8_lossy(bytes);
        let chunk = chunk.trim_end_matches(['\n', '\r']);
        if !chunk.is_empty() {
            sink(chunk);
        }
    };
    let mut buf = vec![0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let cut = pending.len() - incomplete_tail(&pending);
                if cut > 0 {
                    emit(&pending[..cut]);
                    pending.drain(..cut);
                }
            }
        }
    }
    if !pending.is_empty() {
        emit(&pending);
    }
}

/// Length of a trailing UTF-8 sequence that is cut short, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let width = match bytes[i] {
            0x80..=0xBF => continue,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}
