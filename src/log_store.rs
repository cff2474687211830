//! Keyed, append-only log files for build and run output.
//!
//! A key such as `build/1a2b3c4d` maps to `<root>/log/build/1a2b3c4d.log`.
//! At most [`MAX_OPEN_FILES`] files are held open; opening another closes the
//! one opened earliest.
//!
//! Writes are synchronous single-line appends made inline by the caller,
//! async tasks included, in the same way the `tracing` fmt layer writes to
//! stderr. Nothing here may block for longer than one small append.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;

pub const MAX_OPEN_FILES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Log,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Default)]
struct OpenFiles {
    order: VecDeque<PathBuf>,
    files: HashMap<PathBuf, File>,
}

pub struct LogStore {
    dir: PathBuf,
    open: Mutex<OpenFiles>,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: Mutex::new(OpenFiles::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.dir.join(key);
        if path.extension().is_none_or(|ext| ext != "log") {
            let mut name = path.file_name().unwrap_or_default().to_os_string();
            name.push(".log");
            path.set_file_name(name);
        }
        path
    }

    /// Append one line under `key`. When `display` is set the message is also
    /// emitted through tracing. Failures to write are reported, never raised.
    pub fn write(&self, key: &str, level: Level, display: bool, message: &str) {
        if display {
            match level {
                Level::Log => tracing::info!(target: "buildmgr::output", key, "{}", message),
                Level::Warn => tracing::warn!(target: "buildmgr::output", key, "{}", message),
                Level::Error => tracing::error!(target: "buildmgr::output", key, "{}", message),
            }
        }

        let line = format!(
            "[{}] [{}] {}\n",
            Local::now().format("%Y-%-m-%-d %H:%M:%S"),
            level.as_str(),
            console::strip_ansi_codes(message)
        );
        if let Err(e) = self.append(&self.path_for(key), line.as_bytes()) {
            tracing::warn!(key, "cannot write log file: {}", e);
        }
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| std::io::Error::other("log store lock poisoned"))?;

        if !open.files.contains_key(path) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            if open.files.len() >= MAX_OPEN_FILES
                && let Some(oldest) = open.order.pop_front()
            {
                open.files.remove(&oldest);
            }
            open.order.push_back(path.to_path_buf());
            open.files.insert(path.to_path_buf(), file);
        }

        match open.files.get_mut(path) {
            Some(file) => file.write_all(bytes),
            None => Ok(()),
        }
    }

    pub fn open_file_count(&self) -> usize {
        self.open.lock().map(|o| o.files.len()).unwrap_or(0)
    }

    /// Close every open file.
    pub fn close_all(&self) {
        if let Ok(mut open) = self.open.lock() {
            open.files.clear();
            open.order.clear();
        }
    }

    pub fn channel(self: &Arc<Self>, key: impl Into<String>, display: bool) -> LogChannel {
        LogChannel {
            store: self.clone(),
            key: key.into(),
            display,
        }
    }
}

/// A log stream bound to one key, handed to build functions as their console.
#[derive(Clone)]
pub struct LogChannel {
    store: Arc<LogStore>,
    key: String,
    display: bool,
}

impl LogChannel {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.store.write(&self.key, Level::Log, self.display, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.store.write(&self.key, Level::Warn, self.display, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.store.write(&self.key, Level::Error, self.display, message.as_ref());
    }
}

pub fn build_key(build_id: &str) -> String {
    format!("build/{}", build_id)
}

pub fn run_key(build_id: &str) -> String {
    format!("run/{}", build_id)
}
