//! Typed error hierarchy for buildmgr.
//!
//! - `StoreError`: persistence failures and data errors from the store
//! - `LoadError`: a user script could not be resolved
//! - `SupervisorError`: process supervisor connect/start/stop failures
//! - `BuildFailure`: why a single build did not produce an artifact

use buildmgr_common::StateError;
use thiserror::Error;

/// Errors from the persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Build {id} not found")]
    NotFound { id: String },

    #[error("Build id {id} already exists")]
    Collision { id: String },

    #[error("Build {id}: {source}")]
    InvalidTransition {
        id: String,
        #[source]
        source: StateError,
    },

    #[error("Corrupt record for build {id}: {message}")]
    Corrupt { id: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task failed: {0}")]
    Task(String),
}

/// A user-supplied script could not be resolved. Remembered for the lifetime
/// of the process so "not loaded yet" and "failed to load" stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("\"{name}\" not found in {dir}")]
    Missing { name: String, dir: String },

    #[error("\"{path}\" is not a file")]
    NotAFile { path: String },

    #[error("\"{path}\" is not executable")]
    NotExecutable { path: String },

    #[error("Cannot read \"{path}\": {message}")]
    Unreadable { path: String, message: String },
}

/// Errors from the external process supervisor. Cloneable so one failed
/// connection attempt can be reported to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("Cannot connect to process supervisor: {0}")]
    Connect(String),

    #[error("Cannot list processes: {0}")]
    List(String),

    #[error("Starting process {name} failed: {message}")]
    Start { name: String, message: String },

    #[error("Cannot delete process {name}: {message}")]
    Delete { name: String, message: String },

    #[error("Log bus unavailable: {0}")]
    LogBus(String),
}

/// Why a build did not complete.
#[derive(Debug, Error)]
pub enum BuildFailure {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Cannot spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Build script exited with code {code}")]
    ScriptExit { code: i32 },

    #[error("Build script produced an invalid result: {0}")]
    InvalidResult(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
