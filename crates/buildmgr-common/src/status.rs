use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{Artifact, LaunchDescriptor};

/// Flat status of a build record, as stored and displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildStatus {
    Enqueued,
    Building,
    Built,
    Running,
    Stopped,
    BuildError,
    RunError,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 7] = [
        Self::Enqueued,
        Self::Building,
        Self::Built,
        Self::Running,
        Self::Stopped,
        Self::BuildError,
        Self::RunError,
    ];

    /// Durable status code. The table is fixed; never renumber.
    pub fn code(&self) -> i64 {
        match self {
            Self::Enqueued => 0,
            Self::Building => 1,
            Self::Built => 2,
            Self::Running => 3,
            Self::Stopped => 4,
            Self::BuildError => 5,
            Self::RunError => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Building => "building",
            Self::Built => "built",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::BuildError => "buildError",
            Self::RunError => "runError",
        }
    }

    /// Whether records in this status carry a `starting`/`result` artifact.
    pub fn has_artifact(&self) -> bool {
        matches!(self, Self::Built | Self::Running | Self::RunError)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid build status: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("status {status} requires a launch descriptor")]
    MissingArtifact { status: BuildStatus },

    #[error("status {status} cannot carry a launch descriptor")]
    UnexpectedArtifact { status: BuildStatus },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: BuildStatus, to: BuildStatus },
}

/// Status together with the payload that status is allowed to carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BuildState {
    Enqueued,
    Building,
    Built(Artifact),
    Running(Artifact),
    Stopped,
    BuildError,
    RunError(Artifact),
}

impl BuildState {
    pub fn status(&self) -> BuildStatus {
        match self {
            Self::Enqueued => BuildStatus::Enqueued,
            Self::Building => BuildStatus::Building,
            Self::Built(_) => BuildStatus::Built,
            Self::Running(_) => BuildStatus::Running,
            Self::Stopped => BuildStatus::Stopped,
            Self::BuildError => BuildStatus::BuildError,
            Self::RunError(_) => BuildStatus::RunError,
        }
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Built(a) | Self::Running(a) | Self::RunError(a) => Some(a),
            _ => None,
        }
    }

    /// Rebuild a state from its flat durable form.
    pub fn from_parts(status: BuildStatus, artifact: Option<Artifact>) -> Result<Self, StateError> {
        match (status, artifact) {
            (BuildStatus::Enqueued, None) => Ok(Self::Enqueued),
            (BuildStatus::Building, None) => Ok(Self::Building),
            (BuildStatus::Stopped, None) => Ok(Self::Stopped),
            (BuildStatus::BuildError, None) => Ok(Self::BuildError),
            (BuildStatus::Built, Some(a)) => Ok(Self::Built(a)),
            (BuildStatus::Running, Some(a)) => Ok(Self::Running(a)),
            (BuildStatus::RunError, Some(a)) => Ok(Self::RunError(a)),
            (status, Some(_)) => Err(StateError::UnexpectedArtifact { status }),
            (status, None) => Err(StateError::MissingArtifact { status }),
        }
    }

    /// Apply a patch, returning the next state.
    ///
    /// `buildError` and `stopped` are terminal. Status-only patches towards a
    /// non-artifact status drop the artifact; `Running`/`RunError` keep it.
    pub fn apply(&self, patch: BuildPatch) -> Result<Self, StateError> {
        let from = self.status();
        let to = patch.status();
        if !is_valid_transition(from, to) {
            return Err(StateError::IllegalTransition { from, to });
        }

        match patch {
            BuildPatch::Enqueued => Ok(Self::Enqueued),
            BuildPatch::Building => Ok(Self::Building),
            BuildPatch::Stopped => Ok(Self::Stopped),
            BuildPatch::BuildError => Ok(Self::BuildError),
            BuildPatch::Built { starting, result } => Ok(Self::Built(Artifact { starting, result })),
            BuildPatch::Running => self
                .artifact()
                .cloned()
                .map(Self::Running)
                .ok_or(StateError::MissingArtifact { status: to }),
            BuildPatch::RunError => self
                .artifact()
                .cloned()
                .map(Self::RunError)
                .ok_or(StateError::MissingArtifact { status: to }),
            BuildPatch::Idle => self
                .artifact()
                .cloned()
                .map(Self::Built)
                .ok_or(StateError::MissingArtifact { status: to }),
        }
    }
}

/// A requested change to a build record.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildPatch {
    Enqueued,
    Building,
    Built {
        starting: LaunchDescriptor,
        result: Option<serde_json::Value>,
    },
    Running,
    Stopped,
    BuildError,
    RunError,
    /// The process was stopped to make room for another run; the artifact is
    /// kept and the record returns to `built`.
    Idle,
}

impl BuildPatch {
    pub fn status(&self) -> BuildStatus {
        match self {
            Self::Enqueued => BuildStatus::Enqueued,
            Self::Building => BuildStatus::Building,
            Self::Built { .. } | Self::Idle => BuildStatus::Built,
            Self::Running => BuildStatus::Running,
            Self::Stopped => BuildStatus::Stopped,
            Self::BuildError => BuildStatus::BuildError,
            Self::RunError => BuildStatus::RunError,
        }
    }
}

pub fn is_valid_transition(from: BuildStatus, to: BuildStatus) -> bool {
    use BuildStatus as S;
    matches!(
        (from, to),
        (S::Enqueued, S::Enqueued | S::Building | S::Stopped)
            | (S::Building, S::Built | S::BuildError)
            | (S::Built, S::Running)
            | (S::Running, S::Running | S::Built | S::Stopped | S::RunError)
            | (S::RunError, S::Running | S::RunError)
    )
}
