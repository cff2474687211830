use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{BuildState, BuildStatus};

/// How to launch a built artifact as a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

impl LaunchDescriptor {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            interpreter: None,
            args: None,
        }
    }
}

/// Output of a successful build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub starting: LaunchDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: String,
    #[serde(flatten)]
    pub state: BuildState,
    pub created_time: DateTime<Utc>,
}

impl BuildRecord {
    pub fn status(&self) -> BuildStatus {
        self.state.status()
    }

    pub fn starting(&self) -> Option<&LaunchDescriptor> {
        self.state.artifact().map(|a| &a.starting)
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.state.artifact().and_then(|a| a.result.as_ref())
    }
}

/// The single build whose process is currently owned by the run supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProcessRecord {
    pub id: String,
    pub created_time: DateTime<Utc>,
}

/// Supervisor-side process name for a build.
pub fn process_name(build_id: &str) -> String {
    format!("bm.{}", build_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::BuildState;

    #[test]
    fn test_launch_descriptor_optional_fields_are_omitted() {
        let json = serde_json::to_value(LaunchDescriptor::new("index.js")).unwrap();
        assert_eq!(json, serde_json::json!({"script": "index.js"}));

        let parsed: LaunchDescriptor = serde_json::from_value(serde_json::json!({
            "script": "server.py",
            "interpreter": "python3",
            "args": ["--port", "8080"]
        }))
        .unwrap();
        assert_eq!(parsed.interpreter.as_deref(), Some("python3"));
        assert_eq!(parsed.args.unwrap().len(), 2);
    }

    #[test]
    fn test_record_serializes_flat_status() {
        let record = BuildRecord {
            id: "deadbeef".to_string(),
            state: BuildState::Enqueued,
            created_time: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "enqueued");
        assert_eq!(json["id"], "deadbeef");
        assert!(record.starting().is_none());
        assert!(record.result().is_none());
    }

    #[test]
    fn test_process_name() {
        assert_eq!(process_name("a1b2c3d4"), "bm.a1b2c3d4");
    }
}
