//! Runtime settings, persisted as `setting.json` in the root directory.
//!
//! ```json
//! {
//!   "webhookPort": 3000,
//!   "displayBuildLog": false,
//!   "displayRunLog": false,
//!   "cleanupProcess": true,
//!   "defaultInterpreter": "node"
//! }
//! ```
//!
//! Unknown keys are ignored and missing keys fall back to their defaults, so a
//! partial file is valid. The file is written back after loading so new keys
//! show up for the operator.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE: &str = "setting.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Port for the webhook endpoint
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,
    /// Mirror build logs to the orchestrator's own output
    #[serde(default)]
    pub display_build_log: bool,
    /// Mirror run logs to the orchestrator's own output
    #[serde(default)]
    pub display_run_log: bool,
    /// Stop the active process when the orchestrator exits
    #[serde(default = "default_cleanup_process")]
    pub cleanup_process: bool,
    /// Interpreter used when a launch descriptor names none
    #[serde(default = "default_interpreter")]
    pub default_interpreter: String,
}

fn default_webhook_port() -> u16 {
    3000
}

fn default_cleanup_process() -> bool {
    true
}

fn default_interpreter() -> String {
    "node".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            webhook_port: default_webhook_port(),
            display_build_log: false,
            display_run_log: false,
            cleanup_process: default_cleanup_process(),
            default_interpreter: default_interpreter(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut settings: Settings =
            serde_json::from_str(content).context("Failed to parse setting.json")?;
        settings.webhook_port = settings.webhook_port.max(1);
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Warnings about settings that are valid but probably unintended.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.webhook_port < 1024 {
            warnings.push(format!(
                "webhookPort {} is privileged and may require root",
                self.webhook_port
            ));
        }
        if self.default_interpreter.trim().is_empty() {
            warnings.push("defaultInterpreter is empty; launch descriptors must name one".into());
        }
        warnings
    }
}

/// Shared, reloadable settings.
#[derive(Clone)]
pub struct SettingsHandle {
    path: PathBuf,
    current: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or invalid, then write the effective settings back.
    pub fn load_or_default(path: PathBuf) -> Self {
        let settings = match Settings::load(&path) {
            Ok(settings) => {
                tracing::info!(path = %path.display(), "loaded settings");
                settings
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "cannot load settings, using defaults: {:#}", e);
                Settings::default()
            }
        };
        for warning in settings.validate() {
            tracing::warn!("{}", warning);
        }
        if let Err(e) = settings.save(&path) {
            tracing::warn!("{:#}", e);
        }
        Self {
            path,
            current: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn fixed(settings: Settings) -> Self {
        Self {
            path: PathBuf::from(SETTINGS_FILE),
            current: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn get(&self) -> Settings {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-read the file. On error the previous settings stay in effect.
    pub fn reload(&self) -> Result<Settings> {
        let settings = Settings::load(&self.path)?;
        match self.current.write() {
            Ok(mut guard) => *guard = settings.clone(),
            Err(poisoned) => *poisoned.into_inner() = settings.clone(),
        }
        Ok(settings)
    }
}
