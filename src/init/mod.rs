//! `buildmgr init`: lay out a root directory.
//!
//! ```text
//! <root>/
//! ├── main.db          # empty database
//! ├── setting.json     # default settings
//! ├── .env.build       # empty
//! ├── .env.deploy      # empty
//! ├── script/
//! │   ├── build.sh     # sample build script
//! │   └── webhook.sh   # sample webhook script
//! ├── build/
//! └── log/
//! ```
//!
//! Existing files are never overwritten.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::builder::function::BUILD_SCRIPT;
use crate::config::Config;
use crate::env::{BUILD_ENV_FILE, DEPLOY_ENV_FILE};
use crate::settings::Settings;
use crate::store::db::BuildDb;
use crate::webhook::function::WEBHOOK_SCRIPT;

const SAMPLE_BUILD_SCRIPT: &str = r#"#!/bin/sh
# Runs in build/<id>/ with the build context as JSON on stdin.
# Write {"result": ..., "starting": {"script": ..., "interpreter": ..., "args": [...]}}
# to $BUILDMGR_RESULT_FILE and exit 0.
set -e
cat > /dev/null
echo "building $BUILDMGR_BUILD_ID"
printf '{"result": null, "starting": {"script": "index.js"}}' > "$BUILDMGR_RESULT_FILE"
"#;

const SAMPLE_WEBHOOK_SCRIPT: &str = r#"#!/bin/sh
# Receives {"request": {...}, "env": {...}, "buildDir": "..."} on stdin.
# Print {"build": true, "param": ..., "autorun": true} or {"build": false}.
cat > /dev/null
echo '{"build": true, "param": null, "autorun": true}'
"#;

#[derive(Debug)]
pub struct InitResult {
    pub root: PathBuf,
    /// Files written by this call
    pub created: Vec<PathBuf>,
}

pub fn init_root(root: &Path) -> Result<InitResult> {
    let config = Config::new(root.to_path_buf())?;
    config.ensure_directories()?;

    let mut created = Vec::new();
    if !config.db_path.exists() {
        BuildDb::new(&config.db_path).context("Failed to create database")?;
        created.push(config.db_path.clone());
    }
    if !config.settings_path.exists() {
        Settings::default().save(&config.settings_path)?;
        created.push(config.settings_path.clone());
    }
    for name in [BUILD_ENV_FILE, DEPLOY_ENV_FILE] {
        let path = config.root.join(name);
        if write_new(&path, "", false)? {
            created.push(path);
        }
    }
    for (name, body) in [
        (BUILD_SCRIPT, SAMPLE_BUILD_SCRIPT),
        (WEBHOOK_SCRIPT, SAMPLE_WEBHOOK_SCRIPT),
    ] {
        let path = config.script_dir.join(name);
        if write_new(&path, body, true)? {
            created.push(path);
        }
    }

    Ok(InitResult {
        root: config.root,
        created,
    })
}

/// Write `path` unless it exists. Returns whether it was written.
fn write_new(path: &Path, content: &str, executable: bool) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    if executable {
        make_executable(path)?;
    }
    Ok(true)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to make {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
