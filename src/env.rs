//! Build-time and deploy-time environment mappings.
//!
//! Both are read from dotenv files in the root directory: `.env.build` feeds
//! build and webhook scripts, `.env.deploy` feeds launched processes. The two
//! are never merged.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

pub const BUILD_ENV_FILE: &str = ".env.build";
pub const DEPLOY_ENV_FILE: &str = ".env.deploy";

pub type EnvMap = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct EnvManager {
    build: EnvMap,
    deploy: EnvMap,
}

impl EnvManager {
    pub fn new(build: EnvMap, deploy: EnvMap) -> Self {
        Self { build, deploy }
    }

    pub fn load(root: &Path) -> Result<Self> {
        Ok(Self {
            build: read_env_file(&root.join(BUILD_ENV_FILE))?,
            deploy: read_env_file(&root.join(DEPLOY_ENV_FILE))?,
        })
    }

    /// A copy of the build environment; callers may mutate it freely.
    pub fn build_env(&self) -> EnvMap {
        self.build.clone()
    }

    pub fn deploy_env(&self) -> EnvMap {
        self.deploy.clone()
    }
}

/// Parse a dotenv file. A missing file is an empty mapping.
fn read_env_file(path: &Path) -> Result<EnvMap> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "env file not present");
        return Ok(EnvMap::new());
    }
    let mut map = EnvMap::new();
    for item in dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
    {
        let (key, value) = item.with_context(|| format!("Failed to parse {}", path.display()))?;
        map.insert(key, value);
    }
    Ok(map)
}
