use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Filesystem layout of an orchestrator root directory.
///
/// ```text
/// <root>/
///   main.db          build records and the active process
///   setting.json     runtime settings
///   .env.build       build-time environment
///   .env.deploy      deploy-time environment
///   script/          build.sh, webhook.sh
///   build/<id>/      working directory of each build
///   log/             build/<id>.log, run/<id>.log
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
    pub script_dir: PathBuf,
    pub build_root: PathBuf,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create root directory {}", root.display()))?;
        let root = root
            .canonicalize()
            .context("Failed to resolve root directory")?;
        Ok(Self::at(root))
    }

    /// Layout under `root` without touching the filesystem.
    pub fn at(root: PathBuf) -> Self {
        Self {
            db_path: root.join("main.db"),
            settings_path: root.join(crate::settings::SETTINGS_FILE),
            script_dir: root.join("script"),
            build_root: root.join("build"),
            log_dir: root.join("log"),
            root,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.script_dir).context("Failed to create script directory")?;
        std::fs::create_dir_all(&self.build_root).context("Failed to create build directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn build_dir(&self, build_id: &str) -> PathBuf {
        build_dir(&self.build_root, build_id)
    }
}

pub fn build_dir(build_root: &Path, build_id: &str) -> PathBuf {
    build_root.join(build_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let config = Config::at(PathBuf::from("/srv/app"));
        assert_eq!(config.db_path, PathBuf::from("/srv/app/main.db"));
        assert_eq!(config.settings_path, PathBuf::from("/srv/app/setting.json"));
        assert_eq!(config.build_dir("abc"), PathBuf::from("/srv/app/build/abc"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("root")).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.script_dir.is_dir());
        assert!(config.build_root.is_dir());
        assert!(config.log_dir.is_dir());
    }
}
