//! Resolution of user-supplied scripts.
//!
//! A [`ScriptSlot`] resolves its capability once per process and remembers the
//! outcome, success or [`LoadError`]. Fixing a broken script requires a
//! restart.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::builder::{BuildFunction, ScriptBuildFunction, function::BUILD_SCRIPT};
use crate::errors::LoadError;
use crate::webhook::{ScriptWebhookFunction, WebhookFunction, function::WEBHOOK_SCRIPT};

type Resolver<T> = Box<dyn Fn() -> Result<Arc<T>, LoadError> + Send + Sync>;

pub struct ScriptSlot<T: ?Sized> {
    cell: OnceLock<Result<Arc<T>, LoadError>>,
    resolve: Resolver<T>,
}

impl<T: ?Sized + 'static> ScriptSlot<T> {
    pub fn new(resolve: impl Fn() -> Result<Arc<T>, LoadError> + Send + Sync + 'static) -> Self {
        Self {
            cell: OnceLock::new(),
            resolve: Box::new(resolve),
        }
    }

    /// A slot that is already resolved.
    pub fn ready(value: Arc<T>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(value));
        Self {
            cell,
            resolve: Box::new(unreachable_resolver::<T>),
        }
    }

    pub fn get(&self) -> Result<Arc<T>, LoadError> {
        self.cell.get_or_init(|| (self.resolve)()).clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }
}

fn unreachable_resolver<T: ?Sized>() -> Result<Arc<T>, LoadError> {
    Err(LoadError::Missing {
        name: "<preset>".into(),
        dir: "<none>".into(),
    })
}

/// Where the user scripts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPaths {
    pub dir: PathBuf,
    pub build: String,
    pub webhook: String,
}

impl ScriptPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            build: BUILD_SCRIPT.to_string(),
            webhook: WEBHOOK_SCRIPT.to_string(),
        }
    }

    /// Slot resolving the build script on first use.
    pub fn build_function(&self) -> ScriptSlot<dyn BuildFunction> {
        let (dir, name) = (self.dir.clone(), self.build.clone());
        ScriptSlot::new(move || {
            let path = resolve_script(&dir, &name)?;
            tracing::info!(path = %path.display(), "build script loaded");
            Ok(Arc::new(ScriptBuildFunction::new(path)) as Arc<dyn BuildFunction>)
        })
    }

    /// Slot resolving the webhook script on first use.
    pub fn webhook_function(&self) -> ScriptSlot<dyn WebhookFunction> {
        let (dir, name) = (self.dir.clone(), self.webhook.clone());
        ScriptSlot::new(move || {
            let path = resolve_script(&dir, &name)?;
            tracing::info!(path = %path.display(), "webhook script loaded");
            Ok(Arc::new(ScriptWebhookFunction::new(path)) as Arc<dyn WebhookFunction>)
        })
    }
}

/// Find `name` in `dir` and check that it is an executable regular file.
pub fn resolve_script(dir: &Path, name: &str) -> Result<PathBuf, LoadError> {
    let path = dir.join(name);
    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LoadError::Missing {
                name: name.to_string(),
                dir: dir.display().to_string(),
            });
        }
        Err(e) => {
            return Err(LoadError::Unreadable {
                path: path.display().to_string(),
                message: e.to_string(),
            });
        }
    };

    if !metadata.is_file() {
        return Err(LoadError::NotAFile {
            path: path.display().to_string(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(LoadError::NotExecutable {
                path: path.display().to_string(),
            });
        }
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_missing_script() {
        let dir = TempDir::new().unwrap();
        let err = resolve_script(dir.path(), "build.sh").unwrap_err();
        assert!(matches!(err, LoadError::Missing { .. }));
    }

    #[test]
    fn test_directory_is_not_a_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("build.sh")).unwrap();
        let err = resolve_script(dir.path(), "build.sh").unwrap_err();
        assert!(matches!(err, LoadError::NotAFile { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit_required() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("build.sh");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            resolve_script(dir.path(), "build.sh"),
            Err(LoadError::NotExecutable { .. })
        ));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve_script(dir.path(), "build.sh").unwrap(), path);
    }

    #[test]
    fn test_slot_resolves_once_and_remembers_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let slot: ScriptSlot<String> = ScriptSlot::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LoadError::NotAFile { path: "x".into() })
        });

        assert!(!slot.is_resolved());
        assert!(slot.get().is_err());
        assert!(slot.get().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(slot.is_resolved());
    }

    #[cfg(unix)]
    #[test]
    fn test_script_paths_slots() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let paths = ScriptPaths::new(dir.path());
        let path = dir.path().join(BUILD_SCRIPT);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(paths.build_function().get().is_ok());
        assert!(matches!(
            paths.webhook_function().get(),
            Err(LoadError::Missing { .. })
        ));
    }

    #[test]
    fn test_ready_slot() {
        let slot = ScriptSlot::ready(Arc::new("hello".to_string()));
        assert_eq!(slot.get().unwrap().as_str(), "hello");
    }
}
