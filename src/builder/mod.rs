//! Build engine: a serial build queue in front of the user's build function.
//!
//! Every request goes through one long-lived worker task, so at most one
//! build body runs at a time and completions fire in enqueue order.

pub mod function;
pub mod spawn;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use buildmgr_common::{BuildPatch, BuildRecord};
use tokio::sync::mpsc;

use crate::config::build_dir;
use crate::env::EnvManager;
use crate::errors::StoreError;
use crate::loader::ScriptSlot;
use crate::log_store::{LogStore, build_key};
use crate::settings::SettingsHandle;
use crate::store::Store;
pub use function::{BuildContext, BuildFunction, BuildOutput, ScriptBuildFunction};
pub use spawn::{SpawnCommand, SpawnOptions, Spawner};

/// Called once with the build outcome after the build has finished.
pub type Completion = Box<dyn FnOnce(bool) + Send>;

/// Produces candidate build ids.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// How many fresh ids `create_build` tries before giving up.
const MAX_ID_ATTEMPTS: usize = 64;

/// Eight lowercase hex characters from a v4 UUID.
pub fn random_build_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub store: Store,
    pub logs: Arc<LogStore>,
    pub env: Arc<EnvManager>,
    pub settings: SettingsHandle,
    pub build_root: PathBuf,
    pub function: ScriptSlot<dyn BuildFunction>,
    pub ids: IdGenerator,
}

struct BuildJob {
    build_id: String,
    param: serde_json::Value,
    completion: Completion,
}

struct EngineInner {
    store: Store,
    logs: Arc<LogStore>,
    env: Arc<EnvManager>,
    settings: SettingsHandle,
    build_root: PathBuf,
    function: ScriptSlot<dyn BuildFunction>,
    ids: IdGenerator,
}

#[derive(Clone)]
pub struct BuildEngine {
    inner: Arc<EngineInner>,
    queue: mpsc::UnboundedSender<BuildJob>,
}

impl BuildEngine {
    /// Create the engine and spawn its worker. Must be called inside a tokio
    /// runtime.
    pub fn new(parts: EngineParts) -> Self {
        let inner = Arc::new(EngineInner {
            store: parts.store,
            logs: parts.logs,
            env: parts.env,
            settings: parts.settings,
            build_root: parts.build_root,
            function: parts.function,
            ids: parts.ids,
        });
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(inner.clone(), rx));
        Self { inner, queue }
    }

    /// Mark `build_id` enqueued and hand it to the worker. `completion` runs
    /// after the build finishes, never from within this call.
    pub async fn enqueue(
        &self,
        build_id: &str,
        param: serde_json::Value,
        completion: Completion,
    ) -> Result<()> {
        self.inner
            .store
            .update_build_record(build_id, BuildPatch::Enqueued)
            .await
            .with_context(|| format!("Cannot enqueue build {}", build_id))?;
        self.queue
            .send(BuildJob {
                build_id: build_id.to_string(),
                param,
                completion,
            })
            .map_err(|_| anyhow::anyhow!("Build worker has stopped"))?;
        tracing::info!(build_id, "build enqueued");
        Ok(())
    }

    /// Create a record under a fresh id. Collisions are retried silently.
    pub async fn create_build(&self) -> Result<BuildRecord, StoreError> {
        let mut last = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = (self.inner.ids)();
            match self.inner.store.create_build_record(&id).await {
                Ok(record) => {
                    tracing::debug!(build_id = %record.id, "build record created");
                    return Ok(record);
                }
                Err(StoreError::Collision { id }) => {
                    tracing::debug!(build_id = %id, "build id collision, regenerating");
                    last = Some(StoreError::Collision { id });
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(StoreError::Task("no build id generated".into())))
    }

    /// Run one build immediately, bypassing the queue. Returns whether the
    /// record ended up `built`.
    pub async fn build(&self, build_id: &str, param: serde_json::Value) -> bool {
        self.inner.build(build_id, param).await
    }

    pub fn build_root(&self) -> &std::path::Path {
        &self.inner.build_root
    }
}

impl EngineInner {
    async fn build(&self, build_id: &str, param: serde_json::Value) -> bool {
        let function = match self.function.get() {
            Ok(function) => function,
            Err(e) => {
                tracing::error!(build_id, "build function unavailable: {}", e);
                return false;
            }
        };

        if let Err(e) = self
            .store
            .update_build_record(build_id, BuildPatch::Building)
            .await
        {
            tracing::error!(build_id, "cannot start build: {}", e);
            return false;
        }

        let console = self
            .logs
            .channel(build_key(build_id), self.settings.get().display_build_log);
        let dir = build_dir(&self.build_root, build_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            console.error(format!("cannot create build directory {}: {}", dir.display(), e));
            self.mark_failed(build_id).await;
            return false;
        }

        let started = Instant::now();
        console.log(format!("build {} started", build_id));
        let ctx = BuildContext {
            build_id: build_id.to_string(),
            env: self.env.build_env(),
            param,
            spawner: Spawner::new(&dir, console.clone()),
            build_dir: dir,
            console: console.clone(),
        };

        match function.build(ctx).await {
            Ok(output) => {
                let patch = BuildPatch::Built {
                    starting: output.starting,
                    result: output.result,
                };
                match self.store.update_build_record(build_id, patch).await {
                    Ok(_) => {
                        console.log(format!(
                            "build {} succeeded in {:.1}s",
                            build_id,
                            started.elapsed().as_secs_f64()
                        ));
                        tracing::info!(build_id, "build succeeded");
                        true
                    }
                    Err(e) => {
                        tracing::error!(build_id, "cannot record build result: {}", e);
                        false
                    }
                }
            }
            Err(e) => {
                console.error(format!("build {} failed: {}", build_id, e));
                tracing::warn!(build_id, "build failed: {}", e);
                self.mark_failed(build_id).await;
                false
            }
        }
    }

    async fn mark_failed(&self, build_id: &str) {
        if let Err(e) = self
            .store
            .update_build_record(build_id, BuildPatch::BuildError)
            .await
        {
            tracing::error!(build_id, "cannot mark build failed: {}", e);
        }
    }
}

async fn worker(inner: Arc<EngineInner>, mut rx: mpsc::UnboundedReceiver<BuildJob>) {
    while let Some(job) = rx.recv().await {
        let engine = inner.clone();
        let build_id = job.build_id.clone();
        let param = job.param;
        let outcome = match tokio::spawn(async move { engine.build(&build_id, param).await }).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(build_id = %job.build_id, "build task aborted: {}", e);
                inner.mark_failed(&job.build_id).await;
                false
            }
        };

        let completion = job.completion;
        if std::panic::catch_unwind(AssertUnwindSafe(move || completion(outcome))).is_err() {
            tracing::error!(build_id = %job.build_id, "build completion panicked");
        }
    }
    tracing::debug!("build worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BuildFailure, LoadError};
    use crate::settings::Settings;
    use buildmgr_common::{BuildStatus, LaunchDescriptor};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn parts(dir: &TempDir, function: ScriptSlot<dyn BuildFunction>) -> EngineParts {
        EngineParts {
            store: Store::in_memory().unwrap(),
            logs: Arc::new(LogStore::new(dir.path().join("log"))),
            env: Arc::new(EnvManager::default()),
            settings: SettingsHandle::fixed(Settings::default()),
            build_root: dir.path().join("build"),
            function,
            ids: Arc::new(random_build_id),
        }
    }

    fn succeeding() -> ScriptSlot<dyn BuildFunction> {
        let function = |ctx: BuildContext| async move {
            ctx.console.log("compiling");
            Ok::<_, BuildFailure>(BuildOutput {
                result: Some(serde_json::json!({"id": ctx.build_id})),
                starting: LaunchDescriptor::new("index.js"),
            })
        };
        ScriptSlot::ready(Arc::new(function) as Arc<dyn BuildFunction>)
    }

    fn completion() -> (Completion, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Box::new(move |ok| {
                let _ = tx.send(ok);
            }),
            rx,
        )
    }

    #[test]
    fn test_random_build_id_shape() {
        let id = random_build_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_successful_build_records_artifact() {
        let dir = TempDir::new().unwrap();
        let engine = BuildEngine::new(parts(&dir, succeeding()));
        let record = engine.create_build().await.unwrap();

        let (done, rx) = completion();
        engine
            .enqueue(&record.id, serde_json::json!({}), done)
            .await
            .unwrap();
        assert!(rx.await.unwrap());

        let record = engine.inner.store.get_build_record(&record.id).await.unwrap();
        assert_eq!(record.status(), BuildStatus::Built);
        assert_eq!(record.starting().unwrap().script, "index.js");
        assert!(record.result().is_some());
        assert!(dir.path().join("build").join(&record.id).is_dir());
        let log = std::fs::read_to_string(dir.path().join(format!("log/build/{}.log", record.id)))
            .unwrap();
        assert!(log.contains("compiling"));
    }

    #[tokio::test]
    async fn test_failed_build_has_no_artifact() {
        let dir = TempDir::new().unwrap();
        let function = |_ctx: BuildContext| async move {
            Err::<BuildOutput, _>(BuildFailure::ScriptExit { code: 1 })
        };
        let engine = BuildEngine::new(parts(
            &dir,
            ScriptSlot::ready(Arc::new(function) as Arc<dyn BuildFunction>),
        ));
        let record = engine.create_build().await.unwrap();

        let (done, rx) = completion();
        engine
            .enqueue(&record.id, serde_json::Value::Null, done)
            .await
            .unwrap();
        assert!(!rx.await.unwrap());

        let record = engine.inner.store.get_build_record(&record.id).await.unwrap();
        assert_eq!(record.status(), BuildStatus::BuildError);
        assert!(record.starting().is_none());
        assert!(record.result().is_none());
    }

    #[tokio::test]
    async fn test_builds_run_one_at_a_time_in_order() {
        let dir = TempDir::new().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let function = move |ctx: BuildContext| {
            let events = recorded.clone();
            async move {
                events.lock().unwrap().push(format!("start {}", ctx.param));
                tokio::time::sleep(Duration::from_millis(20)).await;
                events.lock().unwrap().push(format!("end {}", ctx.param));
                Ok::<_, BuildFailure>(BuildOutput {
                    result: None,
                    starting: LaunchDescriptor::new("index.js"),
                })
            }
        };
        let engine = BuildEngine::new(parts(
            &dir,
            ScriptSlot::ready(Arc::new(function) as Arc<dyn BuildFunction>),
        ));

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        for n in 0..3 {
            let record = engine.create_build().await.unwrap();
            let tx = order_tx.clone();
            engine
                .enqueue(
                    &record.id,
                    serde_json::json!(n),
                    Box::new(move |ok| {
                        let _ = tx.send((n, ok));
                    }),
                )
                .await
                .unwrap();
        }

        let mut completions = Vec::new();
        for _ in 0..3 {
            completions.push(order_rx.recv().await.unwrap());
        }
        assert_eq!(completions, vec![(0, true), (1, true), (2, true)]);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
    }

    #[tokio::test]
    async fn test_completion_is_not_called_synchronously() {
        let dir = TempDir::new().unwrap();
        let engine = BuildEngine::new(parts(&dir, succeeding()));
        let record = engine.create_build().await.unwrap();

        let called = Arc::new(AtomicUsize::new(0));
        let flag = called.clone();
        let (tx, rx) = oneshot::channel();
        engine
            .enqueue(
                &record.id,
                serde_json::Value::Null,
                Box::new(move |_| {
                    flag.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(());
                }),
            )
            .await
            .unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 0);
        rx.await.unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_build_retries_collisions() {
        let dir = TempDir::new().unwrap();
        let mut parts = parts(&dir, succeeding());
        let candidates = Arc::new(Mutex::new(vec!["bbbbbbbb", "aaaaaaaa", "aaaaaaaa"]));
        parts.ids = Arc::new(move || candidates.lock().unwrap().pop().unwrap().to_string());
        let engine = BuildEngine::new(parts);

        assert_eq!(engine.create_build().await.unwrap().id, "aaaaaaaa");
        assert_eq!(engine.create_build().await.unwrap().id, "bbbbbbbb");
    }

    #[tokio::test]
    async fn test_load_failure_leaves_record_enqueued() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let slot: ScriptSlot<dyn BuildFunction> = ScriptSlot::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LoadError::Missing {
                name: "build.sh".into(),
                dir: "script".into(),
            })
        });
        let engine = BuildEngine::new(parts(&dir, slot));
        let first = engine.create_build().await.unwrap();
        let second = engine.create_build().await.unwrap();

        assert!(!engine.build(&first.id, serde_json::Value::Null).await);
        assert!(!engine.build(&second.id, serde_json::Value::Null).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let record = engine.inner.store.get_build_record(&first.id).await.unwrap();
        assert_eq!(record.status(), BuildStatus::Enqueued);
    }

    #[tokio::test]
    async fn test_missing_record_fails_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let engine = BuildEngine::new(parts(&dir, succeeding()));
        assert!(!engine.build("deadbeef", serde_json::Value::Null).await);
        assert!(!dir.path().join("build/deadbeef").exists());
    }

    #[tokio::test]
    async fn test_panicking_build_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let function = |ctx: BuildContext| async move {
            if ctx.param == serde_json::json!("boom") {
                panic!("build exploded");
            }
            Ok::<_, BuildFailure>(BuildOutput {
                result: None,
                starting: LaunchDescriptor::new("index.js"),
            })
        };
        let engine = BuildEngine::new(parts(
            &dir,
            ScriptSlot::ready(Arc::new(function) as Arc<dyn BuildFunction>),
        ));

        let bad = engine.create_build().await.unwrap();
        let good = engine.create_build().await.unwrap();
        let (bad_done, bad_rx) = completion();
        let (good_done, good_rx) = completion();
        engine
            .enqueue(&bad.id, serde_json::json!("boom"), bad_done)
            .await
            .unwrap();
        engine
            .enqueue(&good.id, serde_json::Value::Null, good_done)
            .await
            .unwrap();

        assert!(!bad_rx.await.unwrap());
        assert!(good_rx.await.unwrap());
        let bad = engine.inner.store.get_build_record(&bad.id).await.unwrap();
        assert_eq!(bad.status(), BuildStatus::BuildError);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_finished_record() {
        let dir = TempDir::new().unwrap();
        let engine = BuildEngine::new(parts(&dir, succeeding()));
        let record = engine.create_build().await.unwrap();
        assert!(engine.build(&record.id, serde_json::Value::Null).await);

        let (done, _rx) = completion();
        assert!(
            engine
                .enqueue(&record.id, serde_json::Value::Null, done)
                .await
                .is_err()
        );
    }
}
