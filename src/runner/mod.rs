//! Run supervisor: keeps at most one built artifact running host-wide.
//!
//! All process changes go through one worker task. Starting a build first
//! stops whatever the active process record names; if that stop fails the
//! supervisor parks in [`SupervisorState::StopFailed`] and refuses further
//! starts until an operator restarts or stops the process.

pub mod local;
pub mod pm2;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use buildmgr_common::{ActiveProcessRecord, BuildPatch, BuildStatus, process_name};
use tokio::sync::{OnceCell, broadcast, mpsc, oneshot};

use crate::config::build_dir;
use crate::env::EnvManager;
use crate::errors::SupervisorError;
use crate::log_store::{LogStore, run_key};
use crate::settings::SettingsHandle;
use crate::store::Store;
pub use local::LocalSupervisor;
pub use pm2::Pm2Supervisor;
pub use supervisor::{
    LogStream, ProcessInfo, ProcessLog, ProcessStatus, ProcessSupervisor, StartSpec,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting(String),
    Running(String),
    Stopping(String),
    StopFailed(String),
}

impl SupervisorState {
    pub fn build_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Starting(id) | Self::Running(id) | Self::Stopping(id) | Self::StopFailed(id) => {
                Some(id)
            }
        }
    }
}

/// Why a process is being stopped; decides what happens to its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// Making room for another start; the build returns to `built`.
    Replaced,
    /// The operator stopped it; the build becomes `stopped`.
    Operator,
    /// Orchestrator exit; both records are left untouched.
    Shutdown,
}

/// Why a build is being launched; decides which statuses may be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchReason {
    /// A run request; only `built` records start.
    Start,
    /// The operator restarted the current process.
    Restart,
    /// Startup recovery of the active process record, which already exists.
    Recover,
}

impl LaunchReason {
    fn allows(&self, status: BuildStatus) -> bool {
        match self {
            Self::Start => status == BuildStatus::Built,
            Self::Restart | Self::Recover => status.has_artifact(),
        }
    }
}

enum RunJob {
    Start(String),
    Recover(oneshot::Sender<()>),
    Restart(oneshot::Sender<bool>),
    Stop(oneshot::Sender<bool>),
    Flush(oneshot::Sender<()>),
    Shutdown {
        cleanup: bool,
        done: oneshot::Sender<()>,
    },
}

pub struct RunnerParts {
    pub store: Store,
    pub logs: Arc<LogStore>,
    pub env: Arc<EnvManager>,
    pub settings: SettingsHandle,
    pub build_root: PathBuf,
    pub supervisor: Arc<dyn ProcessSupervisor>,
}

struct RunInner {
    store: Store,
    logs: Arc<LogStore>,
    env: Arc<EnvManager>,
    settings: SettingsHandle,
    build_root: PathBuf,
    supervisor: Arc<dyn ProcessSupervisor>,
    connection: OnceCell<Result<(), SupervisorError>>,
    state: Arc<Mutex<SupervisorState>>,
    current: Mutex<Option<ActiveProcessRecord>>,
}

#[derive(Clone)]
pub struct RunSupervisor {
    inner: Arc<RunInner>,
    queue: mpsc::UnboundedSender<RunJob>,
}

impl RunSupervisor {
    /// Create the supervisor and spawn its worker. Must be called inside a
    /// tokio runtime. Nothing connects until the first job needs it.
    pub fn new(parts: RunnerParts) -> Self {
        let inner = Arc::new(RunInner {
            store: parts.store,
            logs: parts.logs,
            env: parts.env,
            settings: parts.settings,
            build_root: parts.build_root,
            supervisor: parts.supervisor,
            connection: OnceCell::new(),
            state: Arc::new(Mutex::new(SupervisorState::Idle)),
            current: Mutex::new(None),
        });
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(inner.clone(), rx));
        Self { inner, queue }
    }

    /// Queue a start of `build_id`, replacing the active process.
    pub fn enqueue(&self, build_id: &str) {
        if self.queue.send(RunJob::Start(build_id.to_string())).is_err() {
            tracing::warn!(build_id, "run worker has stopped, start dropped");
        } else {
            tracing::info!(build_id, "run enqueued");
        }
    }

    /// Adopt or relaunch the process named by the active process record.
    pub async fn init(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(RunJob::Recover(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn current_process(&self) -> Option<ActiveProcessRecord> {
        self.inner.current()
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.state()
    }

    /// Stop and start the current process again. `false` when nothing is
    /// tracked or either step failed.
    pub async fn restart_current_process(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(RunJob::Restart(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop the current process and mark its build `stopped`.
    pub async fn delete_current_process(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(RunJob::Stop(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Wait until every job queued so far has been handled.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(RunJob::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the worker, optionally stopping the active process first, and
    /// disconnect from the supervisor. The active process record is kept so
    /// the next start can relaunch it.
    pub async fn shutdown(&self, cleanup: bool) {
        let (done, rx) = oneshot::channel();
        if self.queue.send(RunJob::Shutdown { cleanup, done }).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn worker(inner: Arc<RunInner>, mut rx: mpsc::UnboundedReceiver<RunJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            RunJob::Start(build_id) => inner.start(&build_id).await,
            RunJob::Recover(done) => {
                inner.recover().await;
                let _ = done.send(());
            }
            RunJob::Restart(done) => {
                let _ = done.send(inner.restart().await);
            }
            RunJob::Stop(done) => {
                let _ = done.send(inner.stop_current().await);
            }
            RunJob::Flush(done) => {
                let _ = done.send(());
            }
            RunJob::Shutdown { cleanup, done } => {
                inner.shutdown(cleanup).await;
                let _ = done.send(());
                break;
            }
        }
    }
    tracing::debug!("run worker stopped");
}

impl RunInner {
    fn state(&self) -> SupervisorState {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        tracing::debug!(?state, "run supervisor state");
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn current(&self) -> Option<ActiveProcessRecord> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current(&self, record: Option<ActiveProcessRecord>) {
        match self.current.lock() {
            Ok(mut guard) => *guard = record,
            Err(poisoned) => *poisoned.into_inner() = record,
        }
    }

    /// Connect once and start forwarding logs. Every caller sees the
    /// outcome of the first attempt.
    async fn connection(&self) -> Result<(), SupervisorError> {
        self.connection
            .get_or_init(|| self.establish())
            .await
            .clone()
    }

    async fn establish(&self) -> Result<(), SupervisorError> {
        self.supervisor.connect().await?;
        let rx = self.supervisor.subscribe_logs().await?;
        tokio::spawn(forward_logs(
            rx,
            self.state.clone(),
            self.logs.clone(),
            self.settings.clone(),
        ));
        Ok(())
    }

    async fn find(&self, name: &str) -> Result<Option<ProcessInfo>, SupervisorError> {
        Ok(self
            .supervisor
            .list()
            .await?
            .into_iter()
            .find(|info| info.name == name))
    }

    async fn start(&self, build_id: &str) {
        if let SupervisorState::StopFailed(stuck) = self.state() {
            tracing::error!(
                build_id,
                "process {} could not be stopped; not starting until it is handled",
                process_name(&stuck)
            );
            return;
        }
        if let Err(e) = self.connection().await {
            tracing::error!(build_id, "cannot start: {}", e);
            return;
        }

        // Reject before touching the current process.
        match self.store.get_build_record(build_id).await {
            Ok(record) if LaunchReason::Start.allows(record.status()) => {}
            Ok(record) => {
                tracing::warn!(build_id, status = %record.status(), "only built records can be started");
                return;
            }
            Err(e) => {
                tracing::error!(build_id, "cannot start: {}", e);
                return;
            }
        }

        match self.store.get_active_process_record().await {
            Ok(Some(active)) => {
                if !self.stop(&active.id, StopReason::Replaced).await {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(build_id, "cannot read active process: {}", e);
                return;
            }
        }

        self.launch(build_id, LaunchReason::Start).await;
    }

    async fn recover(&self) {
        let active = match self.store.get_active_process_record().await {
            Ok(Some(active)) => active,
            Ok(None) => {
                tracing::info!("no active process to recover");
                return;
            }
            Err(e) => {
                tracing::error!("cannot read active process: {}", e);
                return;
            }
        };
        if let Err(e) = self.connection().await {
            tracing::error!(build_id = %active.id, "cannot recover: {}", e);
            return;
        }

        self.set_current(Some(active.clone()));
        let name = process_name(&active.id);
        match self.find(&name).await {
            Ok(Some(info)) if info.status.is_alive() => {
                tracing::info!(build_id = %active.id, pid = ?info.pid, "adopted running process");
                self.set_state(SupervisorState::Running(active.id));
            }
            Ok(found) => {
                if found.is_some()
                    && let Err(e) = self.supervisor.delete(&name).await
                {
                    tracing::warn!(build_id = %active.id, "cannot remove dead process: {}", e);
                }
                tracing::info!(build_id = %active.id, "active process is gone, relaunching");
                self.launch(&active.id, LaunchReason::Recover).await;
            }
            Err(e) => {
                tracing::error!(build_id = %active.id, "cannot list processes: {}", e);
                self.set_current(None);
            }
        }
    }

    async fn restart(&self) -> bool {
        let Some(active) = self.current() else {
            tracing::info!("no current process to restart");
            return false;
        };
        if let Err(e) = self.connection().await {
            tracing::error!(build_id = %active.id, "cannot restart: {}", e);
            return false;
        }
        if !self.stop(&active.id, StopReason::Replaced).await {
            return false;
        }
        self.launch(&active.id, LaunchReason::Restart).await
    }

    async fn stop_current(&self) -> bool {
        let Some(active) = self.current() else {
            tracing::info!("no current process to stop");
            return false;
        };
        if let Err(e) = self.connection().await {
            tracing::error!(build_id = %active.id, "cannot stop: {}", e);
            return false;
        }
        self.stop(&active.id, StopReason::Operator).await
    }

    async fn shutdown(&self, cleanup: bool) {
        let connected = matches!(self.connection.get(), Some(Ok(())));
        if cleanup
            && connected
            && let Some(active) = self.current()
        {
            self.stop(&active.id, StopReason::Shutdown).await;
        }
        if connected {
            self.supervisor.disconnect().await;
        }
        self.logs.close_all();
    }

    /// Stop the process of `build_id`. A process that is not there counts as
    /// stopped; a failed delete does not.
    async fn stop(&self, build_id: &str, reason: StopReason) -> bool {
        self.set_state(SupervisorState::Stopping(build_id.to_string()));
        let name = process_name(build_id);
        let console = self.run_console(build_id);

        let outcome = match self.find(&name).await {
            Ok(None) => Ok(()),
            Ok(Some(_)) => self.supervisor.delete(&name).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            console.error(format!("cannot stop {}: {}", name, e));
            tracing::error!(build_id, "stop failed: {}", e);
            self.set_state(SupervisorState::StopFailed(build_id.to_string()));
            return false;
        }
        console.log(format!("process {} stopped", name));

        if reason == StopReason::Shutdown {
            self.set_state(SupervisorState::Idle);
            return true;
        }

        if let Err(e) = self.store.delete_active_process_record(build_id).await {
            tracing::error!(build_id, "cannot delete active process record: {}", e);
        }
        self.set_current(None);

        let patch = match reason {
            StopReason::Operator => BuildPatch::Stopped,
            _ => BuildPatch::Idle,
        };
        match self.store.get_build_record(build_id).await {
            Ok(record) if record.status() == BuildStatus::Running => {
                if let Err(e) = self.store.update_build_record(build_id, patch).await {
                    tracing::error!(build_id, "cannot update build after stop: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(build_id, "cannot read build after stop: {}", e),
        }
        self.set_state(SupervisorState::Idle);
        true
    }

    /// Launch the artifact of `build_id`. When recovering, the active process
    /// record already names it and is not recreated.
    async fn launch(&self, build_id: &str, reason: LaunchReason) -> bool {
        self.set_state(SupervisorState::Starting(build_id.to_string()));
        let launched = self.try_launch(build_id, reason).await;
        if launched {
            self.set_state(SupervisorState::Running(build_id.to_string()));
        } else {
            if reason == LaunchReason::Recover {
                if let Err(e) = self.store.delete_active_process_record(build_id).await {
                    tracing::error!(build_id, "cannot delete active process record: {}", e);
                }
                self.set_current(None);
            }
            self.set_state(SupervisorState::Idle);
        }
        launched
    }

    async fn try_launch(&self, build_id: &str, reason: LaunchReason) -> bool {
        let record = match self.store.get_build_record(build_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(build_id, "cannot start: {}", e);
                return false;
            }
        };
        let starting = match record.starting() {
            Some(starting) if reason.allows(record.status()) => starting.clone(),
            _ => {
                tracing::warn!(build_id, status = %record.status(), ?reason, "build is not runnable");
                return false;
            }
        };

        let settings = self.settings.get();
        let spec = StartSpec {
            name: process_name(build_id),
            script: starting.script,
            interpreter: starting
                .interpreter
                .unwrap_or(settings.default_interpreter),
            args: starting.args.unwrap_or_default(),
            cwd: build_dir(&self.build_root, build_id),
            env: self.env.deploy_env(),
        };
        let console = self.run_console(build_id);
        console.log(format!(
            "starting {} ({} {})",
            spec.name, spec.interpreter, spec.script
        ));

        if let Err(e) = self.supervisor.start(spec).await {
            console.error(format!("start failed: {}", e));
            tracing::error!(build_id, "start failed: {}", e);
            if record.status() == BuildStatus::Running
                && let Err(e) = self
                    .store
                    .update_build_record(build_id, BuildPatch::RunError)
                    .await
            {
                tracing::error!(build_id, "cannot mark run error: {}", e);
            }
            return false;
        }

        let active = if reason == LaunchReason::Recover {
            self.current()
        } else {
            match self.store.create_active_process_record(build_id).await {
                Ok(active) => Some(active),
                Err(e) => {
                    tracing::error!(build_id, "cannot record active process: {}", e);
                    None
                }
            }
        };
        self.set_current(active);

        if record.status() != BuildStatus::Running
            && let Err(e) = self
                .store
                .update_build_record(build_id, BuildPatch::Running)
                .await
        {
            tracing::error!(build_id, "cannot mark running: {}", e);
        }
        tracing::info!(build_id, "process started");
        true
    }

    fn run_console(&self, build_id: &str) -> crate::log_store::LogChannel {
        self.logs
            .channel(run_key(build_id), self.settings.get().display_run_log)
    }
}

/// Copy output of the tracked build's process into its run log.
async fn forward_logs(
    mut rx: broadcast::Receiver<ProcessLog>,
    state: Arc<Mutex<SupervisorState>>,
    logs: Arc<LogStore>,
    settings: SettingsHandle,
) {
    loop {
        let log = match rx.recv().await {
            Ok(log) => log,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "run log forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let tracked = match state.lock() {
            Ok(guard) => guard.build_id().map(str::to_string),
            Err(_) => None,
        };
        let Some(build_id) = tracked else { continue };
        if log.name != process_name(&build_id) {
            continue;
        }
        let channel = logs.channel(run_key(&build_id), settings.get().display_run_log);
        match log.stream {
            LogStream::Out => channel.log(&log.message),
            LogStream::Err => channel.error(&log.message),
        }
    }
    tracing::debug!("run log forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use async_trait::async_trait;
    use buildmgr_common::LaunchDescriptor;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Scripted supervisor that records calls instead of running anything.
    struct FakeSupervisor {
        processes: Mutex<HashMap<String, ProcessStatus>>,
        started: Mutex<Vec<StartSpec>>,
        connects: AtomicUsize,
        fail_connect: AtomicBool,
        fail_start: AtomicBool,
        fail_delete: AtomicBool,
        fail_list: AtomicBool,
        bus: broadcast::Sender<ProcessLog>,
    }

    impl FakeSupervisor {
        fn new() -> Arc<Self> {
            let (bus, _) = broadcast::channel(64);
            Arc::new(Self {
                processes: Mutex::new(HashMap::new()),
                started: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                fail_delete: AtomicBool::new(false),
                fail_list: AtomicBool::new(false),
                bus,
            })
        }

        fn names(&self) -> Vec<String> {
            let mut names: Vec<String> = self.processes.lock().unwrap().keys().cloned().collect();
            names.sort();
            names
        }

        fn start_count(&self) -> usize {
            self.started.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn connect(&self) -> Result<(), SupervisorError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(SupervisorError::Connect("daemon unreachable".into()));
            }
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(SupervisorError::List("daemon went away".into()));
            }
            Ok(self
                .processes
                .lock()
                .unwrap()
                .iter()
                .map(|(name, status)| ProcessInfo {
                    name: name.clone(),
                    status: *status,
                    pid: Some(1),
                })
                .collect())
        }

        async fn start(&self, spec: StartSpec) -> Result<(), SupervisorError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(SupervisorError::Start {
                    name: spec.name,
                    message: "script not found".into(),
                });
            }
            self.processes
                .lock()
                .unwrap()
                .insert(spec.name.clone(), ProcessStatus::Online);
            self.started.lock().unwrap().push(spec);
            Ok(())
        }

        async fn delete(&self, name: &str) -> Result<(), SupervisorError> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(SupervisorError::Delete {
                    name: name.into(),
                    message: "permission denied".into(),
                });
            }
            self.processes.lock().unwrap().remove(name);
            Ok(())
        }

        async fn subscribe_logs(
            &self,
        ) -> Result<broadcast::Receiver<ProcessLog>, SupervisorError> {
            Ok(self.bus.subscribe())
        }

        async fn disconnect(&self) {}
    }

    struct Harness {
        _dir: TempDir,
        store: Store,
        fake: Arc<FakeSupervisor>,
        runner: RunSupervisor,
        log_dir: PathBuf,
    }

    fn harness_with(store: Store, fake: Arc<FakeSupervisor>) -> Harness {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("log");
        let mut deploy = crate::env::EnvMap::new();
        deploy.insert("PORT".into(), "8080".into());
        let runner = RunSupervisor::new(RunnerParts {
            store: store.clone(),
            logs: Arc::new(LogStore::new(&log_dir)),
            env: Arc::new(EnvManager::new(Default::default(), deploy)),
            settings: SettingsHandle::fixed(Settings::default()),
            build_root: dir.path().join("build"),
            supervisor: fake.clone(),
        });
        Harness {
            _dir: dir,
            store,
            fake,
            runner,
            log_dir,
        }
    }

    fn harness() -> Harness {
        harness_with(Store::in_memory().unwrap(), FakeSupervisor::new())
    }

    async fn built(store: &Store, id: &str) {
        store.create_build_record(id).await.unwrap();
        store
            .update_build_record(id, BuildPatch::Building)
            .await
            .unwrap();
        store
            .update_build_record(
                id,
                BuildPatch::Built {
                    starting: LaunchDescriptor::new("index.js"),
                    result: None,
                },
            )
            .await
            .unwrap();
    }

    async fn status(store: &Store, id: &str) -> BuildStatus {
        store.get_build_record(id).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_start_records_active_process() {
        let h = harness();
        built(&h.store, "aaaa0001").await;

        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;

        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Running);
        let active = h.store.get_active_process_record().await.unwrap().unwrap();
        assert_eq!(active.id, "aaaa0001");
        assert_eq!(h.runner.current_process(), Some(active));
        assert_eq!(h.runner.state(), SupervisorState::Running("aaaa0001".into()));

        let spec = h.fake.started.lock().unwrap()[0].clone();
        assert_eq!(spec.name, "bm.aaaa0001");
        assert_eq!(spec.interpreter, "node");
        assert!(spec.cwd.ends_with("build/aaaa0001"));
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("8080"));
    }

    #[tokio::test]
    async fn test_next_start_replaces_previous_process() {
        let h = harness();
        built(&h.store, "aaaa0001").await;
        built(&h.store, "aaaa0002").await;

        h.runner.enqueue("aaaa0001");
        h.runner.enqueue("aaaa0002");
        h.runner.flush().await;

        assert_eq!(h.fake.names(), vec!["bm.aaaa0002"]);
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Built);
        assert_eq!(status(&h.store, "aaaa0002").await, BuildStatus::Running);
        let active = h.store.get_active_process_record().await.unwrap().unwrap();
        assert_eq!(active.id, "aaaa0002");
    }

    #[tokio::test]
    async fn test_stop_failure_blocks_next_start() {
        let h = harness();
        built(&h.store, "aaaa0001").await;
        built(&h.store, "aaaa0002").await;
        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;

        h.fake.fail_delete.store(true, Ordering::SeqCst);
        h.runner.enqueue("aaaa0002");
        h.runner.flush().await;
        assert_eq!(h.runner.state(), SupervisorState::StopFailed("aaaa0001".into()));
        assert_eq!(h.fake.start_count(), 1);
        assert_eq!(status(&h.store, "aaaa0002").await, BuildStatus::Built);

        // Still parked, even once the supervisor would cooperate.
        h.fake.fail_delete.store(false, Ordering::SeqCst);
        h.runner.enqueue("aaaa0002");
        h.runner.flush().await;
        assert_eq!(h.fake.start_count(), 1);

        // An operator restart clears it.
        assert!(h.runner.restart_current_process().await);
        assert_eq!(h.runner.state(), SupervisorState::Running("aaaa0001".into()));
        h.runner.enqueue("aaaa0002");
        h.runner.flush().await;
        assert_eq!(h.fake.names(), vec!["bm.aaaa0002"]);
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_no_active_record() {
        let h = harness();
        built(&h.store, "aaaa0001").await;
        h.fake.fail_start.store(true, Ordering::SeqCst);

        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;

        assert!(h.store.get_active_process_record().await.unwrap().is_none());
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Built);
        assert_eq!(h.runner.state(), SupervisorState::Idle);
        let log = std::fs::read_to_string(h.log_dir.join("run/aaaa0001.log")).unwrap();
        assert!(log.contains("[ERROR] start failed"));
    }

    #[tokio::test]
    async fn test_unbuilt_record_is_not_started() {
        let h = harness();
        h.store.create_build_record("aaaa0001").await.unwrap();

        h.runner.enqueue("aaaa0001");
        h.runner.enqueue("ffff0000");
        h.runner.flush().await;

        assert_eq!(h.fake.start_count(), 0);
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Enqueued);
    }

    #[tokio::test]
    async fn test_operator_stop_is_idempotent() {
        let h = harness();
        built(&h.store, "aaaa0001").await;
        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;

        assert!(h.runner.delete_current_process().await);
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Stopped);
        assert!(h.store.get_active_process_record().await.unwrap().is_none());
        assert!(h.fake.names().is_empty());
        assert!(h.runner.current_process().is_none());

        assert!(!h.runner.delete_current_process().await);
        assert!(!h.runner.restart_current_process().await);
    }

    #[tokio::test]
    async fn test_recovery_adopts_live_process() {
        let store = Store::in_memory().unwrap();
        let fake = FakeSupervisor::new();
        built(&store, "aaaa0001").await;
        store
            .update_build_record("aaaa0001", BuildPatch::Running)
            .await
            .unwrap();
        let active = store.create_active_process_record("aaaa0001").await.unwrap();
        fake.processes
            .lock()
            .unwrap()
            .insert("bm.aaaa0001".into(), ProcessStatus::Online);

        let h = harness_with(store, fake);
        h.runner.init().await;

        assert_eq!(h.fake.start_count(), 0);
        assert_eq!(h.runner.current_process(), Some(active));
        assert_eq!(h.runner.state(), SupervisorState::Running("aaaa0001".into()));
    }

    #[tokio::test]
    async fn test_recovery_relaunches_missing_process() {
        let store = Store::in_memory().unwrap();
        let fake = FakeSupervisor::new();
        built(&store, "aaaa0001").await;
        store
            .update_build_record("aaaa0001", BuildPatch::Running)
            .await
            .unwrap();
        let active = store.create_active_process_record("aaaa0001").await.unwrap();
        fake.processes
            .lock()
            .unwrap()
            .insert("bm.aaaa0001".into(), ProcessStatus::Errored);

        let h = harness_with(store, fake);
        h.runner.init().await;

        assert_eq!(h.fake.start_count(), 1);
        assert_eq!(h.fake.names(), vec!["bm.aaaa0001"]);
        let after = h.store.get_active_process_record().await.unwrap().unwrap();
        assert_eq!(after, active);
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Running);
    }

    #[tokio::test]
    async fn test_failed_recovery_marks_run_error() {
        let store = Store::in_memory().unwrap();
        let fake = FakeSupervisor::new();
        built(&store, "aaaa0001").await;
        store
            .update_build_record("aaaa0001", BuildPatch::Running)
            .await
            .unwrap();
        store.create_active_process_record("aaaa0001").await.unwrap();
        fake.fail_start.store(true, Ordering::SeqCst);

        let h = harness_with(store, fake);
        h.runner.init().await;

        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::RunError);
        assert!(h.store.get_active_process_record().await.unwrap().is_none());
        assert!(h.runner.current_process().is_none());

        // A run error is not started again by a run request.
        h.fake.fail_start.store(false, Ordering::SeqCst);
        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;
        assert_eq!(h.fake.start_count(), 0);
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::RunError);
    }

    #[tokio::test]
    async fn test_running_or_run_error_record_is_not_started() {
        let h = harness();
        built(&h.store, "aaaa0001").await;
        built(&h.store, "aaaa0002").await;
        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;
        h.store
            .update_build_record("aaaa0002", BuildPatch::Running)
            .await
            .unwrap();
        h.store
            .update_build_record("aaaa0002", BuildPatch::RunError)
            .await
            .unwrap();

        h.runner.enqueue("aaaa0002");
        h.runner.flush().await;

        // The current process was left alone.
        assert_eq!(h.fake.start_count(), 1);
        assert_eq!(h.fake.names(), vec!["bm.aaaa0001"]);
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Running);
        assert_eq!(status(&h.store, "aaaa0002").await, BuildStatus::RunError);
        assert_eq!(h.runner.state(), SupervisorState::Running("aaaa0001".into()));
    }

    #[tokio::test]
    async fn test_failed_replacement_leaves_nothing_active() {
        let h = harness();
        built(&h.store, "aaaa0001").await;
        built(&h.store, "aaaa0002").await;
        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;

        h.fake.fail_start.store(true, Ordering::SeqCst);
        h.runner.enqueue("aaaa0002");
        h.runner.flush().await;

        assert!(h.store.get_active_process_record().await.unwrap().is_none());
        assert!(h.runner.current_process().is_none());
        assert!(h.fake.names().is_empty());
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Built);
        assert_eq!(status(&h.store, "aaaa0002").await, BuildStatus::Built);
        assert_eq!(h.runner.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_recovery_list_failure_tracks_nothing() {
        let store = Store::in_memory().unwrap();
        let fake = FakeSupervisor::new();
        built(&store, "aaaa0001").await;
        store
            .update_build_record("aaaa0001", BuildPatch::Running)
            .await
            .unwrap();
        store.create_active_process_record("aaaa0001").await.unwrap();
        fake.fail_list.store(true, Ordering::SeqCst);

        let h = harness_with(store, fake);
        h.runner.init().await;

        assert!(h.runner.current_process().is_none());
        assert_eq!(h.runner.state(), SupervisorState::Idle);
        assert!(!h.runner.restart_current_process().await);
        // The record stays for the next recovery attempt.
        assert!(h.store.get_active_process_record().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_cleanup_keeps_records() {
        let h = harness();
        built(&h.store, "aaaa0001").await;
        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;

        h.runner.shutdown(true).await;

        assert!(h.fake.names().is_empty());
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Running);
        let active = h.store.get_active_process_record().await.unwrap().unwrap();
        assert_eq!(active.id, "aaaa0001");

        // The worker is gone; further requests are dropped.
        assert!(!h.runner.restart_current_process().await);
    }

    #[tokio::test]
    async fn test_connection_error_is_shared() {
        let h = harness();
        h.fake.fail_connect.store(true, Ordering::SeqCst);
        built(&h.store, "aaaa0001").await;

        h.runner.enqueue("aaaa0001");
        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;

        assert_eq!(h.fake.connects.load(Ordering::SeqCst), 1);
        assert_eq!(h.fake.start_count(), 0);
        assert_eq!(status(&h.store, "aaaa0001").await, BuildStatus::Built);
    }

    #[tokio::test]
    async fn test_only_tracked_process_output_is_logged() {
        let h = harness();
        built(&h.store, "aaaa0001").await;
        h.runner.enqueue("aaaa0001");
        h.runner.flush().await;

        let send = |name: &str, stream, message: &str| {
            h.fake
                .bus
                .send(ProcessLog {
                    name: name.into(),
                    stream,
                    message: message.into(),
                })
                .unwrap();
        };
        send("bm.ffff0000", LogStream::Out, "not ours");
        send("bm.aaaa0001", LogStream::Out, "listening");
        send("bm.aaaa0001", LogStream::Err, "warning: deprecated");

        let path = h.log_dir.join("run/aaaa0001.log");
        let mut content = String::new();
        for _ in 0..100 {
            content = std::fs::read_to_string(&path).unwrap_or_default();
            if content.contains("deprecated") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(content.contains("[LOG] listening"), "{}", content);
        assert!(content.contains("[ERROR] warning: deprecated"));
        assert!(!content.contains("not ours"));
        assert!(!h.log_dir.join("run/ffff0000.log").exists());
    }
}
