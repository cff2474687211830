//! Wiring and lifecycle of a serving orchestrator.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::builder::{BuildEngine, EngineParts, random_build_id};
use crate::config::Config;
use crate::console::Console;
use crate::env::EnvManager;
use crate::loader::ScriptPaths;
use crate::log_store::LogStore;
use crate::runner::{
    LocalSupervisor, Pm2Supervisor, ProcessSupervisor, RunSupervisor, RunnerParts,
};
use crate::settings::SettingsHandle;
use crate::store::Store;
use crate::webhook::{self, AppState, SharedState};

/// Which process supervisor backs the run queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SupervisorKind {
    Pm2,
    Local,
}

impl SupervisorKind {
    pub fn create(&self) -> Arc<dyn ProcessSupervisor> {
        match self {
            Self::Pm2 => Arc::new(Pm2Supervisor::default()),
            Self::Local => Arc::new(LocalSupervisor::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Overrides `webhookPort`
    pub port: Option<u16>,
    pub console: bool,
    pub supervisor: SupervisorKind,
}

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Callbacks run once when the orchestrator exits, in registration order.
#[derive(Clone, Default)]
pub struct ShutdownHooks {
    hooks: Arc<Mutex<Vec<ShutdownHook>>>,
}

impl ShutdownHooks {
    pub fn register(&self, hook: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) {
        match self.hooks.lock() {
            Ok(mut hooks) => hooks.push(Box::new(hook)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(hook)),
        }
    }

    pub async fn run(&self) {
        let hooks = match self.hooks.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for hook in hooks {
            hook().await;
        }
    }
}

pub struct App {
    pub config: Config,
    pub settings: SettingsHandle,
    pub store: Store,
    pub logs: Arc<LogStore>,
    pub engine: BuildEngine,
    pub runner: RunSupervisor,
    pub state: SharedState,
    pub shutdown: ShutdownHooks,
}

impl App {
    /// Open the root directory and construct every component. Must be called
    /// inside a tokio runtime.
    pub fn open(config: Config, supervisor: Arc<dyn ProcessSupervisor>) -> Result<Self> {
        config.ensure_directories()?;
        let settings = SettingsHandle::load_or_default(config.settings_path.clone());
        let env = Arc::new(EnvManager::load(&config.root)?);
        let store = Store::open(&config.db_path).context("Failed to open database")?;
        let logs = Arc::new(LogStore::new(&config.log_dir));
        let scripts = ScriptPaths::new(&config.script_dir);

        let engine = BuildEngine::new(EngineParts {
            store: store.clone(),
            logs: logs.clone(),
            env: env.clone(),
            settings: settings.clone(),
            build_root: config.build_root.clone(),
            function: scripts.build_function(),
            ids: Arc::new(random_build_id),
        });
        let runner = RunSupervisor::new(RunnerParts {
            store: store.clone(),
            logs: logs.clone(),
            env: env.clone(),
            settings: settings.clone(),
            build_root: config.build_root.clone(),
            supervisor,
        });
        let state = Arc::new(AppState {
            store: store.clone(),
            engine: engine.clone(),
            runner: runner.clone(),
            env,
            build_root: config.build_root.clone(),
            webhook: scripts.webhook_function(),
        });

        let shutdown = ShutdownHooks::default();
        {
            let runner = runner.clone();
            let settings = settings.clone();
            shutdown.register(move || {
                Box::pin(async move {
                    let cleanup = settings.get().cleanup_process;
                    tracing::info!(cleanup, "stopping run supervisor");
                    runner.shutdown(cleanup).await;
                })
            });
        }

        Ok(Self {
            config,
            settings,
            store,
            logs,
            engine,
            runner,
            state,
            shutdown,
        })
    }

    /// Recover the active process, serve the webhook and, optionally, the
    /// console, until a signal, a server error or the operator exits.
    /// Shutdown hooks run on every path out.
    pub async fn serve(&self, options: &ServeOptions) -> Result<()> {
        self.runner.init().await;

        let port = options
            .port
            .unwrap_or_else(|| self.settings.get().webhook_port);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(webhook::serve(self.state.clone(), port, async move {
            let _ = stop_rx.await;
        }));

        let console = if options.console {
            let console = Console::new(self.store.clone(), self.runner.clone(), self.settings.clone());
            Some(tokio::spawn(async move { console.run().await }))
        } else {
            None
        };
        let console_done = async move {
            let result: Result<()> = match console {
                Some(handle) => handle.await.context("Console task failed")?,
                None => futures::future::pending().await,
            };
            result
        };

        let mut server_done = false;
        let outcome = tokio::select! {
            signal = wait_for_signal() => signal.map(|name| {
                tracing::info!(signal = name, "shutting down");
            }),
            served = &mut server => {
                server_done = true;
                served.context("Webhook server task failed").and_then(|r| r)
            }
            operator = console_done => operator.map(|()| {
                tracing::info!("operator exit");
            }),
        };

        let _ = stop_tx.send(());
        if !server_done && let Err(e) = server.await {
            tracing::warn!("webhook server task failed: {}", e);
        }
        if let Err(e) = &outcome {
            tracing::error!("{:#}", e);
        }
        self.shutdown.run().await;
        outcome
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        ctrl_c = tokio::signal::ctrl_c() => {
            ctrl_c.context("Failed to install Ctrl+C handler")?;
            Ok("SIGINT")
        }
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_shutdown_hooks_run_once_in_order() {
        let hooks = ShutdownHooks::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            hooks.register(move || {
                Box::pin(async move {
                    order.lock().unwrap().push(n);
                })
            });
        }
        hooks.run().await;
        hooks.run().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_open_creates_layout_and_registers_cleanup() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("root")).unwrap();
        let app = App::open(config, SupervisorKind::Local.create()).unwrap();

        assert!(app.config.db_path.exists());
        assert!(app.config.settings_path.exists());
        assert!(app.config.script_dir.is_dir());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        app.shutdown.register(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        app.shutdown.run().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!app.runner.restart_current_process().await);
    }
}
