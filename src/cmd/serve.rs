//! Orchestrator command: `buildmgr serve`.

use std::path::PathBuf;

use anyhow::Result;
use buildmgr::app::{App, ServeOptions, SupervisorKind};
use buildmgr::config::Config;

pub async fn cmd_serve(
    root: PathBuf,
    port: Option<u16>,
    console: bool,
    supervisor: SupervisorKind,
) -> Result<()> {
    let config = Config::new(root)?;
    tracing::info!(root = %config.root.display(), ?supervisor, "starting buildmgr");

    let app = App::open(config, supervisor.create())?;
    app.serve(&ServeOptions {
        port,
        console,
        supervisor,
    })
    .await
}
