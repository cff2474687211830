use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use buildmgr::app::SupervisorKind;

mod cmd;

#[derive(Parser)]
#[command(name = "buildmgr")]
#[command(version, about = "Self-hosted build-and-deploy orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Root directory holding main.db, setting.json, script/, build/ and log/
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the webhook and run the build and run queues
    Serve {
        /// Port to listen on (defaults to webhookPort from setting.json)
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not show the interactive console
        #[arg(long)]
        no_console: bool,

        /// Process supervisor backing launched builds
        #[arg(long, value_enum, default_value = "pm2")]
        supervisor: SupervisorKind,
    },
    /// List build records, most recent first
    Builds {
        /// Page number, starting at 1
        #[arg(long, default_value = "1")]
        page: usize,
    },
    /// Show one build record as JSON
    Show { id: String },
    /// Create the root directory layout with sample scripts
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    buildmgr::logging::init(cli.verbose);
    let root = match cli.root.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            port,
            no_console,
            supervisor,
        } => {
            let code = match cmd::cmd_serve(root, *port, !*no_console, *supervisor).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    1
                }
            };
            // A console prompt may still hold a blocking thread.
            std::process::exit(code);
        }
        Commands::Builds { page } => cmd::cmd_builds(&root, *page).await?,
        Commands::Show { id } => cmd::cmd_show(&root, id).await?,
        Commands::Init => cmd::cmd_init(&root)?,
    }

    Ok(())
}
