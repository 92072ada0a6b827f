//! The Core daemon binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use marshal_core::config::CoreConfig;
use marshal_core::dispatcher::Dispatcher;
use marshal_core::process::SystemProcessManager;
use marshal_core::registry::ProcessRegistry;
use marshal_core::server;
use marshal_ipc::framing::FramingMode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "marshald", about = "Process-coordination core daemon")]
struct Args {
    /// Path to the config file; defaults to the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the Tray listener address.
    #[arg(long)]
    tray_address: Option<String>,

    /// Override the GUI listener address.
    #[arg(long)]
    gui_address: Option<String>,

    /// Framing mode for the Tray listener: auto, framed, or legacy.
    #[arg(long)]
    tray_framing: Option<FramingMode>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let mut config = match &args.config {
        Some(path) => CoreConfig::load_from_file(path)?,
        None => CoreConfig::load()?,
    };
    if let Some(address) = args.tray_address {
        config.tray_address = address;
    }
    if let Some(address) = args.gui_address {
        config.gui_address = address;
    }
    if let Some(mode) = args.tray_framing {
        config.tray_framing = mode;
    }

    info!(
        tray = %config.tray_address,
        gui = %config.gui_address,
        framing = ?config.tray_framing,
        applications = config.catalog.applications.len(),
        "starting core daemon"
    );

    let registry = Arc::new(ProcessRegistry::new());
    let manager = Arc::new(SystemProcessManager::new());
    let dispatcher = Arc::new(Dispatcher::new(registry, manager, config.catalog.clone()));

    let mut tasks = Vec::new();

    {
        let dispatcher = Arc::clone(&dispatcher);
        let address = config.tray_address.clone();
        let mode = config.tray_framing;
        let max = config.max_frame_size;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::run_tray_listener(&address, dispatcher, mode, max).await {
                error!(error = %e, "tray listener failed");
            }
        }));
    }

    {
        let dispatcher = Arc::clone(&dispatcher);
        let address = config.gui_address.clone();
        let max = config.max_frame_size;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::run_gui_listener(&address, dispatcher, max).await {
                error!(error = %e, "gui listener failed");
            }
        }));
    }

    {
        let dispatcher = Arc::clone(&dispatcher);
        let interval = Duration::from_secs(config.liveness_interval_secs);
        tasks.push(tokio::spawn(server::run_liveness_sweep(
            dispatcher, interval,
        )));
    }

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "daemon task panicked");
        }
    }
    Ok(())
}
