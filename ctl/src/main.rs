//! marshalctl: plays the Tray or GUI side of the protocol against a
//! running Core, for operating and debugging it from a shell.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use marshal_ipc::framing::{self, FrameReader, FramingMode};
use marshal_ipc::messages::{
    self, GuiCommand, GuiCommandKind, Message, TrayCommand, TrayCommandKind,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How long to wait for an error reply before assuming the command was
/// accepted silently.
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Marshal control CLI
///
/// Sends Tray and GUI protocol commands to a running Core daemon.
#[derive(Parser, Debug)]
#[command(name = "marshalctl", author, version, about, long_about = None)]
struct Cli {
    /// Address of the Core's Tray listener
    #[arg(long, global = true, default_value = "127.0.0.1:5000")]
    tray_address: String,

    /// Address of the Core's GUI listener
    #[arg(long, global = true, default_value = "127.0.0.1:19850")]
    gui_address: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an executable as a managed instance (Tray protocol)
    Start {
        /// Identifier for the new instance; empty lets the Core pick one
        #[arg(default_value = "")]
        identifier: String,
        /// Path of the executable to launch
        #[arg(required = true)]
        executable: String,
        /// Directory the executable lives in
        #[arg(long, default_value = "")]
        base_directory: String,
        /// Working directory for the launched process
        #[arg(long, default_value = "")]
        working_directory: String,
        /// Whitespace-separated commandline arguments
        #[arg(long, default_value = "")]
        arguments: String,
        /// Send the command unframed, as pre-framing senders do
        #[arg(long)]
        legacy: bool,
    },
    /// Hard-stop a managed instance (Tray protocol)
    Kill {
        #[arg(required = true)]
        identifier: String,
        #[arg(long)]
        legacy: bool,
    },
    /// Gracefully stop a managed instance (Tray protocol)
    Exit {
        #[arg(required = true)]
        identifier: String,
        #[arg(long)]
        legacy: bool,
    },
    /// Launch a catalog application on a cluster (GUI protocol)
    Launch {
        /// Application identifier from the Core's catalog
        #[arg(required = true)]
        application: String,
        /// Cluster to launch on
        #[arg(required = true)]
        cluster: String,
        /// Named configuration variant; omit for the default
        #[arg(long, default_value = "")]
        configuration: String,
    },
    /// Print the Core's GuiInit snapshot (GUI protocol)
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start {
            identifier,
            executable,
            base_directory,
            working_directory,
            arguments,
            legacy,
        } => {
            let command = TrayCommand {
                identifier,
                command: TrayCommandKind::Start,
                executable,
                base_directory,
                current_working_directory: working_directory,
                commandline_arguments: arguments,
            };
            send_tray(&cli.tray_address, command, legacy).await
        }
        Commands::Kill { identifier, legacy } => {
            let command = TrayCommand {
                identifier,
                command: TrayCommandKind::Kill,
                ..TrayCommand::default()
            };
            send_tray(&cli.tray_address, command, legacy).await
        }
        Commands::Exit { identifier, legacy } => {
            let command = TrayCommand {
                identifier,
                command: TrayCommandKind::Exit,
                ..TrayCommand::default()
            };
            send_tray(&cli.tray_address, command, legacy).await
        }
        Commands::Launch {
            application,
            cluster,
            configuration,
        } => {
            let command = GuiCommand {
                command: GuiCommandKind::Start,
                application_identifier: application,
                configuration_identifier: configuration,
                cluster_identifier: cluster,
            };
            send_gui(&cli.gui_address, command).await
        }
        Commands::Snapshot => snapshot(&cli.gui_address).await,
    }
}

/// Sends one Tray command and reports the (optional) error reply.
async fn send_tray(address: &str, command: TrayCommand, legacy: bool) -> Result<()> {
    let mut stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("failed to connect to tray listener at {address}"))?;
    let bytes = messages::serialize(&Message::TrayCommand(command))?;
    if legacy {
        // Pre-framing senders ship the raw document and close their write
        // side; end-of-document is signalled by the shutdown.
        stream.write_all(&bytes).await?;
        stream.shutdown().await?;
    } else {
        framing::write_frame(&mut stream, &bytes).await?;
    }
    report_reply(stream).await
}

async fn send_gui(address: &str, command: GuiCommand) -> Result<()> {
    let mut stream = connect_gui(address).await?;
    // Drain the handshake before issuing the command.
    let _ = read_frame(&mut stream).await?;
    let bytes = messages::serialize(&Message::GuiCommand(command))?;
    framing::write_frame(&mut stream, &bytes).await?;
    report_reply(stream).await
}

async fn snapshot(address: &str) -> Result<()> {
    let mut stream = connect_gui(address).await?;
    let payload = read_frame(&mut stream)
        .await?
        .context("connection closed before the handshake arrived")?;
    match messages::parse(&payload)? {
        Message::GuiInit(init) => {
            println!("{}", "clusters".bold());
            for cluster in &init.clusters {
                println!("  {cluster}");
            }
            println!("{}", "applications".bold());
            for app in &init.applications {
                let clusters = if app.clusters.is_empty() {
                    "any cluster".to_string()
                } else {
                    app.clusters.join(", ")
                };
                println!("  {} ({}) on {clusters}", app.name, app.identifier);
                for conf in &app.configurations {
                    println!("    configuration: {} ({})", conf.name, conf.identifier);
                }
            }
            println!("{}", "processes".bold());
            if init.processes.is_empty() {
                println!("  (none)");
            }
            for process in &init.processes {
                let status = match process.status.as_str() {
                    "Running" => process.status.green(),
                    "Starting" | "Exiting" => process.status.yellow(),
                    _ => process.status.red(),
                };
                println!("  {} [{}] {status}", process.identifier, process.cluster);
            }
            Ok(())
        }
        other => anyhow::bail!("expected GuiInit handshake, got {}", other.message_type()),
    }
}

async fn connect_gui(address: &str) -> Result<TcpStream> {
    TcpStream::connect(address)
        .await
        .with_context(|| format!("failed to connect to gui listener at {address}"))
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut reader = FrameReader::new(stream, FramingMode::Framed);
    Ok(reader.next_frame().await?)
}

/// The Core only replies when a command fails; a quiet socket means the
/// command was accepted.
async fn report_reply(mut stream: TcpStream) -> Result<()> {
    match timeout(REPLY_TIMEOUT, read_frame(&mut stream)).await {
        Ok(Ok(Some(payload))) => match messages::parse(&payload)? {
            Message::ErrorOccurred(reply) => {
                eprintln!("{} {}", "error:".red().bold(), reply.error);
                std::process::exit(1);
            }
            other => {
                // GUI connections also stream status events; show them.
                println!("{} {:?}", "<-".dimmed(), other);
                Ok(())
            }
        },
        Ok(Ok(None)) | Err(_) => {
            println!("{}", "ok".green());
            Ok(())
        }
        Ok(Err(e)) => Err(e),
    }
}
