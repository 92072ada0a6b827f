//! Applies Tray and GUI commands against the process registry.
//!
//! Mutation protocol for anything that involves the process-manager
//! collaborator: reserve the transition in the registry, release the lock,
//! call the collaborator, re-acquire and commit the result or roll the
//! reservation back. The registry lock is never held across a collaborator
//! call, and concurrent commands against one identifier are serialized by
//! their reservations.

use std::sync::Arc;

use marshal_ipc::messages::{
    GuiCommand, GuiCommandKind, GuiInit, Message, ProcessInfo, ProcessStatus, TrayCommand,
    TrayCommandKind,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{ApplicationCatalog, CatalogError};
use crate::process::{LaunchSpec, ProcessError, ProcessManager};
use crate::registry::{InstanceRecord, InstanceState, ProcessRegistry, RegistryError};

/// Buffered status events per GUI subscriber before old ones are dropped.
pub const STATUS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("'start' requires a non-empty executable")]
    MissingExecutable,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("launch of '{identifier}' failed: {source}")]
    Launch {
        identifier: String,
        #[source]
        source: ProcessError,
    },
    #[error("stopping '{identifier}' failed: {source}")]
    Stop {
        identifier: String,
        #[source]
        source: ProcessError,
    },
    /// Outbound-only message types are not accepted as commands.
    #[error("message type '{0}' is not a command")]
    NotACommand(&'static str),
}

pub struct Dispatcher {
    registry: Arc<ProcessRegistry>,
    manager: Arc<dyn ProcessManager>,
    catalog: ApplicationCatalog,
    status: broadcast::Sender<ProcessStatus>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        manager: Arc<dyn ProcessManager>,
        catalog: ApplicationCatalog,
    ) -> Self {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            registry,
            manager,
            catalog,
            status,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Status events for every registry state transition. GUIs subscribe
    /// once per connection.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ProcessStatus> {
        self.status.subscribe()
    }

    /// The handshake snapshot for a freshly connected GUI.
    pub fn gui_init(&self) -> GuiInit {
        let processes = self
            .registry
            .snapshot()
            .into_iter()
            .map(|record| ProcessInfo {
                identifier: record.identifier,
                cluster: record.cluster.unwrap_or_default(),
                status: record.state.to_string(),
            })
            .collect();
        self.catalog.gui_init(processes)
    }

    pub async fn dispatch(&self, message: Message) -> Result<(), DispatchError> {
        match message {
            Message::TrayCommand(command) => self.dispatch_tray(command).await,
            Message::GuiCommand(command) => self.dispatch_gui(command).await,
            other => Err(DispatchError::NotACommand(other.message_type())),
        }
    }

    async fn dispatch_tray(&self, command: TrayCommand) -> Result<(), DispatchError> {
        match command.command {
            TrayCommandKind::Start => {
                let identifier = if command.identifier.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    command.identifier
                };
                let spec = LaunchSpec {
                    executable: command.executable,
                    base_directory: command.base_directory,
                    working_directory: command.current_working_directory,
                    arguments: command.commandline_arguments,
                };
                self.start_instance(identifier, spec, None).await
            }
            TrayCommandKind::Kill => self.kill_instance(&command.identifier).await,
            TrayCommandKind::Exit => self.exit_instance(&command.identifier).await,
        }
    }

    async fn dispatch_gui(&self, command: GuiCommand) -> Result<(), DispatchError> {
        match command.command {
            GuiCommandKind::Start => {
                let spec = self.catalog.resolve(
                    &command.application_identifier,
                    &command.configuration_identifier,
                    &command.cluster_identifier,
                )?;
                let identifier =
                    format!("{}-{}", command.application_identifier, Uuid::new_v4());
                self.start_instance(identifier, spec, Some(command.cluster_identifier))
                    .await
            }
        }
    }

    async fn start_instance(
        &self,
        identifier: String,
        spec: LaunchSpec,
        cluster: Option<String>,
    ) -> Result<(), DispatchError> {
        if spec.executable.is_empty() {
            return Err(DispatchError::MissingExecutable);
        }
        self.registry.reserve(InstanceRecord {
            identifier: identifier.clone(),
            executable: spec.executable.clone(),
            working_directory: spec.working_directory.clone(),
            arguments: spec.arguments.clone(),
            cluster,
            state: InstanceState::Starting,
        })?;
        self.publish(&identifier, "Starting");
        match self.manager.launch(&identifier, &spec).await {
            Ok(()) => match self.registry.commit_running(&identifier) {
                Ok(()) => {
                    info!(identifier, executable = %spec.executable, "instance running");
                    self.publish(&identifier, "Running");
                    Ok(())
                }
                Err(_) => {
                    // A kill won the race while the launch was in flight;
                    // the fresh process must not outlive its record.
                    warn!(identifier, "instance removed during launch, stopping it");
                    if let Err(e) = self.manager.kill(&identifier).await {
                        warn!(identifier, error = %e, "failed to stop orphaned instance");
                    }
                    Ok(())
                }
            },
            Err(source) => {
                // Terminal rollback status; observers that saw Starting
                // learn the instance never came up.
                let _ = self.registry.remove(&identifier);
                self.publish(&identifier, "FailedToStart");
                Err(DispatchError::Launch { identifier, source })
            }
        }
    }

    async fn kill_instance(&self, identifier: &str) -> Result<(), DispatchError> {
        if !self.registry.contains(identifier) {
            return Err(RegistryError::UnknownIdentifier(identifier.to_string()).into());
        }
        match self.manager.kill(identifier).await {
            Ok(()) => {
                let _ = self.registry.remove(identifier);
                info!(identifier, "instance killed");
                self.publish(identifier, "Terminated");
                Ok(())
            }
            Err(source) => Err(DispatchError::Stop {
                identifier: identifier.to_string(),
                source,
            }),
        }
    }

    async fn exit_instance(&self, identifier: &str) -> Result<(), DispatchError> {
        let prior = self.registry.begin_exit(identifier)?;
        self.publish(identifier, "Exiting");
        match self.manager.terminate(identifier).await {
            Ok(()) => {
                let _ = self.registry.remove(identifier);
                info!(identifier, "instance exited");
                self.publish(identifier, "Terminated");
                Ok(())
            }
            Err(source) => {
                self.registry.restore_state(identifier, prior);
                self.publish(identifier, &prior.to_string());
                Err(DispatchError::Stop {
                    identifier: identifier.to_string(),
                    source,
                })
            }
        }
    }

    /// Removes Running instances whose process has silently disappeared.
    /// Called from the liveness sweep.
    pub async fn reap_dead_instances(&self) {
        for record in self.registry.snapshot() {
            if record.state != InstanceState::Running {
                continue;
            }
            if self.manager.is_alive(&record.identifier).await {
                continue;
            }
            if self.registry.remove(&record.identifier).is_ok() {
                warn!(identifier = %record.identifier, "instance disappeared, reaping");
                self.publish(&record.identifier, "Terminated");
            }
        }
    }

    fn publish(&self, identifier: &str, status: &str) {
        // No receivers is fine; GUIs come and go.
        let _ = self.status.send(ProcessStatus {
            identifier: identifier.to_string(),
            status: status.to_string(),
        });
    }
}
