//! The application catalog: the configuration-lookup collaborator for GUI
//! starts.
//!
//! GUI clients do not name executables; they name an application, an
//! optional configuration variant, and a cluster. The catalog resolves that
//! triple into a [`LaunchSpec`] and provides the data half of the `GuiInit`
//! handshake.

use marshal_ipc::messages::{ApplicationInfo, ConfigurationInfo, GuiInit, ProcessInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::LaunchSpec;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown application '{0}'")]
    UnknownApplication(String),
    #[error("unknown configuration '{configuration}' for application '{application}'")]
    UnknownConfiguration {
        application: String,
        configuration: String,
    },
    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),
    #[error("application '{application}' is not offered on cluster '{cluster}'")]
    ClusterMismatch {
        application: String,
        cluster: String,
    },
}

/// One launchable application, as declared in the Core configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub identifier: String,
    pub executable: String,
    #[serde(default)]
    pub base_directory: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Clusters the application may be launched on; empty means any.
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub configurations: Vec<Configuration>,
}

/// A named argument-set variant of an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub name: String,
    pub identifier: String,
    /// Appended to the application's base arguments.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationCatalog {
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default, rename = "application")]
    pub applications: Vec<Application>,
}

impl ApplicationCatalog {
    /// Resolves an application (+ optional configuration) scoped to a
    /// cluster into the spec handed to the process manager.
    pub fn resolve(
        &self,
        application: &str,
        configuration: &str,
        cluster: &str,
    ) -> Result<LaunchSpec, CatalogError> {
        if !self.clusters.iter().any(|c| c == cluster) {
            return Err(CatalogError::UnknownCluster(cluster.to_string()));
        }
        let app = self
            .applications
            .iter()
            .find(|a| a.identifier == application)
            .ok_or_else(|| CatalogError::UnknownApplication(application.to_string()))?;
        if !app.clusters.is_empty() && !app.clusters.iter().any(|c| c == cluster) {
            return Err(CatalogError::ClusterMismatch {
                application: application.to_string(),
                cluster: cluster.to_string(),
            });
        }
        let mut arguments = app.arguments.clone();
        if !configuration.is_empty() {
            let conf = app
                .configurations
                .iter()
                .find(|c| c.identifier == configuration)
                .ok_or_else(|| CatalogError::UnknownConfiguration {
                    application: application.to_string(),
                    configuration: configuration.to_string(),
                })?;
            if !conf.arguments.is_empty() {
                if arguments.is_empty() {
                    arguments = conf.arguments.clone();
                } else {
                    arguments = format!("{arguments} {}", conf.arguments);
                }
            }
        }
        Ok(LaunchSpec {
            executable: app.executable.clone(),
            base_directory: app.base_directory.clone(),
            working_directory: app.working_directory.clone(),
            arguments,
        })
    }

    /// Builds the handshake snapshot sent to a freshly connected GUI.
    pub fn gui_init(&self, processes: Vec<ProcessInfo>) -> GuiInit {
        GuiInit {
            applications: self
                .applications
                .iter()
                .map(|app| ApplicationInfo {
                    name: app.name.clone(),
                    identifier: app.identifier.clone(),
                    tags: app.tags.clone(),
                    clusters: app.clusters.clone(),
                    configurations: app
                        .configurations
                        .iter()
                        .map(|conf| ConfigurationInfo {
                            name: conf.name.clone(),
                            identifier: conf.identifier.clone(),
                        })
                        .collect(),
                })
                .collect(),
            clusters: self.clusters.clone(),
            processes,
        }
    }
}
