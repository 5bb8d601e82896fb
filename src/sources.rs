//! Static configuration files.
//!
//! The tunnels file carries this node's endpoint and the peers assigned
//! by the cloud side; the services file carries the services to proxy
//! and their backing endpoints. Both are YAML documents, re-read on
//! every reconciliation pass. A polling watcher turns file changes into
//! debouncer signals.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use figment::{
    providers::{Format, Yaml},
    Figment,
};
use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::debounce::Debouncer;
use crate::types::Endpoint;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("tunnels file {0} does not exist")]
    MissingTunnels(PathBuf),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: figment::Error,
    },
}

/// Content of the tunnels file.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConf {
    pub local: Endpoint,
    #[serde(default)]
    pub peers: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Port on the backing endpoints. Defaults to `port`.
    #[serde(default)]
    pub target_port: Option<u16>,
}

fn default_protocol() -> String {
    "TCP".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEndpoint {
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "clusterIP")]
    pub cluster_ip: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

impl ServiceSpec {
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ServicesFile {
    #[serde(default)]
    services: Vec<ServiceSpec>,
}

/// Everything read from the static files in one pass.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub network: NetworkConf,
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone)]
pub struct StaticSources {
    tunnels: PathBuf,
    services: PathBuf,
}

impl StaticSources {
    pub fn new(tunnels: impl Into<PathBuf>, services: impl Into<PathBuf>) -> Self {
        Self {
            tunnels: tunnels.into(),
            services: services.into(),
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        vec![self.tunnels.clone(), self.services.clone()]
    }

    pub fn load(&self) -> Result<StaticConfig, SourceError> {
        if !self.tunnels.exists() {
            return Err(SourceError::MissingTunnels(self.tunnels.clone()));
        }
        let network: NetworkConf = read_yaml(&self.tunnels)?;

        // No services file simply means nothing to proxy.
        let services = if self.services.exists() {
            read_yaml::<ServicesFile>(&self.services)?.services
        } else {
            Vec::new()
        };

        Ok(StaticConfig { network, services })
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SourceError> {
    Figment::from(Yaml::file(path))
        .extract()
        .map_err(|source| SourceError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Polls the modification time of `paths` every `period` and signals the
/// debouncer when any of them changes, appears or disappears.
pub async fn watch_files(
    paths: Vec<PathBuf>,
    period: Duration,
    debouncer: Debouncer,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last: Vec<Option<SystemTime>> = paths.iter().map(|p| modified(p)).collect();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Watching {} static config files", paths.len());

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let current: Vec<Option<SystemTime>> = paths.iter().map(|p| modified(p)).collect();
        if current != last {
            debug!("Static config files changed, signalling reconcile");
            last = current;
            debouncer.signal();
        }
    }
    debug!("File watcher stopped");
}
