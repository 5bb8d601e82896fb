//! Owns the agent's tasks and wires their lifecycles together.
//!
//! Every subsystem runs as its own tokio task and they only talk through
//! the peer table and the debouncer. Shutdown is cooperative: a watch
//! channel flips to `true`, each loop exits at its next suspension
//! point, and `stop` waits for all of them so an in-flight reconcile
//! pass is never cut short.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::join_all;
use log::{error, info, warn};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::apply::{ApplyError, Capabilities};
use crate::backup::BackupStore;
use crate::config::{Config, ConfigError};
use crate::debounce::Debouncer;
use crate::discovery::{bind_multicast, Discovery};
use crate::reconcile::{ReconcileSettings, Reconciler};
use crate::sources::{watch_files, StaticSources};
use crate::sweeper::run_sweeper;
use crate::table::PeerTable;

/// How often the static config files are checked for changes.
const FILE_WATCH_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("proxy is enabled but not supported: {0}")]
    ProxyUnsupported(ApplyError),
    #[error("failed to prepare working directory: {0}")]
    Workdir(io::Error),
    #[error("failed to open discovery socket: {0}")]
    Discovery(io::Error),
    #[error("manager already started")]
    AlreadyStarted,
}

pub struct Manager {
    config: Config,
    caps: Capabilities,
    table: PeerTable,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Manager {
    /// `config` must already be validated. Checks that the proxy can be
    /// used when it is enabled; that check is not retried later.
    pub async fn new(config: Config, caps: Capabilities) -> Result<Self, ManagerError> {
        if config.enable_proxy {
            caps.proxy
                .check_support()
                .await
                .map_err(ManagerError::ProxyUnsupported)?;
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            caps,
            table: PeerTable::new(),
            shutdown,
            tasks: Vec::new(),
        })
    }

    pub fn table(&self) -> PeerTable {
        self.table.clone()
    }

    /// Starts every task. With auto-networking the discovery socket joins
    /// the configured multicast group.
    pub async fn start(&mut self) -> Result<(), ManagerError> {
        let discovery = if self.config.auto_networking {
            let group = self.config.multicast_group()?;
            let socket = bind_multicast(group)
                .await
                .map_err(ManagerError::Discovery)?;
            Some((socket, group))
        } else {
            None
        };
        self.spawn_tasks(discovery).await
    }

    /// Like [`Manager::start`] with auto-networking on, but announcing
    /// from `socket` to `target` instead of a multicast group.
    pub async fn start_with_socket(
        &mut self,
        socket: UdpSocket,
        target: SocketAddr,
    ) -> Result<(), ManagerError> {
        self.spawn_tasks(Some((socket, target))).await
    }

    async fn spawn_tasks(
        &mut self,
        discovery: Option<(UdpSocket, SocketAddr)>,
    ) -> Result<(), ManagerError> {
        if !self.tasks.is_empty() {
            return Err(ManagerError::AlreadyStarted);
        }
        let cfg = &self.config;
        tokio::fs::create_dir_all(&cfg.workdir)
            .await
            .map_err(ManagerError::Workdir)?;

        let backup = BackupStore::new(&cfg.workdir);
        if discovery.is_some() {
            backup.restore_into(&self.table).await;
        }

        let (debouncer, trigger, handle) =
            Debouncer::spawn(cfg.debounce(), self.shutdown.subscribe());
        self.tasks.push(("debouncer", handle));

        if cfg.dns.enabled {
            if let Err(e) = self.caps.dns.configure(&cfg.dns, &cfg.workdir).await {
                error!("Failed to configure DNS: {}", e);
            }
        }

        let sources = StaticSources::new(&cfg.tunnels_conf, &cfg.services_conf);
        self.tasks.push((
            "file-watcher",
            tokio::spawn(watch_files(
                sources.paths(),
                FILE_WATCH_PERIOD,
                debouncer.clone(),
                self.shutdown.subscribe(),
            )),
        ));

        let reconciler = Reconciler::new(
            self.table.clone(),
            sources,
            ReconcileSettings::from_config(cfg),
            self.caps.clone(),
        );
        self.tasks.push((
            "reconciler",
            tokio::spawn(reconciler.run(
                trigger,
                cfg.sync_period(),
                self.shutdown.subscribe(),
            )),
        ));

        if let Some((socket, target)) = discovery {
            let discovery = Discovery::new(
                socket,
                target,
                cfg.multicast_token.clone(),
                self.table.clone(),
                debouncer.clone(),
            );
            self.tasks.push((
                "announcer",
                tokio::spawn(
                    discovery
                        .clone()
                        .announce_loop(cfg.multicast_interval(), self.shutdown.subscribe()),
                ),
            ));
            self.tasks.push((
                "receiver",
                tokio::spawn(discovery.receive_loop(self.shutdown.subscribe())),
            ));
            self.tasks.push((
                "sweeper",
                tokio::spawn(run_sweeper(
                    self.table.clone(),
                    cfg.endpoint_ttl(),
                    cfg.multicast_interval(),
                    debouncer,
                    self.shutdown.subscribe(),
                )),
            ));
            self.tasks.push((
                "backup",
                tokio::spawn(backup.run(
                    self.table.clone(),
                    cfg.backup_interval(),
                    self.shutdown.subscribe(),
                )),
            ));
            info!("Auto-networking enabled, exchanging endpoints via {}", target);
        }

        info!("Manager started {} tasks", self.tasks.len());
        Ok(())
    }

    /// Stops every task and waits for them. The discovery socket is closed
    /// when its tasks finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.drain(..).unzip();
        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                warn!("Task {} ended abnormally: {}", name, e);
            }
        }

        if self.config.dns.enabled {
            self.caps.dns.shutdown().await;
        }
        self.table.clear_local().await;
        info!("Manager stopped");
    }
}
