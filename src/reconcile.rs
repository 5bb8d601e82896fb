//! Reconciliation loop.
//!
//! Each pass takes a snapshot of the peer table and the static files,
//! computes the complete desired network state and pushes every category
//! to its collaborator. Nothing is diffed here: the collaborators are
//! expected to converge when handed the same state again, which is what
//! lets the heartbeat repair state that was changed behind our back.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::apply::Capabilities;
use crate::config::Config;
use crate::debounce::Trigger;
use crate::sources::{StaticConfig, StaticSources};
use crate::table::PeerTable;
use crate::types::{
    DesiredNetworkState, Endpoint, NatRule, PeerDescriptor, RealServer, ServiceRule,
};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub masq_outgoing: bool,
    pub enable_proxy: bool,
    pub local_certs: Vec<String>,
}

impl ReconcileSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            masq_outgoing: cfg.masq_outgoing,
            enable_proxy: cfg.enable_proxy,
            local_certs: cfg.local_certs.clone(),
        }
    }
}

fn is_ipv6_cidr(cidr: &str) -> bool {
    cidr.contains(':')
}

/// Computes the full desired state from a table snapshot and the static
/// configuration.
pub fn compute_desired_state(
    snapshot: &[Endpoint],
    static_cfg: Option<&StaticConfig>,
    settings: &ReconcileSettings,
) -> DesiredNetworkState {
    let local = snapshot.iter().find(|ep| ep.is_local());
    let local_name = local.map(|ep| ep.name.as_str());

    // Static peers win over discovered ones with the same name.
    let mut peers: BTreeMap<&str, &Endpoint> = BTreeMap::new();
    for ep in snapshot.iter().filter(|ep| !ep.is_local()) {
        peers.insert(ep.name.as_str(), ep);
    }
    if let Some(cfg) = static_cfg {
        for ep in &cfg.network.peers {
            peers.insert(ep.name.as_str(), ep);
        }
    }
    if let Some(name) = local_name {
        peers.remove(name);
    }

    let tunnel_peers: Vec<PeerDescriptor> = peers
        .values()
        .filter(|ep| !ep.subnets.is_empty())
        .map(|ep| PeerDescriptor {
            name: ep.name.clone(),
            id: ep.tunnel_id().to_string(),
            public_addresses: ep.public_addresses.clone(),
            remote_subnets: ep.subnets.clone(),
            remote_node_subnets: ep.node_subnets.clone(),
            local_certs: settings.local_certs.clone(),
        })
        .collect();

    let mut nat_v4 = Vec::new();
    let mut nat_v6 = Vec::new();
    if let (true, Some(local)) = (settings.masq_outgoing, local) {
        let known: BTreeSet<&str> = std::iter::once(local)
            .chain(peers.values().copied())
            .flat_map(|ep| ep.subnets.iter().chain(ep.node_subnets.iter()))
            .map(String::as_str)
            .collect();

        for source in &local.subnets {
            let v6 = is_ipv6_cidr(source);
            let rule = NatRule {
                source: source.clone(),
                excluded_destinations: known
                    .iter()
                    .filter(|cidr| is_ipv6_cidr(cidr) == v6)
                    .map(|cidr| cidr.to_string())
                    .collect(),
            };
            if v6 {
                nat_v6.push(rule);
            } else {
                nat_v4.push(rule);
            }
        }
    }

    let service_rules = settings.enable_proxy.then(|| {
        let mut rules: Vec<ServiceRule> = static_cfg
            .map(|cfg| cfg.services.as_slice())
            .unwrap_or_default()
            .iter()
            .flat_map(|svc| {
                svc.ports.iter().map(move |port| ServiceRule {
                    service: svc.qualified_name(),
                    virtual_address: svc.cluster_ip.clone(),
                    port: port.port,
                    protocol: port.protocol.to_uppercase(),
                    real_servers: svc
                        .endpoints
                        .iter()
                        .map(|ep| RealServer {
                            address: ep.ip.clone(),
                            port: port.target_port.unwrap_or(port.port),
                        })
                        .collect(),
                })
            })
            .collect();
        rules.sort_by(|a, b| {
            (&a.virtual_address, a.port, &a.protocol).cmp(&(
                &b.virtual_address,
                b.port,
                &b.protocol,
            ))
        });
        rules
    });

    DesiredNetworkState {
        tunnel_peers,
        nat_v4,
        nat_v6,
        service_rules,
    }
}

/// Categories that failed to apply in one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub failed: Vec<&'static str>,
}

impl ApplyReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Reconciler {
    table: PeerTable,
    sources: StaticSources,
    settings: ReconcileSettings,
    caps: Capabilities,
    last_static: Option<StaticConfig>,
    passes: u64,
}

impl Reconciler {
    pub fn new(
        table: PeerTable,
        sources: StaticSources,
        settings: ReconcileSettings,
        caps: Capabilities,
    ) -> Self {
        Self {
            table,
            sources,
            settings,
            caps,
            last_static: None,
            passes: 0,
        }
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Re-reads the static files, keeping the last good copy on failure.
    async fn refresh_static(&mut self) {
        match self.sources.load() {
            Ok(cfg) => {
                self.table.set_local(cfg.network.local.clone()).await;
                self.last_static = Some(cfg);
            }
            Err(e) if self.last_static.is_some() => {
                warn!("Keeping previous static configuration: {}", e);
            }
            Err(e) => warn!("No static configuration available: {}", e),
        }
    }

    /// Runs one full pass: snapshot, compute, apply.
    pub async fn reconcile_once(&mut self) -> ApplyReport {
        self.refresh_static().await;
        let snapshot = self.table.snapshot().await;
        let state = compute_desired_state(&snapshot, self.last_static.as_ref(), &self.settings);
        self.passes += 1;
        debug!(
            "Reconcile pass {}: {} tunnel peers, {} NAT rules, {} service rules",
            self.passes,
            state.tunnel_peers.len(),
            state.nat_v4.len() + state.nat_v6.len(),
            state.service_rules.as_ref().map_or(0, Vec::len)
        );
        self.apply(&state).await
    }

    /// Applies every category. A failing category does not stop the
    /// others; it is retried on the next pass.
    pub async fn apply(&self, state: &DesiredNetworkState) -> ApplyReport {
        let proxy = async {
            match &state.service_rules {
                Some(rules) => self.caps.proxy.apply_service_rules(rules).await,
                None => Ok(()),
            }
        };
        let (tunnel, nat_v4, nat_v6, proxy) = tokio::join!(
            self.caps.tunnel.apply_peers(&state.tunnel_peers),
            self.caps.nat_v4.apply_nat_rules(&state.nat_v4),
            self.caps.nat_v6.apply_nat_rules(&state.nat_v6),
            proxy,
        );

        let mut report = ApplyReport::default();
        for (category, result) in [
            ("tunnel", tunnel),
            ("nat-ipv4", nat_v4),
            ("nat-ipv6", nat_v6),
            ("proxy", proxy),
        ] {
            if let Err(e) = result {
                error!("Failed to apply {} configuration: {}", category, e);
                report.failed.push(category);
            }
        }
        report
    }

    /// Runs a pass on every coalesced trigger and every `sync_period`.
    /// A pass that has started always completes, even on shutdown.
    pub async fn run(
        mut self,
        mut trigger: Trigger,
        sync_period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(sync_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Reconciler started, sync period {:?}", sync_period);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(()) = trigger.recv() => debug!("Reconcile triggered by change"),
                _ = heartbeat.tick() => debug!("Reconcile triggered by heartbeat"),
            }
            self.reconcile_once().await;
        }
        info!("Reconciler stopped after {} passes", self.passes);
    }
}
