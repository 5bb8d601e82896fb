//! Capabilities used to push desired state to the subsystems that
//! enforce it: the tunnel manager, one packet filter per address family,
//! the service proxy and the DNS resolver.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::DnsConfig;
use crate::types::{NatRule, PeerDescriptor, ServiceRule};

pub mod dns;
pub mod state_file;

pub use dns::{render_corefile, CorefileConfigurer};
pub use state_file::{NatStateFile, ProxyStateFile, TunnelStateFile};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Rejected(String),
}

/// Receives the full set of tunnel peers on every pass. Must be
/// idempotent.
#[async_trait]
pub trait TunnelApplier: Send + Sync {
    async fn apply_peers(&self, peers: &[PeerDescriptor]) -> Result<(), ApplyError>;
}

/// One instance per address family.
#[async_trait]
pub trait NatApplier: Send + Sync {
    async fn apply_nat_rules(&self, rules: &[NatRule]) -> Result<(), ApplyError>;
}

#[async_trait]
pub trait ProxyApplier: Send + Sync {
    /// Checked once at startup; an error there is fatal.
    async fn check_support(&self) -> Result<(), ApplyError>;
    async fn apply_service_rules(&self, rules: &[ServiceRule]) -> Result<(), ApplyError>;
}

/// Renders the resolver configuration and hands it to the resolver.
#[async_trait]
pub trait DnsConfigurer: Send + Sync {
    async fn configure(&self, dns: &DnsConfig, workdir: &Path) -> Result<(), ApplyError>;
    /// Stops whatever `configure` started.
    async fn shutdown(&self) {}
}

/// The collaborator handles owned by the reconciliation loop.
#[derive(Clone)]
pub struct Capabilities {
    pub tunnel: Arc<dyn TunnelApplier>,
    pub nat_v4: Arc<dyn NatApplier>,
    pub nat_v6: Arc<dyn NatApplier>,
    pub proxy: Arc<dyn ProxyApplier>,
    pub dns: Arc<dyn DnsConfigurer>,
}

impl Capabilities {
    /// State-file adapters under `workdir/state`, consumed by the
    /// external tunnel, packet-filter and proxy agents.
    pub fn state_files(workdir: &Path, dns: &DnsConfig) -> Self {
        let dir = workdir.join(state_file::STATE_DIR);
        Self {
            tunnel: Arc::new(TunnelStateFile::new(&dir)),
            nat_v4: Arc::new(NatStateFile::v4(&dir)),
            nat_v6: Arc::new(NatStateFile::v6(&dir)),
            proxy: Arc::new(ProxyStateFile::new(&dir)),
            dns: Arc::new(CorefileConfigurer::new(dns.resolver_command.clone())),
        }
    }
}
