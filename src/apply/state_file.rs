//! Appliers that publish each category of desired state as a JSON
//! document for the agents that program the kernel.
//!
//! A document is only rewritten when its content changes, so applying
//! the same state twice leaves the files (and their mtimes) untouched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;

use super::{ApplyError, NatApplier, ProxyApplier, TunnelApplier};
use crate::types::{NatRule, PeerDescriptor, ServiceRule};

pub const STATE_DIR: &str = "state";

/// Present when the kernel has the IPVS load balancer loaded.
const IPVS_PROBE: &str = "/proc/net/ip_vs";

#[derive(Debug, Clone)]
struct StateFile {
    path: PathBuf,
}

impl StateFile {
    fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
        }
    }

    /// Returns whether the document was rewritten.
    async fn publish<T: Serialize + ?Sized>(&self, doc: &T) -> Result<bool, ApplyError> {
        let data = serde_json::to_vec_pretty(doc)?;

        if let Ok(existing) = tokio::fs::read(&self.path).await {
            if existing == data {
                debug!("{} unchanged", self.path.display());
                return Ok(false);
            }
        }

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let temp_file = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_file, &data).await?;
        tokio::fs::rename(&temp_file, &self.path).await?;
        Ok(true)
    }
}

pub struct TunnelStateFile {
    file: StateFile,
}

impl TunnelStateFile {
    pub fn new(dir: &Path) -> Self {
        Self {
            file: StateFile::new(dir, "tunnels.json"),
        }
    }
}

#[async_trait]
impl TunnelApplier for TunnelStateFile {
    async fn apply_peers(&self, peers: &[PeerDescriptor]) -> Result<(), ApplyError> {
        if self.file.publish(peers).await? {
            info!("Published {} tunnel peers", peers.len());
        }
        Ok(())
    }
}

pub struct NatStateFile {
    file: StateFile,
}

impl NatStateFile {
    pub fn v4(dir: &Path) -> Self {
        Self {
            file: StateFile::new(dir, "nat-ipv4.json"),
        }
    }

    pub fn v6(dir: &Path) -> Self {
        Self {
            file: StateFile::new(dir, "nat-ipv6.json"),
        }
    }
}

#[async_trait]
impl NatApplier for NatStateFile {
    async fn apply_nat_rules(&self, rules: &[NatRule]) -> Result<(), ApplyError> {
        if self.file.publish(rules).await? {
            info!(
                "Published {} NAT rules to {}",
                rules.len(),
                self.file.path.display()
            );
        }
        Ok(())
    }
}

pub struct ProxyStateFile {
    file: StateFile,
    probe: PathBuf,
}

impl ProxyStateFile {
    pub fn new(dir: &Path) -> Self {
        Self {
            file: StateFile::new(dir, "services.json"),
            probe: IPVS_PROBE.into(),
        }
    }

    /// Overrides the path whose presence signals IPVS support.
    pub fn with_probe(mut self, probe: impl Into<PathBuf>) -> Self {
        self.probe = probe.into();
        self
    }
}

#[async_trait]
impl ProxyApplier for ProxyStateFile {
    async fn check_support(&self) -> Result<(), ApplyError> {
        if tokio::fs::metadata(&self.probe).await.is_ok() {
            Ok(())
        } else {
            Err(ApplyError::Unsupported(format!(
                "IPVS is not available ({} missing); load the ip_vs module or disable the proxy",
                self.probe.display()
            )))
        }
    }

    async fn apply_service_rules(&self, rules: &[ServiceRule]) -> Result<(), ApplyError> {
        if self.file.publish(rules).await? {
            info!("Published {} service rules", rules.len());
        }
        Ok(())
    }
}
