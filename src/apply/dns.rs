//! Resolver configuration.
//!
//! The agent does not answer DNS queries itself: it renders a Corefile
//! for the embedded resolver and, when a resolver binary is configured,
//! starts it with that file.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{info, warn};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{ApplyError, DnsConfigurer};
use crate::config::DnsConfig;

pub const COREFILE_NAME: &str = "Corefile";

/// Renders the resolver document for `dns`.
pub fn render_corefile(dns: &DnsConfig) -> String {
    let mut out = String::new();
    out.push_str(".:53 {\n    errors\n");
    if dns.debug {
        out.push_str("    log\n    debug\n");
    }
    let _ = writeln!(
        out,
        "    kubernetes {} in-addr.arpa ip6.arpa {{",
        dns.cluster_domain
    );
    out.push_str("      endpoint http://127.0.0.1:10550\n");
    out.push_str("      pods insecure\n");
    out.push_str("      fallthrough in-addr.arpa ip6.arpa\n");
    out.push_str("    }\n");
    out.push_str("    forward . /etc/resolv.conf {\n      prefer_udp\n    }\n");
    if dns.probe {
        out.push_str("    health {\n        lameduck 5s\n    }\n    ready\n");
    }
    out.push_str("    cache 30\n    loop\n    reload\n");
    let _ = writeln!(out, "    bind {}", dns.bind_ip);
    out.push_str("}\n");
    out
}

pub struct CorefileConfigurer {
    resolver_command: Option<String>,
    child: Mutex<Option<Child>>,
}

impl CorefileConfigurer {
    pub fn new(resolver_command: Option<String>) -> Self {
        Self {
            resolver_command,
            child: Mutex::new(None),
        }
    }

    pub fn corefile_path(workdir: &Path) -> PathBuf {
        workdir.join(COREFILE_NAME)
    }
}

#[async_trait]
impl DnsConfigurer for CorefileConfigurer {
    async fn configure(&self, dns: &DnsConfig, workdir: &Path) -> Result<(), ApplyError> {
        let path = Self::corefile_path(workdir);
        tokio::fs::create_dir_all(workdir).await?;
        tokio::fs::write(&path, render_corefile(dns)).await?;
        info!("Wrote resolver configuration to {}", path.display());

        let Some(command) = &self.resolver_command else {
            return Ok(());
        };

        let mut child = self.child.lock().await;
        if child.is_some() {
            // The resolver reloads the Corefile by itself.
            return Ok(());
        }
        let spawned = Command::new(command)
            .arg("-conf")
            .arg(&path)
            .kill_on_drop(true)
            .spawn()?;
        info!("Started resolver {} (pid {:?})", command, spawned.id());
        *child = Some(spawned);
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop resolver: {}", e);
            }
        }
    }
}
