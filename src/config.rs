use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal startup configuration problems. The process exits before any
/// task is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("failed to read multicast token file {path}: {source}")]
    TokenFile {
        path: String,
        source: std::io::Error,
    },
    #[error("the least debounce value is 1 second, got {0:?}")]
    DebounceTooShort(Duration),
    #[error("the least sync period value is 1 second, got {0:?}")]
    SyncPeriodTooShort(Duration),
    #[error("invalid multicast address {0:?}")]
    InvalidMulticastAddress(String),
    #[error("multicast token is required when auto-networking is enabled")]
    MissingToken,
    #[error("invalid DNS bind IP address {0:?}")]
    InvalidDnsBindIp(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    pub enabled: bool,
    pub bind_ip: String,
    pub cluster_domain: String,
    pub debug: bool,
    pub probe: bool,
    /// Resolver binary started with the rendered Corefile. When unset the
    /// Corefile is only written to the working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver_command: Option<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_ip: "169.254.25.10".into(),
            cluster_domain: "cluster.local".into(),
            debug: false,
            probe: false,
            resolver_command: None,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub tunnels_conf: PathBuf,
    pub services_conf: PathBuf,
    pub local_certs: Vec<String>,
    pub debounce_ms: u64,
    pub sync_period_ms: u64,
    pub masq_outgoing: bool,
    pub enable_proxy: bool,
    pub dns: DnsConfig,
    pub auto_networking: bool,
    pub multicast_address: String,
    pub multicast_token: String,
    pub multicast_interval_ms: u64,
    pub endpoint_ttl_ms: u64,
    pub backup_interval_ms: u64,
    pub workdir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnels_conf: "/etc/fabedge/tunnels.yaml".into(),
            services_conf: "/etc/fabedge/services.yaml".into(),
            local_certs: vec!["edgecert.pem".into()],
            debounce_ms: 1_000,
            sync_period_ms: 30_000,
            masq_outgoing: true,
            enable_proxy: true,
            dns: DnsConfig::default(),
            auto_networking: false,
            multicast_address: "239.40.20.81:18080".into(),
            multicast_token: String::new(),
            multicast_interval_ms: 5_000,
            endpoint_ttl_ms: 20_000,
            backup_interval_ms: 10_000,
            workdir: "/var/lib/fabedge".into(),
        }
    }
}

// The token must never reach the logs, so Debug is written by hand.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = if self.multicast_token.is_empty() {
            "<empty>"
        } else {
            "<redacted>"
        };
        f.debug_struct("Config")
            .field("tunnels_conf", &self.tunnels_conf)
            .field("services_conf", &self.services_conf)
            .field("local_certs", &self.local_certs)
            .field("debounce_ms", &self.debounce_ms)
            .field("sync_period_ms", &self.sync_period_ms)
            .field("masq_outgoing", &self.masq_outgoing)
            .field("enable_proxy", &self.enable_proxy)
            .field("dns", &self.dns)
            .field("auto_networking", &self.auto_networking)
            .field("multicast_address", &self.multicast_address)
            .field("multicast_token", &token)
            .field("multicast_interval_ms", &self.multicast_interval_ms)
            .field("endpoint_ttl_ms", &self.endpoint_ttl_ms)
            .field("backup_interval_ms", &self.backup_interval_ms)
            .field("workdir", &self.workdir)
            .finish()
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("edge-agent.toml"))
                .merge(Json::file("edge-agent.json"))
                .merge(Env::prefixed("EDGE_AGENT_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Config = figment.extract()?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("EDGE_AGENT_MULTICAST_TOKEN_FILE") {
            config.multicast_token = std::fs::read_to_string(&secret_file)
                .map_err(|source| ConfigError::TokenFile {
                    path: secret_file.clone(),
                    source,
                })?
                .trim()
                .to_string();
        }

        Ok(config)
    }

    /// Checks the configuration before anything starts. A TTL too short
    /// to survive one lost announcement is raised to twice the interval
    /// instead of being rejected.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.debounce() < Duration::from_secs(1) {
            return Err(ConfigError::DebounceTooShort(self.debounce()));
        }

        if self.sync_period() < Duration::from_secs(1) {
            return Err(ConfigError::SyncPeriodTooShort(self.sync_period()));
        }

        if self.auto_networking {
            self.multicast_group()?;

            if self.multicast_token.is_empty() {
                return Err(ConfigError::MissingToken);
            }

            // A TTL shorter than one interval would evict healthy peers
            // between announcements.
            if self.endpoint_ttl_ms < self.multicast_interval_ms {
                self.endpoint_ttl_ms = 2 * self.multicast_interval_ms;
            }
        }

        if self.dns.enabled && self.dns.bind_ip.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidDnsBindIp(self.dns.bind_ip.clone()));
        }

        Ok(())
    }

    /// Parses the discovery address. Unlike a plain `host:port` check, this
    /// requires a literal multicast group, since the receiver has to join it
    /// and a hostname or unicast address would only fail later at bind time.
    pub fn multicast_group(&self) -> Result<SocketAddr, ConfigError> {
        let addr: SocketAddr = self
            .multicast_address
            .parse()
            .map_err(|_| ConfigError::InvalidMulticastAddress(self.multicast_address.clone()))?;
        if !addr.ip().is_multicast() {
            return Err(ConfigError::InvalidMulticastAddress(
                self.multicast_address.clone(),
            ));
        }
        Ok(addr)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync_period_ms)
    }

    pub fn multicast_interval(&self) -> Duration {
        Duration::from_millis(self.multicast_interval_ms)
    }

    pub fn endpoint_ttl(&self) -> Duration {
        Duration::from_millis(self.endpoint_ttl_ms)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }
}
