//! Data structures shared across the agent.
//!
//! Endpoints are the unit of peer state: they are announced over the
//! discovery medium, stored in the peer table, persisted by the backup
//! store and turned into tunnel/NAT/proxy rules at reconciliation time.
//! Wire and file formats use camelCase field names so the documents stay
//! compatible with the tunnels file written by the cloud side.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Whether an endpoint describes this node or one of its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointKind {
    /// This node's own identity. Never expired, never discovered.
    Local,
    #[default]
    Remote,
}

/// Network identity of a mesh participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    /// Tunnel identity (certificate subject). Empty for discovered peers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub public_addresses: Vec<String>,
    /// CIDR ranges routable through this endpoint.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// CIDR ranges for node-local traffic.
    #[serde(default)]
    pub node_subnets: Vec<String>,
    #[serde(skip)]
    pub kind: EndpointKind,
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Endpoint {
    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            public_addresses: Vec::new(),
            subnets: Vec::new(),
            node_subnets: Vec::new(),
            kind: EndpointKind::Remote,
            last_seen: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == EndpointKind::Local
    }

    /// The identity used by the tunnel subsystem for this endpoint.
    pub fn tunnel_id(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }

    /// Compares the routing-relevant content, ignoring freshness and kind.
    pub fn same_content(&self, other: &Endpoint) -> bool {
        self.name == other.name
            && self.id == other.id
            && self.public_addresses == other.public_addresses
            && self.subnets == other.subnets
            && self.node_subnets == other.node_subnets
    }
}

/// Record broadcast by the discovery transport.
///
/// The token is the shared secret of the LAN segment; receivers drop any
/// message whose token does not match theirs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub token: String,
    pub endpoint_name: String,
    #[serde(default)]
    pub public_addresses: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub node_subnets: Vec<String>,
    /// Milliseconds since the Unix epoch at the sender.
    pub sent_at: u64,
}

impl Announcement {
    pub fn from_endpoint(token: &str, endpoint: &Endpoint, sent_at: u64) -> Self {
        Self {
            token: token.to_string(),
            endpoint_name: endpoint.name.clone(),
            public_addresses: endpoint.public_addresses.clone(),
            subnets: endpoint.subnets.clone(),
            node_subnets: endpoint.node_subnets.clone(),
            sent_at,
        }
    }

    /// Converts the announcement into a remote endpoint. The token is not
    /// carried over.
    pub fn into_endpoint(self) -> Endpoint {
        Endpoint {
            name: self.endpoint_name,
            id: String::new(),
            public_addresses: self.public_addresses,
            subnets: self.subnets,
            node_subnets: self.node_subnets,
            kind: EndpointKind::Remote,
            last_seen: None,
        }
    }
}

// Keeps the shared secret out of logs.
impl std::fmt::Debug for Announcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announcement")
            .field("token", &"<redacted>")
            .field("endpoint_name", &self.endpoint_name)
            .field("public_addresses", &self.public_addresses)
            .field("subnets", &self.subnets)
            .field("node_subnets", &self.node_subnets)
            .field("sent_at", &self.sent_at)
            .finish()
    }
}

/// A tunnel peer handed to the tunnel subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub name: String,
    pub id: String,
    pub public_addresses: Vec<String>,
    pub remote_subnets: Vec<String>,
    pub remote_node_subnets: Vec<String>,
    pub local_certs: Vec<String>,
}

/// Outbound masquerade for traffic originating in `source` unless it is
/// heading for one of `excluded_destinations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatRule {
    pub source: String,
    pub excluded_destinations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealServer {
    pub address: String,
    pub port: u16,
}

/// One virtual service: traffic to `virtual_address:port` is balanced
/// across `real_servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRule {
    pub service: String,
    pub virtual_address: String,
    pub port: u16,
    pub protocol: String,
    pub real_servers: Vec<RealServer>,
}

/// Configuration computed from the table at reconciliation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredNetworkState {
    pub tunnel_peers: Vec<PeerDescriptor>,
    pub nat_v4: Vec<NatRule>,
    pub nat_v6: Vec<NatRule>,
    /// `None` when the proxy feature is disabled.
    pub service_rules: Option<Vec<ServiceRule>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_uses_camel_case_on_the_wire() {
        let mut ep = Endpoint::remote("edge-1");
        ep.public_addresses = vec!["10.0.0.1".into()];
        ep.subnets = vec!["2.2.0.0/24".into()];
        let msg = Announcement::from_endpoint("secret", &ep, 42);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["endpointName"], "edge-1");
        assert_eq!(json["publicAddresses"][0], "10.0.0.1");
        assert_eq!(json["nodeSubnets"].as_array().unwrap().len(), 0);
        assert_eq!(json["sentAt"], 42);
    }

    #[test]
    fn announcement_debug_hides_token() {
        let msg = Announcement::from_endpoint("top-secret", &Endpoint::remote("a"), 0);
        let printed = format!("{:?}", msg);
        assert!(!printed.contains("top-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn endpoint_file_format_skips_freshness() {
        let yaml_like = r#"{"name":"edge-2","id":"C=CN, CN=edge-2","subnets":["2.2.1.0/24"]}"#;
        let ep: Endpoint = serde_json::from_str(yaml_like).unwrap();
        assert_eq!(ep.kind, EndpointKind::Remote);
        assert!(ep.last_seen.is_none());
        assert_eq!(ep.tunnel_id(), "C=CN, CN=edge-2");

        let back = serde_json::to_value(&ep).unwrap();
        assert!(back.get("lastSeen").is_none());
        assert!(back.get("kind").is_none());
    }

    #[test]
    fn tunnel_id_falls_back_to_name() {
        assert_eq!(Endpoint::remote("edge-3").tunnel_id(), "edge-3");
    }
}
