//! Integration test: two agents exchanging endpoints over loopback UDP.
//!
//! Each node announces to the other's socket instead of a multicast group
//! so the test does not depend on multicast routing on the host.

use std::path::Path;
use std::time::{Duration, Instant};

use edge_agent::apply::Capabilities;
use edge_agent::table::PeerTable;
use edge_agent::{Config, Manager};
use tempfile::TempDir;
use tokio::net::UdpSocket;

const INTERVAL_MS: u64 = 200;
const TTL_MS: u64 = 600;

fn node_config(dir: &Path, name: &str, subnet: &str, token: &str) -> Config {
    let tunnels = dir.join("tunnels.yaml");
    std::fs::write(
        &tunnels,
        format!(
            "local:\n  name: {name}\n  publicAddresses: [\"127.0.0.1\"]\n  \
             subnets: [\"{subnet}\"]\n"
        ),
    )
    .unwrap();

    let mut cfg = Config {
        tunnels_conf: tunnels,
        services_conf: dir.join("services.yaml"),
        workdir: dir.join("work"),
        enable_proxy: false,
        auto_networking: true,
        multicast_token: token.into(),
        multicast_interval_ms: INTERVAL_MS,
        endpoint_ttl_ms: TTL_MS,
        ..Config::default()
    };
    cfg.validate().unwrap();
    cfg
}

async fn start_node(cfg: Config, socket: UdpSocket, target: std::net::SocketAddr) -> Manager {
    let caps = Capabilities::state_files(&cfg.workdir, &cfg.dns);
    let mut manager = Manager::new(cfg, caps).await.unwrap();
    manager.start_with_socket(socket, target).await.unwrap();
    manager
}

async fn wait_for(table: &PeerTable, name: &str, present: bool, limit: Duration) -> Duration {
    let started = Instant::now();
    while started.elapsed() < limit {
        if table.get(name).await.is_some() == present {
            return started.elapsed();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "{} was still {} after {:?}",
        name,
        if present { "absent" } else { "present" },
        limit
    );
}

#[tokio::test]
async fn nodes_discover_and_expire_each_other() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let socket_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let socket_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = socket_a.local_addr().unwrap();
    let addr_b = socket_b.local_addr().unwrap();

    let node_a = start_node(
        node_config(dir_a.path(), "node-a", "2.2.1.0/24", "shared"),
        socket_a,
        addr_b,
    )
    .await;
    let node_b = start_node(
        node_config(dir_b.path(), "node-b", "2.2.2.0/24", "shared"),
        socket_b,
        addr_a,
    )
    .await;

    let table_a = node_a.table();
    let table_b = node_b.table();

    // Within one interval plus tolerance for the first reconcile pass.
    wait_for(&table_b, "node-a", true, Duration::from_secs(3)).await;
    wait_for(&table_a, "node-b", true, Duration::from_secs(3)).await;

    let seen = table_b.get("node-a").await.unwrap();
    assert_eq!(seen.subnets, vec!["2.2.1.0/24".to_string()]);
    assert!(!seen.is_local());
    assert_eq!(table_b.local().await.unwrap().name, "node-b");

    // A goes away; B evicts it once the TTL has passed.
    node_a.stop().await;
    let gone_after = wait_for(&table_b, "node-a", false, Duration::from_secs(5)).await;
    assert!(gone_after >= Duration::from_millis(TTL_MS / 2));
    assert!(table_b.local().await.is_some());

    // The final backup no longer carries the evicted peer.
    node_b.stop().await;
    let backup = std::fs::read_to_string(dir_b.path().join("work/endpoints.json")).unwrap();
    assert!(!backup.contains("node-a"));
}

#[tokio::test]
async fn wrong_token_is_never_ingested() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let socket_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let socket_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = socket_a.local_addr().unwrap();
    let addr_b = socket_b.local_addr().unwrap();

    let intruder = start_node(
        node_config(dir_a.path(), "intruder", "6.6.6.0/24", "guess"),
        socket_a,
        addr_b,
    )
    .await;
    let node_b = start_node(
        node_config(dir_b.path(), "node-b", "2.2.2.0/24", "shared"),
        socket_b,
        addr_a,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(INTERVAL_MS * 6)).await;
    assert!(node_b.table().get("intruder").await.is_none());
    assert!(intruder.table().get("node-b").await.is_none());

    intruder.stop().await;
    node_b.stop().await;
}
