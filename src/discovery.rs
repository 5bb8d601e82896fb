//! LAN endpoint discovery over UDP multicast.
//!
//! Every node periodically multicasts its own endpoint, tagged with the
//! shared token of the segment, and listens for the announcements of
//! the others. Delivery is best effort: nothing is acknowledged and a
//! lost datagram is simply replaced by the next tick's.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::debounce::Debouncer;
use crate::table::{PeerTable, Upsert};
use crate::types::Announcement;

/// Largest announcement we send; keeps it in a single unfragmented
/// datagram on common MTUs.
pub const MAX_ANNOUNCEMENT_SIZE: usize = 1400;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// What happened to an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Accepted(Upsert),
    /// Our own announcement looped back by the network.
    SelfAnnouncement,
    /// Token mismatch.
    Rejected,
    Malformed,
}

/// Creates a socket bound to the group port and joined to the group.
pub async fn bind_multicast(group: SocketAddr) -> io::Result<UdpSocket> {
    match group.ip() {
        IpAddr::V4(ip) => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port())).await?;
            socket.join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)?;
            socket.set_multicast_loop_v4(true)?;
            Ok(socket)
        }
        IpAddr::V6(ip) => {
            let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, group.port())).await?;
            socket.join_multicast_v6(&ip, 0)?;
            socket.set_multicast_loop_v6(true)?;
            Ok(socket)
        }
    }
}

/// Short, non-reversible tag of the token so operators can check two
/// nodes share a token without the token ever being logged.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}

fn token_matches(expected: &[u8; 32], presented: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    // Fixed-length digests, compared without early exit.
    expected
        .iter()
        .zip(presented.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct Discovery {
    socket: UdpSocket,
    target: SocketAddr,
    token: String,
    token_digest: [u8; 32],
    table: PeerTable,
    debouncer: Debouncer,
    rejected: AtomicU64,
}

impl Discovery {
    /// `target` is where announcements are sent, normally the multicast
    /// group the socket has joined.
    pub fn new(
        socket: UdpSocket,
        target: SocketAddr,
        token: impl Into<String>,
        table: PeerTable,
        debouncer: Debouncer,
    ) -> Arc<Self> {
        let token = token.into();
        let mut token_digest = [0u8; 32];
        token_digest.copy_from_slice(&Sha256::digest(token.as_bytes()));
        Arc::new(Self {
            socket,
            target,
            token,
            token_digest,
            table,
            debouncer,
            rejected: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of announcements dropped for a token mismatch.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Sends one announcement of the local endpoint. Returns `false` when
    /// there was nothing to send.
    pub async fn announce_once(&self) -> io::Result<bool> {
        let Some(local) = self.table.local().await else {
            debug!("No local endpoint yet, skipping announcement");
            return Ok(false);
        };

        let msg = Announcement::from_endpoint(&self.token, &local, now_millis());
        let bytes = serde_json::to_vec(&msg)?;
        if bytes.len() > MAX_ANNOUNCEMENT_SIZE {
            warn!(
                "Announcement for {} is {} bytes, over the {} byte limit; not sending",
                local.name,
                bytes.len(),
                MAX_ANNOUNCEMENT_SIZE
            );
            return Ok(false);
        }

        self.socket.send_to(&bytes, self.target).await?;
        debug!("Announced {} to {}", local.name, self.target);
        Ok(true)
    }

    pub async fn announce_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Announcing local endpoint to {} every {:?} (token {})",
            self.target,
            interval,
            token_fingerprint(&self.token)
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.announce_once().await {
                error!("Failed to send announcement: {}", e);
            }
        }
        debug!("Announcer stopped");
    }

    pub async fn receive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };

            match received {
                Ok((len, from)) => {
                    self.ingest(&buf[..len], from).await;
                }
                Err(e) => {
                    error!("Failed to receive announcement: {}", e);
                    // Avoid spinning on a persistently failing socket.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Receiver stopped");
    }

    /// Authenticates and applies one inbound datagram.
    pub async fn ingest(&self, bytes: &[u8], from: SocketAddr) -> Ingest {
        let msg: Announcement = match serde_json::from_slice(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping malformed announcement from {}: {}", from, e);
                return Ingest::Malformed;
            }
        };

        if !token_matches(&self.token_digest, &msg.token) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping announcement from {} with mismatched token", from);
            return Ingest::Rejected;
        }

        if let Some(local) = self.table.local().await {
            if local.name == msg.endpoint_name {
                return Ingest::SelfAnnouncement;
            }
        }

        let name = msg.endpoint_name.clone();
        let outcome = self.table.upsert(msg.into_endpoint()).await;
        match outcome {
            Upsert::Ignored => return Ingest::SelfAnnouncement,
            Upsert::Inserted => {
                info!("Discovered endpoint {} at {}", name, from);
                self.debouncer.signal();
            }
            Upsert::Replaced { changed: true } => {
                info!("Endpoint {} changed", name);
                self.debouncer.signal();
            }
            // Only `last_seen` moved; desired state is unaffected.
            Upsert::Replaced { changed: false } => debug!("Refreshed endpoint {}", name),
        }
        Ingest::Accepted(outcome)
    }
}
