//! Peer endpoint table.
//!
//! The table is the only piece of shared mutable state in the agent.
//! Writers (discovery, the sweeper, static config loading, backup restore)
//! take the write lock for the duration of a single entry update; readers
//! get an owned snapshot so they never hold the lock while doing I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::{Endpoint, EndpointKind};

/// Outcome of [`PeerTable::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// An entry with the same name existed and was replaced.
    Replaced { changed: bool },
    /// The name belongs to the local endpoint; nothing was written.
    Ignored,
}

#[derive(Clone, Default)]
pub struct PeerTable {
    inner: Arc<RwLock<HashMap<String, Endpoint>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces this node's own endpoint.
    pub async fn set_local(&self, mut endpoint: Endpoint) {
        endpoint.kind = EndpointKind::Local;
        endpoint.last_seen = None;
        let mut map = self.inner.write().await;
        // The local name may have changed; drop the previous local entry.
        map.retain(|_, ep| !ep.is_local());
        map.insert(endpoint.name.clone(), endpoint);
    }

    pub async fn local(&self) -> Option<Endpoint> {
        let map = self.inner.read().await;
        map.values().find(|ep| ep.is_local()).cloned()
    }

    /// Inserts or replaces a remote endpoint and refreshes its `last_seen`.
    pub async fn upsert(&self, mut endpoint: Endpoint) -> Upsert {
        endpoint.kind = EndpointKind::Remote;
        endpoint.last_seen = Some(Instant::now());

        let mut map = self.inner.write().await;
        match map.get(&endpoint.name) {
            Some(existing) if existing.is_local() => Upsert::Ignored,
            Some(existing) => {
                let changed = !existing.same_content(&endpoint);
                map.insert(endpoint.name.clone(), endpoint);
                Upsert::Replaced { changed }
            }
            None => {
                map.insert(endpoint.name.clone(), endpoint);
                Upsert::Inserted
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Endpoint> {
        self.inner.read().await.get(name).cloned()
    }

    /// Removes a remote endpoint. The local entry cannot be deleted here.
    pub async fn delete(&self, name: &str) -> Option<Endpoint> {
        let mut map = self.inner.write().await;
        match map.get(name) {
            Some(ep) if ep.is_local() => None,
            Some(_) => map.remove(name),
            None => None,
        }
    }

    /// Owned copy of every entry, local included.
    pub async fn snapshot(&self) -> Vec<Endpoint> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn remotes(&self) -> Vec<Endpoint> {
        self.inner
            .read()
            .await
            .values()
            .filter(|ep| !ep.is_local())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Evicts remote entries not refreshed within `ttl` of `now` and
    /// returns their names.
    pub async fn expire(&self, ttl: Duration, now: Instant) -> Vec<String> {
        let mut map = self.inner.write().await;
        let stale: Vec<String> = map
            .values()
            .filter(|ep| !ep.is_local())
            .filter(|ep| match ep.last_seen {
                Some(seen) => now.saturating_duration_since(seen) > ttl,
                None => true,
            })
            .map(|ep| ep.name.clone())
            .collect();
        for name in &stale {
            map.remove(name);
        }
        stale
    }

    /// Seeds the table from a backup. Restored entries start fresh; entries
    /// already present (local or discovered) are left untouched.
    pub async fn restore(&self, endpoints: Vec<Endpoint>) -> usize {
        let now = Instant::now();
        let mut map = self.inner.write().await;
        let mut restored = 0;
        for mut ep in endpoints {
            if map.contains_key(&ep.name) {
                continue;
            }
            ep.kind = EndpointKind::Remote;
            ep.last_seen = Some(now);
            map.insert(ep.name.clone(), ep);
            restored += 1;
        }
        restored
    }

    /// Drops the local entry. Only the manager does this, on shutdown.
    pub(crate) async fn clear_local(&self) {
        self.inner.write().await.retain(|_, ep| !ep.is_local());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, subnet: &str) -> Endpoint {
        let mut ep = Endpoint::remote(name);
        ep.subnets = vec![subnet.to_string()];
        ep
    }

    #[tokio::test]
    async fn upsert_inserts_then_replaces() {
        let table = PeerTable::new();
        assert_eq!(table.upsert(peer("a", "10.1.0.0/24")).await, Upsert::Inserted);
        assert_eq!(
            table.upsert(peer("a", "10.1.0.0/24")).await,
            Upsert::Replaced { changed: false }
        );
        assert_eq!(
            table.upsert(peer("a", "10.2.0.0/24")).await,
            Upsert::Replaced { changed: true }
        );

        let got = table.get("a").await.unwrap();
        assert_eq!(got.subnets, vec!["10.2.0.0/24".to_string()]);
        assert!(got.last_seen.is_some());
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn local_entry_is_protected() {
        let table = PeerTable::new();
        table.set_local(peer("me", "10.0.0.0/24")).await;

        assert_eq!(table.upsert(peer("me", "6.6.6.0/24")).await, Upsert::Ignored);
        assert!(table.delete("me").await.is_none());

        let local = table.local().await.unwrap();
        assert_eq!(local.subnets, vec!["10.0.0.0/24".to_string()]);
        assert!(local.is_local());
    }

    #[tokio::test]
    async fn set_local_replaces_previous_local() {
        let table = PeerTable::new();
        table.set_local(peer("old", "10.0.0.0/24")).await;
        table.set_local(peer("new", "10.0.1.0/24")).await;

        assert!(table.get("old").await.is_none());
        assert_eq!(table.local().await.unwrap().name, "new");
    }

    #[tokio::test]
    async fn delete_removes_remote() {
        let table = PeerTable::new();
        table.upsert(peer("a", "10.1.0.0/24")).await;
        assert!(table.delete("a").await.is_some());
        assert!(table.is_empty().await);
        assert!(table.delete("a").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_evicts_only_stale_remotes() {
        let table = PeerTable::new();
        table.set_local(peer("me", "10.0.0.0/24")).await;
        table.upsert(peer("old", "10.1.0.0/24")).await;

        tokio::time::advance(Duration::from_secs(15)).await;
        table.upsert(peer("fresh", "10.2.0.0/24")).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let removed = table.expire(Duration::from_secs(20), Instant::now()).await;
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(table.get("fresh").await.is_some());
        assert!(table.get("me").await.is_some());

        tokio::time::advance(Duration::from_secs(3600)).await;
        table.expire(Duration::from_secs(20), Instant::now()).await;
        assert_eq!(table.len().await, 1);
        assert!(table.local().await.is_some());
    }

    #[tokio::test]
    async fn restore_keeps_existing_entries() {
        let table = PeerTable::new();
        table.set_local(peer("me", "10.0.0.0/24")).await;
        table.upsert(peer("a", "10.1.0.0/24")).await;

        let restored = table
            .restore(vec![
                peer("me", "9.9.9.0/24"),
                peer("a", "9.9.8.0/24"),
                peer("b", "10.3.0.0/24"),
            ])
            .await;
        assert_eq!(restored, 1);
        assert_eq!(table.get("a").await.unwrap().subnets[0], "10.1.0.0/24");
        assert!(table.get("b").await.unwrap().last_seen.is_some());
        assert!(table.local().await.unwrap().is_local());
    }

    #[tokio::test]
    async fn snapshot_is_detached_copy() {
        let table = PeerTable::new();
        table.upsert(peer("a", "10.1.0.0/24")).await;
        let snap = table.snapshot().await;
        table.delete("a").await;
        assert_eq!(snap.len(), 1);
        assert!(table.remotes().await.is_empty());
    }
}
