//! Periodic backup of discovered endpoints.
//!
//! The snapshot lets a restarted agent rebuild tunnels to its last known
//! peers straight away instead of waiting for them to be rediscovered.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::table::PeerTable;
use crate::types::Endpoint;

pub const BACKUP_FILE_NAME: &str = "endpoints.json";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("backup serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupFile {
    /// Milliseconds since the Unix epoch when the snapshot was taken.
    saved_at: u64,
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    path: PathBuf,
}

impl BackupStore {
    pub fn new(workdir: &Path) -> Self {
        Self {
            path: workdir.join(BACKUP_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the remote entries of `endpoints`, replacing the previous
    /// snapshot atomically.
    pub fn save(&self, endpoints: &[Endpoint]) -> Result<usize, BackupError> {
        let mut remotes: Vec<Endpoint> = endpoints
            .iter()
            .filter(|ep| !ep.is_local())
            .cloned()
            .collect();
        remotes.sort_by(|a, b| a.name.cmp(&b.name));

        let doc = BackupFile {
            saved_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            endpoints: remotes,
        };
        let data = serde_json::to_vec_pretty(&doc)?;

        // Write to temp file first, flushed to disk before it replaces the
        // previous snapshot.
        let temp_file = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&temp_file)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        // Atomic rename
        std::fs::rename(&temp_file, &self.path)?;

        debug!(
            "Saved {} endpoints to {}",
            doc.endpoints.len(),
            self.path.display()
        );
        Ok(doc.endpoints.len())
    }

    /// Reads the last snapshot. A missing file is an empty backup.
    pub fn load(&self) -> Result<Vec<Endpoint>, BackupError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: BackupFile = serde_json::from_slice(&data)?;
        Ok(doc.endpoints)
    }

    /// Seeds `table` from the snapshot. Errors are logged, never fatal.
    pub async fn restore_into(&self, table: &PeerTable) -> usize {
        match self.load() {
            Ok(endpoints) if endpoints.is_empty() => 0,
            Ok(endpoints) => {
                let restored = table.restore(endpoints).await;
                info!("Restored {} endpoints from {}", restored, self.path.display());
                restored
            }
            Err(e) => {
                warn!("Ignoring unreadable backup {}: {}", self.path.display(), e);
                0
            }
        }
    }

    async fn save_table(&self, table: &PeerTable) {
        let snapshot = table.snapshot().await;
        let store = self.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&snapshot)).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Failed to back up endpoints: {}", e),
            Err(e) => error!("Backup task failed: {}", e),
        }
    }

    /// Saves the table every `interval`, and once more on shutdown.
    pub async fn run(
        self,
        table: PeerTable,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; there is nothing new to save yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.save_table(&table).await;
        }

        self.save_table(&table).await;
        debug!("Backup store stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn peer(name: &str) -> Endpoint {
        let mut ep = Endpoint::remote(name);
        ep.public_addresses = vec![format!("192.168.0.{}", name.len())];
        ep.subnets = vec!["2.2.3.0/24".into()];
        ep.node_subnets = vec!["192.168.0.3/32".into()];
        ep
    }

    #[tokio::test]
    async fn backup_restart_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());

        let table = PeerTable::new();
        table.set_local(peer("me")).await;
        table.upsert(peer("alpha")).await;
        table.upsert(peer("beta")).await;
        assert_eq!(store.save(&table.snapshot().await).unwrap(), 2);

        // "Restart": a brand new table seeded from disk.
        let restarted = PeerTable::new();
        assert_eq!(store.restore_into(&restarted).await, 2);

        let mut before = table.remotes().await;
        let mut after = restarted.remotes().await;
        before.sort_by(|a, b| a.name.cmp(&b.name));
        after.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert!(a.same_content(b));
            assert!(!b.is_local());
            assert!(b.last_seen.is_some());
        }
        assert!(restarted.local().await.is_none());
    }

    #[test]
    fn missing_backup_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        store.save(&[peer("alpha"), peer("beta")]).unwrap();
        store.save(&[peer("gamma")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "gamma");
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn stale_temp_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        let temp = store.path().with_extension("json.tmp");
        std::fs::write(&temp, b"leftover from a crash, much longer than needed").unwrap();

        assert_eq!(store.save(&[peer("alpha")]).unwrap(), 1);
        assert!(!temp.exists());
        assert_eq!(store.load().unwrap()[0].name, "alpha");
    }

    #[tokio::test]
    async fn corrupt_backup_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        std::fs::write(store.path(), b"{ not json").unwrap();

        assert!(matches!(store.load(), Err(BackupError::Serde(_))));
        let table = PeerTable::new();
        assert_eq!(store.restore_into(&table).await, 0);
    }

    #[test]
    fn unwritable_dir_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(&dir.path().join("missing/sub"));
        assert!(matches!(store.save(&[peer("a")]), Err(BackupError::Io(_))));
    }

    #[tokio::test]
    async fn run_saves_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path());
        let table = PeerTable::new();
        table.upsert(peer("alpha")).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(store.clone().run(table, Duration::from_secs(3600), stop_rx));
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(store.load().unwrap().len(), 1);
    }
}
