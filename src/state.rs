//! Durable queue bookkeeping shared between restarts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Addresses accepted but not yet finished, plus per-address cooldown deadlines.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueState {
    /// Queued or executing addresses, in admission order.
    #[serde(default)]
    pub in_flight: Vec<String>,
    /// Address -> epoch seconds before which a rescan is suppressed.
    #[serde(default)]
    pub retry_after: BTreeMap<String, u64>,
}

impl QueueState {
    pub fn is_in_flight(&self, address: &str) -> bool {
        self.in_flight.iter().any(|a| a == address)
    }

    pub fn mark_in_flight(&mut self, address: &str) {
        if !self.is_in_flight(address) {
            self.in_flight.push(address.to_string());
        }
    }

    pub fn clear_in_flight(&mut self, address: &str) {
        self.in_flight.retain(|a| a != address);
    }

    pub fn retry_after(&self, address: &str) -> u64 {
        self.retry_after.get(address).copied().unwrap_or(0)
    }

    /// Drop cooldowns that have already expired.
    pub fn prune_expired(&mut self, now: u64) {
        self.retry_after.retain(|_, until| *until > now);
    }
}

/// JSON file holding a [`QueueState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored state. Missing or corrupt files yield an empty state.
    pub async fn load(&self) -> QueueState {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no queue state on disk, starting empty");
                return QueueState::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read queue state: {e}");
                return QueueState::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring corrupt queue state: {e}");
                QueueState::default()
            }
        }
    }

    /// Write the state through a sibling temp file and rename it into place.
    pub async fn save(&self, state: &QueueState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(&data).await.map_err(|e| self.io_err(e))?;
        file.sync_all().await.map_err(|e| self.io_err(e))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, source: std::io::Error) -> Error {
        Error::StateIo {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().await, QueueState::default());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert_eq!(StateStore::new(&path).load().await, QueueState::default());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/state.json"));
        let mut state = QueueState::default();
        state.mark_in_flight("203.0.113.7");
        state.retry_after.insert("198.51.100.1".into(), 1_900_000_000);
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await, state);
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn prune_keeps_future_deadlines() {
        let mut state = QueueState::default();
        state.retry_after.insert("a".into(), 10);
        state.retry_after.insert("b".into(), 100);
        state.prune_expired(50);
        assert_eq!(state.retry_after.len(), 1);
        assert_eq!(state.retry_after("b"), 100);
        assert_eq!(state.retry_after("a"), 0);
    }

    #[test]
    fn in_flight_has_no_duplicates() {
        let mut state = QueueState::default();
        state.mark_in_flight("a");
        state.mark_in_flight("a");
        assert_eq!(state.in_flight, vec!["a"]);
        state.clear_in_flight("a");
        assert!(state.in_flight.is_empty());
    }
}
