//! Persisted record of the last marker uploaded per blob.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::util::write_atomic;

/// File name of the index inside the local credential directory.
pub const SYNC_INDEX_FILE: &str = ".sync-index.json";

/// Blob name → modification marker of the last successful upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIndex {
    #[serde(default)]
    entries: BTreeMap<String, u64>,
}

impl SyncIndex {
    /// Load the index from `dir`. A missing or unreadable index starts empty,
    /// which can only cause extra uploads, never skipped ones.
    pub async fn load(dir: &Path) -> Self {
        let path = dir.join(SYNC_INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Sync index corrupt; starting empty");
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Sync index unreadable; starting empty");
                Self::default()
            }
        }
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self).context("Failed to serialize sync index")?;
        write_atomic(dir, SYNC_INDEX_FILE, &raw).await?;
        Ok(())
    }

    /// True when the local marker is strictly newer than the recorded one.
    pub fn needs_upload(&self, name: &str, local_marker: u64) -> bool {
        self.entries
            .get(name)
            .map_or(true, |recorded| local_marker > *recorded)
    }

    /// Advance the recorded marker. Markers never move backwards.
    pub fn record(&mut self, name: &str, marker: u64) {
        let entry = self.entries.entry(name.to_string()).or_insert(marker);
        if marker > *entry {
            *entry = marker;
        }
    }

    pub fn marker(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_blob_needs_upload() {
        let index = SyncIndex::default();
        assert!(index.needs_upload("creds.json", 1));
    }

    #[test]
    fn equal_marker_does_not_need_upload() {
        let mut index = SyncIndex::default();
        index.record("creds.json", 10);
        assert!(!index.needs_upload("creds.json", 10));
        assert!(!index.needs_upload("creds.json", 9));
        assert!(index.needs_upload("creds.json", 11));
    }

    #[test]
    fn record_never_moves_backwards() {
        let mut index = SyncIndex::default();
        index.record("creds.json", 10);
        index.record("creds.json", 5);
        assert_eq!(index.marker("creds.json"), Some(10));
    }

    #[tokio::test]
    async fn save_then_load_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = SyncIndex::default();
        index.record("creds.json", 42);
        index.save(tmp.path()).await.unwrap();

        let loaded = SyncIndex::load(tmp.path()).await;
        assert_eq!(loaded.marker("creds.json"), Some(42));
    }

    #[tokio::test]
    async fn corrupt_index_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(SYNC_INDEX_FILE), b"not json").unwrap();
        assert!(SyncIndex::load(tmp.path()).await.is_empty());
    }
}
