//! Durable credential synchronization between the local auth directory and a
//! remote object store.
//!
//! The local directory is the working copy the protocol bridge reads and
//! writes. The remote namespace (one per `client_id`) is the copy that
//! survives restarts and host moves. Syncing never deletes local blobs; only
//! [`CredentialStore::teardown`] does.

pub mod bundle;
pub mod index;
pub mod remote;

pub use bundle::CredentialBundle;
pub use index::{SyncIndex, SYNC_INDEX_FILE};
pub use remote::{FilesystemStore, RemoteStore, SupabaseStore};

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::RelayError;

/// Upload policy for [`CredentialStore::sync_from`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Re-upload every blob on each sync.
    Full,
    /// Upload only blobs modified since their last successful upload.
    #[default]
    Incremental,
}

impl std::str::FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => anyhow::bail!("unknown sync mode `{other}` (expected full or incremental)"),
        }
    }
}

/// Outcome of one sync batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: Vec<String>,
    pub unchanged: usize,
    pub failed: Vec<String>,
}

/// Owner of the remote credential namespace.
pub struct CredentialStore {
    remote: Arc<dyn RemoteStore>,
    namespace: String,
    mode: SyncMode,
    sync_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(remote: Arc<dyn RemoteStore>, namespace: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            remote,
            namespace: namespace.into(),
            mode,
            sync_lock: Mutex::new(()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Restore the remote bundle into `local_dir`.
    ///
    /// Returns `false` (fresh start) without touching `local_dir` when the
    /// namespace is empty. Single-blob failures are logged and skipped.
    pub async fn fetch_into(&self, local_dir: &Path) -> Result<bool> {
        let names = self.remote.list(&self.namespace).await.map_err(|e| {
            anyhow::Error::new(RelayError::TransientNetwork(format!("{e:#}")))
                .context("Failed to list remote credentials")
        })?;
        if names.is_empty() {
            tracing::info!(
                namespace = %self.namespace,
                backend = self.remote.name(),
                "No remote credentials; starting fresh"
            );
            return Ok(false);
        }

        tokio::fs::create_dir_all(local_dir)
            .await
            .with_context(|| format!("Failed to create {}", local_dir.display()))?;

        let _guard = self.sync_lock.lock().await;
        let mut index = SyncIndex::load(local_dir).await;
        let mut restored = 0usize;

        for name in &names {
            if !bundle::is_valid_blob_name(name) {
                tracing::warn!(name = %name, "Skipping remote blob with unsafe name");
                continue;
            }
            match self.fetch_blob(local_dir, name).await {
                Ok(marker) => {
                    index.record(name, marker);
                    restored += 1;
                }
                Err(e) => {
                    let err = RelayError::RemoteStoreInconsistent {
                        name: name.clone(),
                        reason: format!("{e:#}"),
                    };
                    tracing::warn!(error = %err, "Skipping credential blob");
                }
            }
        }

        if let Err(e) = index.save(local_dir).await {
            tracing::warn!(error = %e, "Failed to persist sync index after fetch");
        }
        tracing::info!(
            namespace = %self.namespace,
            restored,
            listed = names.len(),
            "Restored credentials from remote store"
        );
        Ok(true)
    }

    async fn fetch_blob(&self, local_dir: &Path, name: &str) -> Result<u64> {
        let content = self
            .remote
            .download(&self.namespace, name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("listed but not found"))?;
        let path = bundle::write_blob(local_dir, name, &content).await?;
        bundle::modification_marker(&path).await
    }

    /// Upload local blobs per the configured [`SyncMode`].
    ///
    /// `changed` narrows the candidate set to the given names, which are
    /// uploaded even when their marker did not move. Upload failures are
    /// logged per blob; markers advance only for blobs that succeeded.
    pub async fn sync_from(&self, local_dir: &Path, changed: Option<&[String]>) -> Result<SyncReport> {
        self.sync_with_mode(local_dir, changed, self.mode).await
    }

    /// Like [`sync_from`](Self::sync_from) with an explicit policy.
    pub async fn sync_with_mode(
        &self,
        local_dir: &Path,
        changed: Option<&[String]>,
        mode: SyncMode,
    ) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;

        let mut candidates = bundle::list_blob_names(local_dir).await?;
        if let Some(changed) = changed {
            candidates.retain(|name| changed.iter().any(|c| c == name));
        }

        let mut index = SyncIndex::load(local_dir).await;
        let mut report = SyncReport::default();

        for name in candidates {
            let path = local_dir.join(&name);
            // Marker is taken before reading so a concurrent rewrite stays dirty.
            let marker = match bundle::modification_marker(&path).await {
                Ok(marker) => marker,
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "Credential blob vanished before upload");
                    report.failed.push(name);
                    continue;
                }
            };

            if mode == SyncMode::Incremental
                && changed.is_none()
                && !index.needs_upload(&name, marker)
            {
                report.unchanged += 1;
                continue;
            }

            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "Failed to read credential blob");
                    report.failed.push(name);
                    continue;
                }
            };

            match self.remote.upload(&self.namespace, &name, content).await {
                Ok(()) => {
                    index.record(&name, marker);
                    report.uploaded.push(name);
                }
                Err(e) => {
                    let detail = format!("{e:#}");
                    tracing::warn!(name = %name, error = %detail, "Credential upload failed");
                    report.failed.push(name);
                }
            }
        }

        if !report.uploaded.is_empty() {
            index
                .save(local_dir)
                .await
                .context("Failed to persist sync index")?;
        }

        tracing::debug!(
            namespace = %self.namespace,
            uploaded = report.uploaded.len(),
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "Credential sync finished"
        );
        Ok(report)
    }

    /// Delete the remote namespace and the local credential directory.
    ///
    /// Only for session teardown (explicit logout); never part of a sync.
    pub async fn teardown(&self, local_dir: &Path) -> Result<()> {
        let _guard = self.sync_lock.lock().await;

        let names = self
            .remote
            .list(&self.namespace)
            .await
            .context("Failed to list remote credentials for teardown")?;
        self.remote
            .delete(&self.namespace, &names)
            .await
            .context("Failed to delete remote credentials")?;

        match tokio::fs::remove_dir_all(local_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove {}", local_dir.display()));
            }
        }

        tracing::info!(
            namespace = %self.namespace,
            removed = names.len(),
            "Credential session torn down"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::{BTreeMap, HashSet};

    /// In-memory store that records uploads and can fail chosen names.
    #[derive(Default)]
    pub struct RecordingStore {
        pub blobs: SyncMutex<BTreeMap<String, Vec<u8>>>,
        pub uploads: SyncMutex<Vec<String>>,
        pub fail_uploads: SyncMutex<HashSet<String>>,
        pub fail_downloads: SyncMutex<HashSet<String>>,
    }

    #[async_trait::async_trait]
    impl RemoteStore for RecordingStore {
        fn name(&self) -> &str {
            "recording"
        }

        async fn list(&self, namespace: &str) -> Result<Vec<String>> {
            let prefix = format!("{namespace}/");
            Ok(self
                .blobs
                .lock()
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                .collect())
        }

        async fn download(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
            if self.fail_downloads.lock().contains(name) {
                anyhow::bail!("injected download failure");
            }
            Ok(self.blobs.lock().get(&format!("{namespace}/{name}")).cloned())
        }

        async fn upload(&self, namespace: &str, name: &str, content: Vec<u8>) -> Result<()> {
            if self.fail_uploads.lock().contains(name) {
                anyhow::bail!("injected upload failure");
            }
            self.uploads.lock().push(name.to_string());
            self.blobs
                .lock()
                .insert(format!("{namespace}/{name}"), content);
            Ok(())
        }

        async fn delete(&self, namespace: &str, names: &[String]) -> Result<()> {
            let mut blobs = self.blobs.lock();
            for name in names {
                blobs.remove(&format!("{namespace}/{name}"));
            }
            Ok(())
        }
    }
}
