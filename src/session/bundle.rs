//! Credential bundle: the named blobs a linked device needs to resume.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;

use crate::util::write_atomic;

/// Full authentication state, blob name → content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialBundle {
    blobs: BTreeMap<String, Vec<u8>>,
}

impl CredentialBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, content: Vec<u8>) {
        self.blobs.insert(name.into(), content);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.blobs.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.blobs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.blobs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Read every blob stored in `dir`. A missing directory yields an empty bundle.
    pub async fn read_dir(dir: &Path) -> Result<Self> {
        let mut bundle = Self::new();
        for name in list_blob_names(dir).await? {
            let content = fs::read(dir.join(&name))
                .await
                .with_context(|| format!("Failed to read credential blob {name}"))?;
            bundle.insert(name, content);
        }
        Ok(bundle)
    }

    /// Persist every blob into `dir`, replacing same-named files.
    pub async fn write_into(&self, dir: &Path) -> Result<()> {
        for (name, content) in self.iter() {
            write_blob(dir, name, content).await?;
        }
        Ok(())
    }
}

impl FromIterator<(String, Vec<u8>)> for CredentialBundle {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self {
            blobs: iter.into_iter().collect(),
        }
    }
}

/// Blob names are flat file names. Dotfiles are reserved for local bookkeeping.
pub fn is_valid_blob_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && name != ".."
        && !name.chars().any(char::is_control)
}

/// Names of the regular, non-hidden files in `dir`, sorted.
pub async fn list_blob_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", dir.display()));
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if is_valid_blob_name(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Local modification marker of a blob, in nanoseconds since the Unix epoch.
pub async fn modification_marker(path: &Path) -> Result<u64> {
    let modified = fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .modified()
        .with_context(|| format!("No modification time for {}", path.display()))?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Write one blob through a temporary sibling and rename it into place.
pub async fn write_blob(dir: &Path, name: &str, content: &[u8]) -> Result<PathBuf> {
    if !is_valid_blob_name(name) {
        anyhow::bail!("Refusing to write credential blob with unsafe name `{name}`");
    }
    write_atomic(dir, name, content).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_names_reject_paths_and_dotfiles() {
        assert!(is_valid_blob_name("creds.json"));
        assert!(is_valid_blob_name("pre-key-12.json"));
        assert!(!is_valid_blob_name(""));
        assert!(!is_valid_blob_name(".sync-index.json"));
        assert!(!is_valid_blob_name("../creds.json"));
        assert!(!is_valid_blob_name("nested/creds.json"));
        assert!(!is_valid_blob_name("nested\\creds.json"));
    }

    #[tokio::test]
    async fn read_dir_skips_hidden_files_and_subdirs() {
        let tmp = tempfile::tempdir().unwrap();
        write_blob(tmp.path(), "creds.json", b"{}").await.unwrap();
        write_atomic(tmp.path(), ".sync-index.json", b"{}").await.unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let bundle = CredentialBundle::read_dir(tmp.path()).await.unwrap();
        assert_eq!(bundle.names().collect::<Vec<_>>(), vec!["creds.json"]);
    }

    #[tokio::test]
    async fn read_dir_of_missing_directory_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = CredentialBundle::read_dir(&tmp.path().join("absent"))
            .await
            .unwrap();
        assert!(bundle.is_empty());
    }

    #[tokio::test]
    async fn write_blob_replaces_content_without_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        write_blob(tmp.path(), "creds.json", b"old").await.unwrap();
        write_blob(tmp.path(), "creds.json", b"new").await.unwrap();

        assert_eq!(std::fs::read(tmp.path().join("creds.json")).unwrap(), b"new");
        let leftovers = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn write_blob_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(write_blob(tmp.path(), "../escape", b"x").await.is_err());
    }
}
