//! Small helpers shared across modules.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Cuts on character boundaries, so multi-byte text (emoji, accents) is safe.
///
/// ```
/// use wa_relay::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("olá, tudo bem?", 4), "olá,...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            // Trim trailing whitespace for cleaner output
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Replace `dir/file_name` through a temporary sibling and a rename.
///
/// Readers see either the old content or the new content, never a prefix.
pub(crate) async fn write_atomic(dir: &Path, file_name: &str, content: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let target = dir.join(file_name);
    let temp_path = dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

    let mut temp_file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("Failed to create {}", temp_path.display()))?;
    temp_file
        .write_all(content)
        .await
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    temp_file
        .sync_all()
        .await
        .with_context(|| format!("Failed to fsync {}", temp_path.display()))?;
    drop(temp_file);

    if let Err(e) = fs::rename(&temp_path, &target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e).with_context(|| format!("Failed to replace {}", target.display()));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii_no_truncation() {
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
        assert_eq!(truncate_with_ellipsis("hello", 50), "hello");
    }

    #[test]
    fn test_truncate_trims_trailing_whitespace() {
        assert_eq!(truncate_with_ellipsis("hello world", 6), "hello...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
        assert_eq!(truncate_with_ellipsis("café résumé naïve", 10), "café résum...");
    }

    #[test]
    fn test_truncate_zero_max_chars() {
        assert_eq!(truncate_with_ellipsis("hello", 0), "...");
    }

    #[tokio::test]
    async fn write_atomic_replaces_without_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        write_atomic(tmp.path(), "state.json", b"old").await.unwrap();
        let path = write_atomic(tmp.path(), "state.json", b"new").await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"new");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn write_atomic_creates_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        write_atomic(&nested, "x", b"1").await.unwrap();
        assert!(nested.join("x").exists());
    }
}
