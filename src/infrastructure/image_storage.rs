//! Content-addressed image store
//!
//! Image bytes live in a two-level directory tree keyed by their SHA-256:
//! `ab/cd/<full-hex>.<ext>`. Writing the same bytes twice is a no-op, which
//! makes image downloads idempotent under at-least-once task delivery.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info};

use crate::domain::version::checksum_hex;

/// Filesystem-backed content-addressed object store
#[derive(Debug, Clone)]
pub struct ImageStorage {
    root: PathBuf,
}

impl ImageStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes, returning the object key. Existing objects are not
    /// rewritten.
    pub async fn store(&self, bytes: &[u8], extension: &str) -> Result<String> {
        let digest = checksum_hex(bytes);
        let key = format!("{}/{}/{}.{}", &digest[..2], &digest[2..4], digest, extension);
        let path = self.root.join(&key);

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Object {key} already stored");
            return Ok(key);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(key)
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    pub async fn exists(&self, key: &str) -> bool {
        fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("deleting {}", path.display()))?;
        }
        Ok(())
    }

    /// Every object key currently on disk
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(keys);
        }

        let mut outer = fs::read_dir(&self.root).await?;
        while let Some(level1) = outer.next_entry().await? {
            if !level1.file_type().await?.is_dir() {
                continue;
            }
            let mut middle = fs::read_dir(level1.path()).await?;
            while let Some(level2) = middle.next_entry().await? {
                if !level2.file_type().await?.is_dir() {
                    continue;
                }
                let mut inner = fs::read_dir(level2.path()).await?;
                while let Some(object) = inner.next_entry().await? {
                    if object.file_type().await?.is_file() {
                        let key = format!(
                            "{}/{}/{}",
                            level1.file_name().to_string_lossy(),
                            level2.file_name().to_string_lossy(),
                            object.file_name().to_string_lossy()
                        );
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    /// Delete the given orphaned keys, returning how many were removed
    pub async fn sweep(&self, orphaned_keys: &[String]) -> Result<u64> {
        let mut removed = 0u64;
        for key in orphaned_keys {
            self.delete(key).await?;
            removed += 1;
        }
        if removed > 0 {
            info!("Swept {removed} orphaned image objects");
        }
        Ok(removed)
    }
}

/// Pick a file extension from a URL or content type, defaulting to jpg
pub fn extension_for(url: &str, content_type: Option<&str>) -> &'static str {
    if let Some(ct) = content_type {
        if ct.contains("png") {
            return "png";
        }
        if ct.contains("webp") {
            return "webp";
        }
        if ct.contains("gif") {
            return "gif";
        }
        if ct.contains("jpeg") || ct.contains("jpg") {
            return "jpg";
        }
    }
    let lower = url.to_lowercase();
    if lower.contains(".png") {
        "png"
    } else if lower.contains(".webp") {
        "webp"
    } else if lower.contains(".gif") {
        "gif"
    } else {
        "jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_is_idempotent_and_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(dir.path());

        let key1 = storage.store(b"image-bytes", "jpg").await.unwrap();
        let key2 = storage.store(b"image-bytes", "jpg").await.unwrap();
        assert_eq!(key1, key2);
        assert!(storage.exists(&key1).await);
        assert_eq!(storage.read(&key1).await.unwrap(), b"image-bytes");

        let keys = storage.list_keys().await.unwrap();
        assert_eq!(keys, vec![key1]);
    }

    #[tokio::test]
    async fn sweep_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(dir.path());

        let key = storage.store(b"orphan", "png").await.unwrap();
        assert_eq!(storage.sweep(&[key.clone()]).await.unwrap(), 1);
        assert!(!storage.exists(&key).await);
    }

    #[test]
    fn extension_selection() {
        assert_eq!(extension_for("https://x/img.png?x=1", None), "png");
        assert_eq!(extension_for("https://x/img", Some("image/webp")), "webp");
        assert_eq!(extension_for("https://x/img", None), "jpg");
    }
}
