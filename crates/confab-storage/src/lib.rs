use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// Manages on-disk blob storage for message media.
///
/// Each blob is stored as a single flat file at `{dir}/{blob_id}`, where the
/// blob id is a fresh UUID plus the original file extension (so a static file
/// server can guess content types).
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Media storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, blob_id: &str) -> PathBuf {
        self.dir.join(blob_id)
    }

    /// Store a blob and return its id. The original filename contributes only
    /// its extension; the id itself is never attacker-controlled.
    pub async fn put(&self, original_name: &str, data: &[u8]) -> Result<String> {
        let ext = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        let blob_id = format!("{}{}", Uuid::new_v4(), ext);

        let path = self.blob_path(&blob_id);
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(blob_id)
    }

    /// Delete a blob. A missing file counts as success: the blob may already
    /// be gone after a previous partial cleanup.
    pub async fn delete(&self, blob_id: &str) -> Result<()> {
        let path = self.blob_path(blob_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted media blob {}", blob_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Media blob {} already gone", blob_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Public URL for a stored blob, served by the media route.
    pub fn url_for(&self, blob_id: &str) -> String {
        format!("/media/{blob_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> BlobStore {
        let dir = std::env::temp_dir().join(format!("confab-store-{}", Uuid::new_v4()));
        BlobStore::new(dir).await.unwrap()
    }

    #[tokio::test]
    async fn put_keeps_extension_and_delete_removes() {
        let store = store().await;

        let id = store.put("holiday.JPG", b"not really a jpeg").await.unwrap();
        assert!(id.ends_with(".jpg"));
        assert_eq!(store.url_for(&id), format!("/media/{id}"));

        let on_disk = fs::read(store.dir().join(&id)).await.unwrap();
        assert_eq!(on_disk, b"not really a jpeg");

        store.delete(&id).await.unwrap();
        assert!(fs::metadata(store.dir().join(&id)).await.is_err());
    }

    #[tokio::test]
    async fn delete_of_missing_blob_is_ok() {
        let store = store().await;
        store.delete("never-existed.png").await.unwrap();
    }

    #[tokio::test]
    async fn hostile_extension_is_dropped() {
        let store = store().await;
        let id = store.put("../../etc/passwd", b"x").await.unwrap();
        assert!(!id.contains('/'));
        assert!(!id.contains(".."));
    }
}
