use crate::{entities::cart_item::AttachedFile, errors::ServiceError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use uuid::Uuid;

/// URL prefix under which stored attachments are served.
pub const CART_UPLOAD_PREFIX: &str = "/uploads/cart";

/// Storage for customer attachments on cart lines.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn store(
        &self,
        original_name: &str,
        contents: Bytes,
    ) -> Result<AttachedFile, ServiceError>;

    /// Deletes a previously stored attachment. Missing files are not an error.
    async fn remove(&self, file: &AttachedFile) -> Result<(), ServiceError>;
}

/// Writes attachments under `{root}/cart/` with random file names.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
    max_bytes: usize,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cart_dir(&self) -> PathBuf {
        self.root.join("cart")
    }
}

/// Keeps a short alphanumeric extension from the client's file name; everything else is dropped.
fn safe_extension(original_name: &str) -> Option<String> {
    let ext = Path::new(original_name).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn display_name(original_name: &str) -> String {
    let name = Path::new(original_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .trim();
    if name.is_empty() {
        "attachment".to_string()
    } else {
        name.to_string()
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    #[instrument(skip(self, contents), fields(size = contents.len()))]
    async fn store(
        &self,
        original_name: &str,
        contents: Bytes,
    ) -> Result<AttachedFile, ServiceError> {
        if contents.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "File {} is empty",
                display_name(original_name)
            )));
        }
        if contents.len() > self.max_bytes {
            return Err(ServiceError::ValidationError(format!(
                "File {} exceeds the {} byte limit",
                display_name(original_name),
                self.max_bytes
            )));
        }

        let dir = self.cart_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ServiceError::StorageError(e.to_string()))?;

        let file_name = match safe_extension(original_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4().simple(), ext),
            None => Uuid::new_v4().simple().to_string(),
        };
        tokio::fs::write(dir.join(&file_name), &contents)
            .await
            .map_err(|e| ServiceError::StorageError(e.to_string()))?;

        debug!(%file_name, "attachment stored");
        Ok(AttachedFile {
            name: display_name(original_name),
            url: format!("{}/{}", CART_UPLOAD_PREFIX, file_name),
        })
    }

    #[instrument(skip(self, file), fields(url = %file.url))]
    async fn remove(&self, file: &AttachedFile) -> Result<(), ServiceError> {
        let file_name = file
            .url
            .strip_prefix(CART_UPLOAD_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| {
                !name.is_empty()
                    && !name.starts_with('.')
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
            })
            .ok_or_else(|| {
                ServiceError::ValidationError(format!("{} is not a stored attachment", file.url))
            })?;

        match tokio::fs::remove_file(self.cart_dir().join(file_name)).await {
            Ok(()) => {
                debug!(%file_name, "attachment removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::StorageError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn stores_file_under_cart_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path(), 1024);

        let file = store
            .store("../../etc/Design Final.PNG", Bytes::from_static(b"png-bytes"))
            .await
            .unwrap();

        assert_eq!(file.name, "Design Final.PNG");
        assert!(file.url.starts_with("/uploads/cart/"));
        assert!(file.url.ends_with(".png"));

        let stored = file.url.trim_start_matches("/uploads/");
        let contents = std::fs::read(dir.path().join(stored)).unwrap();
        assert_eq!(contents, b"png-bytes");
    }

    #[tokio::test]
    async fn rejects_oversized_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path(), 4);

        assert_matches!(
            store.store("a.pdf", Bytes::from_static(b"too large")).await,
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            store.store("a.pdf", Bytes::new()).await,
            Err(ServiceError::ValidationError(_))
        );
    }

    #[tokio::test]
    async fn removes_only_stored_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path(), 1024);

        let file = store
            .store("proof.pdf", Bytes::from_static(b"%PDF"))
            .await
            .unwrap();
        let path = dir.path().join(file.url.trim_start_matches("/uploads/"));
        assert!(path.exists());

        store.remove(&file).await.unwrap();
        assert!(!path.exists());
        // Already gone.
        store.remove(&file).await.unwrap();

        let outside = AttachedFile {
            name: "x".into(),
            url: "/uploads/cart/../secrets.txt".into(),
        };
        assert_matches!(
            store.remove(&outside).await,
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn odd_extensions_are_dropped() {
        assert_eq!(safe_extension("x.tar.gz").as_deref(), Some("gz"));
        assert_eq!(safe_extension("x.ph p"), None);
        assert_eq!(safe_extension("noext"), None);
    }
}
