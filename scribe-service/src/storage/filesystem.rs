use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::StorageError;

use super::{ObjectStore, object_key};

/// Objects stored as plain files under a root directory
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub async fn new(root: PathBuf) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StorageError::Io {
                locator: root.display().to_string(),
                source,
            })?;
        Ok(Self { root })
    }

    /// Map a locator to a path under the root, refusing anything that could
    /// escape it.
    fn resolve(&self, locator: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(locator);
        let safe = !locator.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !safe {
            return Err(StorageError::InvalidLocator {
                locator: locator.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn upload(&self, name: &str, data: Bytes) -> Result<String, StorageError> {
        let locator = object_key(name);
        let path = self.resolve(&locator)?;

        tokio::fs::write(&path, &data)
            .await
            .map_err(|source| StorageError::Io {
                locator: locator.clone(),
                source,
            })?;

        debug!(locator = %locator, bytes = data.len(), "Stored object");
        Ok(locator)
    }

    async fn download(&self, locator: &str) -> Result<Bytes, StorageError> {
        let path = self.resolve(locator)?;

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                locator: locator.to_string(),
            }),
            Err(source) => Err(StorageError::Io {
                locator: locator.to_string(),
                source,
            }),
        }
    }
}
