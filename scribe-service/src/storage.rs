//! Object storage for uploaded document files.
//!
//! Locators are backend-relative keys. The API mints them on upload and the
//! OCR worker hands them back to `download`.

mod filesystem;
mod s3;

pub use filesystem::FilesystemStore;
pub use s3::S3Store;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{ServiceError, ServiceResult, StorageError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` and return the locator it can be fetched by.
    async fn upload(&self, name: &str, data: Bytes) -> Result<String, StorageError>;

    async fn download(&self, locator: &str) -> Result<Bytes, StorageError>;
}

/// Build the configured backend.
pub async fn open_store(config: &StorageConfig) -> ServiceResult<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::Filesystem => {
            let store = FilesystemStore::new(config.data_dir.join("objects")).await?;
            Ok(Arc::new(store))
        }
        StorageBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| ServiceError::Config {
                message: "storage.backend = \"s3\" requires a [storage.s3] section".to_string(),
            })?;
            Ok(Arc::new(S3Store::new(s3).await))
        }
    }
}

/// Fresh object key for an uploaded file: a UUID prefix plus the file name
/// reduced to a safe character set.
pub fn object_key(name: &str) -> String {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        format!("{}-{}", Uuid::new_v4(), cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_sanitizes_name() {
        let key = object_key("../../etc/Invoice 2024.pdf");
        assert!(key.ends_with("-Invoice_2024.pdf"));
        assert!(!key.contains('/'));

        let hidden = object_key("..");
        assert!(!hidden.contains(".."));
        assert_eq!(hidden.len(), 36);
    }

    #[test]
    fn test_object_keys_are_unique() {
        assert_ne!(object_key("a.pdf"), object_key("a.pdf"));
    }
}
