//! Upload orchestration and process wiring.

mod runtime;

pub use runtime::run;

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::events::{DocumentId, DocumentMetadata, DocumentReady};
use crate::storage::ObjectStore;
use crate::transport::QueueTransport;

/// Stores uploaded files and starts them down the pipeline.
pub struct DocumentService {
    store: Arc<dyn ObjectStore>,
    transport: Arc<QueueTransport>,
    document_ready_queue: String,
}

/// A file accepted for processing
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub file_name: String,
    pub data: Bytes,
    pub name: Option<String>,
    pub author: Option<String>,
}

impl DocumentService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        transport: Arc<QueueTransport>,
        document_ready_queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            document_ready_queue: document_ready_queue.into(),
        }
    }

    /// Upload the file, then announce it with a DocumentReady event.
    ///
    /// If publishing fails the stored object is left in place; the caller
    /// sees the error and may upload again under a new id.
    #[instrument(skip_all, fields(file_name = %document.file_name, bytes = document.data.len()))]
    pub async fn submit(&self, document: NewDocument) -> ServiceResult<DocumentReady> {
        if document.data.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "uploaded file is empty".to_string(),
            });
        }

        let file_locator = self
            .store
            .upload(&document.file_name, document.data)
            .await?;

        let name = document
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| document.file_name.clone());

        let event = DocumentReady {
            document_id: DocumentId::new(Uuid::new_v4().to_string()),
            file_locator,
            metadata: DocumentMetadata {
                name,
                author: document.author.unwrap_or_default().trim().to_string(),
                last_modified: Some(Utc::now()),
            },
        };

        self.transport
            .publish(&event.clone().into(), &self.document_ready_queue)
            .await?;

        info!(doc_id = %event.document_id, locator = %event.file_locator, "Document submitted");
        metrics::counter!("scribe_documents_submitted_total").increment(1);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, PipelineEvent};
    use crate::storage::FilesystemStore;
    use crate::transport::{MemoryBroker, RetryPolicy};
    use tempfile::TempDir;

    async fn service(dir: &TempDir, broker: &Arc<MemoryBroker>) -> DocumentService {
        let store = FilesystemStore::new(dir.path().to_path_buf()).await.unwrap();
        DocumentService::new(
            Arc::new(store),
            Arc::new(QueueTransport::new(broker.connect(), 1, RetryPolicy::none())),
            "ready",
        )
    }

    #[tokio::test]
    async fn test_submit_stores_and_publishes() {
        let dir = TempDir::new().unwrap();
        let broker = MemoryBroker::new(None);
        let service = service(&dir, &broker).await;

        let event = service
            .submit(NewDocument {
                file_name: "invoice.pdf".to_string(),
                data: Bytes::from_static(b"%PDF-1.7"),
                name: Some("  Invoice 2024 ".to_string()),
                author: Some("Jane".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(event.metadata.name, "Invoice 2024");
        assert_eq!(event.metadata.author, "Jane");
        assert!(event.metadata.last_modified.is_some());
        assert!(dir.path().join(&event.file_locator).exists());

        let mut subscription = broker.connect().subscribe("ready", 1).await.unwrap();
        let delivery = subscription.next_delivery().await.unwrap().unwrap();
        let published = PipelineEvent::decode(delivery.payload(), EventKind::DocumentReady).unwrap();
        assert_eq!(published, PipelineEvent::DocumentReady(event));
    }

    #[tokio::test]
    async fn test_name_defaults_to_file_name() {
        let dir = TempDir::new().unwrap();
        let broker = MemoryBroker::new(None);
        let service = service(&dir, &broker).await;

        let event = service
            .submit(NewDocument {
                file_name: "minutes.pdf".to_string(),
                data: Bytes::from_static(b"data"),
                name: Some(" ".to_string()),
                author: None,
            })
            .await
            .unwrap();

        assert_eq!(event.metadata.name, "minutes.pdf");
        assert_eq!(event.metadata.author, "");
    }

    #[tokio::test]
    async fn test_empty_file_is_refused_before_publishing() {
        let dir = TempDir::new().unwrap();
        let broker = MemoryBroker::new(None);
        let service = service(&dir, &broker).await;

        let result = service
            .submit(NewDocument {
                file_name: "empty.pdf".to_string(),
                data: Bytes::new(),
                name: None,
                author: None,
            })
            .await;

        assert!(matches!(result, Err(ServiceError::InvalidRequest { .. })));
        assert_eq!(broker.stats("ready").published, 0);
    }
}
