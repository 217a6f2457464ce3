use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::error::{ServiceError, ServiceResult};
use crate::events::{EventKind, OcrResult, PipelineEvent};
use crate::search::{IndexEntry, SearchBackend};
use crate::transport::{MessageHandler, QueueTransport};

/// Upserts OcrResult events into the search index.
pub struct IndexingWorker {
    transport: Arc<QueueTransport>,
    index: Arc<dyn SearchBackend>,
    input_queue: String,
}

impl IndexingWorker {
    pub fn new(
        transport: Arc<QueueTransport>,
        index: Arc<dyn SearchBackend>,
        input_queue: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            index,
            input_queue: input_queue.into(),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> ServiceResult<()> {
        let transport = Arc::clone(&self.transport);
        let queue = self.input_queue.clone();
        info!(input = %queue, "Indexing worker started");
        transport.consume(&queue, self, shutdown).await
    }

    #[instrument(skip_all, fields(doc_id = %result.document_id))]
    async fn index(&self, result: OcrResult) -> ServiceResult<()> {
        let metadata = result.document_metadata.metadata;
        let entry = IndexEntry {
            document_id: result.document_id.as_str().to_string(),
            name: metadata.name,
            author: metadata.author,
            ocr_text: result.ocr_text,
        };

        self.index.upsert(entry).await?;
        info!("Document indexed");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for IndexingWorker {
    fn event_kind(&self) -> EventKind {
        EventKind::OcrResult
    }

    async fn handle(&self, event: PipelineEvent) -> ServiceResult<()> {
        match event {
            PipelineEvent::OcrResult(result) => self.index(result).await,
            other => Err(ServiceError::UnexpectedEvent {
                expected: EventKind::OcrResult,
                found: other.kind(),
            }),
        }
    }
}
