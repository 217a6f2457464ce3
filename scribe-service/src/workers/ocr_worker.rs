use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{ServiceError, ServiceResult, TransportError};
use crate::events::{DocumentId, DocumentReady, EventKind, OcrResult, PipelineEvent};
use crate::ocr::OcrEngine;
use crate::storage::ObjectStore;
use crate::transport::{MessageHandler, QueueTransport};

type Fingerprint = [u8; 32];

/// Turns DocumentReady events into OcrResult events.
pub struct OcrWorker {
    transport: Arc<QueueTransport>,
    store: Arc<dyn ObjectStore>,
    engine: Arc<dyn OcrEngine>,
    input_queue: String,
    output_queue: String,
    /// documentId → fingerprint of the last input whose result was published
    published: Option<Mutex<LruCache<DocumentId, Fingerprint>>>,
}

impl OcrWorker {
    pub fn new(
        transport: Arc<QueueTransport>,
        store: Arc<dyn ObjectStore>,
        engine: Arc<dyn OcrEngine>,
        input_queue: impl Into<String>,
        output_queue: impl Into<String>,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            transport,
            store,
            engine,
            input_queue: input_queue.into(),
            output_queue: output_queue.into(),
            published: NonZeroUsize::new(dedup_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Consume the input queue until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> ServiceResult<()> {
        let transport = Arc::clone(&self.transport);
        let queue = self.input_queue.clone();
        info!(input = %queue, output = %self.output_queue, "OCR worker started");
        transport.consume(&queue, self, shutdown).await
    }

    #[instrument(skip_all, fields(doc_id = %event.document_id))]
    async fn process(&self, event: DocumentReady) -> ServiceResult<()> {
        debug!(locator = %event.file_locator, "Downloading");
        let data = self.store.download(&event.file_locator).await?;

        let fingerprint = fingerprint(&data, &event)?;
        if self.already_published(&event.document_id, &fingerprint) {
            info!("OCR result already published for this content, skipping");
            metrics::counter!("scribe_ocr_duplicates_total").increment(1);
            return Ok(());
        }

        debug!(bytes = data.len(), "Extracting");
        let text = self.engine.extract(&data).await?;

        debug!(chars = text.len(), "Publishing result");
        let result = OcrResult::from_ready(&event, text);
        self.transport
            .publish(&result.into(), &self.output_queue)
            .await?;

        if let Some(published) = &self.published {
            published.lock().put(event.document_id.clone(), fingerprint);
        }
        info!("OCR result published");
        Ok(())
    }

    fn already_published(&self, id: &DocumentId, fingerprint: &Fingerprint) -> bool {
        self.published
            .as_ref()
            .is_some_and(|published| published.lock().get(id) == Some(fingerprint))
    }
}

#[async_trait]
impl MessageHandler for OcrWorker {
    fn event_kind(&self) -> EventKind {
        EventKind::DocumentReady
    }

    async fn handle(&self, event: PipelineEvent) -> ServiceResult<()> {
        match event {
            PipelineEvent::DocumentReady(ready) => self.process(ready).await,
            other => Err(ServiceError::UnexpectedEvent {
                expected: EventKind::DocumentReady,
                found: other.kind(),
            }),
        }
    }
}

/// SHA-256 over the file bytes and the event's metadata.
fn fingerprint(data: &[u8], event: &DocumentReady) -> ServiceResult<Fingerprint> {
    let metadata = serde_json::to_vec(&event.metadata).map_err(TransportError::Encode)?;

    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update([0u8]);
    hasher.update(event.file_locator.as_bytes());
    hasher.update([0u8]);
    hasher.update(&metadata);

    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&hasher.finalize());
    Ok(fingerprint)
}
