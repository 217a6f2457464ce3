//! Queue consumers for each pipeline stage.

mod indexing_worker;
mod ocr_worker;

pub use indexing_worker::IndexingWorker;
pub use ocr_worker::OcrWorker;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OcrError, ServiceResult};
    use crate::events::{
        DocumentId, DocumentMetadata, DocumentReady, OcrDocumentMetadata, OcrResult,
        PipelineEvent,
    };
    use crate::ocr::OcrEngine;
    use crate::search::{MatchMode, SearchService, TantivyIndex};
    use crate::storage::{FilesystemStore, ObjectStore};
    use crate::transport::{MemoryBroker, QueueTransport, RetryPolicy};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    const READY: &str = "document-ready";
    const RESULTS: &str = "ocr-results";
    const DEAD: &str = "dead-letter";

    /// Returns canned text and counts calls.
    struct FakeEngine {
        text: String,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl OcrEngine for FakeEngine {
        async fn extract(&self, _data: &[u8]) -> Result<String, OcrError> {
            *self.calls.lock() += 1;
            Ok(self.text.clone())
        }
    }

    struct Pipeline {
        _dir: TempDir,
        broker: Arc<MemoryBroker>,
        store: Arc<FilesystemStore>,
        engine: Arc<FakeEngine>,
        index: TantivyIndex,
        api: QueueTransport,
        shutdown: CancellationToken,
        tasks: Vec<JoinHandle<ServiceResult<()>>>,
    }

    impl Pipeline {
        async fn start() -> Self {
            let dir = TempDir::new().unwrap();
            let broker = MemoryBroker::new(Some(DEAD.to_string()));
            let store = Arc::new(FilesystemStore::new(dir.path().join("objects")).await.unwrap());
            let engine = Arc::new(FakeEngine {
                text: "Total due $500".to_string(),
                calls: Mutex::new(0),
            });
            let index = TantivyIndex::in_memory().unwrap();
            let shutdown = CancellationToken::new();

            let ocr = Arc::new(OcrWorker::new(
                Arc::new(QueueTransport::new(broker.connect(), 1, RetryPolicy::none())),
                store.clone(),
                engine.clone(),
                READY,
                RESULTS,
                16,
            ));
            let indexer = Arc::new(IndexingWorker::new(
                Arc::new(QueueTransport::new(broker.connect(), 1, RetryPolicy::none())),
                Arc::new(index.clone()),
                RESULTS,
            ));

            let tasks = vec![
                tokio::spawn(ocr.run(shutdown.clone())),
                tokio::spawn(indexer.run(shutdown.clone())),
            ];

            Self {
                _dir: dir,
                api: QueueTransport::new(broker.connect(), 1, RetryPolicy::none()),
                broker,
                store,
                engine,
                index,
                shutdown,
                tasks,
            }
        }

        async fn upload(&self, id: &str, name: &str) -> DocumentReady {
            let locator = self
                .store
                .upload("scan.pdf", Bytes::from_static(b"%PDF-1.7 fake"))
                .await
                .unwrap();
            DocumentReady {
                document_id: DocumentId::new(id),
                file_locator: locator,
                metadata: DocumentMetadata {
                    name: name.to_string(),
                    author: "Jane".to_string(),
                    last_modified: None,
                },
            }
        }

        async fn settled(&self, queue: &str, count: u64) {
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let stats = self.broker.stats(queue);
                    if stats.acked + stats.rejected >= count {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("queue did not drain in time");
        }

        async fn stop(self) {
            self.shutdown.cancel();
            for task in self.tasks {
                task.await.unwrap().unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_uploaded_document_becomes_searchable() {
        let pipeline = Pipeline::start().await;
        let ready = pipeline.upload("42", "Invoice 2024").await;

        pipeline.api.publish(&ready.into(), READY).await.unwrap();
        pipeline.settled(READY, 1).await;
        pipeline.settled(RESULTS, 1).await;

        let search = SearchService::new(Arc::new(pipeline.index.clone()), 100);
        for term in ["Invoice", "500"] {
            let outcome = search.search(term).await.unwrap();
            assert_eq!(outcome.mode, MatchMode::Exact);
            assert_eq!(outcome.hits.len(), 1, "term {term}");
            assert_eq!(outcome.hits[0].document_id, "42");
        }
        assert_eq!(pipeline.broker.stats(RESULTS).acked, 1);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_redelivered_event_publishes_one_result() {
        let pipeline = Pipeline::start().await;
        let ready = pipeline.upload("42", "Invoice 2024").await;
        let event: PipelineEvent = ready.into();

        pipeline.api.publish(&event, READY).await.unwrap();
        pipeline.api.publish(&event, READY).await.unwrap();
        pipeline.settled(READY, 2).await;

        assert_eq!(pipeline.broker.stats(READY).acked, 2);
        assert_eq!(pipeline.broker.stats(RESULTS).published, 1);
        assert_eq!(*pipeline.engine.calls.lock(), 1);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_missing_file_is_dead_lettered() {
        let pipeline = Pipeline::start().await;
        let mut ready = pipeline.upload("9", "Lost").await;
        ready.file_locator = "never-uploaded.pdf".to_string();

        pipeline.api.publish(&ready.into(), READY).await.unwrap();
        pipeline.settled(READY, 1).await;

        assert_eq!(pipeline.broker.stats(READY).rejected, 1);
        assert_eq!(pipeline.broker.stats(DEAD).pending(), 1);
        assert_eq!(pipeline.broker.stats(RESULTS).published, 0);
        assert_eq!(*pipeline.engine.calls.lock(), 0);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_result_leaves_index_untouched() {
        let pipeline = Pipeline::start().await;

        pipeline.broker.publish_raw(RESULTS, b"Total due").unwrap();
        pipeline.settled(RESULTS, 1).await;

        assert_eq!(pipeline.broker.stats(RESULTS).rejected, 1);
        assert_eq!(pipeline.index.num_docs(), 0);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_reindexing_keeps_last_content() {
        let pipeline = Pipeline::start().await;
        let result = |text: &str| -> PipelineEvent {
            OcrResult {
                document_id: DocumentId::new("42"),
                document_metadata: OcrDocumentMetadata {
                    metadata: DocumentMetadata {
                        name: "Invoice 2024".to_string(),
                        author: "Jane".to_string(),
                        last_modified: None,
                    },
                    file_locator: "42.pdf".to_string(),
                },
                ocr_text: text.to_string(),
            }
            .into()
        };

        pipeline.api.publish(&result("first draft"), RESULTS).await.unwrap();
        pipeline.api.publish(&result("final copy"), RESULTS).await.unwrap();
        pipeline.settled(RESULTS, 2).await;

        assert_eq!(pipeline.index.num_docs(), 1);
        let search = SearchService::new(Arc::new(pipeline.index.clone()), 100);
        assert_eq!(search.search("final").await.unwrap().hits.len(), 1);
        assert_eq!(search.search("draft").await.unwrap().mode, MatchMode::Fuzzy);
        pipeline.stop().await;
    }
}
