//! Builds the components a role needs and supervises them until shutdown.

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::{BrokerBackend, QueueNames, Role, ServiceConfig};
use crate::error::{ServiceError, ServiceResult, format_error_chain};
use crate::ocr::TesseractEngine;
use crate::search::{SearchService, TantivyIndex};
use crate::storage::{ObjectStore, open_store};
use crate::transport::{AmqpBroker, Broker, MemoryBroker, QueueTransport, RetryPolicy};
use crate::workers::{IndexingWorker, OcrWorker};

use super::DocumentService;

/// Opens one broker connection per component.
enum Connector {
    Amqp { uri: String, queues: QueueNames },
    Memory(Arc<MemoryBroker>),
}

impl Connector {
    async fn connect(&self) -> ServiceResult<Arc<dyn Broker>> {
        match self {
            Connector::Amqp { uri, queues } => {
                Ok(Arc::new(AmqpBroker::connect(uri, queues.clone()).await?))
            }
            Connector::Memory(broker) => Ok(broker.connect()),
        }
    }
}

/// Run `role` until `shutdown` fires or a component fails.
///
/// The first component error cancels the others and is returned once they
/// have all stopped.
pub async fn run(
    config: ServiceConfig,
    role: Role,
    metrics: PrometheusHandle,
    shutdown: CancellationToken,
) -> ServiceResult<()> {
    let queues = QueueNames::from_config(&config.queues)?;

    let connector = match config.broker.backend {
        BrokerBackend::Amqp => Connector::Amqp {
            uri: config.broker.uri.clone(),
            queues: queues.clone(),
        },
        BrokerBackend::Memory if role == Role::All => {
            warn!("Using the in-memory broker; queued messages are lost on exit");
            Connector::Memory(MemoryBroker::new(queues.dead_letter.clone()))
        }
        BrokerBackend::Memory => {
            return Err(ServiceError::Config {
                message: format!(
                    "broker.backend = \"memory\" only works with role 'all', not '{}'",
                    role.as_str()
                ),
            });
        }
    };

    let retry = RetryPolicy::from_config(&config.retry);
    let prefetch = config.broker.prefetch;
    let transport =
        |broker: Arc<dyn Broker>| Arc::new(QueueTransport::new(broker, prefetch, retry.clone()));

    let store: Option<Arc<dyn ObjectStore>> = if role.runs_api() || role.runs_ocr_worker() {
        Some(open_store(&config.storage).await?)
    } else {
        None
    };

    let index_dir = config.index_dir();
    let index = if role.runs_indexing_worker() {
        Some(TantivyIndex::open(&index_dir, config.search.writer_heap_bytes)?)
    } else if role.runs_api() {
        Some(TantivyIndex::open_read_only(&index_dir)?)
    } else {
        None
    };

    let mut tasks: JoinSet<(&'static str, ServiceResult<()>)> = JoinSet::new();

    if role.runs_ocr_worker()
        && let Some(store) = &store
    {
        let transport = transport(connector.connect().await?);
        let worker = Arc::new(OcrWorker::new(
            transport.clone(),
            store.clone(),
            Arc::new(TesseractEngine::new(&config.ocr)),
            queues.document_ready.clone(),
            queues.ocr_results.clone(),
            config.ocr.dedup_capacity,
        ));
        let token = shutdown.clone();
        tasks.spawn(async move {
            let result = worker.run(token).await;
            close(&transport, "ocr-worker").await;
            ("ocr-worker", result)
        });
    }

    if role.runs_indexing_worker()
        && let Some(index) = &index
    {
        let transport = transport(connector.connect().await?);
        let worker = Arc::new(IndexingWorker::new(
            transport.clone(),
            Arc::new(index.clone()),
            queues.ocr_results.clone(),
        ));
        let token = shutdown.clone();
        tasks.spawn(async move {
            let result = worker.run(token).await;
            close(&transport, "indexing-worker").await;
            ("indexing-worker", result)
        });
    }

    if role.runs_api()
        && let (Some(store), Some(index)) = (store, index)
    {
        let transport = transport(connector.connect().await?);
        let state = AppState {
            documents: Arc::new(DocumentService::new(
                store,
                transport.clone(),
                queues.document_ready.clone(),
            )),
            search: Arc::new(SearchService::new(Arc::new(index), config.search.max_results)),
            metrics,
            role,
            start_time: Instant::now(),
        };
        let app = api::router(state, config.server.max_upload_bytes);

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServiceError::Config {
                message: format!("cannot bind {addr}: {e}"),
            })?;
        info!("Listening on {}", addr);

        let token = shutdown.clone();
        tasks.spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
                .map_err(|e| ServiceError::Internal {
                    message: format!("HTTP server failed: {e}"),
                });
            close(&transport, "api").await;
            ("api", result)
        });
    }

    info!(role = role.as_str(), components = tasks.len(), "Service started");
    let result = supervise(tasks, shutdown).await;

    if let Connector::Memory(broker) = &connector {
        for queue in queues.all() {
            let stats = broker.stats(queue);
            if stats.pending() > 0 {
                warn!(
                    queue = %queue,
                    pending = stats.pending(),
                    "Discarding undelivered in-memory messages"
                );
            }
        }
    }
    result
}

async fn supervise(
    mut tasks: JoinSet<(&'static str, ServiceResult<()>)>,
    shutdown: CancellationToken,
) -> ServiceResult<()> {
    let mut first_error = None;

    while let Some(joined) = tasks.join_next().await {
        let (component, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => (
                "unknown",
                Err(ServiceError::Internal {
                    message: format!("component task failed: {e}"),
                }),
            ),
        };

        match result {
            Ok(()) => info!(component, "Component stopped"),
            Err(e) => {
                error!(component, error = %format_error_chain(&e), "Component failed");
                shutdown.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn close(transport: &QueueTransport, component: &str) {
    if let Err(e) = transport.close().await {
        warn!(component, error = %format_error_chain(&e), "Failed to close broker connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(toml: &str) -> ServiceConfig {
        ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    fn handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    #[tokio::test]
    async fn test_memory_broker_requires_role_all() {
        let config = config(
            r#"
            [broker]
            backend = "memory"
            [queues]
            documentReadyQueue = "ready"
            ocrResultsQueue = "results"
            "#,
        );

        let result = run(config, Role::OcrWorker, handle(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ServiceError::Config { .. })));
    }

    #[tokio::test]
    async fn test_missing_queue_names_fail_startup() {
        let mut config = config("[broker]\nbackend = \"memory\"\n");
        config.queues = HashMap::new();

        let result = run(config, Role::All, handle(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ServiceError::Config { .. })));
    }

    #[tokio::test]
    async fn test_all_role_runs_until_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(&format!(
            r#"
            [server]
            host = "127.0.0.1"
            port = 0
            [broker]
            backend = "memory"
            [queues]
            documentReadyQueue = "ready"
            ocrResultsQueue = "results"
            [storage]
            data_dir = "{}"
            [search]
            writer_heap_bytes = 15000000
            "#,
            dir.path().display()
        ));

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(run(config, Role::All, handle(), shutdown.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!running.is_finished());

        shutdown.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(dir.path().join("index").exists());
    }
}
