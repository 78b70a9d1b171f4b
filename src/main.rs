//! PDF printer service.
//!
//! Depending on `RUN_MODE`, serves the HTTP API, runs the conversion worker
//! pool, or both. See `pdf_printer::config` for the environment variables.

use std::sync::Arc;

use anyhow::{Context, Result};
use redis::IntoConnectionInfo;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pdf_printer::auth::BasicAuth;
use pdf_printer::config::{Config, QueueBackend};
use pdf_printer::converter::{ConversionInvoker, SofficeEngine};
use pdf_printer::queue::{JobQueue, MemoryJobQueue, RedisJobQueue};
use pdf_printer::server::{create_router, AppState};
use pdf_printer::service::PdfService;
use pdf_printer::storage::SharedStorage;
use pdf_printer::telemetry;
use pdf_printer::worker::{Backoff, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    telemetry::init_tracing(config.log_json);

    if let Some(endpoint) = &config.otlp_endpoint {
        if let Err(e) = telemetry::init_telemetry(endpoint) {
            warn!("Failed to initialize telemetry: {}", e);
        }
    }

    info!(
        run_mode = ?config.run_mode,
        queue_backend = ?config.queue_backend,
        shared_dir = %config.shared_dir.display(),
        concurrency = config.worker_concurrency,
        timeout_secs = config.conversion_timeout.as_secs(),
        "Starting PDF printer service"
    );

    if config.uses_default_auth() {
        warn!("AUTH_USER/AUTH_PASS not set, using built-in default credentials");
    }

    let storage = SharedStorage::open(config.shared_dir.clone(), config.fonts_dir.clone())
        .context("Failed to prepare shared storage")?;

    let engine = SofficeEngine::new(config.engine_program.clone(), storage.scratch_dir())
        .with_leading_args(config.engine_args.clone());
    let invoker = ConversionInvoker::new(Arc::new(engine), storage.clone(), config.conversion_timeout);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            shutdown.cancel();
        });
    }

    let Some((publisher, worker_queues)) = build_queues(&config, &shutdown).await? else {
        info!("Shutdown requested while connecting to the queue");
        return Ok(());
    };

    let workers: Vec<JoinHandle<()>> = if config.run_mode.runs_workers() {
        let worker = Worker::new(invoker.clone(), storage.clone()).with_max_attempts(config.max_attempts);
        let handles = worker.spawn_pool(worker_queues, shutdown.clone());
        info!(count = handles.len(), "Worker pool started");
        handles
    } else {
        Vec::new()
    };

    if config.run_mode.runs_server() {
        let service = PdfService::new(storage, invoker, publisher)
            .with_retain_scratch(config.retain_scratch)
            .with_font_cache_program(config.font_cache_program.clone());
        let state = AppState::new(service, Arc::new(BasicAuth::new(&config.auth)));
        let app = create_router(state, config.max_upload_bytes);

        let listener = tokio::net::TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
        info!(addr = %config.listen_addr, "HTTP server listening");

        let server_shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .context("HTTP server failed")?;
    } else {
        info!("Worker service ready, press Ctrl+C to shutdown");
        shutdown.cancelled().await;
    }

    info!("Waiting for workers to finish...");
    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            error!("Worker task failed: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

type Queues = (Arc<dyn JobQueue>, Vec<Arc<dyn JobQueue>>);

/// Returns the queue handle used for publishing plus one handle per worker.
/// Redis workers each get their own connection, since a blocking receive
/// occupies it. Connecting retries until it succeeds; `None` means shutdown
/// arrived first.
async fn build_queues(config: &Config, shutdown: &CancellationToken) -> Result<Option<Queues>> {
    let worker_count = if config.run_mode.runs_workers() {
        config.worker_concurrency
    } else {
        0
    };

    match config.queue_backend {
        QueueBackend::Memory => {
            let queue = Arc::new(MemoryJobQueue::new());
            let workers = (0..worker_count)
                .map(|_| queue.clone() as Arc<dyn JobQueue>)
                .collect();
            info!("Using in-memory job queue");
            Ok(Some((queue as Arc<dyn JobQueue>, workers)))
        }
        QueueBackend::Redis => {
            let mut info = config
                .redis_url
                .as_str()
                .into_connection_info()
                .context("Invalid REDIS_URL")?;
            if let Some(credentials) = &config.queue_credentials {
                info.redis.username = Some(credentials.username.clone());
                info.redis.password = Some(credentials.password.clone());
            }
            let client = redis::Client::open(info).context("Failed to create Redis client")?;

            let Some(publisher) =
                RedisJobQueue::connect_with_retry(&client, &config.queue_name, Backoff::default(), shutdown).await
            else {
                return Ok(None);
            };
            info!(queue = %config.queue_name, "Connected to Redis");

            if worker_count > 0 && config.recover_in_flight {
                let recovered = publisher
                    .recover_in_flight()
                    .await
                    .context("Failed to recover in-flight jobs")?;
                if recovered > 0 {
                    warn!(recovered, "Requeued jobs left in flight by a previous run");
                }
            }

            let mut workers: Vec<Arc<dyn JobQueue>> = Vec::with_capacity(worker_count);
            for _ in 0..worker_count {
                let Some(queue) =
                    RedisJobQueue::connect_with_retry(&client, &config.queue_name, Backoff::default(), shutdown).await
                else {
                    return Ok(None);
                };
                workers.push(Arc::new(queue));
            }
            Ok(Some((Arc::new(publisher), workers)))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
