//! Consume job messages and run typed handlers with retry and state
//! advancement.

use std::future::ready;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::info;

use health::HealthRegistry;
use job_common::cache::{Client, RedisClient};
use job_common::job::JobType;
use job_common::kafka::consumer::JobConsumer;
use job_common::metrics::{serve, setup_metrics_routes};
use job_common::storage::Storage;
use job_common::store::{JobStore, PostgresJobStore};
use job_worker::config::Config;
use job_worker::error::WorkerError;
use job_worker::extract::ParserServiceExtractor;
use job_worker::handlers::pdf_parse::DocumentParseHandler;
use job_worker::handlers::simulated::SimulatedHandler;
use job_worker::llm::ChatCompletionsClient;
use job_worker::registry::HandlerRegistry;
use job_worker::tracker::StatusTracker;
use job_worker::worker::JobWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("consumer".to_string(), time::Duration::seconds(60))
        .await;

    let store: Arc<dyn JobStore> = Arc::new(
        PostgresJobStore::new(&config.database_url, config.max_pg_connections).await?,
    );
    let cache: Arc<dyn Client> = Arc::new(RedisClient::new(config.redis.url())?);
    let storage = Arc::new(
        Storage::new(
            Path::new(&config.storage.temp_dir),
            config.storage.max_size,
            Duration::from_secs(config.storage.ttl_seconds),
        )
        .await?,
    );
    let consumer = JobConsumer::new(&config.kafka, &config.consumer)?;

    let tracker = Arc::new(StatusTracker::new(config.parse.max_retries));
    let extractor = Arc::new(ParserServiceExtractor::new(config.parse.parser_url.clone()));
    let llm = Arc::new(ChatCompletionsClient::new(
        config.parse.llm_api_url.clone(),
        config.parse.llm_api_key.clone(),
        config.parse.llm_model.clone(),
    ));

    let mut registry = HandlerRegistry::new();
    registry.register(
        JobType::PdfParse.as_str(),
        Arc::new(DocumentParseHandler::new(
            store.clone(),
            cache.clone(),
            storage,
            extractor,
            llm,
            tracker,
            Duration::from_millis(config.parse.retry_backoff_ms),
        )),
    );
    let simulated = Arc::new(SimulatedHandler::new(Duration::from_millis(
        config.consumer.processing_time_ms,
    )));
    registry.register(JobType::TestJob.as_str(), simulated.clone());
    registry.register(JobType::SendEmail.as_str(), simulated);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        info!("shutdown signal received");
        _ = shutdown_tx.send(true);
    }));

    let worker = JobWorker::new(
        consumer,
        store,
        cache,
        Arc::new(registry),
        config.consumer.retry_max,
        Duration::from_millis(config.consumer.retry_backoff_ms),
        worker_liveness,
        shutdown_rx,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    drop(tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    }));

    worker.run().await;

    Ok(())
}

pub async fn index() -> &'static str {
    "rusty-jobs worker"
}
