use std::future::ready;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tracing::{info, warn};

use health::HealthRegistry;
use job_api::auth::AuthService;
use job_api::config::Config;
use job_api::handlers::{self, AppState};
use job_api::sink::KafkaJobSink;
use job_common::cache::RedisClient;
use job_common::kafka::producer::create_kafka_producer;
use job_common::metrics::setup_metrics_routes;
use job_common::storage::Storage;
use job_common::store::{JobStore, PostgresJobStore};

async fn listen(app: Router, bind: String, shutdown_window: Duration) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_window))
        .await?;

    Ok(())
}

/// Completes when SIGINT or SIGTERM arrives. Also arms a hard exit so a
/// request that refuses to drain cannot hold the process past the window.
async fn shutdown_signal(window: Duration) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }

    info!("shutdown signal received, draining in-flight requests");
    _ = tokio::spawn(async move {
        tokio::time::sleep(window).await;
        warn!("shutdown window elapsed, exiting");
        std::process::exit(0);
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    let producer_liveness = liveness
        .register("kafka-producer".to_string(), time::Duration::seconds(30))
        .await;

    let store: Arc<dyn JobStore> = Arc::new(
        PostgresJobStore::new(&config.database_url, config.max_pg_connections).await?,
    );
    let cache = Arc::new(RedisClient::new(config.redis.url())?);
    let producer = create_kafka_producer(&config.kafka, producer_liveness).await?;
    let sink = Arc::new(KafkaJobSink::new(producer, config.kafka.topic.clone()));
    let storage = Arc::new(
        Storage::new(
            Path::new(&config.storage.temp_dir),
            config.storage.max_size,
            Duration::from_secs(config.storage.ttl_seconds),
        )
        .await?,
    );

    let state = AppState {
        store,
        cache,
        sink,
        storage,
        auth: AuthService::new(&config.auth),
        staging_ttl: config.storage.ttl_seconds,
    };

    let app = handlers::add_routes(Router::new(), state)
        .route("/_readiness", get(handlers::index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let app = setup_metrics_routes(app);

    let bind = config.bind();
    info!("submission service listening on {}", bind);
    listen(app, bind, config.shutdown_timeout.0).await
}
