//! Production side of the job topic.

use std::time::Duration;

use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use thiserror::Error;
use tracing::info;

use super::KafkaConfig;
use crate::job::JobMessage;

/// Client context that feeds the liveness probe: rdkafka's polling thread is
/// alive exactly as long as this callback keeps firing.
pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        self.liveness.report_healthy_blocking();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("linger.ms", config.producer_linger_ms.to_string())
        .set("message.timeout.ms", config.message_timeout_ms.to_string())
        .set("compression.codec", &config.compression_codec)
        .set(
            "queue.buffering.max.kbytes",
            (config.producer_queue_mib * 1024).to_string(),
        );

    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext { liveness })?;

    // Reaching topic metadata proves the broker wiring before the first
    // create request depends on it; fail startup instead.
    _ = producer.client().fetch_metadata(
        Some(config.topic.as_str()),
        Timeout::After(Duration::from_secs(10)),
    )?;
    info!(
        "kafka producer connected to {} for topic {}",
        config.broker, config.topic
    );

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to serialize message: {error}")]
    SerializationError { error: serde_json::Error },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Publish one job message and wait for the broker ack. The submission
/// service only reports a create as successful once this returns Ok.
pub async fn send_job_message(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    message: &JobMessage,
) -> Result<(), ProduceError> {
    let payload = serde_json::to_string(message)
        .map_err(|error| ProduceError::SerializationError { error })?;
    let key = message.id.to_string();

    let ack = producer
        .send_result(FutureRecord {
            topic,
            payload: Some(&payload),
            partition: None,
            key: Some(&key),
            timestamp: None,
            headers: None,
        })
        .map_err(|(error, _)| ProduceError::KafkaProduceError { error })?;

    match ack.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err((error, _))) => Err(ProduceError::KafkaProduceError { error }),
        // Cancelled due to timeout while retrying
        Err(_) => Err(ProduceError::KafkaProduceCanceled),
    }
}
