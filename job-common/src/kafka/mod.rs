//! Kafka wiring shared by the submission service and the worker.

pub mod consumer;
pub mod producer;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BROKER", default = "localhost:9092")]
    pub broker: String,

    #[envconfig(from = "KAFKA_TOPIC", default = "jobs")]
    pub topic: String,

    #[envconfig(from = "KAFKA_PRODUCER_LINGER_MS", default = "20")]
    pub producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(from = "KAFKA_PRODUCER_QUEUE_MIB", default = "400")]
    pub producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(from = "KAFKA_MESSAGE_TIMEOUT_MS", default = "20000")]
    pub message_timeout_ms: u32, // Time before we stop retrying producing a message

    #[envconfig(from = "KAFKA_COMPRESSION_CODEC", default = "none")]
    pub compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub tls: bool,
}

impl KafkaConfig {
    /// Base rdkafka settings every client of this broker starts from; the
    /// producer and consumer layer their own keys on top.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.broker)
            .set("statistics.interval.ms", "10000");

        if self.tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        config
    }
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(from = "KAFKA_GROUP", default = "job-workers")]
    pub group: String,

    /// Number of in-worker retries after the first attempt.
    #[envconfig(from = "KAFKA_RETRY_MAX", default = "3")]
    pub retry_max: u32,

    /// Fixed sleep between attempts, in milliseconds.
    #[envconfig(from = "KAFKA_RETRY_BACKOFF", default = "1000")]
    pub retry_backoff_ms: u64,

    /// Simulated latency of the payload-free handlers, in milliseconds.
    #[envconfig(from = "KAFKA_PROCESSING_TIME", default = "1000")]
    pub processing_time_ms: u64,

    // We default to "earliest"; a brand new group should see the backlog.
    #[envconfig(from = "KAFKA_OFFSET_RESET", default = "earliest")]
    pub offset_reset: String,
}
