//! Consumption side of the job topic.
//!
//! Receiving and acknowledging are deliberately split: [`JobConsumer::next_job`]
//! hands back a [`DeliveryToken`] alongside the decoded message, and the
//! worker trades the token in through [`JobConsumer::mark_processed`] only
//! after the job's durable state has advanced. A crash in between leaves the
//! offset unstored, so the broker delivers the message again.

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::Message;
use thiserror::Error;
use tracing::warn;

use super::{ConsumerConfig, KafkaConfig};
use crate::job::JobMessage;

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("failed to receive from the job topic: {0}")]
    Receive(#[from] KafkaError),
    /// The message cannot identify a job. Its offset is already stored by
    /// the time this error surfaces, so the group simply moves past it.
    #[error("discarded an unusable message on the job topic: {0}")]
    Unusable(String),
}

/// A consumer-group member subscribed to the job topic.
pub struct JobConsumer {
    consumer: StreamConsumer,
    topic: String,
}

/// Proof of receipt for one job message. Trading it in stores the offset,
/// which the periodic auto-commit then persists for the group.
pub struct DeliveryToken {
    partition: i32,
    offset: i64,
}

impl JobConsumer {
    pub fn new(kafka: &KafkaConfig, config: &ConsumerConfig) -> Result<Self, KafkaError> {
        let mut client_config = kafka.client_config();
        client_config
            .set("group.id", &config.group)
            .set("auto.offset.reset", &config.offset_reset)
            // offsets advance through mark_processed, never on receipt
            .set("enable.auto.offset.store", "false");

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[kafka.topic.as_str()])?;

        Ok(Self {
            consumer,
            topic: kafka.topic.clone(),
        })
    }

    /// Block until the next job message arrives.
    ///
    /// A message with an empty or undecodable payload cannot correspond to
    /// any job row. Such messages are acknowledged on the spot and surfaced
    /// as [`ConsumeError::Unusable`], so the caller logs them and keeps
    /// consuming instead of parking the partition on a poison pill.
    pub async fn next_job(&self) -> Result<(JobMessage, DeliveryToken), ConsumeError> {
        let received = self.consumer.recv().await?;
        let token = DeliveryToken {
            partition: received.partition(),
            offset: received.offset(),
        };

        let decoded = match received.payload() {
            None => Err("empty payload".to_owned()),
            Some(bytes) => serde_json::from_slice::<JobMessage>(bytes).map_err(|e| e.to_string()),
        };

        match decoded {
            Ok(message) => Ok((message, token)),
            Err(reason) => {
                if let Err(err) = self.mark_processed(token) {
                    warn!("failed to skip over an unusable message: {}", err);
                }
                Err(ConsumeError::Unusable(reason))
            }
        }
    }

    /// Store the offset of a delivery whose durable state has advanced.
    pub fn mark_processed(&self, token: DeliveryToken) -> Result<(), KafkaError> {
        self.consumer
            .store_offset(&self.topic, token.partition, token.offset)
    }

    /// Flush stored offsets synchronously so the member leaves the group
    /// without losing progress. Called once on shutdown.
    pub fn shutdown(&self) {
        if let Err(err) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            // NO_OFFSET only means nothing was stored since the last commit
            warn!("offset commit on shutdown failed: {}", err);
        }
    }
}
