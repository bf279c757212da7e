//! The queue seam of the submission service.

use std::sync::Mutex;

use async_trait::async_trait;
use rdkafka::producer::FutureProducer;

use job_common::job::JobMessage;
use job_common::kafka::producer::{send_job_message, KafkaContext, ProduceError};

/// Accepts job messages for the job topic. A successful `publish` means the
/// broker acknowledged the message, not merely that it was enqueued locally.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn publish(&self, message: &JobMessage) -> Result<(), ProduceError>;
}

pub struct KafkaJobSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaJobSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl JobSink for KafkaJobSink {
    async fn publish(&self, message: &JobMessage) -> Result<(), ProduceError> {
        send_job_message(&self.producer, &self.topic, message).await
    }
}

/// Collects published messages instead of talking to a broker. Used by
/// router tests.
#[derive(Default)]
pub struct MemorySink {
    messages: Mutex<Vec<JobMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn messages(&self) -> Vec<JobMessage> {
        self.messages.lock().expect("poisoned sink").clone()
    }
}

#[async_trait]
impl JobSink for MemorySink {
    async fn publish(&self, message: &JobMessage) -> Result<(), ProduceError> {
        self.messages
            .lock()
            .expect("poisoned sink")
            .push(message.clone());
        Ok(())
    }
}
