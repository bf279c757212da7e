//! Handler for the payload-free job types (`test_job`, `send_email`):
//! simulates the configured processing latency and completes with a small
//! result. The real emailer lives outside this service.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use job_common::job::JobMessage;

use crate::error::HandlerError;
use crate::registry::JobHandler;

pub struct SimulatedHandler {
    processing_time: Duration,
}

impl SimulatedHandler {
    pub fn new(processing_time: Duration) -> Self {
        Self { processing_time }
    }
}

#[async_trait]
impl JobHandler for SimulatedHandler {
    async fn handle(
        &self,
        message: &JobMessage,
    ) -> Result<Option<serde_json::Value>, HandlerError> {
        info!(
            job_id = message.id,
            job_type = %message.job_type,
            "simulating {}ms of work",
            self.processing_time.as_millis()
        );
        tokio::time::sleep(self.processing_time).await;

        Ok(Some(json!({
            "message": format!("{} processed", message.name),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn completes_with_a_result() {
        let handler = SimulatedHandler::new(Duration::from_millis(0));
        let message = JobMessage {
            id: 1,
            name: "Test Job".to_owned(),
            job_type: "test_job".to_owned(),
            created_at: Utc::now(),
        };

        let result = handler.handle(&message).await.unwrap().unwrap();
        assert_eq!(result["message"], "Test Job processed");
    }
}
