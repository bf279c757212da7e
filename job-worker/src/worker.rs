//! The consumer-group worker: receive, dispatch, retry, advance state,
//! store the offset.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use health::HealthHandle;
use job_common::cache::{self, Client};
use job_common::job::{JobMessage, JobStatus};
use job_common::kafka::consumer::{ConsumeError, JobConsumer};
use job_common::store::{JobStore, StoreError};

use crate::error::{HandlerError, WorkerError};
use crate::registry::{HandlerRegistry, JobHandler};

pub struct JobWorker {
    consumer: JobConsumer,
    store: Arc<dyn JobStore>,
    cache: Arc<dyn Client>,
    registry: Arc<HandlerRegistry>,
    /// Number of retries after the first attempt.
    retry_max: u32,
    /// Fixed sleep between attempts.
    retry_backoff: Duration,
    liveness: HealthHandle,
    shutdown: watch::Receiver<bool>,
}

impl JobWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: JobConsumer,
        store: Arc<dyn JobStore>,
        cache: Arc<dyn Client>,
        registry: Arc<HandlerRegistry>,
        retry_max: u32,
        retry_backoff: Duration,
        liveness: HealthHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer,
            store,
            cache,
            registry,
            retry_max,
            retry_backoff,
            liveness,
            shutdown,
        }
    }

    /// Consume until shutdown. The offset for a message is stored only once
    /// its durable state has advanced; transient broker errors restart the
    /// receive loop.
    pub async fn run(mut self) {
        info!("worker consuming from the job topic");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                received = self.consumer.next_job() => match received {
                    Ok((message, token)) => {
                        self.liveness.report_healthy().await;
                        match self.process_message(&message).await {
                            Ok(()) => {
                                if let Err(err) = self.consumer.mark_processed(token) {
                                    error!(job_id = message.id, "failed to store offset: {}", err);
                                }
                            }
                            Err(WorkerError::Interrupted) => {
                                // state was not advanced; the message will be
                                // redelivered after the restart
                                info!(job_id = message.id, "job interrupted by shutdown");
                                break;
                            }
                            Err(err) => {
                                // leave the offset unstored so the message is
                                // redelivered
                                error!(job_id = message.id, "failed to process job: {}", err);
                            }
                        }
                    }
                    Err(ConsumeError::Unusable(reason)) => {
                        // already acknowledged by the consumer; the group
                        // moves past it
                        warn!("skipping unusable message on the job topic: {}", reason);
                    }
                    Err(ConsumeError::Receive(err)) => {
                        warn!("kafka receive error, restarting consume loop: {}", err);
                    }
                },
            }
        }

        info!("shutdown requested, committing offsets and leaving the group");
        self.consumer.shutdown();
    }

    /// Run one message through resolution, the retry loop, and the terminal
    /// state writes. `Ok` means the offset may be stored.
    pub async fn process_message(&self, message: &JobMessage) -> Result<(), WorkerError> {
        metrics::counter!("jobs_consumed_total").increment(1);

        let Some(handler) = self.registry.resolve(&message.job_type) else {
            warn!(
                job_id = message.id,
                job_type = %message.job_type,
                "unknown job type, marking job failed"
            );
            self.advance(self.store.mark_failed(message.id).await)?;
            self.set_cached_status(message.id, JobStatus::Failed).await;
            metrics::counter!("jobs_failed").increment(1);
            return Ok(());
        };

        self.advance(self.store.mark_processing(message.id).await)?;
        self.set_cached_status(message.id, JobStatus::Processing)
            .await;

        let started = tokio::time::Instant::now();
        let outcome = self.run_with_retries(handler, message).await?;
        metrics::histogram!("job_processing_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                let response = result.map(|value| value.to_string());
                self.advance(self.store.mark_completed(message.id, response).await)?;
                self.set_cached_status(message.id, JobStatus::Completed)
                    .await;
                metrics::counter!("jobs_completed").increment(1);
                info!(job_id = message.id, "job completed");
            }
            Err(err) => {
                self.advance(self.store.mark_failed(message.id).await)?;
                self.set_cached_status(message.id, JobStatus::Failed).await;
                metrics::counter!("jobs_failed").increment(1);
                error!(job_id = message.id, "job failed: {}", err);
            }
        }

        Ok(())
    }

    /// Up to `retry_max + 1` attempts with a fixed backoff in between.
    /// Permanent errors break out immediately; a shutdown during backoff
    /// aborts the loop without consuming the message.
    async fn run_with_retries(
        &self,
        handler: Arc<dyn JobHandler>,
        message: &JobMessage,
    ) -> Result<Result<Option<serde_json::Value>, HandlerError>, WorkerError> {
        let max_attempts = self.retry_max + 1;
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 1u32;

        loop {
            match run_attempt(handler.clone(), message.clone()).await {
                Ok(result) => return Ok(Ok(result)),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(
                        job_id = message.id,
                        attempt, "attempt failed, retrying: {}", err
                    );
                    metrics::counter!("jobs_retried").increment(1);
                    attempt += 1;

                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                        _ = shutdown.changed() => return Err(WorkerError::Interrupted),
                    }
                }
                Err(err) => return Ok(Err(err)),
            }
        }
    }

    /// Status writes tolerate a missing row: the producer reconciled the job
    /// away, so there is nothing to advance and nothing to redeliver for.
    fn advance(&self, result: Result<(), StoreError>) -> Result<(), WorkerError> {
        match result {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(id)) => {
                warn!(job_id = id, "job row is gone, skipping status write");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The cache is the freshness layer, not the source of truth; failures
    /// here are logged and do not fail the message.
    async fn set_cached_status(&self, id: i64, status: JobStatus) {
        if let Err(err) = self
            .cache
            .set(cache::status_key(id), status.to_string())
            .await
        {
            warn!(job_id = id, "failed to update cached status: {}", err);
        }
    }
}

/// One attempt on a spawned task, so a panicking handler is converted into a
/// retryable failure instead of tearing down the worker.
async fn run_attempt(
    handler: Arc<dyn JobHandler>,
    message: JobMessage,
) -> Result<Option<serde_json::Value>, HandlerError> {
    let task = tokio::spawn(async move { handler.handle(&message).await });

    match task.await {
        Ok(result) => result,
        Err(join_error) => {
            if join_error.is_panic() {
                let panic = join_error.into_panic();
                let description = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic with a non-string payload".to_owned());
                Err(HandlerError::Panicked(description))
            } else {
                Err(HandlerError::Transient(
                    "handler task was cancelled".to_owned(),
                ))
            }
        }
    }
}
