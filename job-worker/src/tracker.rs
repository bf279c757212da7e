//! In-memory lifecycle tracking for documents moving through the parse
//! pipeline, with subscriber fan-out, webhook notifications, and aggregate
//! metrics.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stages a document moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStage {
    Uploaded,
    Parsing,
    Converting,
    Complete,
    Failed,
    Retrying,
}

/// A snapshot of one document's lifecycle record.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatus {
    pub document_id: String,
    pub stage: DocumentStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Aggregate counters across all documents this tracker has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerMetrics {
    pub total_documents: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub total_processing_ms: u64,
    pub avg_processing_ms: u64,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("no status recorded for document {0}")]
    UnknownDocument(String),
}

#[derive(Default)]
struct TrackerInner {
    records: HashMap<String, DocumentStatus>,
    started_at: HashMap<String, DateTime<Utc>>,
    webhooks: HashMap<String, String>,
    subscribers: Vec<mpsc::Sender<DocumentStatus>>,
    metrics: TrackerMetrics,
}

/// One exclusion domain covers records, subscribers, and metrics; webhook
/// and subscriber delivery happen outside of it on a snapshot.
pub struct StatusTracker {
    inner: Mutex<TrackerInner>,
    max_retries: u32,
    client: reqwest::Client,
}

impl StatusTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            max_retries,
            client: reqwest::Client::new(),
        }
    }

    /// Associate a webhook with a document; every subsequent update is
    /// POSTed there, best effort, without blocking the update.
    pub fn register_webhook(&self, document_id: &str, url: String) {
        let mut inner = self.inner.lock().expect("poisoned tracker lock");
        drop(inner.webhooks.insert(document_id.to_owned(), url));
    }

    pub fn update_status(&self, document_id: &str, stage: DocumentStage, error: Option<String>) {
        let (snapshot, subscribers, webhook) = {
            let mut inner = self.inner.lock().expect("poisoned tracker lock");

            let previous = inner.records.get(document_id);
            let retry_count = match (previous, stage) {
                (Some(record), DocumentStage::Retrying) => record.retry_count + 1,
                (Some(record), _) => record.retry_count,
                (None, DocumentStage::Retrying) => 1,
                (None, _) => 0,
            };
            let is_new = previous.is_none();

            let record = DocumentStatus {
                document_id: document_id.to_owned(),
                stage,
                error,
                updated_at: Utc::now(),
                retry_count,
            };
            drop(
                inner
                    .records
                    .insert(document_id.to_owned(), record.clone()),
            );

            if is_new {
                inner.metrics.total_documents += 1;
                let _ = inner
                    .started_at
                    .insert(document_id.to_owned(), record.updated_at);
            }
            match stage {
                DocumentStage::Retrying => inner.metrics.retries += 1,
                DocumentStage::Complete => {
                    inner.metrics.succeeded += 1;
                    if let Some(started) = inner.started_at.get(document_id).copied() {
                        let elapsed =
                            (record.updated_at - started).num_milliseconds().max(0) as u64;
                        inner.metrics.total_processing_ms += elapsed;
                        inner.metrics.avg_processing_ms =
                            inner.metrics.total_processing_ms / inner.metrics.succeeded;
                    }
                }
                // only terminal failures count: the retry budget is spent
                DocumentStage::Failed if retry_count >= self.max_retries => {
                    inner.metrics.failed += 1
                }
                _ => {}
            }

            (
                record,
                inner.subscribers.clone(),
                inner.webhooks.get(document_id).cloned(),
            )
        };

        // Subscribers that cannot accept immediately are skipped; the
        // pipeline never waits on an observer.
        for subscriber in &subscribers {
            if subscriber.try_send(snapshot.clone()).is_err() {
                debug!(document_id, "subscriber full or closed, skipping delivery");
            }
        }

        if let Some(url) = webhook {
            let client = self.client.clone();
            let payload = snapshot;
            drop(tokio::spawn(async move {
                if let Err(err) = client.post(&url).json(&payload).send().await {
                    warn!("status webhook delivery failed: {}", err);
                }
            }));
        }
    }

    pub fn get_status(&self, document_id: &str) -> Result<DocumentStatus, TrackerError> {
        self.inner
            .lock()
            .expect("poisoned tracker lock")
            .records
            .get(document_id)
            .cloned()
            .ok_or_else(|| TrackerError::UnknownDocument(document_id.to_owned()))
    }

    /// True iff the document failed and its retry budget is not spent.
    pub fn should_retry(&self, document_id: &str) -> bool {
        let inner = self.inner.lock().expect("poisoned tracker lock");
        match inner.records.get(document_id) {
            Some(record) => {
                record.stage == DocumentStage::Failed && record.retry_count < self.max_retries
            }
            None => false,
        }
    }

    pub fn subscribe(&self, sender: mpsc::Sender<DocumentStatus>) {
        let mut inner = self.inner.lock().expect("poisoned tracker lock");
        inner.subscribers.push(sender);
    }

    /// Removes the first matching subscriber; a no-op when absent.
    pub fn unsubscribe(&self, sender: &mpsc::Sender<DocumentStatus>) {
        let mut inner = self.inner.lock().expect("poisoned tracker lock");
        if let Some(position) = inner
            .subscribers
            .iter()
            .position(|s| s.same_channel(sender))
        {
            drop(inner.subscribers.remove(position));
        }
    }

    pub fn metrics(&self) -> TrackerMetrics {
        self.inner
            .lock()
            .expect("poisoned tracker lock")
            .metrics
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(received: &mut mpsc::Receiver<DocumentStatus>) -> Vec<DocumentStage> {
        let mut out = Vec::new();
        while let Ok(update) = received.try_recv() {
            out.push(update.stage);
        }
        out
    }

    #[tokio::test]
    async fn tracks_a_successful_document_with_one_retry() {
        let tracker = StatusTracker::new(3);
        let (tx, mut rx) = mpsc::channel(32);
        tracker.subscribe(tx);

        // first attempt fails, second succeeds
        tracker.update_status("1", DocumentStage::Uploaded, None);
        tracker.update_status("1", DocumentStage::Parsing, None);
        tracker.update_status("1", DocumentStage::Failed, Some("no text".to_owned()));
        assert!(tracker.should_retry("1"));
        tracker.update_status("1", DocumentStage::Retrying, None);
        tracker.update_status("1", DocumentStage::Parsing, None);
        tracker.update_status("1", DocumentStage::Converting, None);
        tracker.update_status("1", DocumentStage::Complete, None);

        assert_eq!(
            stages(&mut rx),
            vec![
                DocumentStage::Uploaded,
                DocumentStage::Parsing,
                DocumentStage::Failed,
                DocumentStage::Retrying,
                DocumentStage::Parsing,
                DocumentStage::Converting,
                DocumentStage::Complete,
            ]
        );

        let metrics = tracker.metrics();
        assert_eq!(metrics.total_documents, 1);
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.failed, 0);
        assert_eq!(metrics.retries, 1);

        let record = tracker.get_status("1").unwrap();
        assert_eq!(record.stage, DocumentStage::Complete);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausted_documents_count_as_failures() {
        let tracker = StatusTracker::new(2);

        tracker.update_status("1", DocumentStage::Uploaded, None);
        for _ in 0..2 {
            tracker.update_status("1", DocumentStage::Parsing, None);
            tracker.update_status("1", DocumentStage::Failed, Some("boom".to_owned()));
            assert!(tracker.should_retry("1"));
            tracker.update_status("1", DocumentStage::Retrying, None);
        }
        tracker.update_status("1", DocumentStage::Parsing, None);
        tracker.update_status("1", DocumentStage::Failed, Some("boom".to_owned()));

        // the budget is spent
        assert!(!tracker.should_retry("1"));

        let metrics = tracker.metrics();
        assert_eq!(metrics.total_documents, 1);
        assert_eq!(metrics.succeeded, 0);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.retries, 2);

        // the retry invariant holds
        let record = tracker.get_status("1").unwrap();
        assert!(record.retry_count <= 2 + 1);
    }

    #[tokio::test]
    async fn a_plain_failure_does_not_touch_the_retry_count() {
        let tracker = StatusTracker::new(3);

        tracker.update_status("1", DocumentStage::Uploaded, None);
        tracker.update_status("1", DocumentStage::Failed, Some("boom".to_owned()));

        assert_eq!(tracker.get_status("1").unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn unknown_documents_are_an_error() {
        let tracker = StatusTracker::new(3);
        assert!(matches!(
            tracker.get_status("ghost"),
            Err(TrackerError::UnknownDocument(_))
        ));
        assert!(!tracker.should_retry("ghost"));
    }

    #[tokio::test]
    async fn slow_subscribers_are_skipped_not_awaited() {
        let tracker = StatusTracker::new(3);
        let (tx, mut rx) = mpsc::channel(1);
        tracker.subscribe(tx);

        // the channel holds one update; the second must not block the tracker
        tracker.update_status("1", DocumentStage::Uploaded, None);
        tracker.update_status("1", DocumentStage::Parsing, None);

        assert_eq!(stages(&mut rx), vec![DocumentStage::Uploaded]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_first_match_and_tolerates_absence() {
        let tracker = StatusTracker::new(3);
        let (tx, mut rx) = mpsc::channel(8);
        let (stranger_tx, _stranger_rx) = mpsc::channel(8);

        tracker.subscribe(tx.clone());
        // not subscribed: a no-op
        tracker.unsubscribe(&stranger_tx);

        tracker.update_status("1", DocumentStage::Uploaded, None);
        assert_eq!(stages(&mut rx).len(), 1);

        tracker.unsubscribe(&tx);
        tracker.update_status("1", DocumentStage::Parsing, None);
        assert!(stages(&mut rx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn webhooks_receive_status_updates() {
        use std::sync::{Arc, Mutex};

        use axum::extract::State;
        use axum::routing::post;
        use axum::Json;

        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route(
                "/hook",
                post(
                    |State(sink): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        sink.lock().unwrap().push(body);
                        "ok"
                    },
                ),
            )
            .with_state(sink);
        drop(tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        }));

        let tracker = StatusTracker::new(3);
        tracker.register_webhook("1", format!("http://{}/hook", addr));
        tracker.update_status("1", DocumentStage::Uploaded, None);

        // delivery is fire-and-forget; poll briefly
        for _ in 0..50 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["document_id"], "1");
        assert_eq!(received[0]["stage"], "uploaded");
    }
}
