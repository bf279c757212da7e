//! The document-parse pipeline: fetch the payload, stage the PDF, extract
//! text, structure it with the LLM, persist the result.
//!
//! The pipeline owns its per-document retry budget through the status
//! tracker. Once that budget is spent the error escalates to the worker as
//! permanent, so the job fails without a second retry envelope on top.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use job_common::cache::{self, CacheError, Client};
use job_common::job::{JobMessage, ParseJobPayload, SourceKind};
use job_common::storage::Storage;
use job_common::store::JobStore;

use crate::error::HandlerError;
use crate::extract::TextExtractor;
use crate::llm::{clean_json_response, LlmClient};
use crate::registry::JobHandler;
use crate::tracker::{DocumentStage, StatusTracker};

pub struct DocumentParseHandler {
    store: Arc<dyn JobStore>,
    cache: Arc<dyn Client>,
    storage: Arc<Storage>,
    extractor: Arc<dyn TextExtractor>,
    llm: Arc<dyn LlmClient>,
    tracker: Arc<StatusTracker>,
    /// Sleep between per-document attempts.
    retry_backoff: Duration,
}

impl DocumentParseHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: Arc<dyn Client>,
        storage: Arc<Storage>,
        extractor: Arc<dyn TextExtractor>,
        llm: Arc<dyn LlmClient>,
        tracker: Arc<StatusTracker>,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            storage,
            extractor,
            llm,
            tracker,
            retry_backoff,
        }
    }

    /// Look the payload up under `job:{id}:payload`, falling back to the
    /// durable copy on the row when the cache entry has expired.
    async fn fetch_payload(&self, id: i64) -> Result<ParseJobPayload, HandlerError> {
        let raw = match self.cache.get(cache::payload_key(id)).await {
            Ok(raw) => raw,
            Err(CacheError::NotFound) => {
                let job = self.store.get(id).await.map_err(|e| {
                    HandlerError::Transient(format!("failed to load job row: {}", e))
                })?;
                match job.payload {
                    Some(payload) => payload.0.to_string(),
                    None => {
                        return Err(HandlerError::Permanent(
                            "job has no parse payload".to_owned(),
                        ))
                    }
                }
            }
            Err(err) => {
                return Err(HandlerError::Transient(format!(
                    "failed to fetch payload: {}",
                    err
                )))
            }
        };

        serde_json::from_str(&raw)
            .map_err(|e| HandlerError::Permanent(format!("failed to decode payload: {}", e)))
    }

    /// Resolve the readable path for the document. The boolean says whether
    /// this handler created the file and therefore must delete it.
    async fn stage(&self, payload: &ParseJobPayload) -> Result<(PathBuf, bool), HandlerError> {
        // Reuse what the submission service staged while it still exists.
        if let Some(path) = &payload.staged_path {
            let path = PathBuf::from(path);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok((path, false));
            }
        }

        match payload.source_kind {
            SourceKind::Url => self
                .storage
                .store_from_url(&payload.pdf_source)
                .await
                .map(|path| (path, true))
                .map_err(|e| HandlerError::Transient(e.to_string())),
            SourceKind::Base64 => {
                let bytes = payload
                    .decode_base64_source()
                    .map_err(|e| HandlerError::Permanent(e.to_string()))?;
                self.storage
                    .store_from_bytes(&bytes)
                    .await
                    .map(|path| (path, true))
                    .map_err(|e| HandlerError::Transient(e.to_string()))
            }
            SourceKind::Path => Ok((PathBuf::from(&payload.pdf_source), false)),
        }
    }

    /// One attempt of the fetch → extract → structure → persist pipeline.
    async fn run_attempt(
        &self,
        message: &JobMessage,
        payload: &ParseJobPayload,
        document_id: &str,
        staged: &mut Option<PathBuf>,
        local: &mut Option<PathBuf>,
    ) -> Result<(), HandlerError> {
        let path = match local {
            Some(path) => path.clone(),
            None => {
                let (path, owned) = self.stage(payload).await?;
                if owned {
                    *staged = Some(path.clone());
                }
                *local = Some(path.clone());
                path
            }
        };

        let text = self
            .extractor
            .extract(&path)
            .await
            .map_err(|e| HandlerError::Transient(format!("text extraction failed: {}", e)))?;
        self.tracker
            .update_status(document_id, DocumentStage::Converting, None);

        let prompt = build_prompt(payload, &text);
        let raw = self
            .llm
            .complete(&prompt)
            .await
            .map_err(|e| HandlerError::Transient(format!("llm request failed: {}", e)))?;

        // The model is nondeterministic; a malformed response is worth
        // another attempt.
        let cleaned = clean_json_response(&raw);
        let value: serde_json::Value = serde_json::from_str(cleaned)
            .map_err(|e| HandlerError::Transient(format!("llm returned invalid json: {}", e)))?;
        if !value.is_object() {
            return Err(HandlerError::Transient(
                "llm response is not a json object".to_owned(),
            ));
        }

        self.store
            .update_response(message.id, cleaned)
            .await
            .map_err(|e| HandlerError::Transient(format!("failed to persist result: {}", e)))?;
        if let Err(err) = self
            .cache
            .setex(
                cache::result_key(message.id),
                cleaned.to_owned(),
                self.storage.ttl().as_secs(),
            )
            .await
        {
            warn!(job_id = message.id, "failed to cache result: {}", err);
        }

        self.tracker
            .update_status(document_id, DocumentStage::Complete, None);
        info!(job_id = message.id, "document structured and persisted");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for DocumentParseHandler {
    async fn handle(
        &self,
        message: &JobMessage,
    ) -> Result<Option<serde_json::Value>, HandlerError> {
        let payload = self.fetch_payload(message.id).await?;
        let document_id = message.id.to_string();

        if let Some(url) = &payload.webhook_url {
            self.tracker.register_webhook(&document_id, url.clone());
        }
        self.tracker
            .update_status(&document_id, DocumentStage::Uploaded, None);

        // Stage once, reuse the file across attempts.
        let mut staged: Option<PathBuf> = None;
        let mut local: Option<PathBuf> = None;

        let outcome = loop {
            self.tracker
                .update_status(&document_id, DocumentStage::Parsing, None);

            match self
                .run_attempt(message, &payload, &document_id, &mut staged, &mut local)
                .await
            {
                Ok(()) => break Ok(()),
                Err(err) => {
                    warn!(job_id = message.id, "parse attempt failed: {}", err);
                    self.tracker.update_status(
                        &document_id,
                        DocumentStage::Failed,
                        Some(err.to_string()),
                    );

                    if err.is_retryable() && self.tracker.should_retry(&document_id) {
                        self.tracker
                            .update_status(&document_id, DocumentStage::Retrying, None);
                        tokio::time::sleep(self.retry_backoff).await;
                        continue;
                    }
                    break Err(err);
                }
            }
        };

        // Clean up anything this handler staged, on every exit path. Files
        // staged by the submission service are reaped by its TTL timer, and
        // `path` sources are used in place.
        if let Some(path) = staged {
            if let Err(err) = self.storage.delete(&path).await {
                warn!(job_id = message.id, "failed to clean up staged file: {}", err);
            }
        }

        match outcome {
            // the result is already on the row; nothing for the worker to add
            Ok(()) => Ok(None),
            Err(err) => Err(HandlerError::Permanent(format!(
                "document parse failed: {}",
                err
            ))),
        }
    }
}

fn build_prompt(payload: &ParseJobPayload, text: &str) -> String {
    let description = payload.description.as_deref().unwrap_or("a document");
    let mut prompt = format!(
        "Extract structured data from the following document ({}).\n\
         Respond with a single JSON object conforming to this schema and no surrounding prose:\n\
         {}\n",
        description, payload.expected_schema
    );
    if let Some(language) = payload
        .options
        .as_ref()
        .and_then(|options| options.language.as_deref())
    {
        prompt.push_str(&format!("The document language is {}.\n", language));
    }
    prompt.push_str("\nDocument text:\n");
    prompt.push_str(text);
    prompt
}
