//! Text extraction seam. The production implementation delegates to an
//! external parser service; tests inject their own extractor.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to read document: {0}")]
    Io(#[from] std::io::Error),
    #[error("parser service request failed: {0}")]
    Request(String),
    #[error("parser service returned an unusable response: {0}")]
    BadResponse(String),
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String, ExtractError>;
}

/// POSTs the raw document to a parser service and expects `{"text": "..."}`.
pub struct ParserServiceExtractor {
    url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ParserResponse {
    text: String,
}

impl ParserServiceExtractor {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TextExtractor for ParserServiceExtractor {
    async fn extract(&self, path: &Path) -> Result<String, ExtractError> {
        let bytes = tokio::fs::read(path).await?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(bytes)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ExtractError::Request(e.to_string()))?;

        let parsed: ParserResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::BadResponse(e.to_string()))?;

        Ok(parsed.text)
    }
}
