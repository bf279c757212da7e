//! LLM seam used to structure extracted text against a schema.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm returned an unusable response: {0}")]
    BadResponse(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one prompt, return the raw model text.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Client for an OpenAI-compatible chat completions endpoint. The concrete
/// vendor is wiring, not behavior; anything speaking this shape works.
pub struct ChatCompletionsClient {
    url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl ChatCompletionsClient {
    pub fn new(url: String, api_key: String, model: String) -> Self {
        Self {
            url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmClient for ChatCompletionsClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::BadResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::BadResponse("response held no choices".to_owned()))
    }
}

/// Strip markdown fences and surrounding whitespace from a model response.
/// Models wrap JSON in ```json fences often enough that this is part of the
/// contract.
pub fn clean_json_response(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim()
}
