//! Shared job contracts: the durable record, the queue message, and the
//! document-parse payload.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Maximum size of a decoded base64 PDF source.
pub const MAX_PDF_BYTES: usize = 10 * 1024 * 1024;

/// Enumeration of parsing errors for the closed-set tags below.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
    #[error("{0} is not a valid JobType")]
    ParseJobTypeError(String),
}

/// Enumeration of possible statuses for a Job.
///
/// Status moves along `pending -> processing -> (completed | failed)`; the
/// only backward transition is `failed -> processing` on an explicit replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// A job that has been persisted and published but not yet picked up.
    Pending,
    /// A job currently being run by a worker.
    Processing,
    /// A job that was successfully completed by a worker.
    Completed,
    /// A job that was unsuccessfully completed by a worker.
    Failed,
}

/// Allow casting JobStatus from strings.
impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(ParseError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

struct JobStatusVisitor;

impl<'de> Visitor<'de> for JobStatusVisitor {
    type Value = JobStatus;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of JobStatus")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match JobStatus::from_str(s) {
            Ok(status) => Ok(status),
            Err(_) => Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s),
                &self,
            )),
        }
    }
}

/// Deserialize required to read `JobStatus` from the cache.
impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(JobStatusVisitor)
    }
}

/// Serialize required to write `JobStatus` into API responses.
impl Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// The set of job types known to the submission service.
///
/// The queue message and the worker registry carry the string tag instead so
/// producers can roll out new types ahead of consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    PdfParse,
    SendEmail,
    TestJob,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::PdfParse => "pdf_parse",
            JobType::SendEmail => "send_email",
            JobType::TestJob => "test_job",
        }
    }
}

impl FromStr for JobType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf_parse" => Ok(JobType::PdfParse),
            "send_email" => Ok(JobType::SendEmail),
            "test_job" => Ok(JobType::TestJob),
            invalid => Err(ParseError::ParseJobTypeError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durable job row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    /// A unique id identifying a job. Stable once assigned, never reused.
    pub id: i64,
    /// A human-readable name for the job.
    pub name: String,
    /// The current status of the job.
    pub status: JobStatus,
    /// The type tag that selects a handler on the worker.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    /// When the job row was inserted.
    pub created_at: DateTime<Utc>,
    /// Type-specific payload, stored as JSON. Null for payload-free types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<sqlx::types::Json<serde_json::Value>>,
    /// Final result, set only when the job completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// The message published to the job topic.
///
/// Payloads never travel in the message: the handler looks them up in the
/// cache under `job:{id}:payload`, falling back to the durable row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime"
    )]
    pub created_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            job_type: job.job_type.clone(),
            created_at: job.created_at,
        }
    }
}

pub fn serialize_datetime<S>(datetime: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&datetime.format("%Y-%m-%d %H:%M:%S%.f").to_string())
}

pub fn deserialize_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let naive = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(serde::de::Error::custom)?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Where a document-parse source comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Url,
    Base64,
    Path,
}

/// Validation errors for `ParseJobPayload`, surfaced as 400s.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("pdf_source cannot be empty")]
    EmptySource,
    #[error("pdf_source is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("pdf_source does not look like a PDF document")]
    NotAPdf,
    #[error("PDF size exceeds maximum allowed size of 10MB")]
    PdfTooLarge,
    #[error("pdf_source is not a valid url: {0}")]
    InvalidUrl(String),
    #[error("expected_schema must be a JSON object")]
    SchemaNotAnObject,
    #[error("webhook_url is not a valid http(s) url: {0}")]
    InvalidWebhookUrl(String),
}

/// Options forwarded to the document-parse pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_enabled: Option<bool>,
}

/// The payload of a `pdf_parse` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseJobPayload {
    /// URL, base64 bytes, or a local path, depending on `source_kind`.
    pub pdf_source: String,
    pub source_kind: SourceKind,
    /// The schema the structured output should conform to. Opaque to the
    /// worker; forwarded verbatim to the LLM prompt.
    pub expected_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ParseOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Set by the submission service once the source has been staged
    /// locally. Consumers re-stage from `pdf_source` when the file is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_path: Option<String>,
}

impl ParseJobPayload {
    /// Enforce the payload invariants before a job is accepted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pdf_source.is_empty() {
            return Err(ValidationError::EmptySource);
        }

        match self.source_kind {
            SourceKind::Url => {
                url::Url::parse(&self.pdf_source)
                    .map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;
            }
            SourceKind::Base64 => {
                _ = self.decode_base64_source()?;
            }
            SourceKind::Path => {}
        }

        if !self.expected_schema.is_object() {
            return Err(ValidationError::SchemaNotAnObject);
        }

        if let Some(webhook_url) = &self.webhook_url {
            let parsed = url::Url::parse(webhook_url)
                .map_err(|e| ValidationError::InvalidWebhookUrl(e.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ValidationError::InvalidWebhookUrl(format!(
                    "unsupported scheme {}",
                    parsed.scheme()
                )));
            }
        }

        Ok(())
    }

    /// Decode a base64 source, checking the PDF magic and the size cap.
    pub fn decode_base64_source(&self) -> Result<Vec<u8>, ValidationError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&self.pdf_source)
            .map_err(|e| ValidationError::InvalidBase64(e.to_string()))?;
        if !decoded.starts_with(b"%PDF") {
            return Err(ValidationError::NotAPdf);
        }
        if decoded.len() > MAX_PDF_BYTES {
            return Err(ValidationError::PdfTooLarge);
        }
        Ok(decoded)
    }
}
