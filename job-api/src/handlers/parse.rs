use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::{debug, warn};

use job_common::cache;
use job_common::job::{JobStatus, JobType, ParseJobPayload, SourceKind};
use job_common::store::NewJob;

use super::{decode_body, AppState};
use crate::error::ApiError;

/// Display name used for rows created through the parse-document endpoint.
const PARSE_JOB_NAME: &str = "Parse document";

#[derive(Serialize)]
pub struct ParsePostResponse {
    pub job_id: i64,
    pub status: JobStatus,
}

/// Create a `pdf_parse` job. The source is staged before the row exists so
/// a validation or staging failure leaves no state behind; afterwards the
/// create protocol is the same as for generic jobs, with the payload cached
/// under `job:{id}:payload` in between.
pub async fn create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ParsePostResponse>, ApiError> {
    let mut payload: ParseJobPayload = decode_body(&body)?;
    payload.validate()?;

    let staged = stage_source(&state, &payload).await?;
    if let Some(path) = &staged {
        payload.staged_path = Some(path.display().to_string());
        // staged files are reaped after the staging TTL regardless of outcome
        state.storage.schedule_cleanup(path.clone());
    }

    let payload_json = serde_json::to_value(&payload)
        .map_err(|e| ApiError::RequestParsingError(e.to_string()))?;

    // Step 1: the insert is the commit point for the job's existence.
    let job = match state
        .store
        .insert(NewJob {
            name: PARSE_JOB_NAME.to_owned(),
            job_type: JobType::PdfParse.as_str().to_owned(),
            payload: Some(payload_json.clone()),
        })
        .await
    {
        Ok(job) => job,
        Err(err) => {
            drop_staged(&state, &staged).await;
            return Err(err.into());
        }
    };

    debug!(job_id = job.id, "staging parse payload");

    // Step 2: stage the payload in the cache under the staging TTL.
    if let Err(err) = state
        .cache
        .setex(
            cache::payload_key(job.id),
            payload_json.to_string(),
            state.staging_ttl,
        )
        .await
    {
        drop_staged(&state, &staged).await;
        if let Err(err) = state.store.delete(job.id).await {
            warn!(job_id = job.id, "failed to reconcile job row: {}", err);
        }
        return Err(err.into());
    }

    // Steps 3 and 4, shared with the generic create.
    match super::jobs::finalize_create(&state, &job).await {
        Ok(()) => Ok(Json(ParsePostResponse {
            job_id: job.id,
            status: JobStatus::Pending,
        })),
        Err(err) => {
            drop_staged(&state, &staged).await;
            Err(err)
        }
    }
}

/// Download or decode the source into the staging directory. `path` sources
/// are used in place and never staged.
async fn stage_source(
    state: &AppState,
    payload: &ParseJobPayload,
) -> Result<Option<PathBuf>, ApiError> {
    match payload.source_kind {
        SourceKind::Url => {
            let path = state.storage.store_from_url(&payload.pdf_source).await?;
            Ok(Some(path))
        }
        SourceKind::Base64 => {
            let bytes = payload.decode_base64_source()?;
            let path = state.storage.store_from_bytes(&bytes).await?;
            Ok(Some(path))
        }
        SourceKind::Path => Ok(None),
    }
}

async fn drop_staged(state: &AppState, staged: &Option<PathBuf>) {
    if let Some(path) = staged {
        if let Err(err) = state.storage.delete(path).await {
            warn!("failed to drop staged file during reconcile: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use base64::Engine;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use job_common::cache;
    use job_common::cache::Client;
    use job_common::job::MAX_PDF_BYTES;
    use job_common::store::JobStore;

    use crate::handlers::jobs::tests::{authed_post, test_app};

    #[tokio::test]
    async fn parse_document_create_stages_and_publishes() {
        let test_app = test_app().await;

        // a path source needs an existing file only at handler time, so the
        // create path accepts it without touching the filesystem
        let body = json!({
            "pdf_source": "/data/incoming/report.pdf",
            "source_kind": "path",
            "expected_schema": {"title": "string", "total": "number"},
            "description": "quarterly report"
        });

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(
                &test_app,
                "/api/jobs/parse-document",
                body.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["job_id"], 1);
        assert_eq!(parsed["status"], "pending");

        // the payload is durably mirrored and cached under its key
        let job = test_app.store.get(1).await.unwrap();
        assert_eq!(job.job_type, "pdf_parse");
        assert!(job.payload.is_some());
        let cached = test_app
            .cache
            .get(cache::payload_key(1))
            .await
            .expect("payload should be cached");
        assert!(cached.contains("quarterly report"));

        // the message identifies the job
        let published = test_app.sink.messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, 1);
        assert_eq!(published[0].job_type, "pdf_parse");
    }

    #[tokio::test]
    async fn parse_document_create_stages_base64_sources() {
        let test_app = test_app().await;

        let encoded =
            base64::engine::general_purpose::STANDARD.encode(b"%PDF-1.7 tiny document");
        let body = json!({
            "pdf_source": encoded,
            "source_kind": "base64",
            "expected_schema": {"title": "string"}
        });

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(
                &test_app,
                "/api/jobs/parse-document",
                body.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // the decoded bytes landed in the staging directory and the cached
        // payload points at them
        let cached = test_app.cache.get(cache::payload_key(1)).await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(&cached).unwrap();
        let staged_path = payload["staged_path"].as_str().unwrap();
        assert!(staged_path.starts_with(
            test_app
                .staging_dir
                .path()
                .canonicalize()
                .unwrap()
                .to_str()
                .unwrap()
        ));
        assert_eq!(
            std::fs::read(staged_path).unwrap(),
            b"%PDF-1.7 tiny document"
        );
    }

    #[tokio::test]
    async fn parse_document_create_rejects_oversize_pdf() {
        let test_app = test_app().await;

        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.resize(MAX_PDF_BYTES + 1, b'a');
        let body = json!({
            "pdf_source": base64::engine::general_purpose::STANDARD.encode(&bytes),
            "source_kind": "base64",
            "expected_schema": {"title": "string"}
        });

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(
                &test_app,
                "/api/jobs/parse-document",
                body.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let raw = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            parsed["error"],
            "PDF size exceeds maximum allowed size of 10MB"
        );

        // no row inserted, no message published
        assert_eq!(test_app.store.job_count(), 0);
        assert!(test_app.sink.messages().is_empty());
    }

    #[tokio::test]
    async fn parse_document_create_rejects_bad_webhook_urls() {
        let test_app = test_app().await;

        let body = json!({
            "pdf_source": "/data/incoming/report.pdf",
            "source_kind": "path",
            "expected_schema": {"title": "string"},
            "webhook_url": "not a url"
        });

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(
                &test_app,
                "/api/jobs/parse-document",
                body.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(test_app.store.job_count(), 0);
    }

    #[tokio::test]
    async fn parse_document_create_requires_a_token() {
        use axum::body::Body;
        use axum::http::{self, Request};

        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/api/jobs/parse-document")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
