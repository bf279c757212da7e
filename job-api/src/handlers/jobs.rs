use std::str::FromStr;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use job_common::cache;
use job_common::job::{Job, JobMessage, JobStatus, JobType};
use job_common::store::NewJob;

use super::{decode_body, AppState};
use crate::error::ApiError;

/// The body of a request made to create a generic job.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct JobPostRequestBody {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub job: Job,
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
}

pub async fn create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<JobResponse>, ApiError> {
    let body: JobPostRequestBody = decode_body(&body)?;
    debug!("received job create request: {:?}", body);

    if body.name.trim().is_empty() {
        return Err(ApiError::EmptyJobName);
    }
    let job_type = JobType::from_str(&body.job_type)
        .map_err(|_| ApiError::UnknownJobType(body.job_type.clone()))?;

    let start_time = Instant::now();

    // Step 1: the insert is the commit point for the job's existence.
    let job = state
        .store
        .insert(NewJob {
            name: body.name,
            job_type: job_type.as_str().to_owned(),
            payload: None,
        })
        .await?;

    finalize_create(&state, &job).await?;

    metrics::histogram!("job_create_duration_seconds")
        .record(start_time.elapsed().as_secs_f64());

    Ok(Json(JobResponse { job }))
}

/// Steps 3 and 4 of the create protocol: materialize `pending` in the cache,
/// then publish. A create only returns success once the broker accepted the
/// message; on failure the row is deleted so workers never see a job whose
/// message was never sent.
pub(super) async fn finalize_create(state: &AppState, job: &Job) -> Result<(), ApiError> {
    if let Err(err) = state
        .cache
        .set(cache::status_key(job.id), JobStatus::Pending.to_string())
        .await
    {
        reconcile(state, job.id).await;
        return Err(err.into());
    }

    let message = JobMessage::from_job(job);
    if let Err(err) = state.sink.publish(&message).await {
        error!(job_id = job.id, "failed to publish job message: {}", err);
        reconcile(state, job.id).await;
        return Err(err.into());
    }

    Ok(())
}

/// Undo a partially created job: delete the row and any cache entries.
async fn reconcile(state: &AppState, id: i64) {
    if let Err(err) = state.store.delete(id).await {
        error!(job_id = id, "failed to reconcile partially created job: {}", err);
    }
    for key in [cache::status_key(id), cache::payload_key(id)] {
        if let Err(err) = state.cache.del(key).await {
            warn!(job_id = id, "failed to drop cache entry during reconcile: {}", err);
        }
    }
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let id: i64 = id.parse().map_err(|_| ApiError::InvalidJobId)?;

    let mut job = state.store.get(id).await?;
    overlay_cached_status(&state, &mut job).await;

    Ok(Json(JobResponse { job }))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<JobListResponse>, ApiError> {
    let mut jobs = state.store.list().await?;
    for job in &mut jobs {
        overlay_cached_status(&state, job).await;
    }

    Ok(Json(JobListResponse { jobs }))
}

/// The cache is fresher than the row during a job's active window: replace
/// the persisted status whenever a parseable entry exists.
async fn overlay_cached_status(state: &AppState, job: &mut Job) {
    if let Ok(value) = state.cache.get(cache::status_key(job.id)).await {
        if let Ok(status) = JobStatus::from_str(&value) {
            job.status = status;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{self, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `oneshot`

    use job_common::cache::{Client, MockRedisClient};
    use job_common::kafka::producer::ProduceError;
    use job_common::storage::Storage;
    use job_common::store::JobStore;
    use job_common::test_utils::MemoryJobStore;

    use crate::auth::AuthService;
    use crate::config::AuthConfig;
    use crate::handlers::add_routes;
    use crate::sink::{JobSink, MemorySink};

    pub(crate) struct TestApp {
        pub app: Router,
        pub store: Arc<MemoryJobStore>,
        pub cache: MockRedisClient,
        pub sink: Arc<MemorySink>,
        pub token: String,
        pub staging_dir: tempfile::TempDir,
    }

    /// A sink whose broker is down.
    struct FailingSink;

    #[async_trait]
    impl JobSink for FailingSink {
        async fn publish(&self, _: &job_common::job::JobMessage) -> Result<(), ProduceError> {
            Err(ProduceError::KafkaProduceCanceled)
        }
    }

    async fn build(
        sink: Arc<dyn JobSink>,
    ) -> (
        Router,
        Arc<MemoryJobStore>,
        MockRedisClient,
        String,
        tempfile::TempDir,
    ) {
        let store = Arc::new(MemoryJobStore::new());
        let cache = MockRedisClient::new();
        let staging_dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            Storage::new(staging_dir.path(), 1024 * 1024, Duration::from_secs(60))
                .await
                .unwrap(),
        );
        let auth = AuthService::new(&AuthConfig {
            jwt_secret: "test-secret".to_owned(),
            jwt_expiration: 60,
            username: "admin".to_owned(),
            password: "admin".to_owned(),
        });
        let token = auth.generate_token("admin").unwrap();

        let state = super::super::AppState {
            store: store.clone(),
            cache: Arc::new(cache.clone()),
            sink,
            storage,
            auth,
            staging_ttl: 60,
        };

        let app = add_routes(Router::new(), state);
        (app, store, cache, token, staging_dir)
    }

    pub(crate) async fn test_app() -> TestApp {
        let sink = Arc::new(MemorySink::new());
        let (app, store, cache, token, staging_dir) = build(sink.clone()).await;
        TestApp {
            app,
            store,
            cache,
            sink,
            token,
            staging_dir,
        }
    }

    pub(crate) fn authed_post(test_app: &TestApp, uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", test_app.token),
            )
            .body(Body::from(body))
            .unwrap()
    }

    pub(crate) fn authed_get(test_app: &TestApp, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", test_app.token),
            )
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn create_job_persists_caches_and_publishes() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(
                &test_app,
                "/api/jobs",
                r#"{"name":"Test Job","type":"test_job"}"#.to_owned(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["job"]["id"], 1);
        assert_eq!(body["job"]["name"], "Test Job");
        assert_eq!(body["job"]["status"], "pending");
        assert_eq!(body["job"]["type"], "test_job");

        // the row exists, the cache holds pending, the message was accepted
        let stored = test_app.store.get(1).await.unwrap();
        assert_eq!(stored.name, "Test Job");
        assert_eq!(
            test_app.cache.get(cache::status_key(1)).await.unwrap(),
            "pending"
        );
        let published = test_app.sink.messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, 1);
        assert_eq!(published[0].job_type, "test_job");
    }

    #[tokio::test]
    async fn create_job_rejects_empty_name() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(
                &test_app,
                "/api/jobs",
                r#"{"name":"  ","type":"test_job"}"#.to_owned(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(test_app.store.job_count(), 0);
    }

    #[tokio::test]
    async fn create_job_rejects_unregistered_type() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(
                &test_app,
                "/api/jobs",
                r#"{"name":"Job","type":"mine_bitcoin"}"#.to_owned(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "mine_bitcoin is not a registered job type");
    }

    #[tokio::test]
    async fn create_job_rejects_bodies_that_are_not_json() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(&test_app, "/api/jobs", "x".to_owned()))
            .await
            .unwrap();

        // decode failures keep the uniform error shape, not a bare rejection
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to parse request"));
    }

    #[tokio::test]
    async fn create_job_rejects_bodies_with_missing_fields() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(&test_app, "/api/jobs", "{}".to_owned()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].is_string());
        assert_eq!(test_app.store.job_count(), 0);
    }

    #[tokio::test]
    async fn create_job_requires_a_token() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/api/jobs")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"name":"Job","type":"test_job"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn create_job_deletes_the_row_when_publication_fails() {
        let (app, store, cache, token, _staging_dir) = build(Arc::new(FailingSink)).await;

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/api/jobs")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .header(http::header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::from(r#"{"name":"Job","type":"test_job"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // no orphan row, no stale cache entry
        assert_eq!(store.job_count(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn get_job_overlays_the_cached_status() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(authed_post(
                &test_app,
                "/api/jobs",
                r#"{"name":"Job","type":"test_job"}"#.to_owned(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // a worker advanced the cached status; the row still says pending
        test_app
            .cache
            .set(cache::status_key(1), "processing".to_owned())
            .await
            .unwrap();

        let response = test_app
            .app
            .clone()
            .oneshot(authed_get(&test_app, "/api/jobs/1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["job"]["status"], "processing");
    }

    #[tokio::test]
    async fn get_job_rejects_non_integer_ids() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(authed_get(&test_app, "/api/jobs/abc"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_job_returns_404_for_missing_rows() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(authed_get(&test_app, "/api/jobs/99"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "job 99 does not exist");
    }

    #[tokio::test]
    async fn list_jobs_returns_most_recent_first() {
        let test_app = test_app().await;

        for name in ["first", "second"] {
            let response = test_app
                .app
                .clone()
                .oneshot(authed_post(
                    &test_app,
                    "/api/jobs",
                    format!(r#"{{"name":"{}","type":"test_job"}}"#, name),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = test_app
            .app
            .clone()
            .oneshot(authed_get(&test_app, "/api/jobs"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["name"], "second");
        assert_eq!(jobs[1]["name"], "first");
    }

    #[tokio::test]
    async fn login_issues_usable_tokens() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/api/login")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"username":"admin","password":"admin"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["type"], "Bearer");

        let token = body["token"].as_str().unwrap().to_owned();
        let response = test_app
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/jobs")
                    .header(http::header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_rejects_invalid_bodies() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/api/login")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let test_app = test_app().await;

        let response = test_app
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/api/login")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"username":"admin","password":"nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
