pub mod jobs;
pub mod parse;

use std::sync::Arc;

use axum::body::Bytes;
use axum::{middleware, routing, Router};
use serde::de::DeserializeOwned;
use tower_http::trace::TraceLayer;

use job_common::cache::Client;
use job_common::storage::Storage;
use job_common::store::JobStore;

use crate::auth::{self, AuthService};
use crate::error::ApiError;
use crate::sink::JobSink;

/// Decode a JSON request body by hand so malformed or field-missing input
/// surfaces as a 400 with the uniform `{"error": ...}` shape instead of
/// axum's default extractor rejection.
pub(crate) fn decode_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::RequestParsingError(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub cache: Arc<dyn Client>,
    pub sink: Arc<dyn JobSink>,
    pub storage: Arc<Storage>,
    pub auth: AuthService,
    /// TTL applied to cached payloads and results, in seconds.
    pub staging_ttl: u64,
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    // the bearer layer covers the job routes only; login stays open
    let api = Router::new()
        .route("/api/jobs", routing::post(jobs::create).get(jobs::list))
        .route("/api/jobs/parse-document", routing::post(parse::create))
        .route("/api/jobs/:id", routing::get(jobs::get))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .route("/api/login", routing::post(auth::login))
        .with_state(state);

    router
        .route("/", routing::get(index))
        .merge(api)
        .layer(TraceLayer::new_for_http())
}

pub async fn index() -> &'static str {
    "rusty-jobs api"
}
