//! Token issuance and verification for the API surface.
//!
//! Identity is a single environment-configured principal; everything past
//! the credential check is standard HS256 bearer tokens.

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::ApiError;
use crate::handlers::{decode_body, AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct AuthService {
    secret: String,
    expiration: Duration,
    username: String,
    password: String,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            secret: config.jwt_secret.clone(),
            expiration: Duration::seconds(config.jwt_expiration as i64),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    pub fn verify_credentials(&self, identifier: &str, password: &str) -> bool {
        identifier == self.username && password == self.password
    }

    pub fn generate_token(&self, subject: &str) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_owned(),
            iat: now.timestamp(),
            exp: (now + self.expiration).timestamp(),
        };

        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(self.secret.as_bytes());
        encode(&header, &claims, &encoding_key)
            .map_err(|e| ApiError::TokenSigning(e.to_string()))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        let decoding_key = DecodingKey::from_secret(self.secret.as_bytes());
        let validation = Validation::new(Algorithm::HS256);

        decode::<Claims>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| ApiError::InvalidToken)
    }
}

/// The body of a login request. Either `email` or `username` identifies the
/// principal.
#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub r#type: &'static str,
}

pub async fn login(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<LoginResponse>, ApiError> {
    let body: LoginRequest = decode_body(&body)?;
    let identifier = body.email.or(body.username).ok_or_else(|| {
        ApiError::RequestParsingError("email or username is required".to_owned())
    })?;

    if !state.auth.verify_credentials(&identifier, &body.password) {
        return Err(ApiError::InvalidCredentials);
    }

    let token = state.auth.generate_token(&identifier)?;
    Ok(Json(LoginResponse {
        token,
        r#type: "Bearer",
    }))
}

/// Middleware guarding the job routes; the verified claims are attached to
/// the request extensions.
pub async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::MissingToken)?;

    let token = header.strip_prefix("Bearer ").ok_or(ApiError::MissingToken)?;
    let claims = state.auth.verify_token(token)?;

    _ = request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}
