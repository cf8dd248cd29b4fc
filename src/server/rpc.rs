//! `POST /resolveStream`, a callable-function style RPC.
//!
//! Request: `{"data": {"providerUrl": "...", "mediaType"?: "movie"|"tv", "tmdbId"?: 123}}`
//! with `Authorization: Bearer <token>`.
//!
//! Success: `{"result": {"success": true, "directUrl", "mimeType", "quality", "headers"}}`.
//! Failure: `{"error": {"code", "status", "message"}}` with 401, 400 or 500.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::resolver::{ResolveResult, Resolver};

const PROVIDER_URL_REQUIRED: &str = "Provider URL is required and must be a string.";

/// RPC errors, mapped onto callable error codes.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("User must be authenticated to use this function.")]
    Unauthenticated,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Failed to resolve stream URL: {0}")]
    Internal(String),
}

impl RpcError {
    /// Wire code, e.g. `invalid-argument`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::Internal(_) => "internal",
        }
    }

    /// Canonical status name, e.g. `INVALID_ARGUMENT`.
    pub fn canonical_status(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            error!(code = self.code(), "{self}");
        } else {
            warn!(code = self.code(), "{self}");
        }

        let body = json!({
            "error": {
                "code": self.code(),
                "status": self.canonical_status(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Kind of title the provider page plays. Logging context only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
    #[serde(other)]
    Other,
}

/// TMDB id as sent by the client, number or string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TmdbId {
    Number(u64),
    Text(String),
}

/// A validated resolve call.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub provider_url: Url,
    pub media_type: Option<MediaType>,
    pub tmdb_id: Option<TmdbId>,
}

impl ResolveRequest {
    /// Parse and validate a callable body.
    ///
    /// `providerUrl` is checked first and strictly. `mediaType` and
    /// `tmdbId` are optional context: values of the wrong shape are dropped.
    pub fn from_body(body: &[u8]) -> Result<Self, RpcError> {
        let body: Value = serde_json::from_slice(body)
            .map_err(|e| RpcError::InvalidArgument(format!("Request body must be JSON: {e}")))?;
        let data = body.get("data").unwrap_or(&Value::Null);

        let provider_url = data
            .get("providerUrl")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RpcError::InvalidArgument(PROVIDER_URL_REQUIRED.to_string()))?;
        let provider_url = Url::parse(provider_url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| {
                RpcError::InvalidArgument("Provider URL must be an absolute http(s) URL.".to_string())
            })?;

        Ok(Self {
            provider_url,
            media_type: optional_field(data, "mediaType"),
            tmdb_id: optional_field(data, "tmdbId"),
        })
    }
}

fn optional_field<T: serde::de::DeserializeOwned>(data: &Value, name: &str) -> Option<T> {
    data.get(name)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

#[derive(Serialize)]
struct ResolveResponse {
    success: bool,
    #[serde(flatten)]
    result: ResolveResult,
}

/// Caller id for the request's bearer token.
pub fn authenticate(auth: &AuthConfig, headers: &HeaderMap) -> Result<String, RpcError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .ok_or(RpcError::Unauthenticated)?;

    auth.caller_for(token)
        .map(str::to_string)
        .ok_or(RpcError::Unauthenticated)
}

struct RpcState {
    resolver: Arc<Resolver>,
    auth: AuthConfig,
}

/// Routes for the resolver RPC.
pub fn router(resolver: Arc<Resolver>, auth: AuthConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Router::new()
        .route("/resolveStream", post(resolve_stream))
        .layer(cors)
        .with_state(Arc::new(RpcState { resolver, auth }))
}

async fn resolve_stream(
    State(state): State<Arc<RpcState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, RpcError> {
    let caller = authenticate(&state.auth, &headers)?;
    let request = ResolveRequest::from_body(&body)?;

    info!(
        provider_url = %request.provider_url,
        media_type = ?request.media_type,
        tmdb_id = ?request.tmdb_id,
        caller = %caller,
        "Resolving stream"
    );

    let result = state
        .resolver
        .resolve(request.provider_url.as_str())
        .await
        .map_err(|e| RpcError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "result": ResolveResponse { success: true, result },
    })))
}
