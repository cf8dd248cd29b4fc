//! Range-aware CORS streaming proxy.
//!
//! `GET|POST|HEAD /proxy?url=<target>` fetches the target with browser-like
//! headers and streams the upstream body back unchanged. Players use it to
//! read media that refuses cross-origin requests, seeking via `Range`.
//!
//! Optional query parameters:
//! - `referer`: sent upstream instead of the target's own origin
//! - `filename`: adds `Content-Disposition: attachment`

pub mod cors;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::header::{
    ACCEPT, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::fingerprint::{desktop_profile, BrowserProfile};

pub use cors::cors_headers;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Upstream headers relayed to the caller besides `Content-Type`.
const RELAYED_HEADERS: [axum::http::HeaderName; 3] = [CONTENT_LENGTH, CONTENT_RANGE, ACCEPT_RANGES];

/// Proxy errors, each with a fixed JSON body.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Missing ?url= query parameter")]
    MissingUrl,

    #[error("Invalid URL")]
    InvalidUrl,

    #[error("Upstream connection failed: {0}")]
    Upstream(String),

    #[error("Proxy failed: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingUrl | Self::InvalidUrl => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::MissingUrl | Self::InvalidUrl => json!({ "error": self.to_string() }),
            Self::Upstream(details) => {
                json!({ "error": "Upstream connection failed", "details": details })
            }
            Self::Internal(details) => json!({ "error": "Proxy failed", "details": details }),
        };
        (status, Json(body)).into_response()
    }
}

/// Query parameters, each percent-decoded exactly once. The first
/// occurrence of a repeated key wins.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProxyParams {
    pub url: Option<String>,
    pub referer: Option<String>,
    pub filename: Option<String>,
}

impl ProxyParams {
    pub fn parse(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "url" => &mut params.url,
                "referer" => &mut params.referer,
                "filename" => &mut params.filename,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }
}

/// Validate a target URL: present, absolute, `http` or `https`.
pub fn parse_target(raw: Option<&str>) -> Result<Url, ProxyError> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty());
    let raw = raw.ok_or(ProxyError::MissingUrl)?;
    let url = Url::parse(raw).map_err(|_| ProxyError::InvalidUrl)?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        _ => Err(ProxyError::InvalidUrl),
    }
}

/// `filename` made safe for a quoted `Content-Disposition` value.
///
/// Quotes, backslashes and control characters are dropped, anything
/// outside printable ASCII becomes `_`. `None` if nothing is left.
pub fn sanitise_filename(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '"' | '\\') && !c.is_control())
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// One request to relay.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub target: Url,
    pub accept: Option<HeaderValue>,
    pub range: Option<HeaderValue>,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
    pub referer: Option<Url>,
    pub filename: Option<String>,
}

impl ProxyRequest {
    /// Build from the pieces of an incoming request.
    ///
    /// # Errors
    ///
    /// [`ProxyError::MissingUrl`] or [`ProxyError::InvalidUrl`] for a bad
    /// `url` parameter. An unusable `referer` is ignored.
    pub fn from_parts(
        method: Method,
        params: ProxyParams,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Self, ProxyError> {
        let target = parse_target(params.url.as_deref())?;

        let referer = params.referer.as_deref().and_then(|raw| {
            let parsed = parse_target(Some(raw)).ok();
            if parsed.is_none() {
                debug!("Ignoring unusable referer: {raw}");
            }
            parsed
        });

        Ok(Self {
            method,
            target,
            accept: headers.get(ACCEPT).cloned(),
            range: headers.get(RANGE).cloned(),
            content_type: headers.get(CONTENT_TYPE).cloned(),
            body,
            referer,
            filename: params.filename.as_deref().and_then(sanitise_filename),
        })
    }
}

/// Upstream client plus the profile requests are dressed in.
pub struct ProxyService {
    client: reqwest::Client,
    profile: BrowserProfile,
}

impl ProxyService {
    /// Build the pooled upstream client.
    ///
    /// No total timeout: a long video streams for as long as the player
    /// keeps reading. Built without decompression features, so bytes and
    /// `Content-Length` pass through untouched.
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .read_timeout(Duration::from_millis(config.read_timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            profile: desktop_profile(),
        })
    }

    /// Send `request` upstream and stream the response back.
    ///
    /// Errors before the upstream answers become JSON responses. Once the
    /// body is streaming, a failure just ends the connection.
    #[instrument(skip_all, fields(method = %request.method, url = %request.target))]
    pub async fn forward(&self, request: ProxyRequest) -> Result<Response, ProxyError> {
        let ProxyRequest {
            method,
            target,
            accept,
            range,
            content_type,
            body,
            referer,
            filename,
        } = request;

        let mut headers = self
            .profile
            .origin_headers(&target, accept.as_ref(), referer.as_ref());
        if let Some(range) = range {
            debug!(range = ?range, "Forwarding Range");
            headers.insert(RANGE, range);
        }

        let mut upstream = self.client.request(method.clone(), target).headers(headers);
        if method == Method::POST {
            if let Some(content_type) = content_type {
                upstream = upstream.header(CONTENT_TYPE, content_type);
            }
            upstream = upstream.body(body);
        }

        let upstream = upstream.send().await.map_err(|e| {
            if e.is_builder() {
                ProxyError::Internal(e.to_string())
            } else {
                ProxyError::Upstream(e.to_string())
            }
        })?;

        let status = upstream.status();
        info!(%status, "Upstream responded");

        let mut response = Response::builder().status(status);
        let content_type = upstream
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        response = response.header(CONTENT_TYPE, content_type);
        for name in RELAYED_HEADERS {
            if let Some(value) = upstream.headers().get(&name) {
                response = response.header(name, value.clone());
            }
        }
        if let Some(filename) = filename {
            response = response.header(
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            );
        }

        let body = if method == Method::HEAD {
            Body::empty()
        } else {
            Body::from_stream(upstream.bytes_stream())
        };

        response
            .body(body)
            .map_err(|e| ProxyError::Internal(e.to_string()))
    }
}

/// Axum handler for `/proxy`.
pub async fn handle(
    State(proxy): State<Arc<ProxyService>>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    if method == Method::OPTIONS {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let params = ProxyParams::parse(query.as_deref());
    let request = ProxyRequest::from_parts(method, params, &headers, body).inspect_err(|e| {
        warn!("Rejected proxy request: {e}");
    })?;

    proxy.forward(request).await.inspect_err(|e| {
        error!("Proxy error: {e}");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_decode_once() {
        let params = ProxyParams::parse(Some(
            "url=https%3A%2F%2Fcdn.example%2Fa%2520b.mp4%3Ftoken%3D1&filename=ep%201.mp4",
        ));
        assert_eq!(
            params.url.as_deref(),
            Some("https://cdn.example/a%20b.mp4?token=1")
        );
        assert_eq!(params.filename.as_deref(), Some("ep 1.mp4"));
        assert_eq!(params.referer, None);
    }

    #[test]
    fn test_params_first_occurrence_wins() {
        let params = ProxyParams::parse(Some("url=https://a.example/1&url=https://b.example/2&x=1"));
        assert_eq!(params.url.as_deref(), Some("https://a.example/1"));
    }

    #[test]
    fn test_params_absent() {
        assert_eq!(ProxyParams::parse(None), ProxyParams::default());
        assert_eq!(ProxyParams::parse(Some("")), ProxyParams::default());
    }

    #[test]
    fn test_parse_target() {
        assert!(matches!(parse_target(None), Err(ProxyError::MissingUrl)));
        assert!(matches!(parse_target(Some("  ")), Err(ProxyError::MissingUrl)));
        assert!(matches!(
            parse_target(Some("not-a-valid-url")),
            Err(ProxyError::InvalidUrl)
        ));
        assert!(matches!(
            parse_target(Some("ftp://files.example/a.mp4")),
            Err(ProxyError::InvalidUrl)
        ));
        assert!(matches!(
            parse_target(Some("file:///etc/passwd")),
            Err(ProxyError::InvalidUrl)
        ));
        assert_eq!(
            parse_target(Some("https://cdn.example/v.m3u8")).unwrap().as_str(),
            "https://cdn.example/v.m3u8"
        );
    }

    #[test]
    fn test_sanitise_filename() {
        assert_eq!(sanitise_filename("movie.mp4").as_deref(), Some("movie.mp4"));
        assert_eq!(
            sanitise_filename("bad\"name\\\r\n.mp4").as_deref(),
            Some("badname.mp4")
        );
        assert_eq!(sanitise_filename("été.mp4").as_deref(), Some("_t_.mp4"));
        assert_eq!(sanitise_filename("\"\""), None);
    }

    #[test]
    fn test_from_parts_ignores_bad_referer() {
        let params = ProxyParams {
            url: Some("https://cdn.example/a.mp4".to_string()),
            referer: Some("javascript:alert(1)".to_string()),
            filename: None,
        };
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=0-"));

        let request = ProxyRequest::from_parts(Method::GET, params, &headers, Bytes::new()).unwrap();
        assert!(request.referer.is_none());
        assert_eq!(request.range.unwrap(), "bytes=0-");
        assert!(request.accept.is_none());
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(ProxyError::MissingUrl.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::InvalidUrl.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::Upstream("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Internal("oops".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
