//! Permissive CORS headers for the proxy route.
//!
//! Added to every response the route produces, errors and `405`s included,
//! so a browser player can always read the status.

use axum::extract::Request;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS,
};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

const ALLOW_ORIGIN: &str = "*";
const ALLOW_METHODS: &str = "GET, POST, HEAD, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, Range, X-Requested-With";
const EXPOSE_HEADERS: &str = "Content-Length, Content-Range, Accept-Ranges, Content-Type";

const CORS_HEADERS: [(HeaderName, &str); 4] = [
    (ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN),
    (ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS),
    (ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_HEADERS),
    (ACCESS_CONTROL_EXPOSE_HEADERS, EXPOSE_HEADERS),
];

/// Middleware that stamps the CORS headers on the way out.
pub async fn cors_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}
