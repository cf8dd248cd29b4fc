//! Streaming proxy integration tests
//!
//! Requests go through the full router with `oneshot`; the upstream is a
//! local wiremock server.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use mediarelay::config::Config;
use mediarelay::fingerprint::{DESKTOP_ACCEPT_LANGUAGE, DESKTOP_USER_AGENT};
use mediarelay::server::{create_router, AppContext, ServiceRole};
use serde_json::Value;
use tower::ServiceExt;
use wiremock::matchers::{any, body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn app() -> Router {
    let ctx = AppContext::from_config(Config::default(), ServiceRole::Proxy).unwrap();
    create_router(ctx)
}

/// `/proxy?url=<target>&<extra>` with the target percent-encoded.
fn proxy_uri(target: &str, extra: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    if extra.is_empty() {
        format!("/proxy?url={encoded}")
    } else {
        format!("/proxy?url={encoded}&{extra}")
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(body: Body) -> Vec<u8> {
    body.collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(body: Body) -> Value {
    serde_json::from_slice(&body_bytes(body).await).unwrap()
}

fn assert_cors(headers: &axum::http::HeaderMap) {
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(
        headers["access-control-allow-methods"],
        "GET, POST, HEAD, OPTIONS"
    );
    assert_eq!(
        headers["access-control-allow-headers"],
        "Content-Type, Authorization, Range, X-Requested-With"
    );
    assert_eq!(
        headers["access-control-expose-headers"],
        "Content-Length, Content-Range, Accept-Ranges, Content-Type"
    );
}

// ─── Preflight and validation ────────────────────────────────────────────────

#[tokio::test]
async fn options_is_204_with_cors_and_no_body() {
    for uri in ["/proxy", "/proxy?url=not-a-valid-url"] {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_cors(response.headers());
        assert!(body_bytes(response.into_body()).await.is_empty());
    }
}

#[tokio::test]
async fn missing_url_is_400() {
    let response = app().oneshot(get("/proxy")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_cors(response.headers());
    let body = body_bytes(response.into_body()).await;
    assert_eq!(body, br#"{"error":"Missing ?url= query parameter"}"#);
}

#[tokio::test]
async fn invalid_url_is_400_without_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    for uri in [
        "/proxy?url=not-a-valid-url",
        "/proxy?url=ftp%3A%2F%2Ffiles.example%2Fa.mp4",
    ] {
        let response = app().oneshot(get(uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_cors(response.headers());
        let body = body_json(response.into_body()).await;
        assert_eq!(body, serde_json::json!({ "error": "Invalid URL" }));
    }
}

#[tokio::test]
async fn unsupported_method_still_has_cors() {
    let response = app()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/proxy?url=https%3A%2F%2Fa.example%2F")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_cors(response.headers());
}

// ─── Relaying ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn range_is_forwarded_and_206_relayed() {
    let upstream = MockServer::start().await;
    let chunk = vec![7u8; 1000];
    Mock::given(method("GET"))
        .and(path("/video.mp4"))
        .and(header("range", "bytes=1000-1999"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-type", "video/mp4")
                .insert_header("content-range", "bytes 1000-1999/5000")
                .insert_header("accept-ranges", "bytes")
                .insert_header("x-served-by", "cache-1")
                .set_body_bytes(chunk.clone()),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let target = format!("{}/video.mp4", upstream.uri());
    let response = app()
        .oneshot(
            Request::builder()
                .uri(proxy_uri(&target, ""))
                .header("Range", "bytes=1000-1999")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let headers = response.headers();
    assert_eq!(headers["content-type"], "video/mp4");
    assert_eq!(headers["content-range"], "bytes 1000-1999/5000");
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(headers["content-length"], "1000");
    assert!(headers.get("x-served-by").is_none());
    assert_cors(headers);

    assert_eq!(body_bytes(response.into_body()).await, chunk);
}

#[tokio::test]
async fn upstream_sees_browser_headers_for_its_own_origin() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\n"))
        .mount(&upstream)
        .await;

    let target = format!("{}/hls/master.m3u8?token=abc", upstream.uri());
    let response = app()
        .oneshot(
            Request::builder()
                .uri(proxy_uri(&target, ""))
                .header("Accept", "application/vnd.apple.mpegurl")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let request = &received[0];
    assert_eq!(request.url.query(), Some("token=abc"));
    assert_eq!(request.headers["referer"], format!("{}/", upstream.uri()).as_str());
    assert_eq!(request.headers["origin"], upstream.uri().as_str());
    assert_eq!(request.headers["user-agent"], DESKTOP_USER_AGENT);
    assert_eq!(request.headers["accept-language"], DESKTOP_ACCEPT_LANGUAGE);
    assert_eq!(request.headers["accept"], "application/vnd.apple.mpegurl");
    assert!(request.headers.get("range").is_none());
}

#[tokio::test]
async fn referer_override_replaces_synthesized_origin() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("referer", "https://player.example/embed/42"))
        .and(header("origin", "https://player.example"))
        .and(header("accept", "*/*"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .expect(1)
        .mount(&upstream)
        .await;

    let target = format!("{}/seg-1.ts", upstream.uri());
    let uri = proxy_uri(&target, "referer=https%3A%2F%2Fplayer.example%2Fembed%2F42");
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_content_type_defaults_to_octet_stream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8, 1, 2, 3]))
        .mount(&upstream)
        .await;

    let target = format!("{}/blob", upstream.uri());
    let response = app().oneshot(get(&proxy_uri(&target, ""))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/octet-stream");
    assert_eq!(body_bytes(response.into_body()).await, vec![0u8, 1, 2, 3]);
}

#[tokio::test]
async fn filename_sets_sanitised_disposition() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "video/mp4"))
        .mount(&upstream)
        .await;

    let target = format!("{}/v.mp4", upstream.uri());
    let uri = proxy_uri(&target, "filename=My%20%22Movie%22.mp4");
    let response = app().oneshot(get(&uri)).await.unwrap();

    assert_eq!(
        response.headers()["content-disposition"],
        "attachment; filename=\"My Movie.mp4\""
    );
}

#[tokio::test]
async fn upstream_error_status_is_mirrored() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&upstream)
        .await;

    let target = format!("{}/private.m3u8", upstream.uri());
    let response = app().oneshot(get(&proxy_uri(&target, ""))).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_cors(response.headers());
    assert_eq!(body_bytes(response.into_body()).await, b"forbidden");
}

#[tokio::test]
async fn post_body_and_content_type_are_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/license"))
        .and(header("content-type", "application/octet-stream"))
        .and(body_string("challenge"))
        .respond_with(ResponseTemplate::new(200).set_body_string("granted"))
        .expect(1)
        .mount(&upstream)
        .await;

    let target = format!("{}/license", upstream.uri());
    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(proxy_uri(&target, ""))
                .header("Content-Type", "application/octet-stream")
                .body(Body::from("challenge"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response.into_body()).await, b"granted");
}

#[tokio::test]
async fn head_is_forwarded_as_head() {
    let upstream = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/v.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "video/mp4")
                .insert_header("accept-ranges", "bytes"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let target = format!("{}/v.mp4", upstream.uri());
    let response = app()
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri(proxy_uri(&target, ""))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert!(body_bytes(response.into_body()).await.is_empty());
}

// ─── Upstream failures ───────────────────────────────────────────────────────

#[tokio::test]
async fn connection_failure_is_502() {
    // Grab a free port, then close it so nothing is listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let target = format!("http://127.0.0.1:{port}/video.mp4");
    let response = app().oneshot(get(&proxy_uri(&target, ""))).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_cors(response.headers());
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Upstream connection failed");
    assert!(body["details"].is_string());
}

#[tokio::test]
async fn upstream_dying_mid_body_aborts_the_stream() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Promises 1000 bytes, sends 10, hangs up.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: video/mp4\r\nContent-Length: 1000\r\n\r\n0123456789",
            )
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
    });

    let target = format!("http://{addr}/video.mp4");
    let response = app().oneshot(get(&proxy_uri(&target, ""))).await.unwrap();

    // Headers were already committed, so the failure can only cut the body.
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "1000");
    assert_cors(response.headers());
    assert!(response.into_body().collect().await.is_err());
}
