//! End-to-end relay tests over real sockets.
//!
//! Each test starts a relay server on an ephemeral port, dials it with
//! `handle_client` and a local axum router as the backend, then talks to the relay
//! as an ordinary HTTP caller with `reqwest`.

use axum::{
    Router,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use bytes::Bytes;
use http::Request;
use http_body_util::Full;
use relay_http_bridge::{RelayConfig, SessionRegistry, serve};
use relay_http_client::{ClientClosed, RelayClient, RewritePolicy, ServiceHandler, handle_client};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::net::TcpListener;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

struct TestRelay {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Self {
        relay_common::logging::init_test_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(SessionRegistry::new(config.registry_config()));
        tokio::spawn(serve(listener, config, registry.clone()));
        Self { addr, registry }
    }

    fn session_url(&self, name: &str) -> String {
        format!("ws://{}/ws/{}", self.addr, name)
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect(
        &self,
        name: &str,
        router: Router,
        rewrite: Option<RewritePolicy>,
    ) -> RelayClient {
        let client = handle_client(
            &self.session_url(name),
            "http://backend.test",
            ServiceHandler::new(router),
            None,
            rewrite,
        )
        .await
        .expect("relay should accept the session");

        let registry = self.registry.clone();
        let name = name.to_string();
        wait_until("session registration", move || registry.get(&name).is_some()).await;
        client
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < WAIT_LIMIT, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn widgets(
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let accepts_text = headers
        .get(header::ACCEPT)
        .is_some_and(|v| v == "text/plain");
    if !accepts_text || query.get("x").map(String::as_str) != Some("1") {
        return (StatusCode::BAD_REQUEST, "unexpected request").into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain")], "ok").into_response()
}

fn backend() -> Router {
    Router::new()
        .route("/widgets", get(widgets))
        .route(
            "/echo",
            post(|body: Bytes| async move {
                (
                    StatusCode::CREATED,
                    [("x-echo-length", body.len().to_string())],
                    body,
                )
            }),
        )
        .route("/hello", get(|| async { "hello" }))
        .route("/big", get(|| async { "a body that is far too large" }))
}

#[tokio::test]
async fn get_is_relayed_byte_for_byte() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let _client = relay.connect("svc-1", backend(), None).await;

    let response = reqwest::Client::new()
        .get(relay.url("/r/svc-1/widgets?x=1"))
        .header(header::ACCEPT, "text/plain")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn post_body_and_status_are_relayed() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let _client = relay.connect("svc", backend(), None).await;

    let payload = vec![0u8, 1, 2, 254, 255];
    let response = reqwest::Client::new()
        .post(relay.url("/r/svc/echo"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-echo-length"], "5");
    assert_eq!(response.bytes().await.unwrap().to_vec(), payload);
}

#[tokio::test]
async fn rewrite_policy_redirects_every_path() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let rewrite: RewritePolicy = Arc::new(|request: &mut Request<Full<Bytes>>| {
        *request.uri_mut() = "/hello".parse().unwrap();
    });
    let _client = relay.connect("svc", backend(), Some(rewrite)).await;

    let body = reqwest::get(relay.url("/r/svc/whatever/you/like"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let relay = TestRelay::start(RelayConfig::default()).await;

    let response = reqwest::get(relay.url("/r/nobody/path")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_routes_report_and_stop_sessions() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let client = relay.connect("svc-1", backend(), None).await;
    let http = reqwest::Client::new();

    let summary: serde_json::Value = serde_json::from_str(
        &http
            .get(relay.url("/sessions?prefix=svc"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(summary["count"], 1);
    assert_eq!(summary["accepted"], true);

    let stopped = http
        .delete(relay.url("/sessions/svc-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(stopped.status(), StatusCode::NO_CONTENT);

    let reason = tokio::time::timeout(WAIT_LIMIT, client.closed())
        .await
        .expect("client should notice the stop");
    assert!(matches!(reason, ClientClosed::ConnectionLost(_)));

    let registry = relay.registry.clone();
    wait_until("registry to empty", move || registry.count() == 0).await;
    let response = http.get(relay.url("/r/svc-1/hello")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let again = http
        .delete(relay.url("/sessions/svc-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_response_is_rejected_and_session_dropped() {
    let relay = TestRelay::start(RelayConfig {
        max_response_bytes: Some(8),
        ..RelayConfig::default()
    })
    .await;
    let client = relay.connect("svc", backend(), None).await;

    let response = reqwest::get(relay.url("/r/svc/big")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!response.text().await.unwrap().contains("far too large"));

    let reason = tokio::time::timeout(WAIT_LIMIT, client.closed())
        .await
        .expect("client should notice the stop");
    assert!(matches!(reason, ClientClosed::ConnectionLost(_)));
}

#[tokio::test]
async fn reconnecting_backend_replaces_the_session() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let first = relay.connect("svc", backend(), None).await;
    let first_id = relay.registry.get("svc").unwrap().id.clone();

    let second = handle_client(
        &relay.session_url("svc"),
        "http://backend.test",
        ServiceHandler::new(backend()),
        None,
        None,
    )
    .await
    .unwrap();

    let reason = tokio::time::timeout(WAIT_LIMIT, first.closed())
        .await
        .expect("replaced client should be closed");
    assert!(matches!(reason, ClientClosed::ConnectionLost(_)));

    let registry = relay.registry.clone();
    wait_until("replacement", move || {
        registry.get("svc").is_some_and(|s| s.id != first_id) && registry.count() == 1
    })
    .await;

    let body = reqwest::get(relay.url("/r/svc/hello"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello");
    assert!(!second.is_finished());
}

#[tokio::test]
async fn heartbeats_keep_an_idle_session_alive() {
    let relay = TestRelay::start(RelayConfig {
        heartbeat_interval_secs: 1,
        ..RelayConfig::default()
    })
    .await;
    let client = relay.connect("svc", backend(), None).await;

    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(!client.is_finished());
    assert_eq!(relay.registry.count(), 1);
    let body = reqwest::get(relay.url("/r/svc/hello"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello");
}

#[tokio::test]
async fn client_shutdown_unregisters_the_session() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let client = relay.connect("svc", backend(), None).await;

    client.shutdown();
    assert_eq!(client.closed().await, ClientClosed::Shutdown);

    let registry = relay.registry.clone();
    wait_until("registry to empty", move || registry.count() == 0).await;
}

#[tokio::test]
async fn invalid_origin_is_refused_before_dialing() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let result = handle_client(
        &relay.session_url("svc"),
        "bad\norigin",
        ServiceHandler::new(backend()),
        None,
        None,
    )
    .await;
    assert!(matches!(
        result,
        Err(relay_http_client::RelayClientError::InvalidOrigin(_))
    ));
}
