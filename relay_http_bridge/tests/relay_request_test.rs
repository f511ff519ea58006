//! Request relay tests.
//!
//! Each test registers a session over an in-memory pair, drives `handle_server`
//! with a real `http::Request` and checks what reaches the backend and what is
//! replayed into the response sink.

mod common;

use bytes::Bytes;
use common::{finished, quiet_registry, register, spawn_backend, text_response};
use http::{Request, StatusCode, header};
use http_body_util::{Full, StreamBody};
use relay_common::{RequestEnvelope, ResponseCapture, ResponseSink};
use relay_http_bridge::{
    BridgeError, HttpResponseSink, StopReason, handle_server, max_body_policy,
};
use std::sync::{Arc, Mutex};

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::get(uri)
        .header(header::ACCEPT, "text/plain")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn relays_request_and_replays_response() {
    let registry = quiet_registry();
    let svc = register(&registry, "svc-1").await;

    let seen: Arc<Mutex<Vec<RequestEnvelope>>> = Arc::default();
    let _backend = {
        let seen = seen.clone();
        spawn_backend(svc.backend, move |envelope| {
            seen.lock().unwrap().push(envelope);
            text_response(StatusCode::OK, "ok")
        })
    };

    let mut sink = HttpResponseSink::new();
    handle_server(&registry, "svc-1", &mut sink, get("/widgets?x=1"), None)
        .await
        .unwrap();

    assert_eq!(sink.status(), Some(StatusCode::OK));
    assert_eq!(sink.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(sink.body(), b"ok");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "GET");
    assert_eq!(seen[0].url, "/widgets?x=1");
    assert_eq!(seen[0].headers[header::ACCEPT], "text/plain");
    assert_eq!(seen[0].form["x"], vec!["1".to_string()]);
    assert!(!seen[0].is_ping);
}

#[tokio::test]
async fn request_body_reaches_backend() {
    let registry = quiet_registry();
    let svc = register(&registry, "svc").await;
    let _backend = spawn_backend(svc.backend, |envelope| {
        let mut capture = ResponseCapture::default();
        capture.write_status(StatusCode::CREATED);
        capture.write(&envelope.body).unwrap();
        capture
    });

    let request = Request::post("/echo")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Full::new(Bytes::from_static(b"\x00\x01binary\xff")))
        .unwrap();
    let mut sink = HttpResponseSink::new();
    handle_server(&registry, "svc", &mut sink, request, None)
        .await
        .unwrap();

    assert_eq!(sink.status(), Some(StatusCode::CREATED));
    assert_eq!(sink.body(), b"\x00\x01binary\xff");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let registry = quiet_registry();
    let mut sink = HttpResponseSink::new();

    let result = handle_server(&registry, "missing", &mut sink, get("/"), None).await;

    assert!(matches!(result, Err(BridgeError::SessionNotFound(name)) if name == "missing"));
    assert!(sink.is_untouched());
}

#[tokio::test]
async fn response_without_status_leaves_status_to_the_sink() {
    let registry = quiet_registry();
    let svc = register(&registry, "svc").await;
    let _backend = spawn_backend(svc.backend, |_| ResponseCapture::default());

    let mut sink = HttpResponseSink::new();
    handle_server(&registry, "svc", &mut sink, get("/"), None)
        .await
        .unwrap();

    assert_eq!(sink.status(), None);
    assert_eq!(sink.into_response().status(), StatusCode::OK);
}

#[tokio::test]
async fn rejected_response_writes_nothing_and_stops_the_session() {
    let registry = quiet_registry();
    let svc = register(&registry, "svc").await;
    let _backend = spawn_backend(svc.backend, |_| {
        text_response(StatusCode::OK, "far too long for the policy")
    });

    let policy = max_body_policy(4);
    let mut sink = HttpResponseSink::new();
    let result = handle_server(&registry, "svc", &mut sink, get("/"), Some(policy.as_ref())).await;

    assert!(matches!(result, Err(BridgeError::ResponseRejected(_))));
    assert!(sink.is_untouched());

    finished(svc.serve).await;
    assert_eq!(svc.session.stop_reason(), Some(StopReason::ResponseRejected));
    assert!(registry.get("svc").is_none());
}

#[tokio::test]
async fn accepted_response_passes_the_policy() {
    let registry = quiet_registry();
    let svc = register(&registry, "svc").await;
    let _backend = spawn_backend(svc.backend, |_| text_response(StatusCode::OK, "ok"));

    let policy = max_body_policy(4);
    let mut sink = HttpResponseSink::new();
    handle_server(&registry, "svc", &mut sink, get("/"), Some(policy.as_ref()))
        .await
        .unwrap();

    assert_eq!(sink.body(), b"ok");
    assert!(!svc.session.is_stopped());
}

#[tokio::test]
async fn backend_error_is_reported_and_session_survives() {
    let registry = quiet_registry();
    let svc = register(&registry, "svc").await;
    let _backend = spawn_backend(svc.backend, |_| ResponseCapture::failed("upstream refused"));

    let mut sink = HttpResponseSink::new();
    let result = handle_server(&registry, "svc", &mut sink, get("/"), None).await;

    assert!(matches!(result, Err(BridgeError::Upstream(msg)) if msg == "upstream refused"));
    assert!(sink.is_untouched());
    assert!(!svc.session.is_stopped());
}

#[tokio::test]
async fn backend_disconnect_mid_request_closes_the_session() {
    let registry = quiet_registry();
    let svc = register(&registry, "svc").await;
    let mut connection = svc.backend;

    let backend = tokio::spawn(async move {
        let envelope: RequestEnvelope = connection.recv_json().await.unwrap();
        assert_eq!(envelope.url, "/slow");
        drop(connection);
    });

    let mut sink = HttpResponseSink::new();
    let result = handle_server(&registry, "svc", &mut sink, get("/slow"), None).await;

    assert!(matches!(result, Err(BridgeError::SessionClosed(_))));
    assert!(sink.is_untouched());
    backend.await.unwrap();

    finished(svc.serve).await;
    assert_eq!(svc.session.stop_reason(), Some(StopReason::TransportFailed));
}

#[tokio::test]
async fn overlapping_requests_each_get_their_own_response() {
    let registry = quiet_registry();
    let svc = register(&registry, "svc").await;
    let _backend = spawn_backend(svc.backend, |envelope| {
        text_response(StatusCode::OK, &envelope.url)
    });

    let calls = (0..8).map(|i| {
        let registry = registry.clone();
        async move {
            let mut sink = HttpResponseSink::new();
            let uri = format!("/item/{}", i);
            handle_server(&registry, "svc", &mut sink, get(&uri), None)
                .await
                .unwrap();
            (uri, sink.body().to_vec())
        }
    });

    for (uri, body) in futures::future::join_all(calls).await {
        assert_eq!(body, uri.into_bytes());
    }
}

#[tokio::test]
async fn unreadable_request_body_is_not_forwarded() {
    let registry = quiet_registry();
    let mut svc = register(&registry, "svc").await;

    let body = StreamBody::new(futures::stream::iter(vec![Err::<
        http_body::Frame<Bytes>,
        std::io::Error,
    >(std::io::Error::other(
        "connection reset",
    ))]));
    let request = Request::post("/upload").body(body).unwrap();

    let mut sink = HttpResponseSink::new();
    let result = handle_server(&registry, "svc", &mut sink, request, None).await;

    assert!(matches!(result, Err(BridgeError::Envelope(_))));
    assert!(sink.is_untouched());
    assert!(!svc.session.is_stopped());

    // Nothing was sent to the backend.
    registry.stop_serve("svc");
    finished(svc.serve).await;
    assert!(svc.backend.recv().await.is_err());
}
