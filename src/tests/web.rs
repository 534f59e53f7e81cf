use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::mock_api::{Behavior, MockApi};
use super::remote_config;
use crate::semantic::RetrievalService;
use crate::web::router;

/// Handlers use `block_in_place`, which needs the multi-threaded runtime.
fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

async fn call(service: &Arc<RetrievalService>, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(service.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn upload(filename: &str, text: &str) -> Value {
    json!({"filename": filename, "data_b64": STANDARD.encode(text)})
}

fn service_with(api: &MockApi, kb_dir: &std::path::Path) -> Arc<RetrievalService> {
    let mut config = remote_config(kb_dir, api);
    config.chunk_size = 5;
    config.chunk_overlap = 2;
    Arc::new(RetrievalService::new(config).unwrap())
}

#[test]
fn test_ingest_search_status_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let api = MockApi::start();
    let service = service_with(&api, tmp.path());

    block_on(async {
        let (status, body) = call(&service, get("/api/kb/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "absent");

        let (status, body) = call(
            &service,
            post("/api/kb/search", json!({"query": "anything", "topk": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true, "hits": []}));

        let (status, body) = call(
            &service,
            post(
                "/api/kb/ingest",
                json!({"files": [upload("a.txt", "alpha beta gamma")]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true, "added_chunks": 6}));

        let (status, body) = call(
            &service,
            post("/api/kb/search", json!({"query": "alpha", "topk": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        let hits = body["hits"].as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["text"], "alpha");
        assert_eq!(hits[0]["source"], "a.txt");
        assert_eq!(hits[0]["meta"]["position"], 0);
        let score = hits[0]["score"].as_f64().unwrap();
        assert!((-1.0..=1.0).contains(&score));

        let (status, body) = call(&service, get("/api/kb/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "present");
        assert_eq!(body["entries"], 6);
        assert_eq!(body["backend"], "remote");
    });
}

#[test]
fn test_topk_default_and_negative() {
    let tmp = tempfile::tempdir().unwrap();
    let api = MockApi::start();
    let service = service_with(&api, tmp.path());

    block_on(async {
        call(
            &service,
            post(
                "/api/kb/ingest",
                json!({"files": [upload("a.txt", "alpha beta gamma")]}),
            ),
        )
        .await;

        let (_, body) = call(&service, post("/api/kb/search", json!({"query": "alpha"}))).await;
        assert_eq!(body["hits"].as_array().unwrap().len(), 5);

        let (status, body) = call(
            &service,
            post("/api/kb/search", json!({"query": "alpha", "topk": -3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hits"], json!([]));
    });
}

#[test]
fn test_bad_input_is_structured() {
    let tmp = tempfile::tempdir().unwrap();
    let api = MockApi::start();
    let service = service_with(&api, tmp.path());

    block_on(async {
        let (status, body) = call(
            &service,
            post(
                "/api/kb/ingest",
                json!({"files": [{"filename": "a.txt", "data_b64": "not base64!!"}]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert_eq!(body["cause"], "invalid_input");
        assert!(body["error"].as_str().unwrap().contains("a.txt"));

        let (status, body) = call(&service, post("/api/kb/search", json!({"topk": 2}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["cause"], "invalid_input");

        let request = Request::builder()
            .method("POST")
            .uri("/api/kb/search")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(&service, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["cause"], "invalid_input");
    });

    assert_eq!(api.requests(), 0);
}

#[test]
fn test_backend_failures_map_to_status() {
    let cases = [
        (Behavior::Status(401), StatusCode::BAD_GATEWAY, "auth"),
        (Behavior::Status(429), StatusCode::SERVICE_UNAVAILABLE, "quota"),
        (Behavior::Status(500), StatusCode::SERVICE_UNAVAILABLE, "transient"),
        (Behavior::Garbage, StatusCode::BAD_GATEWAY, "malformed_response"),
    ];

    for (behavior, expected_status, cause) in cases {
        let tmp = tempfile::tempdir().unwrap();
        let api = MockApi::builder().behavior(behavior).start();
        let service = service_with(&api, tmp.path());

        block_on(async {
            let (status, body) = call(
                &service,
                post("/api/kb/ingest", json!({"files": [upload("a.txt", "text")]})),
            )
            .await;
            assert_eq!(status, expected_status, "{behavior:?}");
            assert_eq!(body["ok"], false);
            assert_eq!(body["cause"], cause);
        });
    }
}
