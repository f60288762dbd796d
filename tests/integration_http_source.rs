//! HTTP source integration tests
//!
//! Drives the controller against a mock Kubernetes-style API server:
//! - Initial list and NDJSON watch
//! - Token authentication
//! - Gone on watch forces a relist

mod common;

use std::io::Write;
use std::sync::Arc;

use common::*;
use reconcile_controller::cache::Indexer;
use reconcile_controller::config::{ControllerConfig, RetryConfig, SourceConfig};
use reconcile_controller::controller::{Context, Controller};
use reconcile_controller::models::DynamicObject;
use reconcile_controller::source::{HttpSource, RemoteSource};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pod_json(name: &str, rv: &str) -> serde_json::Value {
    json!({
        "metadata": {"namespace": "default", "name": name, "resourceVersion": rv},
        "status": {"phase": "Running"}
    })
}

fn ndjson(lines: &[serde_json::Value]) -> String {
    lines.iter().map(|line| format!("{}\n", line)).collect()
}

fn slow_relist() -> RetryConfig {
    RetryConfig {
        initial_backoff_secs: 60,
        max_backoff_secs: 60,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

async fn count_list_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| !r.url.query().unwrap_or("").contains("watch=true"))
        .count()
}

struct Setup {
    cache: Arc<Indexer<DynamicObject>>,
    handler: Arc<RecordingHandler>,
    controller: Arc<Controller<DynamicObject>>,
}

fn setup(source: HttpSource<DynamicObject>, relist: RetryConfig) -> Setup {
    let cache = Arc::new(Indexer::new());
    let handler = Arc::new(RecordingHandler::new(Arc::clone(&cache)));
    let ctx = Context::new(Arc::clone(&cache), fast_queue(), handler.clone());
    let remote: Arc<dyn RemoteSource<DynamicObject>> = Arc::new(source);
    let controller = Arc::new(Controller::new(
        remote,
        ctx,
        &ControllerConfig::default(),
        relist,
    ));

    Setup {
        cache,
        handler,
        controller,
    }
}

/// Test 1: List then watch, ending with the object deleted
#[tokio::test]
async fn test_list_and_watch_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pods"))
        .and(query_param_is_missing("watch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": {"resourceVersion": "10"},
            "items": [pod_json("web", "9")]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pods"))
        .and(query_param("watch", "true"))
        .and(query_param("resourceVersion", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
            json!({"type": "ADDED", "object": pod_json("db", "11")}),
            json!({"type": "DELETED", "object": pod_json("web", "12")}),
        ])))
        .mount(&server)
        .await;

    let source = HttpSource::with_client(reqwest::Client::new(), &server.uri(), "api/v1/pods");
    let setup = setup(source, slow_relist());

    let cancel = CancellationToken::new();
    let handle = {
        let controller = Arc::clone(&setup.controller);
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(1, cancel).await })
    };

    wait_until(|| setup.cache.list_keys() == vec!["default/db"]).await;
    wait_until(|| {
        setup
            .handler
            .last_for("default/web")
            .is_some_and(|o| o.resource_version.is_none())
    })
    .await;
    wait_until(|| {
        setup.handler.last_for("default/db").map(|o| o.resource_version)
            == Some(Some("11".to_string()))
    })
    .await;

    let db = setup.cache.get("default/db").unwrap();
    assert_eq!(db.data["status"]["phase"], "Running");

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
}

/// Test 2: Token from file is sent on list and watch
#[tokio::test]
async fn test_token_authenticated_source() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer abc123"))
        .and(query_param_is_missing("watch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": {"resourceVersion": "1"},
            "items": [pod_json("web", "1")]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer abc123"))
        .and(query_param("watch", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    let mut token_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(token_file, "abc123").unwrap();

    let config = SourceConfig {
        endpoint: server.uri(),
        path: "api/v1/pods".to_string(),
        token_file: Some(token_file.path().to_string_lossy().to_string()),
        request_timeout_secs: 5,
        ..SourceConfig::default()
    };
    let source = HttpSource::new(&config).unwrap();
    let setup = setup(source, slow_relist());

    let cancel = CancellationToken::new();
    let handle = {
        let controller = Arc::clone(&setup.controller);
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(1, cancel).await })
    };

    wait_until(|| setup.handler.calls_for("default/web") == 1).await;

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
}

/// Test 3: A watch answered with 410 Gone triggers a fresh list
#[tokio::test]
async fn test_gone_watch_triggers_relist() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param_is_missing("watch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": {"resourceVersion": "5"},
            "items": [pod_json("web", "5")]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("watch", "true"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let source = HttpSource::with_client(reqwest::Client::new(), &server.uri(), "api/v1/pods");
    let setup = setup(source, no_backoff());

    let cancel = CancellationToken::new();
    let handle = {
        let controller = Arc::clone(&setup.controller);
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(1, cancel).await })
    };

    wait_until(|| setup.controller.has_synced()).await;
    let mut lists = 0;
    for _ in 0..500 {
        lists = count_list_requests(&server).await;
        if lists >= 3 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert!(lists >= 3, "expected repeated lists, got {}", lists);
    assert_eq!(setup.cache.list_keys(), vec!["default/web"]);

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
}
