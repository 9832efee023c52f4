//! Integration tests for the reconciler endpoint over a real artifact directory

use std::fs;
use std::path::Path;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use flipbit::server::{create_router, ReconcilerState};
use flipbit::stream::{DirectoryStore, Reconciler};

fn app_for(dir: &Path, addresses: &[&str]) -> Router {
    let reconciler = Reconciler::new(
        DirectoryStore::new(dir),
        addresses.iter().map(|a| a.parse().unwrap()).collect(),
    );
    create_router(ReconcilerState::new(reconciler))
}

async fn post_update(app: &Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/update")
                .header("content-type", "application/json; charset=utf-8")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn service(name: &str, node_port: u16, hosts: &[&str]) -> (String, Value) {
    (
        format!("{}.default", name),
        json!({
            "name": name,
            "namespace": "default",
            "ports": [{"protocol": "TCP", "nativePort": 80, "nodePort": node_port}],
            "hosts": hosts,
        }),
    )
}

fn map(entries: Vec<(String, Value)>) -> Value {
    Value::Object(entries.into_iter().collect())
}

fn conf_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_service_lifecycle_on_disk() {
    let dir = TempDir::new().unwrap();
    let app = app_for(dir.path(), &["10.0.0.1"]);

    let (status, body) = post_update(&app, map(vec![service("web", 31000, &["h1"])])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{"service": "web.default", "ipAddress": "10.0.0.1", "status": "Created"}])
    );
    let first = fs::read_to_string(dir.path().join("web.default.conf")).unwrap();
    assert!(first.starts_with("#flipbit realip 10.0.0.1\n#flipbit service web.default\n"));

    let (_, body) = post_update(&app, map(vec![service("web", 31000, &["h1"])])).await;
    assert_eq!(body[0]["status"], "NoChange");
    assert_eq!(fs::read_to_string(dir.path().join("web.default.conf")).unwrap(), first);

    let (_, body) = post_update(&app, map(vec![service("web", 31000, &["h1", "h2"])])).await;
    assert_eq!(body[0]["status"], "Changed");
    assert_eq!(body[0]["ipAddress"], "10.0.0.1");
    let changed = fs::read_to_string(dir.path().join("web.default.conf")).unwrap();
    assert!(changed.contains("server h2:31000;"));

    let (_, body) = post_update(&app, json!({})).await;
    assert_eq!(body, json!([]));
    assert!(conf_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_pool_exhaustion() {
    let dir = TempDir::new().unwrap();
    let app = app_for(dir.path(), &["10.0.0.1"]);

    let (_, body) = post_update(
        &app,
        map(vec![service("a", 31000, &["h1"]), service("b", 31001, &["h1"])]),
    )
    .await;

    assert_eq!(
        body,
        json!([
            {"service": "a.default", "ipAddress": "10.0.0.1", "status": "Created"},
            {"service": "b.default", "ipAddress": "none", "status": "Cannot Assign IP"}
        ])
    );
    assert_eq!(conf_files(dir.path()), vec!["a.default.conf"]);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let desired = map(vec![service("a", 31000, &["h1"]), service("b", 31001, &["h1"])]);

    let (_, body) = post_update(&app_for(dir.path(), &["10.0.0.1", "10.0.0.2"]), desired.clone()).await;
    assert_eq!(body[0]["ipAddress"], "10.0.0.1");
    assert_eq!(body[1]["ipAddress"], "10.0.0.2");

    // A fresh process reads the same allocations back from disk.
    let (_, body) = post_update(&app_for(dir.path(), &["10.0.0.1", "10.0.0.2"]), desired).await;
    assert_eq!(
        body,
        json!([
            {"service": "a.default", "ipAddress": "10.0.0.1", "status": "NoChange"},
            {"service": "b.default", "ipAddress": "10.0.0.2", "status": "NoChange"}
        ])
    );
}

#[tokio::test]
async fn test_foreign_orphan_and_conflicting_files() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("default.conf"), "server { listen 80; }\n").unwrap();
    fs::write(
        dir.path().join("gone.default.conf"),
        "#flipbit realip 192.168.0.1\n#flipbit service gone.default\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("a.default.conf"),
        "#flipbit realip 10.0.0.1\n#flipbit service a.default\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("b.default.conf"),
        "#flipbit realip 10.0.0.1\n#flipbit service b.default\n",
    )
    .unwrap();
    let app = app_for(dir.path(), &["10.0.0.1", "10.0.0.2"]);

    let (_, body) = post_update(&app, map(vec![service("b", 31001, &["h1"])])).await;

    // a.default held 10.0.0.1 and is no longer wanted; b.default's copy was a
    // conflict and gets a fresh allocation.
    assert_eq!(
        body,
        json!([{"service": "b.default", "ipAddress": "10.0.0.1", "status": "Created"}])
    );
    assert_eq!(
        conf_files(dir.path()),
        vec!["b.default.conf", "default.conf", "gone.default.conf"]
    );
}

#[tokio::test]
async fn test_missing_directory_is_server_error() {
    let dir = TempDir::new().unwrap();
    let app = app_for(&dir.path().join("missing"), &["10.0.0.1"]);

    let (status, body) = post_update(&app, map(vec![service("a", 31000, &["h1"])])).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_invalid_service_key_reports_error() {
    let dir = TempDir::new().unwrap();
    let app = app_for(dir.path(), &["10.0.0.1"]);

    let (status, body) = post_update(
        &app,
        json!({"../x": {"name": "x", "namespace": "..", "ports": [], "hosts": []}}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["status"], "Error");
    assert_eq!(body[0]["ipAddress"], "none");
    assert!(conf_files(dir.path()).is_empty());
}
