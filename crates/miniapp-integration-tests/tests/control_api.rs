//! Control API behaviour over real sockets.

mod common;

use std::time::Duration;

use common::TestDaemon;
use miniapp_config::LaunchMode;
use serde_json::{Value, json};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lists_shipped_apps() {
    let daemon = TestDaemon::start().await;
    let (status, apps) = daemon.get("/api/apps").await;
    assert_eq!(status, 200);

    let names: Vec<&str> = apps
        .as_array()
        .unwrap()
        .iter()
        .map(|app| app["name"].as_str().unwrap())
        .collect();
    for expected in ["counter", "sample", "todo"] {
        assert!(names.contains(&expected), "{expected} missing from {names:?}");
    }
    assert!(apps[0]["path"].is_string());
    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_error_statuses() {
    let daemon = TestDaemon::start().await;

    let (status, body) = daemon
        .post("/api/launch-app", &json!({ "appName": "does-not-exist" }))
        .await;
    assert_eq!(status, 500);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("does-not-exist"));

    for path in ["/api/show-app", "/api/hide-app", "/api/refresh-app"] {
        let (status, body) = daemon.post(path, &Value::Null).await;
        assert_eq!(status, 400, "{path}");
        assert_eq!(body["success"], false);
    }

    let (status, current) = daemon.get("/api/current-app").await;
    assert_eq!(status, 200);
    assert_eq!(current["currentApp"], Value::Null);
    assert_eq!(current["apps"], json!([]));

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_show_hide_refresh_do_not_touch_data() {
    let daemon = TestDaemon::start().await;
    daemon.launch("counter").await;
    daemon.call("increment", json!([])).await;

    let (status, _) = daemon.post("/api/hide-app", &Value::Null).await;
    assert_eq!(status, 200);
    let (_, current) = daemon.get("/api/current-app").await;
    assert_eq!(current["apps"][0]["visible"], false);

    let (status, _) = daemon.post("/api/show-app", &Value::Null).await;
    assert_eq!(status, 200);
    let (_, current) = daemon.get("/api/current-app").await;
    assert_eq!(current["apps"][0]["visible"], true);

    let (_, refreshed) = daemon.post("/api/refresh-app", &Value::Null).await;
    assert_eq!(refreshed["success"], true);
    assert_eq!(refreshed["data"]["count"], 1);

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replace_mode_keeps_one_instance() {
    let daemon = TestDaemon::start().await;
    daemon.launch("counter").await;
    daemon.launch("todo").await;

    let (_, current) = daemon.get("/api/current-app").await;
    assert_eq!(current["currentApp"], "todo");
    assert_eq!(current["apps"].as_array().unwrap().len(), 1);

    let (status, _) = daemon.post("/api/terminate-app", &Value::Null).await;
    assert_eq!(status, 200);
    let (_, current) = daemon.get("/api/current-app").await;
    assert_eq!(current["currentApp"], Value::Null);

    let (status, _) = daemon.post("/api/terminate-app", &Value::Null).await;
    assert_eq!(status, 400);

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_coexisting_instances_get_distinct_ports() {
    let daemon = TestDaemon::with_mode(LaunchMode::Coexist).await;
    let x = daemon.launch("counter").await;
    let y = daemon.launch("todo").await;
    assert_ne!(x, y);

    let (_, current) = daemon.get("/api/current-app").await;
    assert_eq!(current["currentApp"], "todo");
    assert_eq!(current["apps"].as_array().unwrap().len(), 2);

    let (status, _) = daemon
        .post("/api/terminate-app", &json!({ "appName": "counter" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(daemon.handle.host().lock().await.ports_in_use(), vec![y]);

    // Give the old render server a moment to release its socket.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let again = daemon.launch("counter").await;
    assert_eq!(again, x);

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_faults_are_contained() {
    let daemon = TestDaemon::start().await;

    // A load fault still yields a running (empty) instance.
    let (status, body) = daemon
        .post("/api/launch-app", &json!({ "appName": "broken" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["initialData"], json!({}));

    daemon.launch("flaky").await;
    let failed = daemon.call("explode", json!([])).await;
    assert_eq!(failed["success"], false);
    assert!(failed["error"].as_str().unwrap().contains("kaput"));

    let ok = daemon.call("bump", json!([2])).await;
    assert_eq!(ok["success"], true);
    assert_eq!(ok["result"], 2);

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health() {
    let daemon = TestDaemon::start().await;
    let (status, body) = daemon.get("/api/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    daemon.stop().await;
}
