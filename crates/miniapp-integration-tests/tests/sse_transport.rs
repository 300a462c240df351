//! Render server surface: shell page, stylesheet, SSE stream, method calls.

mod common;

use common::{STEP_TIMEOUT, TestDaemon};
use serde_json::{Value, json};

/// Read the SSE body into `seen` until it contains `needle`.
async fn read_until(response: &mut reqwest::Response, seen: &mut String, needle: &str) {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !seen.contains(needle) {
            let chunk = response
                .chunk()
                .await
                .unwrap()
                .expect("event stream ended");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {needle:?} in {seen:?}"));
}

#[tokio::test]
async fn test_event_stream_replays_then_follows_renders() {
    let daemon = TestDaemon::start().await;
    let port = daemon.launch("counter").await;

    let mut response = daemon
        .http
        .get(daemon.render_url(port, "/events"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let mut seen = String::new();
    read_until(&mut response, &mut seen, r#""count":0"#).await;
    assert!(seen.contains("retry: 10000"));
    assert!(seen.contains(r#""type":"render""#));

    daemon.call("increment", json!([])).await;
    read_until(&mut response, &mut seen, r#""count":1"#).await;

    daemon.call("increment", json!([])).await;
    read_until(&mut response, &mut seen, r#""count":2"#).await;

    drop(response);
    daemon.stop().await;
}

#[tokio::test]
async fn test_shell_page_and_stylesheet() {
    let daemon = TestDaemon::start().await;
    let port = daemon.launch("counter").await;

    let page = daemon
        .http
        .get(daemon.render_url(port, "/"))
        .send()
        .await
        .unwrap();
    assert_eq!(page.status().as_u16(), 200);
    let html = page.text().await.unwrap();
    assert!(html.contains("EventSource"));
    assert!(html.contains("/app.css"));

    let css = daemon
        .http
        .get(daemon.render_url(port, "/app.css"))
        .send()
        .await
        .unwrap();
    assert_eq!(css.status().as_u16(), 200);
    assert!(css.headers()["content-type"].to_str().unwrap().starts_with("text/css"));
    assert!(css.text().await.unwrap().contains(".counter"));

    daemon.stop().await;
}

#[tokio::test]
async fn test_missing_stylesheet_is_404() {
    let daemon = TestDaemon::start().await;
    let port = daemon.launch("flaky").await;

    let css = daemon
        .http
        .get(daemon.render_url(port, "/app.css"))
        .send()
        .await
        .unwrap();
    assert_eq!(css.status().as_u16(), 404);

    daemon.stop().await;
}

#[tokio::test]
async fn test_render_server_method_calls() {
    let daemon = TestDaemon::start().await;
    let port = daemon.launch("counter").await;
    let url = daemon.render_url(port, "/api/callMethod");

    let response = daemon
        .http
        .post(&url)
        .json(&json!({ "methodName": "increment", "args": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);

    let response = daemon
        .http
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid request format");

    let (_, body) = daemon.post("/api/refresh-app", &Value::Null).await;
    assert_eq!(body["data"]["count"], 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_render_server_stops_with_its_instance() {
    let daemon = TestDaemon::start().await;
    let port = daemon.launch("counter").await;

    let (status, _) = daemon.post("/api/terminate-app", &Value::Null).await;
    assert_eq!(status, 200);

    let mut closed = false;
    for _ in 0..50 {
        if daemon
            .http
            .get(daemon.render_url(port, "/"))
            .send()
            .await
            .is_err()
        {
            closed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(closed, "render server still answering on {port}");

    daemon.stop().await;
}
