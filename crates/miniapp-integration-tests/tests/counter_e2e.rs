//! End-to-end: launch the counter, drive it, and watch the renders arrive.

mod common;

use common::{TestDaemon, next_envelope, send_text, wait_for};
use serde_json::{Value, json};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_counter_reaches_five_and_renders_it() {
    let daemon = TestDaemon::start().await;
    let mut viewer = daemon.viewer().await;

    let (_, launch) = daemon
        .post("/api/launch-app", &json!({ "appName": "counter" }))
        .await;
    assert_eq!(launch["success"], true);
    assert_eq!(launch["initialData"]["count"], 0);

    // Launching broadcasts the first render to existing viewers.
    let first = wait_for(&mut viewer, "render", |_| true).await;
    assert_eq!(first.payload["data"]["count"], 0);

    for _ in 0..5 {
        let response = daemon.call("increment", json!([])).await;
        assert_eq!(response["success"], true);
    }

    let render = wait_for(&mut viewer, "render", |p| p["data"]["count"] == 5).await;
    let html = render.payload["html"].as_str().unwrap();
    assert!(html.contains('5'), "html should show the count: {html}");

    let (_, refreshed) = daemon.post("/api/refresh-app", &Value::Null).await;
    assert_eq!(refreshed["data"]["count"], 5);

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_renders_follow_mutations_in_order() {
    let daemon = TestDaemon::start().await;
    daemon.launch("counter").await;
    let mut viewer = daemon.viewer().await;

    // Late joiners get the cached render straight away.
    let replay = wait_for(&mut viewer, "render", |_| true).await;
    assert_eq!(replay.payload["data"]["count"], 0);

    daemon.call("setStep", json!([3])).await;
    daemon.call("increment", json!([])).await;
    daemon.call("decrement", json!([])).await;
    daemon.call("increment", json!([])).await;

    let mut seen = Vec::new();
    while seen.last() != Some(&json!(3)) || seen.len() < 4 {
        let render = wait_for(&mut viewer, "render", |_| true).await;
        seen.push(render.payload["data"]["count"].clone());
    }
    assert_eq!(seen, vec![json!(0), json!(3), json!(0), json!(3)]);

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_calls_method_over_push_channel() {
    let daemon = TestDaemon::start().await;
    daemon.launch("counter").await;
    let mut viewer = daemon.viewer().await;

    send_text(
        &mut viewer,
        r#"{"type":"callMethod","payload":{"methodName":"increment","args":[]}}"#,
    )
    .await;
    let response = wait_for(&mut viewer, "methodCallResponse", |_| true).await;
    assert_eq!(response.payload["success"], true);
    assert_eq!(response.payload["methodName"], "increment");

    send_text(
        &mut viewer,
        r#"{"type":"callMethod","payload":{"methodName":"launchRockets","args":[]}}"#,
    )
    .await;
    let response = wait_for(&mut viewer, "methodCallResponse", |_| true).await;
    assert_eq!(response.payload["success"], false);
    assert_eq!(response.payload["error"], "Method not found: launchRockets");

    // The instance is unaffected by the bad call.
    send_text(
        &mut viewer,
        r#"{"type":"callMethod","payload":{"methodName":"increment","args":[]}}"#,
    )
    .await;
    let render = wait_for(&mut viewer, "render", |p| p["data"]["count"] == 2).await;
    assert_eq!(render.payload["data"]["count"], 2);

    let console = loop {
        let envelope = next_envelope(&mut viewer).await;
        if envelope.kind.as_str() == "console" {
            break envelope;
        }
    };
    assert_eq!(console.payload["level"], "info");

    daemon.stop().await;
}
