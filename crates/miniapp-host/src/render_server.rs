//! Per-instance render server.
//!
//! Each instance gets a small HTTP server on its leased port. Browsers that
//! only watch (never call back over the push channel) can follow the app
//! through `GET /events`, a server-sent event stream of `render` and
//! `console` envelopes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt, stream};
use miniapp_bridge::Bridge;
use miniapp_push::{CallMethodPayload, Envelope};
use miniapp_template::Renderer;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconnect hint sent to `EventSource` clients.
const SSE_RETRY: Duration = Duration::from_secs(10);

/// Shell page. It follows `/events` and wires `onTap` attributes to
/// `/api/callMethod`.
const SHELL_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>mini-app</title>
<link rel="stylesheet" href="/app.css">
</head>
<body>
<div id="app"></div>
<script>
(function () {
  var root = document.getElementById("app");
  function callMethod(methodName, args) {
    return fetch("/api/callMethod", {
      method: "POST",
      headers: { "Content-Type": "application/json" },
      body: JSON.stringify({ methodName: methodName, args: args || [] })
    });
  }
  window.callMethod = callMethod;
  root.addEventListener("click", function (e) {
    var el = e.target.closest("[onTap]");
    if (!el) return;
    e.preventDefault();
    var name = el.getAttribute("onTap").replace(/\(.*\)$/, "").trim();
    if (name) callMethod(name);
  });
  var source = new EventSource("/events");
  source.onmessage = function (e) {
    var msg = JSON.parse(e.data);
    if (msg.type === "render") {
      root.innerHTML = msg.payload.html;
    } else if (msg.type === "console") {
      var log = console[msg.payload.level] || console.log;
      log.apply(console, ["[app]"].concat(msg.payload.args));
    }
  };
})();
</script>
</body>
</html>
"#;

/// Everything the render server needs from its instance.
#[derive(Clone)]
pub struct RenderState {
    /// App name, used as the bridge event source.
    pub app_name: Arc<str>,
    /// The instance's bridge.
    pub bridge: Arc<Bridge>,
    /// The instance's renderer (for late-join replay).
    pub renderer: Arc<Renderer>,
    /// Serialized envelopes for SSE viewers.
    pub viewers: broadcast::Sender<Arc<str>>,
    /// Stylesheet served at `/app.css`.
    pub style: Option<Arc<str>>,
    /// Cancelled when the instance is torn down.
    pub shutdown: CancellationToken,
}

/// Routes of the render server.
pub fn router(state: RenderState) -> Router {
    Router::new()
        .route("/", get(shell))
        .route("/events", get(events))
        .route("/app.css", get(stylesheet))
        .route("/api/callMethod", post(call_method))
        .with_state(state)
}

/// Serve `state` on `listener` until the shutdown token fires.
pub fn spawn(listener: TcpListener, state: RenderState) -> JoinHandle<()> {
    let shutdown = state.shutdown.clone();
    let app_name = Arc::clone(&state.app_name);
    tokio::spawn(async move {
        let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
        info!(app = %app_name, port, "Render server listening");
        let served = axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        match served {
            Ok(()) => debug!(app = %app_name, port, "Render server stopped"),
            Err(e) => warn!(app = %app_name, port, error = %e, "Render server failed"),
        }
    })
}

async fn shell() -> Html<&'static str> {
    Html(SHELL_HTML)
}

async fn events(
    State(state): State<RenderState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribing under the renderer lock means no render is missed or repeated.
    let (rx, replay) = state.renderer.with_latest(|latest| {
        let replay = latest.and_then(|latest| {
            Envelope::render(latest.html.clone(), latest.data.clone())
                .to_json()
                .ok()
        });
        (state.viewers.subscribe(), replay)
    });

    let hello = Event::default().retry(SSE_RETRY);
    let first = match replay {
        Some(json) => hello.data(json),
        None => hello.comment("connected"),
    };

    let updates = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(json) => return Some((Ok(Event::default().data(&*json)), rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE viewer lagged, skipping envelopes");
                },
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream = stream::once(async move { Ok(first) })
        .chain(updates)
        .take_until(state.shutdown.cancelled_owned());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stylesheet(State(state): State<RenderState>) -> Response {
    match &state.style {
        Some(css) => ([(header::CONTENT_TYPE, "text/css")], css.to_string()).into_response(),
        None => (StatusCode::NOT_FOUND, "/* no app css */").into_response(),
    }
}

async fn call_method(
    State(state): State<RenderState>,
    body: Result<Json<CallMethodPayload>, JsonRejection>,
) -> Response {
    let Ok(Json(call)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid request format" })),
        )
            .into_response();
    };

    match state
        .bridge
        .request_method(&state.app_name, &call.method_name, call.args)
        .await
    {
        Ok(outcome) => {
            if let Some(error) = outcome.error_message(&call.method_name) {
                warn!(app = %state.app_name, method = %call.method_name, %error, "Method call failed");
            }
            Json(json!({ "success": true })).into_response()
        },
        Err(e) => {
            warn!(app = %state.app_name, method = %call.method_name, error = %e, "No logic behind bridge");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Bridge not available" })),
            )
                .into_response()
        },
    }
}
