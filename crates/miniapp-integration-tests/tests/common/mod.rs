//! Shared test harness for integration tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use miniapp_config::{Config, LaunchMode};
use miniapp_host::{Daemon, DaemonHandle};
use miniapp_push::Envelope;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// How long a test waits for any single network event.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// A viewer connected to the push channel.
pub type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Logic that faults during load.
pub const BROKEN_APP: &str = "App(#{ data: ";

/// Logic whose methods can fault without taking the instance down.
pub const FLAKY_APP: &str = r#"
    App(#{
        data: #{ calls: 0 },
        explode: || { throw "kaput"; },
        bump: |by| { setData(#{ calls: this.data.calls + by }); by }
    });
"#;

/// A daemon on ephemeral ports over a private copy of the shipped apps.
#[allow(dead_code)]
pub struct TestDaemon {
    /// The running daemon.
    pub handle: DaemonHandle,
    /// HTTP client for the control API and render servers.
    pub http: reqwest::Client,
    _apps_dir: TempDir,
}

#[allow(dead_code)]
impl TestDaemon {
    /// Start in `replace` mode.
    pub async fn start() -> Self {
        Self::with_mode(LaunchMode::Replace).await
    }

    /// Start with the given launch mode.
    pub async fn with_mode(mode: LaunchMode) -> Self {
        let apps_dir = TempDir::new().expect("failed to create tempdir");
        copy_shipped_apps(apps_dir.path());
        write_app(apps_dir.path(), "broken", BROKEN_APP, None);
        write_app(
            apps_dir.path(),
            "flaky",
            FLAKY_APP,
            Some("<text>calls: {{calls}}</text>"),
        );

        let mut config = Config::default();
        config.apps.dir = apps_dir.path().to_path_buf();
        config.apps.launch_mode = mode;
        config.server.control_port = 0;
        config.server.push_port = 0;
        config.server.render_port_base = free_port_base(32);
        config.server.render_port_limit = 32;
        config.server.shutdown_grace_ms = 500;

        let handle = Daemon::start(&config).await.expect("daemon failed to start");
        Self {
            handle,
            http: reqwest::Client::new(),
            _apps_dir: apps_dir,
        }
    }

    /// Control API URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.handle.control_addr())
    }

    /// Render server URL for `path` on `port`.
    pub fn render_url(&self, port: u16, path: &str) -> String {
        format!("http://127.0.0.1:{port}{path}")
    }

    /// Push channel URL.
    pub fn push_url(&self) -> String {
        format!("ws://{}", self.handle.push_addr())
    }

    /// `GET` a control route; returns status and JSON body.
    pub async fn get(&self, path: &str) -> (u16, Value) {
        let response = self.http.get(self.url(path)).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// `POST` JSON to a control route; returns status and JSON body.
    pub async fn post(&self, path: &str, body: &Value) -> (u16, Value) {
        let response = self.http.post(self.url(path)).json(body).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// Launch `app` and return its render port.
    pub async fn launch(&self, app: &str) -> u16 {
        let (status, body) = self
            .post("/api/launch-app", &serde_json::json!({ "appName": app }))
            .await;
        assert_eq!(status, 200, "launch {app} failed: {body}");
        u16::try_from(body["renderPort"].as_u64().unwrap()).unwrap()
    }

    /// Call a method on the active instance through the control API.
    pub async fn call(&self, method: &str, args: Value) -> Value {
        let (status, body) = self
            .post(
                "/api/call-method",
                &serde_json::json!({ "methodName": method, "args": args }),
            )
            .await;
        assert_eq!(status, 200, "call {method} failed: {body}");
        body
    }

    /// Connect a push viewer and consume its `connection` envelope.
    pub async fn viewer(&self) -> Viewer {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.push_url())
            .await
            .unwrap();
        let hello = next_envelope(&mut ws).await;
        assert_eq!(hello.kind.as_str(), "connection");
        assert_eq!(hello.payload["status"], "connected");
        ws
    }

    /// Stop the daemon.
    pub async fn stop(self) {
        self.handle.shutdown().await;
    }
}

/// Next text frame as an envelope.
pub async fn next_envelope(ws: &mut Viewer) -> Envelope {
    loop {
        let frame = tokio::time::timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("viewer stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return Envelope::parse(&text).unwrap();
        }
    }
}

/// Skip envelopes until one of type `kind` satisfies `pred`.
#[allow(dead_code)]
pub async fn wait_for(ws: &mut Viewer, kind: &str, pred: impl Fn(&Value) -> bool) -> Envelope {
    loop {
        let envelope = next_envelope(ws).await;
        if envelope.kind.as_str() == kind && pred(&envelope.payload) {
            return envelope;
        }
    }
}

/// Send a raw text frame.
#[allow(dead_code)]
pub async fn send_text(ws: &mut Viewer, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Start of a run of ports that were free a moment ago.
pub fn free_port_base(span: u16) -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    port.saturating_sub(span).max(1024)
}

fn shipped_apps_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../apps")
}

fn copy_shipped_apps(dest: &Path) {
    for app in std::fs::read_dir(shipped_apps_dir()).unwrap() {
        let app = app.unwrap();
        if !app.path().is_dir() {
            continue;
        }
        let target = dest.join(app.file_name());
        std::fs::create_dir_all(&target).unwrap();
        for file in std::fs::read_dir(app.path()).unwrap() {
            let file = file.unwrap();
            std::fs::copy(file.path(), target.join(file.file_name())).unwrap();
        }
    }
}

fn write_app(root: &Path, name: &str, script: &str, template: Option<&str>) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("app.rhai"), script).unwrap();
    if let Some(template) = template {
        std::fs::write(dir.join("app.axml"), template).unwrap();
    }
}
