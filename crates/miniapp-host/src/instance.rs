//! One running mini-app and its wiring.
//!
//! An [`AppInstance`] owns its sandbox, bridge, renderer and render server.
//! The bridge only holds a weak reference to the [`RenderRouter`], so the
//! ownership graph stays acyclic: host → instance → {sandbox, bridge,
//! renderer}.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use miniapp_bridge::{Bridge, BridgeEvent, BridgeSubscriber, Direction, LogLevel, SubscriberId};
use miniapp_push::{ConnectionSet, Envelope};
use miniapp_sandbox::{LoadReport, Sandbox, SandboxLimits, SandboxState};
use miniapp_template::Renderer;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::AppBundle;
use crate::error::HostResult;
use crate::render_server::{self, RenderState};

/// Buffered envelopes per SSE viewer before it starts lagging.
const VIEWER_BUFFER: usize = 64;

/// Tracing target for log lines emitted by app logic.
pub const APP_LOG_TARGET: &str = "miniapp::app";

/// Bridge subscriber that turns logic output into viewer traffic.
///
/// State mutations are rendered and cached, then fanned out to SSE viewers
/// and, while the instance is active, to push-channel viewers. Log lines are
/// mirrored into `tracing` and fanned out the same way.
pub struct RenderRouter {
    app_name: String,
    renderer: Arc<Renderer>,
    viewers: broadcast::Sender<Arc<str>>,
    push: ConnectionSet,
    active: Arc<AtomicBool>,
}

impl RenderRouter {
    fn fan_out(&self, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(json) => {
                // No SSE viewers is not an error.
                let _ = self.viewers.send(Arc::from(json));
            },
            Err(e) => {
                error!(app = %self.app_name, error = %e, "Failed to serialize envelope");
                return;
            },
        }
        if self.active.load(Ordering::SeqCst) {
            let delivered = self.push.broadcast(envelope);
            debug!(app = %self.app_name, kind = %envelope.kind, delivered, "Broadcast to push viewers");
        }
    }

    fn mirror_log(&self, level: LogLevel, args: &[Value]) {
        let line = args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            LogLevel::Error => error!(target: APP_LOG_TARGET, app = %self.app_name, "{line}"),
            LogLevel::Warn => warn!(target: APP_LOG_TARGET, app = %self.app_name, "{line}"),
            LogLevel::Info | LogLevel::Log => {
                info!(target: APP_LOG_TARGET, app = %self.app_name, "{line}");
            },
        }
    }
}

impl BridgeSubscriber for RenderRouter {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::StateMutated { snapshot, .. } => {
                self.renderer.render_and_publish(snapshot, |output| {
                    self.fan_out(&Envelope::render(output.html.clone(), output.data.clone()));
                });
            },
            BridgeEvent::LogEmitted { level, args, .. } => {
                self.mirror_log(*level, args);
                self.fan_out(&Envelope::console(*level, args.clone()));
            },
            BridgeEvent::MethodInvocationRequested { .. } => {},
        }
    }

    fn accepts(&self, event: &BridgeEvent) -> bool {
        event.direction() == Direction::ToHost
    }

    fn name(&self) -> &str {
        "render-router"
    }
}

/// One entry of the instance list in `GET /api/current-app`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    /// App name.
    pub name: String,
    /// Instance identifier.
    pub id: Uuid,
    /// Render server port.
    pub port: u16,
    /// Sandbox lifecycle state.
    pub state: SandboxState,
    /// Whether the app was last shown rather than hidden.
    pub visible: bool,
    /// Launch time.
    pub created_at: DateTime<Utc>,
}

/// A running mini-app.
pub struct AppInstance {
    id: Uuid,
    name: String,
    port: u16,
    created_at: DateTime<Utc>,
    visible: bool,
    sandbox: Arc<Sandbox>,
    bridge: Arc<Bridge>,
    renderer: Arc<Renderer>,
    viewers: broadcast::Sender<Arc<str>>,
    // Held so the bridge's weak reference stays alive.
    _router: Arc<RenderRouter>,
    subscription: SubscriberId,
    active: Arc<AtomicBool>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
    terminated: bool,
}

impl AppInstance {
    /// Wire up and start an instance on an already-bound render listener.
    ///
    /// The render router is subscribed before the logic runs, so the first
    /// render reflects the data published during load.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Sandbox`](crate::HostError::Sandbox) if the
    /// sandbox thread cannot start.
    pub async fn start(
        bundle: AppBundle,
        listener: TcpListener,
        limits: SandboxLimits,
        push: ConnectionSet,
    ) -> HostResult<Self> {
        let port = listener.local_addr()?.port();
        let bridge = Arc::new(Bridge::new());
        let renderer = Arc::new(Renderer::new(bundle.template));
        let (viewers, _) = broadcast::channel(VIEWER_BUFFER);
        let active = Arc::new(AtomicBool::new(false));

        let router = Arc::new(RenderRouter {
            app_name: bundle.name.clone(),
            renderer: Arc::clone(&renderer),
            viewers: viewers.clone(),
            push,
            active: Arc::clone(&active),
        });
        let subscription = bridge.subscribe(router.clone());

        let sandbox =
            Sandbox::spawn(bundle.name.clone(), bundle.script, Arc::clone(&bridge), limits).await?;
        if let Some(fault) = &sandbox.load_report().fault {
            warn!(app = %bundle.name, %fault, "App logic faulted during load");
        }
        if renderer.latest().is_none() {
            renderer.render_and_cache(&sandbox.snapshot());
        }

        let shutdown = CancellationToken::new();
        let server = render_server::spawn(
            listener,
            RenderState {
                app_name: Arc::from(bundle.name.as_str()),
                bridge: Arc::clone(&bridge),
                renderer: Arc::clone(&renderer),
                viewers: viewers.clone(),
                style: bundle.style.map(Arc::from),
                shutdown: shutdown.clone(),
            },
        );

        let instance = Self {
            id: Uuid::new_v4(),
            name: bundle.name,
            port,
            created_at: Utc::now(),
            visible: true,
            sandbox: Arc::new(sandbox),
            bridge,
            renderer,
            viewers,
            _router: router,
            subscription,
            active,
            shutdown,
            server: Some(server),
            terminated: false,
        };
        info!(app = %instance.name, id = %instance.id, port, "Instance started");
        Ok(instance)
    }

    /// Instance identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// App name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render server port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The sandbox handle.
    #[must_use]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// A shared handle to the sandbox, for awaiting it without the host lock.
    #[must_use]
    pub fn shared_sandbox(&self) -> Arc<Sandbox> {
        Arc::clone(&self.sandbox)
    }

    /// The instance's bridge.
    #[must_use]
    pub fn bridge(&self) -> Arc<Bridge> {
        Arc::clone(&self.bridge)
    }

    /// The instance's renderer.
    #[must_use]
    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// What happened while loading the logic.
    #[must_use]
    pub fn load_report(&self) -> &LoadReport {
        self.sandbox.load_report()
    }

    /// Latest committed data.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Value> {
        self.sandbox.snapshot()
    }

    /// Number of SSE viewers currently following the instance.
    #[must_use]
    pub fn sse_viewer_count(&self) -> usize {
        self.viewers.receiver_count()
    }

    /// Whether push-channel viewers receive this instance's output.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Whether the app was last shown.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Whether [`terminate`](Self::terminate) ran.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// List entry for the control API.
    #[must_use]
    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            name: self.name.clone(),
            id: self.id,
            port: self.port,
            state: self.sandbox.state(),
            visible: self.visible,
            created_at: self.created_at,
        }
    }

    /// Tear the instance down. Idempotent and non-blocking: in-flight
    /// viewer sends may be dropped. The port is released by the owner.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.set_active(false);
        self.sandbox.dispose();
        self.shutdown.cancel();
        self.bridge.unsubscribe(self.subscription);
        self.renderer.clear();
        // The server task winds down on its own once cancelled.
        drop(self.server.take());
        info!(app = %self.name, id = %self.id, port = self.port, "Instance terminated");
    }
}

impl Drop for AppInstance {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for AppInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("port", &self.port)
            .field("visible", &self.visible)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}
