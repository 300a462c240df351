//! The sandbox actor.
//!
//! Each sandbox owns a dedicated OS thread running a current-thread tokio
//! runtime. The script engine never leaves that thread; callers talk to it
//! through an unbounded command channel, so callbacks never overlap and
//! timers interleave between commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use miniapp_bridge::{Bridge, BridgeEvent, BridgeSubscriber, MethodOutcome, SubscriberId};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::engine::{LoadReport, ScriptEngine};
use crate::error::{SandboxError, SandboxResult};
use crate::limits::SandboxLimits;
use crate::methods::Lifecycle;
use crate::status::{SandboxState, SharedStatus};

enum Command {
    Invoke {
        method: String,
        args: Value,
        reply: oneshot::Sender<MethodOutcome>,
    },
    Lifecycle {
        hook: Lifecycle,
        args: Value,
        reply: oneshot::Sender<()>,
    },
    Dispose,
}

/// Handle to a running sandbox.
///
/// Dropping the handle disposes the sandbox.
pub struct Sandbox {
    app_name: String,
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<SharedStatus>,
    bridge: Arc<Bridge>,
    load_report: LoadReport,
    // Held so the bridge's weak reference stays alive.
    _forwarder: Arc<MethodForwarder>,
    subscription: SubscriberId,
    disposed: AtomicBool,
}

impl Sandbox {
    /// Start a sandbox thread, evaluate `source` and launch the app.
    ///
    /// Faults in the logic do not fail this call; they are reported in the
    /// returned sandbox's [`load_report`](Self::load_report) and on the bridge.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Spawn`] if the thread cannot be created, or
    /// [`SandboxError::Runtime`] if it dies before finishing the load.
    pub async fn spawn(
        app_name: impl Into<String>,
        source: impl Into<String>,
        bridge: Arc<Bridge>,
        limits: SandboxLimits,
    ) -> SandboxResult<Self> {
        let app_name = app_name.into();
        let source = source.into();
        let status = Arc::new(SharedStatus::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel::<Result<LoadReport, String>>();

        let thread_name = app_name.clone();
        let thread_bridge = Arc::clone(&bridge);
        let thread_status = Arc::clone(&status);
        std::thread::Builder::new()
            .name(format!("sandbox-{app_name}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = init_tx.send(Err(e.to_string()));
                        return;
                    },
                };

                let mut engine = ScriptEngine::new(
                    &thread_name,
                    thread_bridge,
                    Arc::clone(&thread_status),
                    limits,
                );
                let report = engine.load(&source);
                thread_status.set_state(if report.registered {
                    SandboxState::Launched
                } else {
                    SandboxState::Loaded
                });
                if init_tx.send(Ok(report)).is_err() {
                    return;
                }

                runtime.block_on(run(engine, command_rx, &thread_status));
                debug!(app = %thread_name, "Sandbox thread exiting");
            })?;

        let load_report = init_rx
            .await
            .map_err(|_| SandboxError::Runtime("sandbox thread exited during load".into()))?
            .map_err(SandboxError::Runtime)?;

        let forwarder = Arc::new(MethodForwarder {
            commands: commands.clone(),
        });
        let subscription = bridge.subscribe(Arc::clone(&forwarder) as Arc<dyn BridgeSubscriber>);

        info!(
            app = %app_name,
            registered = load_report.registered,
            faulted = load_report.fault.is_some(),
            "Sandbox started"
        );

        Ok(Self {
            app_name,
            commands,
            status,
            bridge,
            load_report,
            _forwarder: forwarder,
            subscription,
            disposed: AtomicBool::new(false),
        })
    }

    /// Run a named method.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Disposed`] after [`dispose`](Self::dispose).
    pub async fn invoke_method(&self, method: &str, args: Value) -> SandboxResult<MethodOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Invoke {
            method: method.to_string(),
            args,
            reply,
        })?;
        rx.await.map_err(|_| SandboxError::Disposed)
    }

    /// Run a lifecycle callback by name (`onShow`, ...) and wait for it.
    ///
    /// Unknown names and undeclared callbacks are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Disposed`] after [`dispose`](Self::dispose).
    pub async fn trigger_lifecycle(&self, name: &str, args: Value) -> SandboxResult<()> {
        let Some(hook) = Lifecycle::from_callback_name(name) else {
            if self.is_disposed() {
                return Err(SandboxError::Disposed);
            }
            debug!(app = %self.app_name, name, "Ignoring unknown lifecycle hook");
            return Ok(());
        };

        let (reply, rx) = oneshot::channel();
        self.send(Command::Lifecycle { hook, args, reply })?;
        rx.await.map_err(|_| SandboxError::Disposed)
    }

    fn send(&self, command: Command) -> SandboxResult<()> {
        if self.is_disposed() {
            return Err(SandboxError::Disposed);
        }
        self.commands
            .send(command)
            .map_err(|_| SandboxError::Disposed)
    }

    /// The latest committed data.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Value> {
        self.status.snapshot()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SandboxState {
        self.status.state()
    }

    /// The app this sandbox runs.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// What happened while loading the source.
    #[must_use]
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Cancel all timers and stop the actor. Idempotent; does not block.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bridge.unsubscribe(self.subscription);
        let _ = self.commands.send(Command::Dispose);
        self.status.set_state(SandboxState::Disposed);
        info!(app = %self.app_name, "Sandbox disposed");
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run(
    mut engine: ScriptEngine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    status: &SharedStatus,
) {
    loop {
        let deadline = engine.next_timer_deadline();
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Invoke { method, args, reply } => {
                        status.mark_running();
                        let outcome = engine.invoke_method(&method, &args);
                        let _ = reply.send(outcome);
                    },
                    Command::Lifecycle { hook, args, reply } => {
                        status.mark_running();
                        engine.trigger_lifecycle(hook, &args);
                        let _ = reply.send(());
                    },
                    Command::Dispose => break,
                }
            },
            () = sleep_until(deadline) => {
                status.mark_running();
                engine.fire_due_timers(Instant::now());
            },
        }
    }

    engine.shutdown();
    status.set_state(SandboxState::Disposed);
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Claims method requests published on the bridge and queues them on the actor.
struct MethodForwarder {
    commands: mpsc::UnboundedSender<Command>,
}

impl BridgeSubscriber for MethodForwarder {
    fn on_event(&self, event: &BridgeEvent) {
        let BridgeEvent::MethodInvocationRequested { request, .. } = event else {
            return;
        };
        let Some(reply) = request.reply.take() else {
            return;
        };

        let command = Command::Invoke {
            method: request.method.clone(),
            args: request.args.clone(),
            reply,
        };
        if let Err(mpsc::error::SendError(Command::Invoke { reply, .. })) =
            self.commands.send(command)
        {
            error!(method = %request.method, "Method request for a stopped sandbox");
            let _ = reply.send(MethodOutcome::Failed("sandbox disposed".into()));
        }
    }

    fn accepts(&self, event: &BridgeEvent) -> bool {
        matches!(event, BridgeEvent::MethodInvocationRequested { .. })
    }

    fn name(&self) -> &str {
        "sandbox-method-forwarder"
    }
}
