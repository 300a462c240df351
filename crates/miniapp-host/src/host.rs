//! The instance host: launches, tracks and tears down mini-apps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use miniapp_bridge::{Bridge, MethodOutcome};
use miniapp_config::{ClientSection, Config, LaunchMode, SandboxSection};
use miniapp_push::{ConnectionSet, Envelope, ReconnectPolicy};
use miniapp_sandbox::{Sandbox, SandboxLimits};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::catalog::{AppCatalog, AppDescriptor};
use crate::error::{HostError, HostResult};
use crate::instance::{AppInstance, InstanceSummary};
use crate::ports::PortAllocator;

/// Host state shared by the control API and the push handler.
pub type SharedHost = Arc<Mutex<InstanceHost>>;

/// Bridge event source used for host-initiated method calls.
const HOST_SOURCE: &str = "host";

/// Result of a successful launch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchReport {
    /// App that was launched.
    pub app_name: String,
    /// Data right after load and `onLaunch`.
    pub initial_data: Arc<Value>,
    /// Port of the instance's render server.
    pub render_port: u16,
}

/// Body of `GET /api/current-app`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentApp {
    /// Name of the active instance, if any.
    pub current_app: Option<String>,
    /// Every running instance.
    pub apps: Vec<InstanceSummary>,
}

/// Converts the `[sandbox]` section into engine limits.
#[must_use]
pub fn sandbox_limits(section: &SandboxSection) -> SandboxLimits {
    SandboxLimits {
        max_operations: section.max_operations,
        max_call_levels: section.max_call_levels,
        max_expr_depth: section.max_expr_depth,
        max_string_size: section.max_string_size,
        max_array_size: section.max_array_size,
        max_map_size: section.max_map_size,
        max_timers: section.max_timers,
        min_timer_interval_ms: section.min_timer_interval_ms,
    }
}

/// Converts the `[client]` section into a push client reconnect policy.
#[must_use]
pub fn reconnect_policy(section: &ClientSection) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(section.base_delay_ms),
        max_attempts: section.max_attempts,
    }
}

/// Owns every running [`AppInstance`], keyed by app name.
///
/// At most one instance is *active*: it receives control commands and its
/// output goes to push-channel viewers. Other instances (in `coexist` mode)
/// keep running and keep serving their own render server.
#[derive(Debug)]
pub struct InstanceHost {
    catalog: AppCatalog,
    ports: PortAllocator,
    instances: BTreeMap<String, AppInstance>,
    active: Option<String>,
    launch_mode: LaunchMode,
    limits: SandboxLimits,
    bind_host: String,
    push: ConnectionSet,
}

impl InstanceHost {
    /// Host configured from `config`, broadcasting to `push` viewers.
    #[must_use]
    pub fn new(config: &Config, push: ConnectionSet) -> Self {
        Self {
            catalog: AppCatalog::new(&config.apps),
            ports: PortAllocator::new(
                config.server.render_port_base,
                config.server.render_port_limit,
            ),
            instances: BTreeMap::new(),
            active: None,
            launch_mode: config.apps.launch_mode,
            limits: sandbox_limits(&config.sandbox),
            bind_host: config.server.host.clone(),
            push,
        }
    }

    /// Wrap in the shared handle used by the HTTP and push layers.
    #[must_use]
    pub fn into_shared(self) -> SharedHost {
        Arc::new(Mutex::new(self))
    }

    /// Apps available in the apps directory.
    #[must_use]
    pub fn list_apps(&self) -> Vec<AppDescriptor> {
        self.catalog.list()
    }

    /// Launch `name` and make it the active instance.
    ///
    /// In `replace` mode every other instance is torn down first. In both
    /// modes a running instance of the same app is replaced. An unknown app
    /// leaves the running instances untouched.
    ///
    /// # Errors
    ///
    /// [`HostError::AppNotFound`], [`HostError::PortExhaustion`], or an
    /// I/O or sandbox error while starting. The leased port is released on
    /// every failure.
    pub async fn launch(&mut self, name: &str) -> HostResult<LaunchReport> {
        let bundle = self.catalog.load(name)?;

        match self.launch_mode {
            LaunchMode::Replace => self.terminate_all(),
            LaunchMode::Coexist => self.remove(name),
        }

        let (port, listener) = self.lease_listener()?;
        let instance =
            match AppInstance::start(bundle, listener, self.limits, self.push.clone()).await {
                Ok(instance) => instance,
                Err(e) => {
                    self.ports.release(port);
                    return Err(e);
                },
            };

        let report = LaunchReport {
            app_name: name.to_string(),
            initial_data: Arc::clone(&instance.load_report().initial_data),
            render_port: port,
        };
        self.activate(instance);
        info!(app = name, port, mode = ?self.launch_mode, "App launched");
        Ok(report)
    }

    /// Mark the active instance visible or hidden.
    ///
    /// Returns the app name and its sandbox; callers run the `onShow` or
    /// `onHide` callback after releasing the host lock.
    ///
    /// # Errors
    ///
    /// [`HostError::InstanceNotFound`] with no active instance.
    pub fn set_visibility(&mut self, visible: bool) -> HostResult<(String, Arc<Sandbox>)> {
        let instance = self.active_instance_mut()?;
        instance.set_visible(visible);
        Ok((instance.name().to_string(), instance.shared_sandbox()))
    }

    /// Current data of the active instance. No logic runs.
    ///
    /// # Errors
    ///
    /// [`HostError::InstanceNotFound`] with no active instance.
    pub fn refresh(&self) -> HostResult<Arc<Value>> {
        Ok(self.active_instance()?.snapshot())
    }

    /// Tear down `name`, or the active instance when `None`.
    ///
    /// Terminating an app that is not running is a no-op.
    ///
    /// # Errors
    ///
    /// [`HostError::InstanceNotFound`] when `name` is `None` and nothing is
    /// active.
    pub fn terminate(&mut self, name: Option<&str>) -> HostResult<()> {
        let target = match name {
            Some(name) => name.to_string(),
            None => self.active.clone().ok_or(HostError::InstanceNotFound)?,
        };
        self.remove(&target);
        Ok(())
    }

    /// Active app and running instances.
    #[must_use]
    pub fn current(&self) -> CurrentApp {
        CurrentApp {
            current_app: self.active.clone(),
            apps: self.instances.values().map(AppInstance::summary).collect(),
        }
    }

    /// Name and bridge of the active instance.
    ///
    /// Callers await on the bridge after releasing the host lock.
    ///
    /// # Errors
    ///
    /// [`HostError::InstanceNotFound`] with no active instance.
    pub fn active_bridge(&self) -> HostResult<(String, Arc<Bridge>)> {
        let instance = self.active_instance()?;
        Ok((instance.name().to_string(), instance.bridge()))
    }

    /// The active instance.
    ///
    /// # Errors
    ///
    /// [`HostError::InstanceNotFound`] with no active instance.
    pub fn active_instance(&self) -> HostResult<&AppInstance> {
        self.active
            .as_deref()
            .and_then(|name| self.instances.get(name))
            .ok_or(HostError::InstanceNotFound)
    }

    fn active_instance_mut(&mut self) -> HostResult<&mut AppInstance> {
        self.active
            .as_deref()
            .and_then(|name| self.instances.get_mut(name))
            .ok_or(HostError::InstanceNotFound)
    }

    /// A running instance by app name.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<&AppInstance> {
        self.instances.get(name)
    }

    /// Render ports currently leased.
    #[must_use]
    pub fn ports_in_use(&self) -> Vec<u16> {
        self.ports.in_use()
    }

    /// Tear down every instance.
    pub fn shutdown(&mut self) {
        let count = self.instances.len();
        self.terminate_all();
        info!(count, "Instance host shut down");
    }

    fn terminate_all(&mut self) {
        let names: Vec<String> = self.instances.keys().cloned().collect();
        for name in names {
            self.remove(&name);
        }
    }

    fn remove(&mut self, name: &str) {
        let Some(mut instance) = self.instances.remove(name) else {
            debug!(app = name, "No running instance to terminate");
            return;
        };
        instance.terminate();
        self.ports.release(instance.port());
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
    }

    fn activate(&mut self, instance: AppInstance) {
        for other in self.instances.values() {
            other.set_active(false);
        }
        instance.set_active(true);
        instance.renderer().with_latest(|latest| {
            if let Some(latest) = latest {
                self.push
                    .broadcast(&Envelope::render(latest.html.clone(), latest.data.clone()));
            }
        });
        let name = instance.name().to_string();
        self.instances.insert(name.clone(), instance);
        self.active = Some(name);
    }

    /// Lease a port and keep the socket the probe bound.
    fn lease_listener(&mut self) -> HostResult<(u16, TcpListener)> {
        let host = self.bind_host.clone();
        let mut bound = None;
        let port = self.ports.allocate_with(|port| {
            match std::net::TcpListener::bind((host.as_str(), port)) {
                Ok(listener) => {
                    bound = Some(listener);
                    true
                },
                Err(_) => false,
            }
        })?;

        let listener = bound
            .ok_or_else(|| std::io::Error::other("render listener missing after probe"))
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)
            });
        match listener {
            Ok(listener) => Ok((port, listener)),
            Err(e) => {
                self.ports.release(port);
                Err(e.into())
            },
        }
    }
}

/// Run `method` on the active instance without holding the host lock while
/// the logic runs.
///
/// # Errors
///
/// [`HostError::InstanceNotFound`] with no active instance, or
/// [`HostError::Bridge`] if the instance went away mid-call.
pub async fn call_active_method(
    host: &SharedHost,
    method: &str,
    args: Value,
) -> HostResult<MethodOutcome> {
    let (app, bridge) = host.lock().await.active_bridge()?;
    debug!(app = %app, method, "Calling method on active instance");
    Ok(bridge.request_method(HOST_SOURCE, method, args).await?)
}

/// Mark the active instance visible and run its `onShow` callback.
///
/// # Errors
///
/// [`HostError::InstanceNotFound`] with no active instance, or
/// [`HostError::Sandbox`] if the callback could not be delivered.
pub async fn show_active(host: &SharedHost) -> HostResult<()> {
    change_visibility(host, true).await
}

/// Mark the active instance hidden and run its `onHide` callback.
///
/// # Errors
///
/// [`HostError::InstanceNotFound`] with no active instance, or
/// [`HostError::Sandbox`] if the callback could not be delivered.
pub async fn hide_active(host: &SharedHost) -> HostResult<()> {
    change_visibility(host, false).await
}

async fn change_visibility(host: &SharedHost, visible: bool) -> HostResult<()> {
    let hook = if visible { "onShow" } else { "onHide" };
    let (app, sandbox) = host.lock().await.set_visibility(visible)?;
    sandbox.trigger_lifecycle(hook, Value::Null).await?;
    debug!(app = %app, hook, "Visibility changed");
    Ok(())
}
