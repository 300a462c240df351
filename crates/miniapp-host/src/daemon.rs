//! Wiring of the long-running services: control API, push server and the
//! instance host behind both.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use miniapp_config::Config;
use miniapp_push::{ConnectionSet, PushServer};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::error::HostResult;
use crate::host::{InstanceHost, SharedHost};
use crate::push_handler::HostPushHandler;

/// Starts the daemon services.
pub struct Daemon;

impl Daemon {
    /// Bind the push server and control API and start serving.
    ///
    /// Port 0 in the config binds an ephemeral port; the handle reports the
    /// real addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if either listener cannot be bound.
    pub async fn start(config: &Config) -> HostResult<DaemonHandle> {
        let bind_host = config.server.host.as_str();
        let push = PushServer::bind((bind_host, config.server.push_port)).await?;
        let push_addr = push.local_addr();
        let connections = push.connections();

        let host = InstanceHost::new(config, connections.clone()).into_shared();
        let control = TcpListener::bind((bind_host, config.server.control_port)).await?;
        let control_addr = control.local_addr()?;

        let shutdown = CancellationToken::new();
        let push_task = tokio::spawn(push.serve(
            Arc::new(HostPushHandler::new(Arc::clone(&host))),
            shutdown.clone(),
        ));

        let api_shutdown = shutdown.clone();
        let router = api::router(Arc::clone(&host));
        let control_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(control, router)
                .with_graceful_shutdown(api_shutdown.cancelled_owned())
                .await
            {
                warn!(error = %e, "Control API stopped with error");
            }
        });

        info!(%control_addr, %push_addr, apps_dir = %config.apps.dir.display(), "Daemon started");
        Ok(DaemonHandle {
            control_addr,
            push_addr,
            host,
            connections,
            shutdown,
            tasks: vec![push_task, control_task],
            grace: Duration::from_millis(config.server.shutdown_grace_ms),
        })
    }
}

/// Running daemon services.
pub struct DaemonHandle {
    control_addr: SocketAddr,
    push_addr: SocketAddr,
    host: SharedHost,
    connections: ConnectionSet,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl DaemonHandle {
    /// Address of the control API.
    #[must_use]
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Address of the push server.
    #[must_use]
    pub fn push_addr(&self) -> SocketAddr {
        self.push_addr
    }

    /// The shared instance host.
    #[must_use]
    pub fn host(&self) -> SharedHost {
        Arc::clone(&self.host)
    }

    /// Number of connected push viewers.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting, tear down every instance and wait up to the grace
    /// period for the listeners to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.host.lock().await.shutdown();
        for task in self.tasks {
            if tokio::time::timeout(self.grace, task).await.is_err() {
                warn!(grace_ms = self.grace.as_millis(), "Listener did not drain in time");
            }
        }
        info!("Daemon stopped");
    }
}
