//! Miniapp Host - runs many isolated mini-app instances side by side.
//!
//! The host owns every [`AppInstance`]. Each instance owns a sandbox, a
//! bridge, a renderer and a render server on its own leased port. Around
//! the host sit two long-running services:
//!
//! - the control API ([`api`]): launch, show, hide, refresh and terminate
//!   apps over JSON HTTP;
//! - the push channel ([`miniapp_push::PushServer`]): live `render` and
//!   `console` envelopes for viewers of the active instance, and their
//!   `callMethod` requests routed back through the bridge.
//!
//! [`Daemon`] wires both to a shared [`InstanceHost`]; the `miniappd`
//! binary is a thin shell around it.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(unreachable_pub)]

pub mod api;
pub mod prelude;
pub mod render_server;

mod catalog;
mod daemon;
mod error;
mod host;
mod instance;
mod ports;
mod push_handler;

pub use catalog::{AppBundle, AppCatalog, AppDescriptor};
pub use daemon::{Daemon, DaemonHandle};
pub use error::{HostError, HostResult};
pub use host::{
    CurrentApp, InstanceHost, LaunchReport, SharedHost, call_active_method, hide_active,
    reconnect_policy, sandbox_limits, show_active,
};
pub use instance::{APP_LOG_TARGET, AppInstance, InstanceSummary, RenderRouter};
pub use ports::PortAllocator;
pub use push_handler::HostPushHandler;
