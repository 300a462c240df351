//! Error types for the instance host.

use miniapp_bridge::BridgeError;
use miniapp_push::PushError;
use miniapp_sandbox::SandboxError;

/// Errors produced by the host and its HTTP surfaces.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// No app with this name in the apps directory.
    #[error("App not found: {0}")]
    AppNotFound(String),

    /// The operation needs an active instance and there is none.
    #[error("No active app instance")]
    InstanceNotFound,

    /// Every port in the render range is taken.
    #[error("No free render port in {base}..{end}")]
    PortExhaustion {
        /// First port of the range.
        base: u16,
        /// One past the last port of the range.
        end: u32,
    },

    /// Sandbox failure (not a contained logic fault).
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Bridge delivery failure.
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Push channel failure.
    #[error("Push channel error: {0}")]
    Push(#[from] PushError),

    /// Filesystem or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for host operations.
pub type HostResult<T> = Result<T, HostError>;
