use thiserror::Error;

/// Errors that can occur when driving a sandbox.
///
/// Faults raised by the logic itself are contained inside the sandbox and
/// surface as [`MethodOutcome::Failed`](miniapp_bridge::MethodOutcome) or
/// log events; they only appear here when they prevent a call from being
/// made at all.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The logic raised while running a callback.
    #[error("script fault: {0}")]
    ScriptFault(String),

    /// The sandbox was disposed; no further calls are accepted.
    #[error("sandbox disposed")]
    Disposed,

    /// The sandbox thread could not be started.
    #[error("failed to spawn sandbox thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The sandbox thread failed before finishing the load.
    #[error("sandbox runtime failed: {0}")]
    Runtime(String),
}

/// A specialized Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;
