//! Bridge error types.

use thiserror::Error;

/// Errors that can occur when talking across the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A method request was published but nothing on the logic side picked it up.
    #[error("no logic endpoint accepted method request: {method}")]
    NoResponder {
        /// Requested method.
        method: String,
    },

    /// The logic side took the request but dropped the reply channel.
    #[error("reply dropped for method: {method}")]
    ReplyDropped {
        /// Requested method.
        method: String,
    },
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
