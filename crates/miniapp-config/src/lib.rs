#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(unreachable_pub)]
//! Layered configuration for the mini-app host.
//!
//! # Usage
//!
//! ```rust,no_run
//! use miniapp_config::Config;
//!
//! let config = Config::load(None).unwrap();
//! println!("control API on port {}", config.server.control_port);
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment variables** (`MINIAPP_CONTROL_PORT`, `MINIAPP_PUSH_PORT`,
//!    `MINIAPP_RENDER_PORT_BASE`, `MINIAPP_APPS_DIR`, `MINIAPP_LOG_LEVEL`)
//! 2. **Explicit file** (`--config <path>`)
//! 3. **User** (`~/.miniapp/config.toml`)
//! 4. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! This crate depends on no other miniapp crate. The host converts these
//! types into sandbox limits and reconnect policies at startup.

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Commonly used types.
pub mod prelude;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::LoadOptions;
pub use types::*;

impl Config {
    /// Load configuration with full precedence, optionally including an
    /// explicit file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(explicit: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(&LoadOptions {
            explicit: explicit.map(std::path::Path::to_path_buf),
            ..LoadOptions::default()
        })
    }
}
