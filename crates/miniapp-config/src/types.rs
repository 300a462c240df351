//! Configuration types for the mini-app host.
//!
//! These types have no dependencies on the other miniapp crates; the host
//! converts them into domain types at startup. Every struct implements
//! [`Default`] with the same values as the embedded `defaults.toml`, so a
//! bare `[section]` header produces a working configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listening addresses and port ranges.
    pub server: ServerSection,
    /// App discovery and launch policy.
    pub apps: AppsSection,
    /// Resource limits for sandboxed logic.
    pub sandbox: SandboxSection,
    /// Push client reconnection policy.
    pub client: ClientSection,
    /// Log level and format.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// ServerSection
// ---------------------------------------------------------------------------

/// Listening addresses and ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Interface every listener binds to.
    pub host: String,
    /// Control HTTP API port.
    pub control_port: u16,
    /// Push channel `WebSocket` port.
    pub push_port: u16,
    /// First port handed to per-instance render servers.
    pub render_port_base: u16,
    /// Number of ports in the render range.
    pub render_port_limit: u16,
    /// How long shutdown waits for listeners to drain.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            control_port: 3000,
            push_port: 3003,
            render_port_base: 4100,
            render_port_limit: 64,
            shutdown_grace_ms: 2000,
        }
    }
}

impl ServerSection {
    /// Last port of the render range, inclusive. `None` if the range is
    /// empty or runs past `u16::MAX`.
    #[must_use]
    pub fn render_port_end(&self) -> Option<u16> {
        self.render_port_limit
            .checked_sub(1)
            .and_then(|span| self.render_port_base.checked_add(span))
    }
}

// ---------------------------------------------------------------------------
// AppsSection
// ---------------------------------------------------------------------------

/// What happens to running instances when another app launches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Terminate every other instance first.
    #[default]
    Replace,
    /// Keep other instances running; only the newest is active.
    Coexist,
}

/// App discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsSection {
    /// Directory holding one subdirectory per app.
    pub dir: PathBuf,
    /// Launch policy.
    pub launch_mode: LaunchMode,
    /// Markup file name inside an app directory.
    pub template_file: String,
    /// Logic file name inside an app directory.
    pub script_file: String,
    /// Stylesheet file name inside an app directory.
    pub style_file: String,
}

impl Default for AppsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("apps"),
            launch_mode: LaunchMode::Replace,
            template_file: "app.axml".to_owned(),
            script_file: "app.rhai".to_owned(),
            style_file: "app.axss".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxSection
// ---------------------------------------------------------------------------

/// Resource limits for sandboxed logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Operations per top-level call (0 = unlimited).
    pub max_operations: u64,
    /// Function call depth.
    pub max_call_levels: usize,
    /// Expression nesting depth.
    pub max_expr_depth: usize,
    /// String length in bytes.
    pub max_string_size: usize,
    /// Array length.
    pub max_array_size: usize,
    /// Object map size.
    pub max_map_size: usize,
    /// Live timers per instance.
    pub max_timers: usize,
    /// Lower bound for interval periods.
    pub min_timer_interval_ms: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 1024 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_timers: 64,
            min_timer_interval_ms: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// ClientSection
// ---------------------------------------------------------------------------

/// Push client reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// The n-th retry waits `n * base_delay_ms`.
    pub base_delay_ms: u64,
    /// Consecutive failures that end reconnection.
    pub max_attempts: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Extra filter directives (e.g. `["miniapp::app=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
