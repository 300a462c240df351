//! Resource limits applied to every sandbox engine.

use serde::{Deserialize, Serialize};

/// Limits for one sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Maximum operations per top-level call (0 = unlimited).
    pub max_operations: u64,
    /// Maximum function call depth.
    pub max_call_levels: usize,
    /// Maximum expression nesting depth.
    pub max_expr_depth: usize,
    /// Maximum string length in bytes.
    pub max_string_size: usize,
    /// Maximum array length.
    pub max_array_size: usize,
    /// Maximum object map size.
    pub max_map_size: usize,
    /// Maximum number of live timers.
    pub max_timers: usize,
    /// Lower bound for interval periods, in milliseconds.
    pub min_timer_interval_ms: u64,
}

impl Default for SandboxLimits {
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
