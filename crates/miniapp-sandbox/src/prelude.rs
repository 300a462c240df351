//! Prelude module - commonly used types for convenient import.
//!
//! Use `use miniapp_sandbox::prelude::*;` to import all essential types.

pub use crate::{Lifecycle, LoadReport, Sandbox, SandboxLimits, SandboxState};

pub use crate::{SandboxError, SandboxResult};
