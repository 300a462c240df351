//! Prelude module - commonly used types for convenient import.
//!
//! Use `use miniapp_host::prelude::*;` to import all essential types.

pub use crate::{
    AppCatalog, AppDescriptor, AppInstance, CurrentApp, Daemon, DaemonHandle, InstanceHost,
    LaunchReport, SharedHost,
};

pub use crate::{HostError, HostResult};
