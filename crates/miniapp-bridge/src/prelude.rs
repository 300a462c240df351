//! Prelude module - commonly used types for convenient import.
//!
//! Use `use miniapp_bridge::prelude::*;` to import all essential types.

pub use crate::{Bridge, BridgeSubscriber, FnSubscriber, SubscriberId};

pub use crate::{BridgeError, BridgeResult};

pub use crate::{BridgeEvent, EventMetadata, LogLevel, MethodOutcome, MethodRequest, ReplySlot};
