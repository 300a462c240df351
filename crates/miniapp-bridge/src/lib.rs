//! Miniapp Bridge - the single channel between sandboxed logic and the host.
//!
//! The bridge carries three kinds of traffic:
//! - `StateMutated`: logic committed a `setData` patch; the full snapshot rides along
//! - `LogEmitted`: logic wrote to `console`
//! - `MethodInvocationRequested`: the host asks logic to run a declared method
//!
//! Subscribers are held weakly. A subscriber that is dropped without
//! unsubscribing is pruned on the next publish and never receives further
//! events.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use miniapp_bridge::{Bridge, BridgeEvent, EventMetadata, FnSubscriber, LogLevel};
//!
//! let bridge = Bridge::new();
//! let printer = Arc::new(FnSubscriber::new("printer", |event: &BridgeEvent| {
//!     println!("{}", event.event_type());
//! }));
//! bridge.subscribe(printer.clone());
//!
//! let delivered = bridge.publish(&BridgeEvent::LogEmitted {
//!     metadata: EventMetadata::new("counter"),
//!     level: LogLevel::Info,
//!     args: vec![],
//! });
//! assert_eq!(delivered, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(unreachable_pub)]

pub mod prelude;

mod bridge;
mod error;
mod event;

pub use bridge::{Bridge, BridgeSubscriber, EventFilter, FnSubscriber, SubscriberId};
pub use error::{BridgeError, BridgeResult};
pub use event::{
    BridgeEvent, Direction, EventMetadata, LogLevel, MethodOutcome, MethodRequest, ReplySlot,
};
