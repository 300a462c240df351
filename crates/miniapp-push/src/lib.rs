//! Miniapp Push - the live channel between the host and app viewers.
//!
//! Frames are JSON [`Envelope`]s tagged with a [`MessageType`]. The
//! [`PushServer`] accepts viewer `WebSocket`s, broadcasts renders and log
//! lines through its [`ConnectionSet`], and routes inbound `callMethod`
//! frames to a [`PushHandler`]. The [`PushClient`] is the viewer side: it
//! keeps a connection open and retries with linear backoff when it drops.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(unreachable_pub)]

pub mod prelude;

mod client;
mod error;
mod protocol;
mod reconnect;
mod server;

pub use client::{ClientEvent, PushClient, PushClientHandle};
pub use error::{PushError, PushResult};
pub use protocol::{
    CallMethodPayload, ConnectionPayload, ConnectionStatus, ConsolePayload, Envelope,
    ErrorPayload, INVALID_FORMAT, MessageType, MethodCallResponsePayload, RenderPayload,
    UNKNOWN_TYPE, now_millis,
};
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
pub use server::{ConnectionId, ConnectionSet, Peer, PushHandler, PushServer};
