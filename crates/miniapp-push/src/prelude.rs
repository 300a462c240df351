//! Prelude module - commonly used types for convenient import.
//!
//! Use `use miniapp_push::prelude::*;` to import all essential types.

pub use crate::{
    CallMethodPayload, ClientEvent, ConnectionSet, Envelope, MessageType,
    MethodCallResponsePayload, Peer, PushClient, PushClientHandle, PushHandler, PushServer,
    ReconnectPolicy,
};

pub use crate::{PushError, PushResult};
