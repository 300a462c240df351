//! Push-channel callbacks backed by the instance host.

use async_trait::async_trait;
use miniapp_push::{CallMethodPayload, Envelope, MethodCallResponsePayload, Peer, PushHandler};
use tracing::debug;

use crate::host::{SharedHost, call_active_method};

/// Replays the active render to joining viewers and routes their method
/// calls to the active instance.
pub struct HostPushHandler {
    host: SharedHost,
}

impl HostPushHandler {
    /// Handler over `host`.
    #[must_use]
    pub fn new(host: SharedHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl PushHandler for HostPushHandler {
    async fn on_client_joined(&self, peer: &Peer) {
        let host = self.host.lock().await;
        let Ok(instance) = host.active_instance() else {
            return;
        };
        // The peer is already registered for broadcasts; replaying under the
        // renderer lock keeps the replay ordered against live renders.
        instance.renderer().with_latest(|latest| {
            if let Some(latest) = latest {
                let sent = peer.send(&Envelope::render(latest.html.clone(), latest.data.clone()));
                debug!(connection_id = %peer.id(), sent, "Replayed latest render");
            }
        });
    }

    async fn on_call_method(&self, call: CallMethodPayload) -> MethodCallResponsePayload {
        match call_active_method(&self.host, &call.method_name, call.args).await {
            Ok(outcome) => MethodCallResponsePayload::from_outcome(&call.method_name, &outcome),
            Err(e) => MethodCallResponsePayload::failure(&call.method_name, e.to_string()),
        }
    }
}
