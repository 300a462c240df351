//! `WebSocket` push server.
//!
//! Viewers connect, receive a `connection` envelope, and are then fed
//! `render` and `console` envelopes by broadcast. Inbound `callMethod`
//! frames are handed to a [`PushHandler`] and answered with a
//! `methodCallResponse` on the same connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{PushError, PushResult};
use crate::protocol::{
    CallMethodPayload, Envelope, INVALID_FORMAT, MessageType, MethodCallResponsePayload,
    UNKNOWN_TYPE,
};

/// Outbound frames buffered per connection before it counts as stalled.
const OUTBOUND_QUEUE: usize = 256;

// ── Connections ──────────────────────────────────────────────

/// Identifier of one viewer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Write half of one connection.
#[derive(Debug, Clone)]
pub struct Peer {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
    evicted: CancellationToken,
}

impl Peer {
    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `envelope` for this connection only.
    ///
    /// Returns `false` if the connection is gone or stalled.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(json) => self.tx.try_send(Arc::from(json)).is_ok(),
            Err(e) => {
                error!(connection = %self.id, error = %e, "Failed to serialize envelope");
                false
            },
        }
    }
}

#[derive(Debug)]
struct Slot {
    tx: mpsc::Sender<Arc<str>>,
    evicted: CancellationToken,
}

/// The set of open connections, shared between the accept loop and
/// whoever broadcasts.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSet {
    inner: Arc<Mutex<HashMap<ConnectionId, Slot>>>,
}

impl ConnectionSet {
    fn insert(&self, peer: &Peer) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                peer.id,
                Slot {
                    tx: peer.tx.clone(),
                    evicted: peer.evicted.clone(),
                },
            );
    }

    fn remove(&self, id: ConnectionId) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Send `envelope` to every open connection.
    ///
    /// The envelope is serialized once. A connection whose queue is closed
    /// or full is dropped from the set and closed; a stalled viewer
    /// reconnects and is resynced on join instead of silently missing
    /// frames. Returns the number of connections the frame was queued for.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let json: Arc<str> = match envelope.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!(kind = %envelope.kind, error = %e, "Failed to serialize broadcast");
                return 0;
            },
        };

        let mut delivered = 0;
        let mut connections = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        connections.retain(|id, slot| match slot.tx.try_send(Arc::clone(&json)) {
            Ok(()) => {
                delivered += 1;
                true
            },
            Err(TrySendError::Full(_)) => {
                warn!(connection = %id, kind = %envelope.kind, "Viewer stalled, closing connection");
                slot.evicted.cancel();
                false
            },
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %id, "Removing closed viewer");
                false
            },
        });
        delivered
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no connection is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Handler ──────────────────────────────────────────────────

/// Host-side callbacks for the push server.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// A viewer finished the handshake and received its `connection`
    /// envelope. Typically used to send it the latest render.
    async fn on_client_joined(&self, _peer: &Peer) {}

    /// A viewer asked to run a method.
    async fn on_call_method(&self, call: CallMethodPayload) -> MethodCallResponsePayload;
}

// ── Server ───────────────────────────────────────────────────

/// Bound push server.
pub struct PushServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionSet,
}

impl PushServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Io`] if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs) -> PushResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            connections: ConnectionSet::default(),
        })
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for broadcasting to the connections this server accepts.
    #[must_use]
    pub fn connections(&self) -> ConnectionSet {
        self.connections.clone()
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(self, handler: Arc<dyn PushHandler>, shutdown: CancellationToken) {
        info!(addr = %self.local_addr, "Push server listening");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            remote,
                            self.connections.clone(),
                            Arc::clone(&handler),
                            shutdown.clone(),
                        ));
                    },
                    Err(e) => warn!(error = %e, "Failed to accept push connection"),
                },
            }
        }
        info!(addr = %self.local_addr, "Push server stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    connections: ConnectionSet,
    handler: Arc<dyn PushHandler>,
    shutdown: CancellationToken,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%remote, error = %e, "WebSocket handshake failed");
            return;
        },
    };
    let (mut writer, mut reader) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(OUTBOUND_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = writer.send(Message::Text(text.to_string())).await {
                debug!(error = %e, "Push writer closed");
                break;
            }
        }
        let _ = writer.close().await;
    });

    let peer = Peer {
        id: ConnectionId::new(),
        tx,
        evicted: CancellationToken::new(),
    };
    info!(connection = %peer.id, %remote, "Viewer connected");
    peer.send(&Envelope::connection(true));
    connections.insert(&peer);
    handler.on_client_joined(&peer).await;

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = peer.evicted.cancelled() => {
                info!(connection = %peer.id, "Evicting stalled viewer");
                break;
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_text(&text, handler.as_ref()).await {
                        peer.send(&reply);
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Ping/pong handled by tungstenite; binary ignored.
                },
                Some(Err(e)) => {
                    debug!(connection = %peer.id, error = %e, "Viewer read error");
                    break;
                },
            },
        }
    }

    connections.remove(peer.id);
    info!(connection = %peer.id, "Viewer disconnected");
    if peer.evicted.is_cancelled() {
        // The backlog would never drain to a stalled reader.
        writer_task.abort();
    }
    drop(peer);
    let _ = writer_task.await;
}

/// Process one inbound text frame; the reply to send back, if any.
async fn handle_text(text: &str, handler: &dyn PushHandler) -> Option<Envelope> {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(PushError::UnknownType(kind)) => {
            return Some(unknown_type(&kind));
        },
        Err(e) => {
            debug!(error = %e, "Rejected inbound frame");
            return Some(Envelope::error(
                "Invalid message format",
                Some(INVALID_FORMAT),
            ));
        },
    };

    trace!(kind = %envelope.kind, "Inbound envelope");
    match envelope.kind {
        MessageType::CallMethod => {
            let call: CallMethodPayload = match envelope.payload_as() {
                Ok(call) => call,
                Err(e) => {
                    debug!(error = %e, "Malformed callMethod payload");
                    return Some(Envelope::error(
                        "Invalid message format",
                        Some(INVALID_FORMAT),
                    ));
                },
            };
            let response = handler.on_call_method(call).await;
            Some(Envelope::method_call_response(&response))
        },
        other => Some(unknown_type(other.as_str())),
    }
}

fn unknown_type(kind: &str) -> Envelope {
    Envelope::error(format!("Unknown message type: {kind}"), Some(UNKNOWN_TYPE))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio_tungstenite::connect_async;

    use super::*;
    use crate::protocol::ErrorPayload;

    struct EchoHandler;

    #[async_trait]
    impl PushHandler for EchoHandler {
        async fn on_client_joined(&self, peer: &Peer) {
            peer.send(&Envelope::render("<div>hi</div>", json!({})));
        }

        async fn on_call_method(&self, call: CallMethodPayload) -> MethodCallResponsePayload {
            if call.method_name == "fail" {
                return MethodCallResponsePayload::failure(&call.method_name, "boom");
            }
            MethodCallResponsePayload {
                success: true,
                method_name: call.method_name,
                result: Some(call.args),
                error: None,
            }
        }
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start() -> (ConnectionSet, SocketAddr, CancellationToken) {
        let server = PushServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let connections = server.connections();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(Arc::new(EchoHandler), shutdown.clone()));
        (connections, addr, shutdown)
    }

    async fn next_envelope(ws: &mut Client) -> Envelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return Envelope::parse(&text).unwrap();
            }
        }
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let hello = next_envelope(&mut ws).await;
        assert_eq!(hello.kind, MessageType::Connection);
        assert_eq!(hello.payload["status"], "connected");
        let joined = next_envelope(&mut ws).await;
        assert_eq!(joined.kind, MessageType::Render);
        ws
    }

    async fn wait_for_connections(set: &ConnectionSet, expected: usize) {
        for _ in 0..100 {
            if set.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} connections, found {}", set.len());
    }

    #[tokio::test]
    async fn call_method_gets_response() {
        let (_set, addr, shutdown) = start().await;
        let mut ws = connect(addr).await;

        let call = Envelope::call_method("setStep", json!([3]));
        ws.send(Message::Text(call.to_json().unwrap())).await.unwrap();
        let reply = next_envelope(&mut ws).await;
        assert_eq!(reply.kind, MessageType::MethodCallResponse);
        let response: MethodCallResponsePayload = reply.payload_as().unwrap();
        assert!(response.success);
        assert_eq!(response.method_name, "setStep");
        assert_eq!(response.result, Some(json!([3])));

        let call = Envelope::call_method("fail", Value::Null);
        ws.send(Message::Text(call.to_json().unwrap())).await.unwrap();
        let response: MethodCallResponsePayload =
            next_envelope(&mut ws).await.payload_as().unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("boom"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn bad_frames_get_errors_and_keep_connection() {
        let (_set, addr, shutdown) = start().await;
        let mut ws = connect(addr).await;

        ws.send(Message::Text("{not json".into())).await.unwrap();
        let err: ErrorPayload = next_envelope(&mut ws).await.payload_as().unwrap();
        assert_eq!(err.message, "Invalid message format");
        assert_eq!(err.code.as_deref(), Some(INVALID_FORMAT));

        ws.send(Message::Text(r#"{"type":"hello","payload":{}}"#.into()))
            .await
            .unwrap();
        let err: ErrorPayload = next_envelope(&mut ws).await.payload_as().unwrap();
        assert_eq!(err.message, "Unknown message type: hello");
        assert_eq!(err.code.as_deref(), Some(UNKNOWN_TYPE));

        // Known but not accepted inbound.
        ws.send(Message::Text(r#"{"type":"render","payload":{}}"#.into()))
            .await
            .unwrap();
        let err: ErrorPayload = next_envelope(&mut ws).await.payload_as().unwrap();
        assert_eq!(err.message, "Unknown message type: render");

        // Still alive.
        let call = Envelope::call_method("ping", Value::Null);
        ws.send(Message::Text(call.to_json().unwrap())).await.unwrap();
        assert_eq!(
            next_envelope(&mut ws).await.kind,
            MessageType::MethodCallResponse
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn broadcast_reaches_every_viewer() {
        let (set, addr, shutdown) = start().await;
        assert_eq!(set.broadcast(&Envelope::render("", json!({}))), 0);

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        wait_for_connections(&set, 2).await;

        let sent = set.broadcast(&Envelope::render("<p>5</p>", json!({"count": 5})));
        assert_eq!(sent, 2);
        for ws in [&mut a, &mut b] {
            let env = next_envelope(ws).await;
            assert_eq!(env.kind, MessageType::Render);
            assert_eq!(env.payload["html"], "<p>5</p>");
        }

        drop(a);
        wait_for_connections(&set, 1).await;
        assert_eq!(set.broadcast(&Envelope::render("", json!({}))), 1);

        shutdown.cancel();
    }

    fn detached_peer(capacity: usize) -> (Peer, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let peer = Peer {
            id: ConnectionId::new(),
            tx,
            evicted: CancellationToken::new(),
        };
        (peer, rx)
    }

    #[test]
    fn stalled_viewer_is_evicted_not_skipped() {
        let set = ConnectionSet::default();
        let (stalled, mut backlog) = detached_peer(2);
        let (healthy, mut inbox) = detached_peer(8);
        set.insert(&stalled);
        set.insert(&healthy);

        for count in 0..2 {
            let sent = set.broadcast(&Envelope::render("", json!({ "count": count })));
            assert_eq!(sent, 2);
        }
        assert!(!stalled.evicted.is_cancelled());

        let sent = set.broadcast(&Envelope::render("", json!({ "count": 2 })));
        assert_eq!(sent, 1);
        assert_eq!(set.len(), 1);
        assert!(stalled.evicted.is_cancelled());
        assert!(!healthy.evicted.is_cancelled());

        // Later frames go only to the healthy viewer.
        set.broadcast(&Envelope::render("", json!({ "count": 3 })));
        assert!(backlog.try_recv().is_ok());
        assert!(backlog.try_recv().is_ok());
        assert!(backlog.try_recv().is_err());
        let mut last = None;
        while let Ok(frame) = inbox.try_recv() {
            last = Some(frame);
        }
        let last = Envelope::parse(&last.unwrap()).unwrap();
        assert_eq!(last.payload["data"]["count"], 3);
    }

    #[test]
    fn closed_viewer_is_removed() {
        let set = ConnectionSet::default();
        let (peer, rx) = detached_peer(2);
        set.insert(&peer);
        drop(rx);
        assert_eq!(set.broadcast(&Envelope::render("", json!({}))), 0);
        assert!(set.is_empty());
        assert!(!peer.evicted.is_cancelled());
    }

    #[tokio::test]
    async fn evicted_connection_is_closed() {
        let (set, addr, shutdown) = start().await;
        let mut ws = connect(addr).await;
        wait_for_connections(&set, 1).await;

        let id = *set.inner.lock().unwrap().keys().next().unwrap();
        set.inner.lock().unwrap()[&id].evicted.cancel();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                    Some(Ok(_)) => {},
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "evicted connection stayed open");
        wait_for_connections(&set, 0).await;

        shutdown.cancel();
    }
}
