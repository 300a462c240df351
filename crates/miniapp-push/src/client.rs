//! Reconnecting push client.
//!
//! [`PushClient::spawn`] starts a background task that keeps a `WebSocket`
//! open to a push server, surfacing what happens as [`ClientEvent`]s.
//! Dropped connections are retried according to a [`ReconnectPolicy`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PushError, PushResult};
use crate::protocol::Envelope;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};

const EVENT_QUEUE: usize = 256;
const OUTBOUND_QUEUE: usize = 64;

/// Something the client observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A connection opened.
    Connected,
    /// An envelope arrived.
    Message(Envelope),
    /// The open connection closed.
    Disconnected,
    /// Reconnection stopped after `attempts` consecutive failures.
    GaveUp {
        /// Consecutive failures at the time of giving up.
        attempts: u32,
    },
}

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    attempts: AtomicU32,
}

/// Entry point for the reconnecting client.
pub struct PushClient;

impl PushClient {
    /// Start connecting to `url` in the background.
    ///
    /// Must be called within a Tokio runtime. The receiver yields events
    /// until the client is closed or gives up, then returns `None`.
    #[must_use]
    pub fn spawn(
        url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (PushClientHandle, mpsc::Receiver<ClientEvent>) {
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        tokio::spawn(run(
            url.into(),
            policy,
            Arc::clone(&shared),
            outbound_rx,
            events_tx,
            cancel.clone(),
        ));

        let handle = PushClientHandle {
            shared,
            outbound: outbound_tx,
            cancel,
        };
        (handle, events_rx)
    }
}

/// Control handle for a spawned client. Dropping it closes the client.
#[derive(Debug)]
pub struct PushClientHandle {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl PushClientHandle {
    /// Send `envelope` over the open connection.
    ///
    /// # Errors
    ///
    /// [`PushError::NotConnected`] if no connection is open.
    pub fn send(&self, envelope: &Envelope) -> PushResult<()> {
        if !self.is_connected() {
            return Err(PushError::NotConnected);
        }
        let json = envelope.to_json()?;
        self.outbound
            .try_send(json)
            .map_err(|_| PushError::NotConnected)
    }

    /// Send a `callMethod` envelope.
    ///
    /// # Errors
    ///
    /// [`PushError::NotConnected`] if no connection is open.
    pub fn call_method(&self, method_name: &str, args: Value) -> PushResult<()> {
        self.send(&Envelope::call_method(method_name, args))
    }

    /// Whether a connection is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Consecutive failed attempts since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushClientHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum SessionEnd {
    Cancelled,
    Closed,
}

async fn run(
    url: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
) {
    let mut state = ReconnectState::new(policy);

    loop {
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            attempt = connect_async(url.as_str()) => attempt,
        };

        match attempt {
            Ok((ws, _response)) => {
                state.on_open();
                shared.attempts.store(0, Ordering::Release);
                // Frames queued for a previous connection are stale.
                while outbound.try_recv().is_ok() {}
                shared.connected.store(true, Ordering::Release);
                info!(url = %url, "Push client connected");
                let _ = events.send(ClientEvent::Connected).await;

                let end = session(ws, &mut outbound, &events, &cancel).await;
                shared.connected.store(false, Ordering::Release);
                let _ = events.send(ClientEvent::Disconnected).await;
                if matches!(end, SessionEnd::Cancelled) {
                    break;
                }
                info!(url = %url, "Push connection closed");
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Push client connection failed");
            },
        }

        let decision = state.on_failure();
        shared.attempts.store(state.attempts(), Ordering::Release);
        match decision {
            ReconnectDecision::Retry(delay) => {
                info!(
                    delay_ms = delay.as_millis(),
                    attempt = state.attempts(),
                    "Reconnecting after backoff"
                );
                if sleep_or_cancel(delay, &cancel).await {
                    break;
                }
            },
            ReconnectDecision::GiveUp => {
                warn!(attempts = state.attempts(), "Push client giving up");
                let _ = events
                    .send(ClientEvent::GaveUp {
                        attempts: state.attempts(),
                    })
                    .await;
                break;
            },
        }
    }

    shared.connected.store(false, Ordering::Release);
    debug!(url = %url, "Push client stopped");
}

async fn session(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    outbound: &mut mpsc::Receiver<String>,
    events: &mpsc::Sender<ClientEvent>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut writer, mut reader) = ws.split();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = writer.send(Message::Close(None)).await;
                return SessionEnd::Cancelled;
            },
            Some(text) = outbound.recv() => {
                if let Err(e) = writer.send(Message::Text(text)).await {
                    debug!(error = %e, "Push client write failed");
                    return SessionEnd::Closed;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                    Ok(envelope) => {
                        let _ = events.send(ClientEvent::Message(envelope)).await;
                    },
                    Err(e) => debug!(error = %e, "Ignoring malformed envelope"),
                },
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    debug!(error = %e, "Push client read error");
                    return SessionEnd::Closed;
                },
            },
        }
    }
}

/// Sleep for `delay`; `true` if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}
