//! Subscriber trait and the bridge registry.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::Value;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::event::{BridgeEvent, EventMetadata, MethodOutcome, MethodRequest, ReplySlot};

/// Filter function type for [`FnSubscriber`].
pub type EventFilter = Box<dyn Fn(&BridgeEvent) -> bool + Send + Sync>;

/// Something that wants to observe bridge traffic.
///
/// `on_event` runs on the publisher's thread. Keep it short: forward into a
/// channel if the work is heavy or async.
pub trait BridgeSubscriber: Send + Sync {
    /// Called for every accepted event.
    fn on_event(&self, event: &BridgeEvent);

    /// Return `false` to skip an event. Accepts everything by default.
    fn accepts(&self, event: &BridgeEvent) -> bool {
        let _ = event;
        true
    }

    /// Name used in logs.
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Registration handle returned by [`Bridge::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Bidirectional event channel between one logic instance and its host.
///
/// Subscribers are stored as [`Weak`] references: the bridge never keeps a
/// subscriber alive. Publishing snapshots the live set and releases the
/// lock before notifying, so a subscriber may publish or (un)subscribe from
/// inside `on_event`.
#[derive(Default)]
pub struct Bridge {
    subscribers: RwLock<HashMap<SubscriberId, Weak<dyn BridgeSubscriber>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl Bridge {
    /// Create an empty bridge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The bridge keeps only a weak reference.
    pub fn subscribe(&self, subscriber: Arc<dyn BridgeSubscriber>) -> SubscriberId {
        let id = SubscriberId::new();
        let name = subscriber.name().to_string();

        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::downgrade(&subscriber));

        debug!(subscriber_name = %name, "Bridge subscriber registered");
        id
    }

    /// Remove a subscriber. Returns `true` if it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();

        if removed {
            debug!(subscriber_id = ?id, "Bridge subscriber unregistered");
        }
        removed
    }

    /// Number of registered subscribers that are still alive.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Deliver an event to every live subscriber that accepts it.
    ///
    /// Returns the number of subscribers that received the event. A
    /// subscriber that panics is logged and counted as not delivered.
    pub fn publish(&self, event: &BridgeEvent) -> usize {
        let (live, dead) = self.snapshot();

        if !dead.is_empty() {
            let mut subs = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in &dead {
                subs.remove(id);
            }
            trace!(pruned = dead.len(), "Pruned dropped bridge subscribers");
        }

        let mut delivered = 0usize;
        for (id, subscriber) in live {
            if !subscriber.accepts(event) {
                continue;
            }

            trace!(
                subscriber_name = %subscriber.name(),
                event_type = %event.event_type(),
                "Notifying bridge subscriber"
            );

            let result = catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event)));
            match result {
                Ok(()) => delivered = delivered.saturating_add(1),
                Err(e) => warn!(
                    subscriber_id = ?id,
                    subscriber_name = %subscriber.name(),
                    error = ?e,
                    "Bridge subscriber panicked"
                ),
            }
        }
        delivered
    }

    /// Ask the logic side to run `method` and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NoResponder`] if no subscriber claimed the
    /// request, or [`BridgeError::ReplyDropped`] if the claimant went away
    /// without answering.
    pub async fn request_method(
        &self,
        source: &str,
        method: &str,
        args: Value,
    ) -> BridgeResult<MethodOutcome> {
        let (reply, rx) = ReplySlot::channel();
        let event = BridgeEvent::MethodInvocationRequested {
            metadata: EventMetadata::new(source),
            request: MethodRequest {
                method: method.to_string(),
                args,
                reply: reply.clone(),
            },
        };

        self.publish(&event);
        if reply.is_pending() {
            return Err(BridgeError::NoResponder {
                method: method.to_string(),
            });
        }

        rx.await.map_err(|_| BridgeError::ReplyDropped {
            method: method.to_string(),
        })
    }

    #[allow(clippy::type_complexity)]
    fn snapshot(&self) -> (Vec<(SubscriberId, Arc<dyn BridgeSubscriber>)>, Vec<SubscriberId>) {
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut live = Vec::with_capacity(subs.len());
        let mut dead = Vec::new();
        for (id, weak) in subs.iter() {
            match weak.upgrade() {
                Some(strong) => live.push((*id, strong)),
                None => dead.push(*id),
            }
        }
        (live, dead)
    }
}

/// Closure-backed subscriber.
pub struct FnSubscriber<F>
where
    F: Fn(&BridgeEvent) + Send + Sync,
{
    name: String,
    filter: Option<EventFilter>,
    handler: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&BridgeEvent) + Send + Sync,
{
    /// Create a subscriber that runs `handler` for every event.
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            filter: None,
            handler,
        }
    }

    /// Only deliver events for which `filter` returns `true`.
    #[must_use]
    pub fn with_filter<P>(mut self, filter: P) -> Self
    where
        P: Fn(&BridgeEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }
}

impl<F> BridgeSubscriber for FnSubscriber<F>
where
    F: Fn(&BridgeEvent) + Send + Sync,
{
    fn on_event(&self, event: &BridgeEvent) {
        (self.handler)(event);
    }

    fn accepts(&self, event: &BridgeEvent) -> bool {
        self.filter.as_ref().is_none_or(|f| f(event))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Direction, LogLevel};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn log_event() -> BridgeEvent {
        BridgeEvent::LogEmitted {
            metadata: EventMetadata::new("test"),
            level: LogLevel::Log,
            args: vec![json!("hello")],
        }
    }

    #[test]
    fn test_publish_reaches_live_subscribers() {
        let bridge = Bridge::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let sub = Arc::new(FnSubscriber::new("counter", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        bridge.subscribe(sub.clone());

        assert_eq!(bridge.publish(&log_event()), 1);
        assert_eq!(bridge.publish(&log_event()), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bridge = Bridge::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let sub = Arc::new(FnSubscriber::new("short-lived", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        bridge.subscribe(sub.clone());
        assert_eq!(bridge.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bridge.subscriber_count(), 0);
        assert_eq!(bridge.publish(&log_event()), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(bridge.subscribers.read().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let bridge = Bridge::new();
        let sub = Arc::new(FnSubscriber::new("x", |_| {}));
        let id = bridge.subscribe(sub.clone());

        assert!(bridge.unsubscribe(id));
        assert!(!bridge.unsubscribe(id));
        assert_eq!(bridge.publish(&log_event()), 0);
    }

    #[test]
    fn test_filter_skips_events() {
        let bridge = Bridge::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        let sub = Arc::new(
            FnSubscriber::new("to-host-only", move |e: &BridgeEvent| {
                s.lock().unwrap().push(e.event_type());
            })
            .with_filter(|e| e.direction() == Direction::ToHost),
        );
        bridge.subscribe(sub.clone());

        let (reply, _rx) = ReplySlot::channel();
        bridge.publish(&BridgeEvent::MethodInvocationRequested {
            metadata: EventMetadata::default(),
            request: MethodRequest {
                method: "m".into(),
                args: Value::Null,
                reply,
            },
        });
        bridge.publish(&log_event());

        assert_eq!(*seen.lock().unwrap(), vec!["log_emitted"]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_affect_others() {
        let bridge = Bridge::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let bad = Arc::new(FnSubscriber::new("bad", |_| panic!("boom")));
        let c = Arc::clone(&counter);
        let good = Arc::new(FnSubscriber::new("good", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        bridge.subscribe(bad.clone());
        bridge.subscribe(good.clone());

        assert_eq!(bridge.publish(&log_event()), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_publish() {
        let bridge = Arc::new(Bridge::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_bridge = Arc::downgrade(&bridge);
        let c = Arc::clone(&counter);
        let sub = Arc::new(FnSubscriber::new("echo", move |e: &BridgeEvent| {
            c.fetch_add(1, Ordering::SeqCst);
            if let (BridgeEvent::LogEmitted { level: LogLevel::Log, .. }, Some(b)) =
                (e, inner_bridge.upgrade())
            {
                b.publish(&BridgeEvent::LogEmitted {
                    metadata: EventMetadata::new("echo"),
                    level: LogLevel::Info,
                    args: vec![],
                });
            }
        }));
        bridge.subscribe(sub.clone());

        bridge.publish(&log_event());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_method_round_trip() {
        let bridge = Bridge::new();
        let responder = Arc::new(FnSubscriber::new("logic", |e: &BridgeEvent| {
            if let BridgeEvent::MethodInvocationRequested { request, .. } = e {
                if let Some(tx) = request.reply.take() {
                    let _ = tx.send(MethodOutcome::Completed(json!(request.method.len())));
                }
            }
        }));
        bridge.subscribe(responder.clone());

        let outcome = bridge
            .request_method("host", "increment", Value::Null)
            .await
            .unwrap();
        assert_eq!(outcome, MethodOutcome::Completed(json!(9)));
    }

    #[tokio::test]
    async fn test_request_method_without_responder() {
        let bridge = Bridge::new();
        let err = bridge
            .request_method("host", "increment", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoResponder { .. }));
    }

    #[tokio::test]
    async fn test_request_method_reply_dropped() {
        let bridge = Bridge::new();
        let swallow = Arc::new(FnSubscriber::new("swallow", |e: &BridgeEvent| {
            if let BridgeEvent::MethodInvocationRequested { request, .. } = e {
                drop(request.reply.take());
            }
        }));
        bridge.subscribe(swallow.clone());

        let err = bridge
            .request_method("host", "x", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ReplyDropped { .. }));
    }
}
