//! The capability context: everything sandboxed logic is allowed to touch.
//!
//! One context exists per sandbox. The natives registered on the engine
//! close over a clone of it, so the logic reaches the host only through
//! these methods.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use miniapp_bridge::{Bridge, BridgeEvent, EventMetadata, LogLevel};
use rhai::{Dynamic, EvalAltResult, FnPtr, INT, Position};
use serde_json::{Map as JsonMap, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::limits::SandboxLimits;
use crate::status::SharedStatus;
use crate::timers::{TimerId, TimerQueue};

/// Build a runtime error raised into the script.
pub(crate) fn script_fault(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

/// Convert a script value to JSON, falling back to its display form.
pub(crate) fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    rhai::serde::from_dynamic::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

#[derive(Default)]
struct ContextState {
    data: JsonMap<String, Value>,
    /// Keys mutated during the current top-level call, when tracking.
    pending_patch: Option<JsonMap<String, Value>>,
    registration: Option<rhai::Map>,
    timers: TimerQueue<FnPtr>,
}

#[derive(Clone)]
pub(crate) struct CapabilityContext {
    inner: Rc<RefCell<ContextState>>,
    bridge: Arc<Bridge>,
    status: Arc<SharedStatus>,
    app_name: String,
    limits: SandboxLimits,
}

impl CapabilityContext {
    pub(crate) fn new(
        app_name: impl Into<String>,
        bridge: Arc<Bridge>,
        status: Arc<SharedStatus>,
        limits: SandboxLimits,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ContextState::default())),
            bridge,
            status,
            app_name: app_name.into(),
            limits,
        }
    }

    pub(crate) fn app_name(&self) -> &str {
        &self.app_name
    }

    pub(crate) fn snapshot(&self) -> Arc<Value> {
        self.status.snapshot()
    }

    /// `setData`: shallow-merge `update` and publish the new snapshot.
    pub(crate) fn set_data(&self, update: rhai::Map) -> Result<(), Box<EvalAltResult>> {
        let value: Value = rhai::serde::from_dynamic(&Dynamic::from_map(update))
            .map_err(|e| script_fault(format!("setData: {e}")))?;
        let Value::Object(mut update) = value else {
            return Err(script_fault("setData expects an object"));
        };

        // `setData({ data: {...} })`
        if update.len() == 1
            && update.get("data").is_some_and(Value::is_object)
            && let Some(Value::Object(inner)) = update.remove("data")
        {
            update = inner;
        }

        let snapshot = {
            let mut state = self.inner.borrow_mut();
            for (key, value) in &update {
                state.data.insert(key.clone(), value.clone());
            }
            if let Some(pending) = state.pending_patch.as_mut() {
                pending.extend(update.clone());
            }
            Arc::new(Value::Object(state.data.clone()))
        };

        self.commit(snapshot, update);
        Ok(())
    }

    /// Replace the data with the registration's initial state.
    pub(crate) fn init_data(&self, data: JsonMap<String, Value>) {
        let snapshot = {
            let mut state = self.inner.borrow_mut();
            state.data = data.clone();
            Arc::new(Value::Object(data.clone()))
        };
        self.commit(snapshot, data);
    }

    fn commit(&self, snapshot: Arc<Value>, patch: JsonMap<String, Value>) {
        self.status.set_snapshot(Arc::clone(&snapshot));
        debug!(
            app = %self.app_name,
            keys = patch.len(),
            "State mutated"
        );
        self.bridge.publish(&BridgeEvent::StateMutated {
            metadata: EventMetadata::new(self.app_name.as_str()),
            snapshot,
            patch,
        });
    }

    pub(crate) fn log(&self, level: LogLevel, args: &[Dynamic]) {
        let args = args.iter().map(dynamic_to_json).collect();
        self.bridge.publish(&BridgeEvent::LogEmitted {
            metadata: EventMetadata::new(self.app_name.as_str()),
            level,
            args,
        });
    }

    /// Log a contained fault and forward it as an error-level log line.
    pub(crate) fn report_fault(&self, origin: &str, message: &str) {
        warn!(app = %self.app_name, origin, error = %message, "Script fault contained");
        self.log(
            LogLevel::Error,
            &[Dynamic::from(format!("{origin}: {message}"))],
        );
    }

    /// `App(map)`.
    pub(crate) fn register(&self, app: rhai::Map) -> Result<(), Box<EvalAltResult>> {
        let mut state = self.inner.borrow_mut();
        if state.registration.is_some() {
            return Err(script_fault("App already registered"));
        }
        state.registration = Some(app);
        Ok(())
    }

    pub(crate) fn take_registration(&self) -> Option<rhai::Map> {
        self.inner.borrow_mut().registration.take()
    }

    pub(crate) fn begin_tracking(&self) {
        self.inner.borrow_mut().pending_patch = Some(JsonMap::new());
    }

    /// Stop tracking; the merged patch if anything was committed.
    pub(crate) fn finish_tracking(&self) -> Option<JsonMap<String, Value>> {
        self.inner
            .borrow_mut()
            .pending_patch
            .take()
            .filter(|patch| !patch.is_empty())
    }

    pub(crate) fn add_timer(
        &self,
        callback: FnPtr,
        delay_ms: INT,
        repeat: bool,
    ) -> Result<INT, Box<EvalAltResult>> {
        let mut state = self.inner.borrow_mut();
        if state.timers.len() >= self.limits.max_timers {
            return Err(script_fault(format!(
                "timer limit reached ({} live timers)",
                self.limits.max_timers
            )));
        }

        let mut millis = u64::try_from(delay_ms).unwrap_or(0);
        if repeat {
            millis = millis.max(self.limits.min_timer_interval_ms);
        }
        Ok(state
            .timers
            .schedule(callback, Duration::from_millis(millis), repeat))
    }

    pub(crate) fn clear_timer(&self, id: INT) {
        self.inner.borrow_mut().timers.cancel(id);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.inner.borrow_mut().timers.next_deadline()
    }

    pub(crate) fn take_due_timers(&self, now: Instant) -> Vec<(TimerId, FnPtr)> {
        self.inner.borrow_mut().timers.take_due(now)
    }

    #[cfg(test)]
    pub(crate) fn timer_count(&self) -> usize {
        self.inner.borrow().timers.len()
    }

    pub(crate) fn clear_timers(&self) {
        self.inner.borrow_mut().timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use miniapp_bridge::FnSubscriber;
    use serde_json::json;

    use super::*;

    fn context(limits: SandboxLimits) -> (CapabilityContext, Arc<Bridge>) {
        let bridge = Arc::new(Bridge::new());
        let ctx = CapabilityContext::new(
            "test",
            Arc::clone(&bridge),
            Arc::new(SharedStatus::default()),
            limits,
        );
        (ctx, bridge)
    }

    fn map(value: Value) -> rhai::Map {
        rhai::serde::to_dynamic(value)
            .unwrap()
            .try_cast::<rhai::Map>()
            .unwrap()
    }

    #[test]
    fn test_set_data_merges_and_publishes_once() {
        let (ctx, bridge) = context(SandboxLimits::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = Arc::new(FnSubscriber::new("sink", move |event: &BridgeEvent| {
            if let BridgeEvent::StateMutated { patch, .. } = event {
                sink.lock().unwrap().push(Value::Object(patch.clone()));
            }
        }));
        bridge.subscribe(sub.clone());

        ctx.init_data(JsonMap::from_iter([("a".to_string(), json!(1))]));
        ctx.set_data(map(json!({"b": 2}))).unwrap();

        assert_eq!(*ctx.snapshot(), json!({"a": 1, "b": 2}));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![json!({"a": 1}), json!({"b": 2})]
        );
    }

    #[test]
    fn test_legacy_envelope_is_unwrapped() {
        let (ctx, _bridge) = context(SandboxLimits::default());
        ctx.set_data(map(json!({"data": {"count": 7}}))).unwrap();
        assert_eq!(*ctx.snapshot(), json!({"count": 7}));

        // Not an envelope: `data` is not the only key.
        ctx.set_data(map(json!({"data": {"x": 1}, "y": 2}))).unwrap();
        assert_eq!(ctx.snapshot()["data"], json!({"x": 1}));
    }

    #[test]
    fn test_tracking_collects_merged_patch() {
        let (ctx, _bridge) = context(SandboxLimits::default());
        ctx.set_data(map(json!({"untracked": true}))).unwrap();

        ctx.begin_tracking();
        ctx.set_data(map(json!({"a": 1}))).unwrap();
        ctx.set_data(map(json!({"a": 2, "b": 3}))).unwrap();
        let patch = ctx.finish_tracking().unwrap();
        assert_eq!(Value::Object(patch), json!({"a": 2, "b": 3}));

        ctx.begin_tracking();
        assert!(ctx.finish_tracking().is_none());
    }

    #[test]
    fn test_second_registration_is_rejected() {
        let (ctx, _bridge) = context(SandboxLimits::default());
        ctx.register(rhai::Map::new()).unwrap();
        assert!(ctx.register(rhai::Map::new()).is_err());
        assert!(ctx.take_registration().is_some());
        assert!(ctx.take_registration().is_none());
    }

    #[test]
    fn test_timer_cap() {
        let limits = SandboxLimits {
            max_timers: 2,
            ..SandboxLimits::default()
        };
        let (ctx, _bridge) = context(limits);
        let callback = FnPtr::new("tick").unwrap();
        let first = ctx.add_timer(callback.clone(), 1000, false).unwrap();
        ctx.add_timer(callback.clone(), 1000, true).unwrap();
        assert!(ctx.add_timer(callback.clone(), 1000, false).is_err());

        ctx.clear_timer(first);
        ctx.clear_timer(12345);
        assert_eq!(ctx.timer_count(), 1);
        assert!(ctx.add_timer(callback, 1000, false).is_ok());
    }

    #[test]
    fn test_report_fault_publishes_error_log() {
        let (ctx, bridge) = context(SandboxLimits::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = Arc::new(FnSubscriber::new("sink", move |event: &BridgeEvent| {
            if let BridgeEvent::LogEmitted { level, args, .. } = event {
                sink.lock().unwrap().push((*level, args.clone()));
            }
        }));
        bridge.subscribe(sub.clone());

        ctx.report_fault("onLaunch", "boom");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, LogLevel::Error);
        assert_eq!(seen[0].1, vec![json!("onLaunch: boom")]);
    }
}
