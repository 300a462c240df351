//! The script engine: one hardened Rhai engine per mini-app.

use std::sync::Arc;

use chrono::Utc;
use miniapp_bridge::{Bridge, LogLevel, MethodOutcome};
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, FnPtr, INT, Map, Scope};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value, json};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::context::{CapabilityContext, dynamic_to_json, script_fault};
use crate::limits::SandboxLimits;
use crate::methods::{Lifecycle, MethodTable};
use crate::status::SharedStatus;

/// Value `console` resolves to inside the logic.
#[derive(Debug, Clone, Copy)]
struct Console;

/// Outcome of evaluating an app's source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    /// Whether the logic called `App(...)`.
    pub registered: bool,
    /// Compile or evaluation fault, if any. The sandbox keeps running either way.
    pub fault: Option<String>,
    /// Method names declared by the registration.
    pub methods: Vec<String>,
    /// Data right after load (and `onLaunch`).
    pub initial_data: Arc<Value>,
}

pub(crate) struct ScriptEngine {
    engine: Engine,
    ast: Option<AST>,
    ctx: CapabilityContext,
    app: Option<Map>,
    methods: MethodTable,
}

impl ScriptEngine {
    pub(crate) fn new(
        app_name: &str,
        bridge: Arc<Bridge>,
        status: Arc<SharedStatus>,
        limits: SandboxLimits,
    ) -> Self {
        let ctx = CapabilityContext::new(app_name, bridge, status, limits);
        let engine = build_engine(&ctx, &limits);
        Self {
            engine,
            ast: None,
            ctx,
            app: None,
            methods: MethodTable::default(),
        }
    }

    /// Compile and evaluate `source`, then launch the app if it registered.
    pub(crate) fn load(&mut self, source: &str) -> LoadReport {
        let ast = match self.engine.compile(source) {
            Ok(ast) => ast,
            Err(e) => {
                let message = format!("compile error: {e}");
                self.ctx.report_fault("load", &message);
                return self.report(Some(message));
            },
        };

        let fault = self
            .engine
            .run_ast_with_scope(&mut Scope::new(), &ast)
            .err()
            .map(|e| {
                let message = e.to_string();
                self.ctx.report_fault("load", &message);
                message
            });
        self.ast = Some(ast);

        let Some(app) = self.ctx.take_registration() else {
            debug!(app = %self.ctx.app_name(), "Logic did not register an app");
            return self.report(fault);
        };
        self.install(app);

        if let Some(on_launch) = self.methods.lifecycle(Lifecycle::Launch).cloned()
            && let Err(e) = self.run_tracked(&on_launch, Vec::new())
        {
            self.ctx
                .report_fault(Lifecycle::Launch.callback_name(), &e.to_string());
        }

        info!(
            app = %self.ctx.app_name(),
            methods = self.methods.method_names().len(),
            "App launched"
        );
        self.report(fault)
    }

    fn report(&self, fault: Option<String>) -> LoadReport {
        LoadReport {
            registered: self.app.is_some(),
            fault,
            methods: self.methods.method_names(),
            initial_data: self.ctx.snapshot(),
        }
    }

    fn install(&mut self, app: Map) {
        let initial = match app.get("data") {
            None => JsonMap::new(),
            Some(data) => match dynamic_to_json(data) {
                Value::Object(data) => data,
                Value::Null => JsonMap::new(),
                other => {
                    self.ctx.report_fault(
                        "App",
                        &format!("initial data must be an object, got {other}"),
                    );
                    JsonMap::new()
                },
            },
        };
        self.methods = MethodTable::from_registration(&app);
        self.app = Some(app);
        self.ctx.init_data(initial);
    }

    pub(crate) fn invoke_method(&mut self, name: &str, args: &Value) -> MethodOutcome {
        let Some(callback) = self.methods.method(name).cloned() else {
            debug!(app = %self.ctx.app_name(), method = name, "Method not found");
            return MethodOutcome::NotFound;
        };

        let result = positional_args(args).and_then(|args| self.run_tracked(&callback, args));
        match result {
            Ok(value) => MethodOutcome::Completed(dynamic_to_json(&value)),
            Err(e) => {
                let message = e.to_string();
                self.ctx.report_fault(name, &message);
                MethodOutcome::Failed(message)
            },
        }
    }

    /// Run a lifecycle callback if declared. `onUpdate` itself is not tracked.
    pub(crate) fn trigger_lifecycle(&mut self, hook: Lifecycle, args: &Value) {
        let Some(callback) = self.methods.lifecycle(hook).cloned() else {
            return;
        };

        let result = positional_args(args).and_then(|args| {
            if hook == Lifecycle::Update {
                self.call(&callback, args)
            } else {
                self.run_tracked(&callback, args)
            }
        });
        if let Err(e) = result {
            self.ctx.report_fault(hook.callback_name(), &e.to_string());
        }
    }

    pub(crate) fn fire_due_timers(&mut self, now: Instant) {
        for (id, callback) in self.ctx.take_due_timers(now) {
            if let Err(e) = self.run_tracked(&callback, Vec::new()) {
                self.ctx.report_fault(&format!("timer {id}"), &e.to_string());
            }
        }
    }

    pub(crate) fn next_timer_deadline(&self) -> Option<Instant> {
        self.ctx.next_deadline()
    }

    pub(crate) fn shutdown(&mut self) {
        self.ctx.clear_timers();
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &CapabilityContext {
        &self.ctx
    }

    /// A top-level call: mutations are tracked and followed by `onUpdate`.
    fn run_tracked(
        &mut self,
        callback: &FnPtr,
        args: Vec<Dynamic>,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        self.ctx.begin_tracking();
        let result = self.call(callback, args);

        if let Some(patch) = self.ctx.finish_tracking()
            && let Some(on_update) = self.methods.lifecycle(Lifecycle::Update).cloned()
        {
            let update = rhai::serde::to_dynamic(json!({ "data": patch }))
                .and_then(|update| self.call(&on_update, vec![update]));
            if let Err(e) = update {
                self.ctx
                    .report_fault(Lifecycle::Update.callback_name(), &e.to_string());
            }
        }

        result
    }

    /// Call `callback` with `this` bound to the app map.
    fn call(&mut self, callback: &FnPtr, args: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
        let Some(ast) = self.ast.as_ref() else {
            return Err(script_fault("no logic loaded"));
        };

        let mut app = self.app.clone().unwrap_or_default();
        app.insert(
            "data".into(),
            rhai::serde::to_dynamic(&*self.ctx.snapshot())?,
        );
        let mut this = Dynamic::from_map(app);

        let mut call_args = callback.curry().to_vec();
        call_args.extend(args);

        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut this);
        let result = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut Scope::new(),
            ast,
            callback.fn_name(),
            call_args,
        );

        if self.app.is_some()
            && let Some(app) = this.flatten().try_cast::<Map>()
        {
            self.app = Some(app);
        }
        result
    }
}

/// Array → positional arguments, `null` → none, anything else → one argument.
fn positional_args(args: &Value) -> Result<Vec<Dynamic>, Box<EvalAltResult>> {
    match args {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(rhai::serde::to_dynamic).collect(),
        other => Ok(vec![rhai::serde::to_dynamic(other)?]),
    }
}

fn build_engine(ctx: &CapabilityContext, limits: &SandboxLimits) -> Engine {
    let mut engine = Engine::new();
    engine
        .set_max_operations(limits.max_operations)
        .set_max_call_levels(limits.max_call_levels)
        .set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size)
        .set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");

    let c = ctx.clone();
    engine.register_fn("setData", move |update: Map| c.set_data(update));

    let c = ctx.clone();
    engine.register_fn("setTimeout", move |callback: FnPtr, ms: INT| {
        c.add_timer(callback, ms, false)
    });
    let c = ctx.clone();
    engine.register_fn("setInterval", move |callback: FnPtr, ms: INT| {
        c.add_timer(callback, ms, true)
    });
    for name in ["clearTimeout", "clearInterval"] {
        let c = ctx.clone();
        engine.register_fn(name, move |id: INT| c.clear_timer(id));
        engine.register_fn(name, |_: ()| {});
    }

    let c = ctx.clone();
    engine.register_fn("App", move |app: Map| c.register(app));
    engine.register_fn("now", || -> INT { Utc::now().timestamp_millis() });

    engine.register_type_with_name::<Console>("Console");
    engine.on_var(|name, _, _| Ok((name == "console").then(|| Dynamic::from(Console))));
    for (name, level) in [
        ("log", LogLevel::Log),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        register_console_method(&mut engine, ctx, name, level);
    }

    let c = ctx.clone();
    engine.on_print(move |text| c.log(LogLevel::Log, &[Dynamic::from(text.to_string())]));
    let c = ctx.clone();
    engine.on_debug(move |text, _, _| c.log(LogLevel::Info, &[Dynamic::from(text.to_string())]));

    engine
}

/// `console.<name>(...)` with one to four arguments.
fn register_console_method(
    engine: &mut Engine,
    ctx: &CapabilityContext,
    name: &str,
    level: LogLevel,
) {
    let c = ctx.clone();
    engine.register_fn(name, move |_: Console, a: Dynamic| c.log(level, &[a]));
    let c = ctx.clone();
    engine.register_fn(name, move |_: Console, a: Dynamic, b: Dynamic| {
        c.log(level, &[a, b]);
    });
    let c = ctx.clone();
    engine.register_fn(
        name,
        move |_: Console, a: Dynamic, b: Dynamic, d: Dynamic| c.log(level, &[a, b, d]),
    );
    let c = ctx.clone();
    engine.register_fn(
        name,
        move |_: Console, a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic| {
            c.log(level, &[a, b, d, e]);
        },
    );
}
