//! Rendering compiled templates and the per-instance renderer cache.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::expr::{Scope, display, truthy};
use crate::ir::{AttrNode, ElementNode, Segment, Template, TemplateNode};

/// Markup used when an app ships no template.
pub const PLACEHOLDER_TEMPLATE: &str = "<div>(no template)</div>";

/// Upper bound on the numeric `for` shorthand.
pub const MAX_NUMERIC_RANGE: usize = 10_000;

/// Escape text for use inside a double-quoted attribute value.
#[must_use]
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

impl Template {
    /// Render against a data snapshot.
    #[must_use]
    pub fn render(&self, data: &Value) -> String {
        let mut out = String::new();
        let scope = Scope::Root(data);
        for node in self.nodes() {
            render_node(node, &scope, &mut out);
        }
        out
    }
}

fn render_node(node: &TemplateNode, scope: &Scope<'_>, out: &mut String) {
    match node {
        TemplateNode::Text(text) => render_segments(&text.segments, scope, out),
        TemplateNode::Element(element) => render_element(element, scope, out),
    }
}

fn render_segments(segments: &[Segment], scope: &Scope<'_>, out: &mut String) {
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Binding(binding) => {
                let value = binding.eval(scope);
                out.push_str(&display(value.as_deref()));
            },
        }
    }
}

fn render_element(element: &ElementNode, scope: &Scope<'_>, out: &mut String) {
    if let Some(condition) = &element.condition
        && !truthy(condition.eval(scope).as_deref())
    {
        return;
    }

    let Some(repeat) = &element.repeat else {
        render_element_body(element, scope, out);
        return;
    };

    let evaluated = repeat.binding.eval(scope);
    let range: Vec<Value>;
    let items: &[Value] = match evaluated.as_deref() {
        Some(Value::Array(items)) => items,
        Some(Value::Number(n)) => {
            range = numeric_range(n.as_f64().unwrap_or(f64::NAN), &repeat.binding.source);
            &range
        },
        _ => &[],
    };

    for (index, item) in items.iter().enumerate() {
        let frame = Scope::Frame {
            parent: scope,
            item_alias: &repeat.item,
            item,
            index_alias: &repeat.index,
            index,
        };
        render_element_body(element, &frame, out);
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn numeric_range(n: f64, source: &str) -> Vec<Value> {
    if !n.is_finite() || n < 0.0 {
        return Vec::new();
    }
    let mut count = n.floor() as usize;
    if count > MAX_NUMERIC_RANGE {
        warn!(expression = %source, requested = count, "Numeric for range clamped");
        count = MAX_NUMERIC_RANGE;
    }
    (0..count).map(Value::from).collect()
}

fn render_element_body(element: &ElementNode, scope: &Scope<'_>, out: &mut String) {
    out.push('<');
    out.push_str(&element.tag);
    for attr in &element.attrs {
        render_attr(attr, scope, out);
    }
    out.push('>');

    if element.is_void() {
        return;
    }

    for child in &element.children {
        render_node(child, scope, out);
    }
    out.push_str("</");
    out.push_str(&element.tag);
    out.push('>');
}

fn render_attr(attr: &AttrNode, scope: &Scope<'_>, out: &mut String) {
    let mut value = String::new();
    render_segments(&attr.value, scope, &mut value);
    if value.is_empty() {
        return;
    }
    out.push(' ');
    out.push_str(&attr.name);
    out.push_str("=\"");
    out.push_str(&escape_html(&value));
    out.push('"');
}

/// One render: the HTML and the data it was rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderOutput {
    /// Rendered HTML.
    pub html: String,
    /// The snapshot used.
    pub data: Value,
}

#[derive(Debug)]
struct RendererState {
    source: Option<String>,
    template: Arc<Template>,
    latest: Option<RenderOutput>,
}

/// Per-instance renderer.
///
/// Holds the compiled IR for the current template source and the latest
/// render. Rendering and updating the cache happen under one lock, so the
/// cached render always corresponds to the last completed render.
#[derive(Debug)]
pub struct Renderer {
    state: Mutex<RendererState>,
}

impl Renderer {
    /// Create a renderer. `None` renders the placeholder.
    #[must_use]
    pub fn new(template: Option<String>) -> Self {
        let compiled = match &template {
            Some(source) => Template::compile(source),
            None => {
                warn!("No template found, rendering placeholder");
                Template::compile(PLACEHOLDER_TEMPLATE)
            },
        };
        Self {
            state: Mutex::new(RendererState {
                source: template,
                template: Arc::new(compiled),
                latest: None,
            }),
        }
    }

    /// Replace the template source. Recompiles only if it changed.
    ///
    /// Returns `true` when a recompilation happened.
    pub fn set_template(&self, source: &str) -> bool {
        let mut state = self.lock();
        if state.source.as_deref() == Some(source) {
            return false;
        }
        state.template = Arc::new(Template::compile(source));
        state.source = Some(source.to_string());
        debug!("Template recompiled");
        true
    }

    /// The compiled IR currently in use.
    #[must_use]
    pub fn template(&self) -> Arc<Template> {
        Arc::clone(&self.lock().template)
    }

    /// Render `data` without touching the latest-render cache.
    #[must_use]
    pub fn render(&self, data: &Value) -> RenderOutput {
        let template = self.template();
        RenderOutput {
            html: template.render(data),
            data: data.clone(),
        }
    }

    /// Render `data` and store the result as the latest render.
    pub fn render_and_cache(&self, data: &Value) -> RenderOutput {
        self.render_and_publish(data, RenderOutput::clone)
    }

    /// Render `data`, cache it, and hand it to `publish` before the lock is
    /// released.
    ///
    /// Publishing under the lock orders every published render against
    /// [`with_latest`](Self::with_latest) replays: a viewer replayed from the
    /// cache never sees an older render after a newer one.
    pub fn render_and_publish<R>(
        &self,
        data: &Value,
        publish: impl FnOnce(&RenderOutput) -> R,
    ) -> R {
        let mut state = self.lock();
        let output = RenderOutput {
            html: state.template.render(data),
            data: data.clone(),
        };
        let published = publish(&output);
        state.latest = Some(output);
        published
    }

    /// Run `f` over the latest render while no render can be published.
    pub fn with_latest<R>(&self, f: impl FnOnce(Option<&RenderOutput>) -> R) -> R {
        let state = self.lock();
        f(state.latest.as_ref())
    }

    /// The latest cached render, for viewers that join late.
    #[must_use]
    pub fn latest(&self) -> Option<RenderOutput> {
        self.lock().latest.clone()
    }

    /// Drop the latest render.
    pub fn clear(&self) {
        self.lock().latest = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RendererState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
