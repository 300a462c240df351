//! Compiled template IR.
//!
//! A [`Template`] is immutable once compiled. Directive attributes are
//! lifted out of the attribute list into typed slots, and every `{{ }}`
//! placeholder is parsed ahead of time.

use tracing::warn;

use crate::expr::{Evaluated, Expr, Scope};
use crate::markup::{ParsedAttr, RawElement, RawNode, parse_markup};

/// Source-tag to output-tag translation.
const TAG_MAP: &[(&str, &str)] = &[
    ("view", "div"),
    ("container", "div"),
    ("text", "span"),
    ("image", "img"),
    ("navigator", "a"),
];

/// Output tags emitted without a close tag.
const VOID_TAGS: &[&str] = &["img", "br", "hr", "input", "meta", "link"];

const DEFAULT_ITEM_ALIAS: &str = "item";
const DEFAULT_INDEX_ALIAS: &str = "index";

/// A placeholder expression together with its source text.
///
/// `expr` is `None` when the source failed to parse; such a binding
/// evaluates to `undefined`.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Expression source as written in the template.
    pub source: String,
    /// Compiled expression, if it parsed.
    pub expr: Option<Expr>,
}

impl Binding {
    /// Compile `source`, logging and keeping a dead binding on failure.
    #[must_use]
    pub fn compile(source: &str) -> Self {
        let source = source.trim();
        let expr = match Expr::parse(source) {
            Ok(expr) => Some(expr),
            Err(e) => {
                warn!(expression = %source, error = %e, "Template expression rejected");
                None
            },
        };
        Self {
            source: source.to_string(),
            expr,
        }
    }

    pub(crate) fn eval<'s>(&self, scope: &Scope<'s>) -> Evaluated<'s> {
        self.expr.as_ref().and_then(|expr| expr.eval(scope))
    }
}

/// Piece of interpolated text.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text copied to the output.
    Literal(String),
    /// A `{{ expr }}` placeholder.
    Binding(Binding),
}

/// Output attribute with its value split into segments.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrNode {
    /// Output name (local part of a namespaced source name).
    pub name: String,
    /// Value segments.
    pub value: Vec<Segment>,
}

/// `for` directive.
#[derive(Debug, Clone, PartialEq)]
pub struct ForDirective {
    /// The list (or count) expression.
    pub binding: Binding,
    /// Name the current element is bound to.
    pub item: String,
    /// Name the current index is bound to.
    pub index: String,
}

/// A text node.
#[derive(Debug, Clone, PartialEq)]
pub struct TextNode {
    /// Literal and placeholder segments in order.
    pub segments: Vec<Segment>,
}

/// An element node.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    /// Output tag after translation.
    pub tag: String,
    /// Output attributes in source order, directives removed.
    pub attrs: Vec<AttrNode>,
    /// Child nodes.
    pub children: Vec<TemplateNode>,
    /// `if` directive.
    pub condition: Option<Binding>,
    /// `for` directive.
    pub repeat: Option<ForDirective>,
}

impl ElementNode {
    /// Whether the output tag has no close tag.
    #[must_use]
    pub fn is_void(&self) -> bool {
        VOID_TAGS.contains(&self.tag.as_str())
    }
}

/// Node of the compiled tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    /// Text with placeholders.
    Text(TextNode),
    /// Element with directives.
    Element(ElementNode),
}

/// A compiled template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<TemplateNode>,
}

impl Template {
    /// Compile markup into IR. Never fails; bad expressions compile to dead bindings.
    #[must_use]
    pub fn compile(source: &str) -> Self {
        let nodes = parse_markup(source).into_iter().map(compile_node).collect();
        Self { nodes }
    }

    /// Root nodes.
    #[must_use]
    pub fn nodes(&self) -> &[TemplateNode] {
        &self.nodes
    }
}

fn compile_node(node: RawNode) -> TemplateNode {
    match node {
        RawNode::Text(text) => TemplateNode::Text(TextNode {
            segments: split_segments(&text),
        }),
        RawNode::Element(element) => TemplateNode::Element(compile_element(element)),
    }
}

fn compile_element(element: RawElement) -> ElementNode {
    let RawElement {
        name,
        attrs,
        children,
    } = element;

    let mut condition = None;
    let mut repeat_expr = None;
    let mut item = None;
    let mut index = None;
    let mut out_attrs = Vec::with_capacity(attrs.len());

    for ParsedAttr {
        name: attr_name,
        value,
    } in attrs
    {
        let local = local_name(&attr_name);
        let value = value.unwrap_or_default();
        match local {
            "if" => condition = Some(Binding::compile(strip_mustache(&value))),
            "for" => repeat_expr = Some(Binding::compile(strip_mustache(&value))),
            "for-item" => item = Some(strip_mustache(&value).trim().to_string()),
            "for-index" => index = Some(strip_mustache(&value).trim().to_string()),
            _ => out_attrs.push(AttrNode {
                name: local.to_string(),
                value: split_segments(&value),
            }),
        }
    }

    let repeat = repeat_expr.map(|binding| ForDirective {
        binding,
        item: item
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_ITEM_ALIAS.to_string()),
        index: index
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_INDEX_ALIAS.to_string()),
    });

    ElementNode {
        tag: translate_tag(&name).to_string(),
        attrs: out_attrs,
        children: children.into_iter().map(compile_node).collect(),
        condition,
        repeat,
    }
}

fn translate_tag(tag: &str) -> &str {
    TAG_MAP
        .iter()
        .find(|(from, _)| *from == tag)
        .map_or(tag, |(_, to)| *to)
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Strip a whole-value `{{ expr }}` wrapper.
fn strip_mustache(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .filter(|inner| !inner.contains("{{") && !inner.contains("}}"))
        .map_or(trimmed, str::trim)
}

fn split_segments(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        let inner = &after_open[..close];
        if inner.trim().is_empty() {
            push_literal(&mut segments, &rest[..open + 2 + close + 2]);
        } else {
            push_literal(&mut segments, &rest[..open]);
            segments.push(Segment::Binding(Binding::compile(inner)));
        }
        rest = &after_open[close + 2..];
    }
    push_literal(&mut segments, rest);

    segments
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Literal(prev)) = segments.last_mut() {
        prev.push_str(text);
    } else {
        segments.push(Segment::Literal(text.to_string()));
    }
}
