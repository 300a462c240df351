//! Miniapp Template - compiles view markup and renders it against app data.
//!
//! This crate provides:
//! - A lenient markup scanner producing an immutable IR ([`Template`])
//! - `if` / `for` / `for-item` / `for-index` directives, matched on the
//!   attribute's local name so `a:if`, `wx:for` and plain `if` all work
//! - A restricted, read-only expression language for `{{ }}` placeholders
//! - [`Renderer`], which caches the compiled IR and the latest render
//!
//! Text interpolation is not HTML-escaped; attribute values are.
//!
//! # Example
//!
//! ```rust
//! use miniapp_template::Renderer;
//! use serde_json::json;
//!
//! let renderer = Renderer::new(Some(
//!     r#"<view a:for="{{items}}"><text>{{index}}: {{item}}</text></view>"#.to_string(),
//! ));
//! let output = renderer.render_and_cache(&json!({"items": ["a", "b"]}));
//! assert_eq!(
//!     output.html,
//!     "<div><span>0: a</span></div><div><span>1: b</span></div>"
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(unreachable_pub)]

pub mod prelude;

mod error;
mod expr;
mod ir;
mod markup;
mod render;

pub use error::{TemplateError, TemplateResult};
pub use expr::{BinaryOp, Expr, LogicalOp, MAX_EXPR_DEPTH, UnaryOp};
pub use markup::MAX_ELEMENT_DEPTH;
pub use ir::{AttrNode, Binding, ElementNode, ForDirective, Segment, Template, TemplateNode, TextNode};
pub use render::{MAX_NUMERIC_RANGE, PLACEHOLDER_TEMPLATE, RenderOutput, Renderer, escape_html};
