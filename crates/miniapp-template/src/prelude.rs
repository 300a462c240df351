//! Prelude module - commonly used types for convenient import.
//!
//! Use `use miniapp_template::prelude::*;` to import all essential types.

pub use crate::{RenderOutput, Renderer, Template};

pub use crate::{TemplateError, TemplateResult};
