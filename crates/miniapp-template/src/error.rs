//! Template error types.

use thiserror::Error;

/// Errors raised while compiling a template expression.
///
/// Markup itself never fails to parse; malformed markup is recovered
/// leniently. Only `{{ }}` expressions and directive values can be rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A character that cannot start any token.
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedChar {
        /// The offending character.
        found: char,
        /// Byte offset within the expression.
        offset: usize,
    },

    /// A string literal without its closing quote.
    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString {
        /// Byte offset of the opening quote.
        offset: usize,
    },

    /// A numeric literal that does not parse.
    #[error("invalid number literal '{literal}'")]
    InvalidNumber {
        /// The literal text.
        literal: String,
    },

    /// A token in a position the grammar does not allow.
    #[error("unexpected token '{found}' at offset {offset}")]
    UnexpectedToken {
        /// Token text.
        found: String,
        /// Byte offset within the expression.
        offset: usize,
    },

    /// The expression stopped early.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// `f(...)` syntax. Expressions are read-only and cannot call anything.
    #[error("function calls are not allowed (offset {offset})")]
    CallNotAllowed {
        /// Byte offset of the opening parenthesis.
        offset: usize,
    },

    /// The expression nests deeper than the evaluator will recurse.
    #[error("expression nested deeper than {limit} levels")]
    TooDeep {
        /// The nesting limit.
        limit: usize,
    },

    /// The expression was empty.
    #[error("empty expression")]
    Empty,
}

/// Result type for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;
