//! Restricted expression language for `{{ }}` placeholders and directives.
//!
//! The grammar is deliberately small: literals, identifiers, property and
//! index access, unary `!`/`-`, arithmetic, comparisons, logical operators,
//! the ternary, parentheses and array literals. There is no call syntax, no
//! assignment and no way to reach anything but the data snapshot, so
//! evaluation cannot mutate state or perform I/O.
//!
//! Values follow loose scripting semantics over [`serde_json::Value`]:
//! `undefined` is represented as `None`.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::error::{TemplateError, TemplateResult};

/// Result of evaluating an expression. `None` is `undefined`.
pub(crate) type Evaluated<'s> = Option<Cow<'s, Value>>;

/// Deepest expression tree, and parser recursion, accepted.
pub const MAX_EXPR_DEPTH: usize = 128;

/// Largest magnitude for which an `f64` is rendered as an integer.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Compiled expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal number, string, boolean or `null`.
    Literal(Value),
    /// The `undefined` keyword.
    Undefined,
    /// A name resolved against the evaluation scope.
    Ident(String),
    /// `base.name`
    Member(Box<Expr>, String),
    /// `base[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `!x` or `-x`
    Unary(UnaryOp, Box<Expr>),
    /// Arithmetic and comparison.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Short-circuiting `&&`, `||`, `??`.
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    /// `cond ? then : else`
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `[a, b, c]`
    Array(Vec<Expr>),
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
}

/// Strict binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
}

/// Short-circuiting operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// `&&`
    And,
    /// `||`
    Or,
    /// `??`
    Coalesce,
}

impl Expr {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns a [`TemplateError`] describing the first lexical or
    /// syntactic problem, including any attempt at a function call.
    pub fn parse(source: &str) -> TemplateResult<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(TemplateError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let (expr, _) = parser.parse_expr(0)?;
        match parser.peek() {
            None => Ok(expr),
            Some((offset, token)) => Err(TemplateError::UnexpectedToken {
                found: token.to_string(),
                offset: *offset,
            }),
        }
    }

    /// Evaluate against a data snapshot. `None` means `undefined`.
    #[must_use]
    pub fn evaluate(&self, data: &Value) -> Option<Value> {
        self.eval(&Scope::Root(data)).map(Cow::into_owned)
    }

    pub(crate) fn eval<'s>(&self, scope: &Scope<'s>) -> Evaluated<'s> {
        match self {
            Self::Literal(value) => Some(Cow::Owned(value.clone())),
            Self::Undefined => None,
            Self::Ident(name) => scope.lookup(name),
            Self::Member(base, name) => property(base.eval(scope)?, name),
            Self::Index(base, key) => {
                let base = base.eval(scope)?;
                let key = key.eval(scope)?;
                index(base, &key)
            },
            Self::Unary(UnaryOp::Not, operand) => Some(Cow::Owned(Value::Bool(!truthy(
                operand.eval(scope).as_deref(),
            )))),
            Self::Unary(UnaryOp::Neg, operand) => {
                number_value(-to_number(operand.eval(scope).as_deref())).map(Cow::Owned)
            },
            Self::Binary(op, lhs, rhs) => {
                let a = lhs.eval(scope);
                let b = rhs.eval(scope);
                binary(*op, a.as_deref(), b.as_deref()).map(Cow::Owned)
            },
            Self::Logical(op, lhs, rhs) => {
                let a = lhs.eval(scope);
                let take_rhs = match op {
                    LogicalOp::And => truthy(a.as_deref()),
                    LogicalOp::Or => !truthy(a.as_deref()),
                    LogicalOp::Coalesce => matches!(a.as_deref(), None | Some(Value::Null)),
                };
                if take_rhs { rhs.eval(scope) } else { a }
            },
            Self::Conditional(cond, then, otherwise) => {
                if truthy(cond.eval(scope).as_deref()) {
                    then.eval(scope)
                } else {
                    otherwise.eval(scope)
                }
            },
            Self::Array(items) => Some(Cow::Owned(Value::Array(
                items
                    .iter()
                    .map(|item| item.eval(scope).map_or(Value::Null, Cow::into_owned))
                    .collect(),
            ))),
        }
    }
}

/// Name resolution chain: the data snapshot at the root, `for` aliases above it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope<'s> {
    Root(&'s Value),
    Frame {
        parent: &'s Scope<'s>,
        item_alias: &'s str,
        item: &'s Value,
        index_alias: &'s str,
        index: usize,
    },
}

impl<'s> Scope<'s> {
    pub(crate) fn lookup(&self, name: &str) -> Evaluated<'s> {
        match *self {
            Scope::Root(data) => data.get(name).map(Cow::Borrowed),
            Scope::Frame {
                parent,
                item_alias,
                item,
                index_alias,
                index,
            } => {
                if name == index_alias {
                    Some(Cow::Owned(Value::from(index)))
                } else if name == item_alias {
                    Some(Cow::Borrowed(item))
                } else {
                    parent.lookup(name)
                }
            },
        }
    }
}

/// Truthiness: `undefined`, `null`, `false`, `0`, `NaN` and `""` are falsy.
pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Text shown for a placeholder: `undefined`/`null` render as empty.
pub(crate) fn display(value: Option<&Value>) -> Cow<'_, str> {
    match value {
        None | Some(Value::Null) => Cow::Borrowed(""),
        Some(other) => to_js_string(Some(other)),
    }
}

fn to_js_string(value: Option<&Value>) -> Cow<'_, str> {
    match value {
        None => Cow::Borrowed("undefined"),
        Some(Value::Null) => Cow::Borrowed("null"),
        Some(Value::Bool(true)) => Cow::Borrowed("true"),
        Some(Value::Bool(false)) => Cow::Borrowed("false"),
        Some(Value::Number(n)) => Cow::Owned(format_number(n)),
        Some(Value::String(s)) => Cow::Borrowed(s),
        Some(Value::Array(items)) => Cow::Owned(
            items
                .iter()
                .map(|item| display(Some(item)))
                .collect::<Vec<_>>()
                .join(","),
        ),
        Some(Value::Object(_)) => Cow::Borrowed("[object Object]"),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn format_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    let f = n.as_f64().unwrap_or(f64::NAN);
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        (f as i64).to_string()
    } else {
        f.to_string()
    }
}

fn to_number(value: Option<&Value>) -> f64 {
    match value {
        None | Some(Value::Object(_)) => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        },
        Some(Value::Array(items)) => match items.as_slice() {
            [] => 0.0,
            [single] => to_number(Some(single)),
            _ => f64::NAN,
        },
    }
}

/// Convert an arithmetic result back into JSON. Non-finite results are `undefined`.
#[allow(clippy::cast_possible_truncation)]
fn number_value(n: f64) -> Option<Value> {
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Some(Value::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number)
}

fn property<'s>(base: Cow<'s, Value>, name: &str) -> Evaluated<'s> {
    if name == "length" {
        match base.as_ref() {
            Value::Array(items) => return Some(Cow::Owned(Value::from(items.len()))),
            Value::String(s) => return Some(Cow::Owned(Value::from(s.chars().count()))),
            _ => {},
        }
    }
    match base {
        Cow::Borrowed(value) => value.get(name).map(Cow::Borrowed),
        Cow::Owned(value) => value.get(name).cloned().map(Cow::Owned),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn index<'s>(base: Cow<'s, Value>, key: &Value) -> Evaluated<'s> {
    match key {
        Value::String(name) => property(base, name),
        Value::Number(n) => {
            let f = n.as_f64()?;
            if f < 0.0 || f.fract() != 0.0 {
                return None;
            }
            let i = f as usize;
            if let Value::String(s) = base.as_ref() {
                return s
                    .chars()
                    .nth(i)
                    .map(|c| Cow::Owned(Value::String(c.to_string())));
            }
            match base {
                Cow::Borrowed(value) => value.get(i).map(Cow::Borrowed),
                Cow::Owned(value) => value.get(i).cloned().map(Cow::Owned),
            }
        },
        _ => None,
    }
}

fn binary(op: BinaryOp, a: Option<&Value>, b: Option<&Value>) -> Option<Value> {
    match op {
        BinaryOp::Add => add(a, b),
        BinaryOp::Sub => number_value(to_number(a) - to_number(b)),
        BinaryOp::Mul => number_value(to_number(a) * to_number(b)),
        BinaryOp::Div => number_value(to_number(a) / to_number(b)),
        BinaryOp::Rem => number_value(to_number(a) % to_number(b)),
        BinaryOp::Lt => Some(Value::Bool(compare(a, b) == Some(Ordering::Less))),
        BinaryOp::Le => Some(Value::Bool(matches!(
            compare(a, b),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::Gt => Some(Value::Bool(compare(a, b) == Some(Ordering::Greater))),
        BinaryOp::Ge => Some(Value::Bool(matches!(
            compare(a, b),
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinaryOp::LooseEq => Some(Value::Bool(loose_eq(a, b))),
        BinaryOp::LooseNe => Some(Value::Bool(!loose_eq(a, b))),
        BinaryOp::StrictEq => Some(Value::Bool(strict_eq(a, b))),
        BinaryOp::StrictNe => Some(Value::Bool(!strict_eq(a, b))),
    }
}

fn add(a: Option<&Value>, b: Option<&Value>) -> Option<Value> {
    let concatenates = |v: Option<&Value>| {
        matches!(
            v,
            Some(Value::String(_) | Value::Array(_) | Value::Object(_))
        )
    };
    if concatenates(a) || concatenates(b) {
        let mut out = to_js_string(a).into_owned();
        out.push_str(&to_js_string(b));
        Some(Value::String(out))
    } else {
        number_value(to_number(a) + to_number(b))
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Option<Ordering> {
    if let (Some(Value::String(x)), Some(Value::String(y))) = (a, b) {
        return Some(x.cmp(y));
    }
    to_number(a).partial_cmp(&to_number(b))
}

#[allow(clippy::float_cmp)]
fn strict_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x.as_f64() == y.as_f64(),
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[allow(clippy::float_cmp)]
fn loose_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    let nullish = |v: Option<&Value>| matches!(v, None | Some(Value::Null));
    if nullish(a) || nullish(b) {
        return nullish(a) && nullish(b);
    }
    match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => x == y,
        (
            Some(Value::Number(_) | Value::String(_) | Value::Bool(_)),
            Some(Value::Number(_) | Value::String(_) | Value::Bool(_)),
        ) => to_number(a) == to_number(b),
        _ => strict_eq(a, b),
    }
}

// --- lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Ident(name) => f.write_str(name),
            Self::Punct(p) => f.write_str(p),
        }
    }
}

/// Longest first, so `===` wins over `==` and `=`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "??", "<", ">", "+", "-", "*", "/", "%",
    "!", "?", ":", ".", "[", "]", "(", ")", ",",
];

fn tokenize(source: &str) -> TemplateResult<Vec<(usize, Token)>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        if b.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let literal = &source[start..i];
            let n = literal
                .parse::<f64>()
                .map_err(|_| TemplateError::InvalidNumber {
                    literal: literal.to_string(),
                })?;
            tokens.push((start, Token::Num(n)));
            continue;
        }

        if b == b'"' || b == b'\'' {
            let (value, next) = lex_string(source, start)?;
            tokens.push((start, Token::Str(value)));
            i = next;
            continue;
        }

        if b.is_ascii_alphabetic() || b == b'_' || b == b'$' {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            tokens.push((start, Token::Ident(source[start..i].to_string())));
            continue;
        }

        let rest = &source[start..];
        match PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) {
            Some(p) => {
                tokens.push((start, Token::Punct(p)));
                i += p.len();
            },
            None => {
                return Err(TemplateError::UnexpectedChar {
                    found: rest.chars().next().unwrap_or('\0'),
                    offset: start,
                });
            },
        }
    }

    Ok(tokens)
}

fn lex_string(source: &str, start: usize) -> TemplateResult<(String, usize)> {
    let mut chars = source[start..].char_indices();
    let Some((_, quote)) = chars.next() else {
        return Err(TemplateError::UnterminatedString { offset: start });
    };

    let mut out = String::new();
    while let Some((offset, c)) = chars.next() {
        if c == quote {
            return Ok((out, start + offset + c.len_utf8()));
        }
        if c == '\\' {
            match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, other)) => out.push(other),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    Err(TemplateError::UnterminatedString { offset: start })
}

// --- parser ---

const TERNARY_BP: u8 = 2;
const PREFIX_BP: u8 = 17;
const POSTFIX_BP: u8 = 19;

enum Infix {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn infix_binding(punct: &str) -> Option<(Infix, u8, u8)> {
    let (op, left) = match punct {
        "??" => (Infix::Logical(LogicalOp::Coalesce), 3),
        "||" => (Infix::Logical(LogicalOp::Or), 5),
        "&&" => (Infix::Logical(LogicalOp::And), 7),
        "==" => (Infix::Binary(BinaryOp::LooseEq), 9),
        "!=" => (Infix::Binary(BinaryOp::LooseNe), 9),
        "===" => (Infix::Binary(BinaryOp::StrictEq), 9),
        "!==" => (Infix::Binary(BinaryOp::StrictNe), 9),
        "<" => (Infix::Binary(BinaryOp::Lt), 11),
        "<=" => (Infix::Binary(BinaryOp::Le), 11),
        ">" => (Infix::Binary(BinaryOp::Gt), 11),
        ">=" => (Infix::Binary(BinaryOp::Ge), 11),
        "+" => (Infix::Binary(BinaryOp::Add), 13),
        "-" => (Infix::Binary(BinaryOp::Sub), 13),
        "*" => (Infix::Binary(BinaryOp::Mul), 15),
        "/" => (Infix::Binary(BinaryOp::Div), 15),
        "%" => (Infix::Binary(BinaryOp::Rem), 15),
        _ => return None,
    };
    Some((op, left, left + 1))
}

/// A subtree and its height.
type Parsed = (Expr, usize);

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> TemplateResult<(usize, Token)> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(TemplateError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn peek_punct(&self) -> Option<&'static str> {
        match self.peek() {
            Some((_, Token::Punct(p))) => Some(p),
            _ => None,
        }
    }

    fn expect(&mut self, punct: &'static str) -> TemplateResult<()> {
        match self.next()? {
            (_, Token::Punct(p)) if p == punct => Ok(()),
            (offset, other) => Err(TemplateError::UnexpectedToken {
                found: other.to_string(),
                offset,
            }),
        }
    }

    /// Height of a node whose tallest child is `child`.
    fn nest(child: usize) -> TemplateResult<usize> {
        let height = child + 1;
        if height > MAX_EXPR_DEPTH {
            return Err(TemplateError::TooDeep {
                limit: MAX_EXPR_DEPTH,
            });
        }
        Ok(height)
    }

    fn parse_expr(&mut self, min_bp: u8) -> TemplateResult<Parsed> {
        if self.depth >= MAX_EXPR_DEPTH {
            return Err(TemplateError::TooDeep {
                limit: MAX_EXPR_DEPTH,
            });
        }
        self.depth += 1;
        let parsed = self.parse_operators(min_bp);
        self.depth -= 1;
        parsed
    }

    fn parse_operators(&mut self, min_bp: u8) -> TemplateResult<Parsed> {
        let (mut lhs, mut height) = self.parse_prefix()?;

        while let Some(punct) = self.peek_punct() {
            match punct {
                "." | "[" | "(" if POSTFIX_BP < min_bp => break,
                "." => {
                    self.pos += 1;
                    match self.next()? {
                        (_, Token::Ident(name)) => {
                            height = Self::nest(height)?;
                            lhs = Expr::Member(Box::new(lhs), name);
                        },
                        (offset, other) => {
                            return Err(TemplateError::UnexpectedToken {
                                found: other.to_string(),
                                offset,
                            });
                        },
                    }
                },
                "[" => {
                    self.pos += 1;
                    let (key, key_height) = self.parse_expr(0)?;
                    self.expect("]")?;
                    height = Self::nest(height.max(key_height))?;
                    lhs = Expr::Index(Box::new(lhs), Box::new(key));
                },
                "(" => {
                    let offset = self.peek().map_or(0, |(offset, _)| *offset);
                    return Err(TemplateError::CallNotAllowed { offset });
                },
                "?" => {
                    if TERNARY_BP < min_bp {
                        break;
                    }
                    self.pos += 1;
                    let (then, then_height) = self.parse_expr(0)?;
                    self.expect(":")?;
                    let (otherwise, otherwise_height) = self.parse_expr(TERNARY_BP)?;
                    height = Self::nest(height.max(then_height).max(otherwise_height))?;
                    lhs = Expr::Conditional(Box::new(lhs), Box::new(then), Box::new(otherwise));
                },
                other => {
                    let Some((op, left_bp, right_bp)) = infix_binding(other) else {
                        break;
                    };
                    if left_bp < min_bp {
                        break;
                    }
                    self.pos += 1;
                    let (rhs, rhs_height) = self.parse_expr(right_bp)?;
                    height = Self::nest(height.max(rhs_height))?;
                    lhs = match op {
                        Infix::Binary(op) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
                        Infix::Logical(op) => Expr::Logical(op, Box::new(lhs), Box::new(rhs)),
                    };
                },
            }
        }

        Ok((lhs, height))
    }

    fn parse_prefix(&mut self) -> TemplateResult<Parsed> {
        let (offset, token) = self.next()?;
        match token {
            Token::Num(n) => Ok((Expr::Literal(number_value(n).unwrap_or(Value::Null)), 1)),
            Token::Str(s) => Ok((Expr::Literal(Value::String(s)), 1)),
            Token::Ident(name) => {
                let expr = match name.as_str() {
                    "true" => Expr::Literal(Value::Bool(true)),
                    "false" => Expr::Literal(Value::Bool(false)),
                    "null" => Expr::Literal(Value::Null),
                    "undefined" => Expr::Undefined,
                    _ => Expr::Ident(name),
                };
                Ok((expr, 1))
            },
            Token::Punct("(") => {
                let inner = self.parse_expr(0)?;
                self.expect(")")?;
                Ok(inner)
            },
            Token::Punct("[") => {
                let mut items = Vec::new();
                let mut tallest = 0;
                if self.peek_punct() == Some("]") {
                    self.pos += 1;
                    return Ok((Expr::Array(items), 1));
                }
                loop {
                    let (item, item_height) = self.parse_expr(0)?;
                    tallest = tallest.max(item_height);
                    items.push(item);
                    match self.next()? {
                        (_, Token::Punct(",")) if self.peek_punct() == Some("]") => {
                            self.pos += 1;
                            break;
                        },
                        (_, Token::Punct(",")) => {},
                        (_, Token::Punct("]")) => break,
                        (offset, other) => {
                            return Err(TemplateError::UnexpectedToken {
                                found: other.to_string(),
                                offset,
                            });
                        },
                    }
                }
                Ok((Expr::Array(items), Self::nest(tallest)?))
            },
            Token::Punct(op @ ("!" | "-")) => {
                let op = if op == "!" { UnaryOp::Not } else { UnaryOp::Neg };
                let (operand, height) = self.parse_expr(PREFIX_BP)?;
                Ok((Expr::Unary(op, Box::new(operand)), Self::nest(height)?))
            },
            other => Err(TemplateError::UnexpectedToken {
                found: other.to_string(),
                offset,
            }),
        }
    }
}
