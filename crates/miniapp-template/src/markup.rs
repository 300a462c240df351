//! Lenient markup scanner.
//!
//! Produces a raw element/text tree. Comments, `<!DOCTYPE>` and processing
//! instructions are dropped. A missing close tag is closed by an ancestor's
//! close tag or at end of input; a stray close tag is ignored. Start tags
//! nested deeper than [`MAX_ELEMENT_DEPTH`] are dropped and their content
//! joins the deepest open element.

use tracing::warn;

/// Deepest element nesting kept in the tree.
pub const MAX_ELEMENT_DEPTH: usize = 256;

/// Tags whose content is kept verbatim rather than scanned for markup.
const RAW_TEXT_TAGS: &[&str] = &["script", "style"];

/// Tags that never have children in the source markup.
const VOID_SOURCE_TAGS: &[&str] = &["img", "image", "br", "hr", "input", "meta", "link"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedAttr {
    pub(crate) name: String,
    pub(crate) value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawElement {
    pub(crate) name: String,
    pub(crate) attrs: Vec<ParsedAttr>,
    pub(crate) children: Vec<RawNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawNode {
    Text(String),
    Element(RawElement),
}

#[derive(Default)]
struct TreeBuilder {
    roots: Vec<RawNode>,
    open: Vec<RawElement>,
    text: String,
    dropped: usize,
}

impl TreeBuilder {
    fn push_node(&mut self, node: RawNode) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.roots.push(node),
        }
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            self.push_node(RawNode::Text(text));
        }
    }

    fn close_top(&mut self) {
        if let Some(element) = self.open.pop() {
            self.push_node(RawNode::Element(element));
        }
    }

    fn close(&mut self, name: &str) {
        let Some(depth) = self.open.iter().rposition(|el| el.name == name) else {
            return;
        };
        while self.open.len() > depth {
            self.close_top();
        }
    }

    fn finish(mut self) -> Vec<RawNode> {
        self.flush_text();
        if self.dropped > 0 {
            warn!(
                dropped = self.dropped,
                limit = MAX_ELEMENT_DEPTH,
                "Markup nested too deeply, dropped start tags"
            );
        }
        while !self.open.is_empty() {
            self.close_top();
        }
        self.roots
    }
}

/// Parse markup into a raw tree.
pub(crate) fn parse_markup(input: &str) -> Vec<RawNode> {
    let mut builder = TreeBuilder::default();
    let mut cursor = 0usize;

    while cursor < input.len() {
        let Some(rel) = input[cursor..].find('<') else {
            builder.text.push_str(&input[cursor..]);
            break;
        };
        let lt = cursor + rel;
        builder.text.push_str(&input[cursor..lt]);
        let rest = &input[lt..];

        if rest.starts_with("<!--") {
            cursor = rest.find("-->").map_or(input.len(), |end| lt + end + 3);
            continue;
        }

        if rest.starts_with("<!") || rest.starts_with("<?") {
            cursor = rest.find('>').map_or(input.len(), |end| lt + end + 1);
            continue;
        }

        if let Some(after) = rest.strip_prefix("</") {
            let Some(end) = after.find('>') else {
                builder.text.push_str(rest);
                break;
            };
            let name = after[..end].trim().to_ascii_lowercase();
            builder.flush_text();
            builder.close(&name);
            cursor = lt + 2 + end + 1;
            continue;
        }

        let starts_tag = rest
            .as_bytes()
            .get(1)
            .is_some_and(|b| b.is_ascii_alphabetic());
        if !starts_tag {
            builder.text.push('<');
            cursor = lt + 1;
            continue;
        }

        let Some(gt) = find_tag_end(input, lt) else {
            builder.text.push_str(rest);
            break;
        };

        let (name, attrs, self_closing) = split_start_tag(&input[lt + 1..gt]);
        let name = name.to_ascii_lowercase();
        let element = RawElement {
            attrs: parse_attributes(attrs),
            name,
            children: Vec::new(),
        };
        builder.flush_text();
        cursor = gt + 1;

        if self_closing || VOID_SOURCE_TAGS.contains(&element.name.as_str()) {
            builder.push_node(RawNode::Element(element));
            continue;
        }

        if RAW_TEXT_TAGS.contains(&element.name.as_str()) {
            let mut element = element;
            let (content, next) = match find_close_tag(input, cursor, &element.name) {
                Some(close) => {
                    let after_close = input[close..]
                        .find('>')
                        .map_or(input.len(), |end| close + end + 1);
                    (&input[cursor..close], after_close)
                },
                None => (&input[cursor..], input.len()),
            };
            if !content.is_empty() {
                element.children.push(RawNode::Text(content.to_string()));
            }
            builder.push_node(RawNode::Element(element));
            cursor = next;
            continue;
        }

        if builder.open.len() >= MAX_ELEMENT_DEPTH {
            builder.dropped += 1;
            continue;
        }
        builder.open.push(element);
    }

    builder.finish()
}

fn split_start_tag(inside: &str) -> (&str, &str, bool) {
    let trimmed = inside.trim();
    let self_closing = trimmed.ends_with('/');
    let core = if self_closing {
        trimmed[..trimmed.len().saturating_sub(1)].trim_end()
    } else {
        trimmed
    };

    let name_end = core
        .char_indices()
        .find(|(_, ch)| ch.is_whitespace())
        .map_or(core.len(), |(idx, _)| idx);

    (&core[..name_end], core[name_end..].trim_start(), self_closing)
}

fn parse_attributes(input: &str) -> Vec<ParsedAttr> {
    let mut out = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0usize;

    let skip_ws = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };

    while i < bytes.len() {
        i = skip_ws(i);
        if i >= bytes.len() {
            break;
        }

        let name_start = i;
        while i < bytes.len()
            && !bytes[i].is_ascii_whitespace()
            && bytes[i] != b'='
            && bytes[i] != b'/'
        {
            i += 1;
        }
        if i == name_start {
            i += 1;
            continue;
        }
        let name = input[name_start..i].to_string();

        i = skip_ws(i);
        if i >= bytes.len() || bytes[i] != b'=' {
            out.push(ParsedAttr { name, value: None });
            continue;
        }

        i = skip_ws(i + 1);
        if i >= bytes.len() {
            out.push(ParsedAttr {
                name,
                value: Some(String::new()),
            });
            break;
        }

        let value = if bytes[i] == b'"' || bytes[i] == b'\'' {
            let quote = bytes[i];
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] != quote {
                i += 1;
            }
            let value = input[start..i].to_string();
            if i < bytes.len() {
                i += 1;
            }
            value
        } else {
            let start = i;
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            input[start..i].to_string()
        };

        out.push(ParsedAttr {
            name,
            value: Some(value),
        });
    }

    out
}

/// Index of the `>` closing the tag opened at `lt_idx`, skipping quoted values.
fn find_tag_end(input: &str, lt_idx: usize) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut quote: Option<u8> = None;

    for (i, &b) in bytes.iter().enumerate().skip(lt_idx + 1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {},
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {},
        }
    }

    None
}

fn find_close_tag(input: &str, start: usize, tag: &str) -> Option<usize> {
    let needle = format!("</{}", tag.to_ascii_lowercase());
    let lower = input[start..].to_ascii_lowercase();
    lower.find(&needle).map(|idx| start + idx)
}
