//! Reverse conversion: ENML → markdown.
//!
//! The body is unwrapped from its envelope and run through the ENML
//! sanitizer, which guarantees well-formed markup. `<en-todo>` and
//! `<en-media>` are then rewritten into ordinary checkbox, image and link
//! elements, the result is parsed into a small element tree with
//! quick-xml, and the tree is rendered as GitHub-flavored markdown.
//!
//! Attachments are addressed in the output as `resource:<hex digest>`, the
//! same pseudo-URL the forward converter accepts, so an unedited round trip
//! never re-uploads anything.

use quick_xml::events::{BytesStart, Event};
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::digest::ContentDigest;
use crate::models::Attachment;
use crate::sanitize::sanitize_enml;

static EN_NOTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<en-note\b[^>]*?(?:/>|>(.*)</en-note\s*>)")
        .expect("en-note pattern is valid")
});

static PROLOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<\?xml.*?\?>|<!DOCTYPE[^>]*>").expect("prolog pattern is valid")
});

static EN_TODO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<en-todo\b([^>]*?)\s*/>").expect("en-todo pattern is valid"));

static EN_MEDIA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<en-media\b([^>]*?)\s*/>").expect("en-media pattern is valid")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)="([^"]*)""#).expect("attribute pattern is valid")
});

/// Convert an ENML document (or bare body fragment) into markdown.
///
/// `attachments` supplies metadata for the note's stored resources; it is
/// used for image detection and display labels. Media elements whose digest
/// is unknown still produce a reference, chosen from their own `type`.
pub fn enml_to_markdown(enml: &str, attachments: &[Attachment]) -> String {
    let content = strip_envelope(enml);
    let clean = sanitize_enml(content);
    let html = rewrite_todos(&clean);
    let html = rewrite_media(&html, attachments);

    let nodes = parse_fragment(&html);
    let mut markdown = blocks_to_string(&render_blocks(&nodes));
    if !markdown.is_empty() {
        markdown.push('\n');
    }
    markdown
}

/// The content of the `<en-note>` root, or the whole input minus any
/// prolog when there is no root element.
fn strip_envelope(enml: &str) -> &str {
    match EN_NOTE_RE.captures(enml) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()),
        None => {
            let start = PROLOG_RE
                .find_iter(enml)
                .last()
                .map_or(0, |m| m.end());
            &enml[start..]
        }
    }
}

fn rewrite_todos(html: &str) -> String {
    EN_TODO_RE
        .replace_all(html, |caps: &Captures<'_>| {
            let checked = ATTR_RE.captures_iter(&caps[1]).any(|a| {
                a[1].eq_ignore_ascii_case("checked") && a[2].eq_ignore_ascii_case("true")
            });
            if checked {
                r#"<input type="checkbox" checked="checked"/>"#.to_string()
            } else {
                r#"<input type="checkbox"/>"#.to_string()
            }
        })
        .into_owned()
}

fn rewrite_media(html: &str, attachments: &[Attachment]) -> String {
    EN_MEDIA_RE
        .replace_all(html, |caps: &Captures<'_>| {
            let mut hash = None;
            let mut mime = None;
            let mut label = None;
            // Values come out of the sanitizer already escaped.
            for attr in ATTR_RE.captures_iter(&caps[1]) {
                let value = attr[2].trim().to_string();
                match attr[1].to_ascii_lowercase().as_str() {
                    "hash" => hash = Some(value),
                    "type" => mime = Some(value),
                    "title" if !value.is_empty() => label = Some(value),
                    "alt" if !value.is_empty() && label.is_none() => label = Some(value),
                    _ => {}
                }
            }
            let Some(raw_hash) = hash else {
                return String::new();
            };
            media_reference(&raw_hash, mime, label, attachments)
        })
        .into_owned()
}

fn media_reference(
    raw_hash: &str,
    mime: Option<String>,
    label: Option<String>,
    attachments: &[Attachment],
) -> String {
    let digest = raw_hash.parse::<ContentDigest>().ok();
    let known = digest.and_then(|d| attachments.iter().find(|a| a.hash == d));
    let url = match digest {
        Some(d) => d.to_resource_url(),
        None => format!("resource:{}", escape_attr(&raw_hash.to_ascii_lowercase())),
    };

    let mime = known
        .map(|a| escape_attr(&a.mime))
        .or(mime)
        .unwrap_or_default();
    let label = label
        .or_else(|| known.and_then(|a| a.filename.as_deref()).map(escape_attr))
        .or_else(|| (!mime.is_empty()).then(|| mime.clone()))
        .unwrap_or_else(|| "attachment".to_string());

    if known.is_none() {
        tracing::debug!(hash = %raw_hash, "media element references an unknown attachment");
    }

    if mime.starts_with("image/") {
        format!(r#"<img src="{url}" alt="{label}"/>"#)
    } else {
        format!(r#"<a href="{url}">{label}</a>"#)
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// Element tree
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Self {
        let name = String::from_utf8_lossy(start.name().as_ref()).to_ascii_lowercase();
        let attrs = start
            .attributes()
            .with_checks(false)
            .filter_map(Result::ok)
            .map(|attr| {
                let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
                let value = attr
                    .unescape_value_with(html_entity)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
                (key, value)
            })
            .collect();
        Self {
            name,
            attrs,
            children: Vec::new(),
        }
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|c| match c {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }
}

/// Parse sanitized markup into a forest of nodes. Parse errors end the
/// walk; everything read up to that point is kept.
fn parse_fragment(html: &str) -> Vec<Node> {
    let mut reader = quick_xml::Reader::from_reader(html.as_bytes());
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut stack = vec![Element::default()];
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => stack.push(Element::from_start(&e)),
            Ok(Event::Empty(e)) => append(&mut stack, Node::Element(Element::from_start(&e))),
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                close(&mut stack, &name);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape_with(html_entity)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                append(&mut stack, Node::Text(text));
            }
            Ok(Event::CData(c)) => {
                append(&mut stack, Node::Text(String::from_utf8_lossy(&c).into_owned()))
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!(error = %e, "malformed note markup, keeping what was parsed");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    while stack.len() > 1 {
        if let Some(open) = stack.pop() {
            append(&mut stack, Node::Element(open));
        }
    }
    stack.pop().map(|root| root.children).unwrap_or_default()
}

fn append(stack: &mut [Element], node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn close(stack: &mut Vec<Element>, name: &str) {
    let Some(pos) = stack.iter().skip(1).rposition(|el| el.name == name) else {
        return;
    };
    while stack.len() > pos + 1 {
        if let Some(open) = stack.pop() {
            append(stack, Node::Element(open));
        }
    }
}

/// HTML named entities that may survive sanitizing but are unknown to XML.
fn html_entity(name: &str) -> Option<&'static str> {
    Some(match name {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "nbsp" => "\u{a0}",
        "copy" => "©",
        "reg" => "®",
        "trade" => "™",
        "hellip" => "…",
        "mdash" => "—",
        "ndash" => "–",
        "lsquo" => "‘",
        "rsquo" => "’",
        "ldquo" => "“",
        "rdquo" => "”",
        "laquo" => "«",
        "raquo" => "»",
        "bull" => "•",
        "middot" => "·",
        "times" => "×",
        "divide" => "÷",
        "deg" => "°",
        "plusmn" => "±",
        "sect" => "§",
        "para" => "¶",
        "euro" => "€",
        "pound" => "£",
        "yen" => "¥",
        "cent" => "¢",
        "larr" => "←",
        "rarr" => "→",
        "uarr" => "↑",
        "darr" => "↓",
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Markdown rendering
// ---------------------------------------------------------------------------

const BLOCK_ELEMENTS: &[&str] = &[
    "address", "blockquote", "center", "dd", "div", "dl", "dt", "h1", "h2", "h3", "h4", "h5",
    "h6", "hr", "li", "ol", "p", "pre", "table", "ul",
];

fn is_block(name: &str) -> bool {
    BLOCK_ELEMENTS.contains(&name)
}

#[derive(Debug, PartialEq)]
enum Block {
    Text(String),
    /// A paragraph that starts with a checkbox, rendered as `[x] text`.
    Task(String),
}

fn blocks_to_string(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut prev_task = false;
    for block in blocks {
        let (text, is_task) = match block {
            Block::Text(t) => (t.clone(), false),
            Block::Task(t) => (format!("- {t}"), true),
        };
        if !out.is_empty() {
            out.push_str(if prev_task && is_task { "\n" } else { "\n\n" });
        }
        out.push_str(&text);
        prev_task = is_task;
    }
    out
}

fn render_blocks(nodes: &[Node]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut inline = Inline::paragraph();
    for node in nodes {
        match node {
            Node::Element(el) if is_block(&el.name) => {
                flush_paragraph(&mut inline, &mut blocks);
                blocks.extend(render_block(el));
            }
            other => inline.node(other),
        }
    }
    flush_paragraph(&mut inline, &mut blocks);
    blocks
}

fn flush_paragraph(inline: &mut Inline, blocks: &mut Vec<Block>) {
    let text = std::mem::replace(inline, Inline::paragraph()).finish();
    if text.is_empty() {
        return;
    }
    if text == "[ ]" || text == "[x]" {
        // A bare marker needs its trailing space to parse as a task item.
        blocks.push(Block::Task(format!("{text} ")));
    } else if text.starts_with("[ ] ") || text.starts_with("[x] ") {
        blocks.push(Block::Task(text));
    } else {
        blocks.push(Block::Text(escape_block_starts(&text)));
    }
}

fn render_block(el: &Element) -> Vec<Block> {
    match el.name.as_str() {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = el.name[1..].parse::<usize>().unwrap_or(1);
            let mut inline = Inline::default();
            inline.nodes(&el.children);
            let text = inline.finish().replace("\\\n", " ");
            if text.is_empty() {
                Vec::new()
            } else {
                vec![Block::Text(format!("{} {text}", "#".repeat(level)))]
            }
        }
        "ul" | "ol" => non_empty(render_list(el)),
        "pre" => vec![Block::Text(render_code_block(el))],
        "blockquote" => {
            let inner = blocks_to_string(&render_blocks(&el.children));
            let quoted = inner
                .lines()
                .map(|line| {
                    if line.is_empty() {
                        ">".to_string()
                    } else {
                        format!("> {line}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
            non_empty(quoted)
        }
        "hr" => vec![Block::Text("---".to_string())],
        "table" => non_empty(render_table(el)),
        _ => render_blocks(&el.children),
    }
}

fn non_empty(text: String) -> Vec<Block> {
    if text.trim().is_empty() {
        Vec::new()
    } else {
        vec![Block::Text(text)]
    }
}

fn render_list(list: &Element) -> String {
    let ordered = list.name == "ol";
    let mut number = list
        .attr("start")
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(1);
    let loose = list
        .child_elements()
        .filter(|c| c.name == "li")
        .any(|li| li.child_elements().any(|c| c.name == "p"));

    let mut items: Vec<String> = Vec::new();
    for child in list.child_elements() {
        match child.name.as_str() {
            "li" => {
                let marker = if ordered {
                    format!("{number}. ")
                } else {
                    "- ".to_string()
                };
                number += 1;
                items.push(render_list_item(child, &marker, loose));
            }
            // A list nested directly inside a list belongs to the previous item.
            "ul" | "ol" => {
                let nested = indent(&render_list(child), 2);
                match items.last_mut() {
                    Some(last) => {
                        last.push('\n');
                        last.push_str(&nested);
                    }
                    None => items.push(render_list(child)),
                }
            }
            _ => {}
        }
    }
    items.join(if loose { "\n\n" } else { "\n" })
}

fn render_list_item(li: &Element, marker: &str, loose: bool) -> String {
    let blocks = render_blocks(&li.children);
    let mut parts = Vec::with_capacity(blocks.len());
    for (i, block) in blocks.iter().enumerate() {
        match block {
            Block::Task(t) if i == 0 => parts.push(t.clone()),
            Block::Task(t) => parts.push(format!("- {t}")),
            Block::Text(t) => parts.push(t.clone()),
        }
    }
    let body = parts.join(if loose { "\n\n" } else { "\n" });
    if body.is_empty() {
        return marker.trim_end().to_string();
    }

    let width = marker.chars().count();
    let mut out = String::new();
    for (i, line) in body.lines().enumerate() {
        if i == 0 {
            out.push_str(marker);
            out.push_str(line);
        } else {
            out.push('\n');
            if !line.is_empty() {
                out.push_str(&" ".repeat(width));
                out.push_str(line);
            }
        }
    }
    out
}

fn indent(text: &str, width: usize) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{line}", " ".repeat(width))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_code_block(pre: &Element) -> String {
    let code = pre.child_elements().find(|c| c.name == "code");
    let lang = code
        .and_then(|c| c.attr("lang"))
        .or_else(|| pre.attr("lang"))
        .or_else(|| {
            code.and_then(|c| c.attr("class"))
                .and_then(|class| class.split_whitespace().find_map(|c| c.strip_prefix("language-")))
        })
        .unwrap_or("")
        .trim();

    let mut text = String::new();
    raw_text(&pre.children, &mut text);
    let text = text.strip_prefix('\n').unwrap_or(&text).trim_end_matches('\n');

    let fence = "`".repeat(longest_run(text, '`').max(2) + 1);
    if text.is_empty() {
        format!("{fence}{lang}\n{fence}")
    } else {
        format!("{fence}{lang}\n{text}\n{fence}")
    }
}

fn render_table(table: &Element) -> String {
    let mut rows: Vec<Vec<(String, Option<String>)>> = Vec::new();
    collect_rows(table, &mut rows);
    if rows.is_empty() {
        return String::new();
    }
    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);

    let mut lines = Vec::with_capacity(rows.len() + 1);
    for (i, row) in rows.iter().enumerate() {
        let mut cells: Vec<&str> = row.iter().map(|(text, _)| text.as_str()).collect();
        cells.resize(width, "");
        lines.push(format!("| {} |", cells.join(" | ")));
        if i == 0 {
            let separators: Vec<&str> = (0..width)
                .map(|col| match row.get(col).and_then(|(_, a)| a.as_deref()) {
                    Some("left") => ":---",
                    Some("center") => ":---:",
                    Some("right") => "---:",
                    _ => "---",
                })
                .collect();
            lines.push(format!("| {} |", separators.join(" | ")));
        }
    }
    lines.join("\n")
}

fn collect_rows(el: &Element, rows: &mut Vec<Vec<(String, Option<String>)>>) {
    for child in el.child_elements() {
        match child.name.as_str() {
            "tr" => {
                let cells = child
                    .child_elements()
                    .filter(|c| c.name == "td" || c.name == "th")
                    .map(|cell| {
                        let mut inline = Inline::default();
                        inline.nodes(&cell.children);
                        let text = inline
                            .finish()
                            .replace("\\\n", "<br>")
                            .replace('\n', " ")
                            .replace('|', "\\|");
                        let align = cell.attr("align").map(|a| a.trim().to_ascii_lowercase());
                        (text, align)
                    })
                    .collect();
                rows.push(cells);
            }
            "thead" | "tbody" | "tfoot" => collect_rows(child, rows),
            _ => {}
        }
    }
}

/// Concatenated text of `nodes` with `<br>` as newlines and no escaping.
fn raw_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Element(el) if el.name == "br" => out.push('\n'),
            Node::Element(el) => raw_text(&el.children, out),
        }
    }
}

fn longest_run(text: &str, ch: char) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for c in text.chars() {
        if c == ch {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Escape characters that would start a block construct at the beginning of a line.
fn escape_block_starts(text: &str) -> String {
    text.split('\n')
        .map(escape_line_start)
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_line_start(line: &str) -> String {
    let first = line.chars().next();
    let second = line.chars().nth(1);
    let starts_block = match first {
        Some('#') => {
            let hashes = line.chars().take_while(|&c| c == '#').count();
            hashes <= 6 && line[hashes..].chars().next().is_none_or(|c| c == ' ')
        }
        Some('-' | '+') => second.is_none_or(|c| c == ' ') || line.starts_with("---"),
        Some('>' | '=') => true,
        _ => false,
    };
    if starts_block {
        return format!("\\{line}");
    }

    // `1. item` / `1) item`
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 && digits <= 9 {
        let rest = &line[digits..];
        if rest.starts_with(". ") || rest.starts_with(") ") || rest == "." || rest == ")" {
            return format!("{}\\{}", &line[..digits], rest);
        }
    }
    line.to_string()
}

/// Accumulates inline markdown for one paragraph.
#[derive(Default)]
struct Inline {
    out: String,
    /// A leading checkbox may be written as a `[x] ` task prefix.
    task_start: bool,
    pending: Vec<PendingClose>,
}

/// Emphasis ending in punctuation. Its closing delimiter only closes when
/// the next character is not alphanumeric, which is known once the
/// paragraph is complete.
struct PendingClose {
    open_at: usize,
    close_at: usize,
    marker: &'static str,
    tag: &'static str,
}

fn is_punctuation(ch: char) -> bool {
    !ch.is_alphanumeric() && !ch.is_whitespace()
}

impl Inline {
    fn paragraph() -> Self {
        Self {
            task_start: true,
            ..Self::default()
        }
    }

    fn finish(mut self) -> String {
        self.settle();
        let mut text = self.out.trim().to_string();
        while let Some(stripped) = text.strip_suffix('\\') {
            text = stripped.trim_end().to_string();
        }
        text
    }

    fn nodes(&mut self, nodes: &[Node]) {
        for node in nodes {
            self.node(node);
        }
    }

    fn node(&mut self, node: &Node) {
        match node {
            Node::Text(t) => self.text(t),
            Node::Element(el) => self.element(el),
        }
    }

    fn space(&mut self) {
        if !self.out.ends_with([' ', '\n']) {
            self.out.push(' ');
        }
    }

    fn text(&mut self, raw: &str) {
        let chars: Vec<char> = raw.chars().collect();
        for (i, &ch) in chars.iter().enumerate() {
            if ch.is_whitespace() && ch != '\u{a0}' {
                self.space();
                continue;
            }
            let prev = if i == 0 {
                self.out.chars().last()
            } else {
                Some(chars[i - 1])
            };
            let next = chars.get(i + 1).copied();
            let escape = match ch {
                '\\' | '`' | '*' | '[' | ']' => true,
                '_' => {
                    !prev.is_some_and(char::is_alphanumeric)
                        || !next.is_some_and(char::is_alphanumeric)
                }
                '<' => next.is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?')),
                '~' => prev == Some('~') || next == Some('~'),
                '&' => looks_like_entity(&chars[i + 1..]),
                _ => false,
            };
            if escape {
                self.out.push('\\');
            }
            self.out.push(ch);
        }
    }

    fn element(&mut self, el: &Element) {
        match el.name.as_str() {
            "br" => {
                let trimmed = self.out.trim_end_matches(' ').len();
                self.out.truncate(trimmed);
                if !self.out.is_empty() && !self.out.ends_with('\n') {
                    self.out.push_str("\\\n");
                }
            }
            "b" | "strong" => self.wrapped(el, "**", "strong"),
            "i" | "em" | "cite" | "dfn" | "var" => self.wrapped(el, "*", "em"),
            "s" | "del" | "strike" => self.wrapped(el, "~~", "del"),
            "code" | "tt" | "kbd" | "samp" => self.code_span(el),
            "a" => self.link(el),
            "img" => self.image(el),
            "input" => {
                if el.attr("type").is_some_and(|t| t.eq_ignore_ascii_case("checkbox")) {
                    let checked = el.attr("checked").is_some();
                    if self.task_start && self.out.trim().is_empty() {
                        self.out.push_str(if checked { "[x] " } else { "[ ] " });
                    } else {
                        self.out.push_str(&format!(r#"<en-todo checked="{checked}"/>"#));
                    }
                }
            }
            name if is_block(name) => {
                self.space();
                self.nodes(&el.children);
                self.space();
            }
            _ => self.nodes(&el.children),
        }
    }

    fn wrapped(&mut self, el: &Element, marker: &'static str, tag: &'static str) {
        let mut inner = Inline::default();
        inner.nodes(&el.children);
        inner.settle();
        let content = inner.out;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            if !content.is_empty() {
                self.space();
            }
            return;
        }
        if content.starts_with([' ', '\n']) {
            self.space();
        }

        let opens = !(trimmed.starts_with(is_punctuation)
            && self.out.ends_with(char::is_alphanumeric));
        if opens {
            let open_at = self.out.len();
            self.out.push_str(marker);
            self.out.push_str(trimmed);
            let close_at = self.out.len();
            self.out.push_str(marker);
            if trimmed.ends_with(is_punctuation) {
                self.pending.push(PendingClose {
                    open_at,
                    close_at,
                    marker,
                    tag,
                });
            }
        } else {
            self.out.push_str(&format!("<{tag}>{trimmed}</{tag}>"));
        }

        if content.ends_with([' ', '\n']) {
            self.space();
        }
    }

    /// Rewrite pending emphasis as HTML tags where a word character follows
    /// the closing delimiter.
    fn settle(&mut self) {
        for span in std::mem::take(&mut self.pending).into_iter().rev() {
            let after = span.close_at + span.marker.len();
            if !self.out[after..].starts_with(char::is_alphanumeric) {
                continue;
            }
            self.out
                .replace_range(span.close_at..after, &format!("</{}>", span.tag));
            self.out.replace_range(
                span.open_at..span.open_at + span.marker.len(),
                &format!("<{}>", span.tag),
            );
        }
    }

    fn code_span(&mut self, el: &Element) {
        let mut text = String::new();
        raw_text(&el.children, &mut text);
        let text = text.replace('\n', " ");
        if text.is_empty() {
            return;
        }
        let ticks = "`".repeat(longest_run(&text, '`') + 1);
        let pad = if text.starts_with('`') || text.ends_with('`') {
            " "
        } else {
            ""
        };
        self.out.push_str(&ticks);
        self.out.push_str(pad);
        self.out.push_str(&text);
        self.out.push_str(pad);
        self.out.push_str(&ticks);
    }

    fn link(&mut self, el: &Element) {
        let mut label = Inline::default();
        label.nodes(&el.children);
        let label = label.finish();
        let href = el.attr("href").map(str::trim).unwrap_or("");
        if href.is_empty() {
            self.out.push_str(&label);
            return;
        }
        let label = if label.is_empty() {
            escape_label(href)
        } else {
            label
        };
        self.out.push('[');
        self.out.push_str(&label);
        self.out.push_str("](");
        self.out.push_str(&format_destination(href));
        if let Some(title) = el.attr("title").filter(|t| !t.is_empty()) {
            self.out.push_str(&format!(" \"{}\"", title.replace('"', "\\\"")));
        }
        self.out.push(')');
    }

    fn image(&mut self, el: &Element) {
        let Some(src) = el.attr("src").map(str::trim).filter(|s| !s.is_empty()) else {
            return;
        };
        let alt = escape_label(el.attr("alt").unwrap_or(""));
        self.out.push_str("![");
        self.out.push_str(&alt);
        self.out.push_str("](");
        self.out.push_str(&format_destination(src));
        if let Some(title) = el.attr("title").filter(|t| !t.is_empty()) {
            self.out.push_str(&format!(" \"{}\"", title.replace('"', "\\\"")));
        }
        self.out.push(')');
    }
}

fn looks_like_entity(rest: &[char]) -> bool {
    let body: Vec<char> = rest.iter().take_while(|c| **c != ';').take(32).copied().collect();
    !body.is_empty()
        && rest.get(body.len()) == Some(&';')
        && (body.iter().all(char::is_ascii_alphanumeric)
            || (body[0] == '#' && body[1..].iter().all(char::is_ascii_alphanumeric)))
}

fn escape_label(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '[' | ']') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn format_destination(url: &str) -> String {
    if url.chars().any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '<' | '>')) {
        format!("<{}>", url.replace('<', "%3C").replace('>', "%3E"))
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enml::wrap_enml;

    fn md(content: &str) -> String {
        enml_to_markdown(&wrap_enml(content), &[])
    }

    #[test]
    fn strips_envelope_and_renders_paragraphs() {
        assert_eq!(md("<p>one</p><p>two</p>"), "one\n\ntwo\n");
        assert_eq!(md("<div>line one</div><div>line two</div>"), "line one\n\nline two\n");
    }

    #[test]
    fn bare_fragment_and_empty_note() {
        assert_eq!(enml_to_markdown("<p>bare</p>", &[]), "bare\n");
        assert_eq!(enml_to_markdown(&wrap_enml(""), &[]), "");
        assert_eq!(enml_to_markdown("<en-note/>", &[]), "");
    }

    #[test]
    fn headings_and_emphasis() {
        let out = md("<h2>Plan <em>A</em></h2><p>a <b>bold</b> and <i>it</i> and <del>old</del></p>");
        assert_eq!(out, "## Plan *A*\n\na **bold** and *it* and ~~old~~\n");
    }

    #[test]
    fn emphasis_whitespace_moves_outside_markers() {
        assert_eq!(md("<p>x<strong> y </strong>z</p>"), "x **y** z\n");
    }

    #[test]
    fn nested_lists_are_indented() {
        let out = md("<ul><li>a<ul><li>b</li></ul></li><li>c</li></ul><ol start=\"3\"><li>x</li><li>y</li></ol>");
        assert_eq!(out, "- a\n  - b\n- c\n\n3. x\n4. y\n");
    }

    #[test]
    fn todos_in_lists_and_divs() {
        let out = md(
            r#"<ul><li><en-todo checked="true"/>done</li><li><en-todo checked="false"/>open</li></ul>"#,
        );
        assert_eq!(out, "- [x] done\n- [ ] open\n");

        let out = md(r#"<div><en-todo/>milk</div><div><en-todo checked="true"/>eggs</div><div>after</div>"#);
        assert_eq!(out, "- [ ] milk\n- [x] eggs\n\nafter\n");
    }

    #[test]
    fn todo_after_text_stays_an_element() {
        let out = md(r#"<div>Buy <en-todo checked="true"/> milk</div>"#);
        assert_eq!(out, "Buy <en-todo checked=\"true\"/> milk\n");

        let out = md(r#"<div><en-todo/>a <en-todo checked="true"/>b</div>"#);
        assert_eq!(out, "- [ ] a <en-todo checked=\"true\"/>b\n");

        let out = md(r#"<table><tr><td><en-todo/>cell</td></tr></table>"#);
        assert_eq!(out, "| <en-todo checked=\"false\"/>cell |\n| --- |\n");
    }

    #[test]
    fn bare_todo_keeps_task_spacing() {
        assert_eq!(md("<div><en-todo/></div><div>next</div>"), "- [ ] \n\nnext\n");
    }

    #[test]
    fn emphasis_against_word_characters_falls_back_to_tags() {
        assert_eq!(md(r#"<p>a<b>"q"</b>b</p>"#), "a<strong>\"q\"</strong>b\n");
        assert_eq!(md("<p><b>Note:</b>next</p>"), "<strong>Note:</strong>next\n");
        assert_eq!(md("<p><b>Note:</b> next</p>"), "**Note:** next\n");
        assert_eq!(md("<p>x<i>(y)</i>, z</p>"), "x<em>(y)</em>, z\n");
        assert_eq!(md("<p>a<s>b.</s>c</p>"), "a<del>b.</del>c\n");
    }

    #[test]
    fn code_block_with_language() {
        let out = md("<pre><code lang=\"rust\">fn main() {\n    let a = 1 &lt; 2;\n}\n</code></pre>");
        assert_eq!(out, "```rust\nfn main() {\n    let a = 1 < 2;\n}\n```\n");
    }

    #[test]
    fn code_fence_grows_past_backtick_runs() {
        let out = md("<pre>a ``` b</pre>");
        assert_eq!(out, "````\na ``` b\n````\n");
    }

    #[test]
    fn inline_code_is_not_escaped() {
        assert_eq!(md("<p>run <code>a*b_c</code> now</p>"), "run `a*b_c` now\n");
    }

    #[test]
    fn tables_render_as_gfm() {
        let out = md(
            "<table><thead><tr><th>a</th><th align=\"right\">b</th></tr></thead>\
             <tbody><tr><td>1|2</td><td><b>x</b></td></tr><tr><td>3</td></tr></tbody></table>",
        );
        assert_eq!(out, "| a | b |\n| --- | ---: |\n| 1\\|2 | **x** |\n| 3 |  |\n");
    }

    #[test]
    fn blockquote_and_rule() {
        assert_eq!(md("<blockquote><p>q1</p><p>q2</p></blockquote><hr/>"), "> q1\n>\n> q2\n\n---\n");
    }

    #[test]
    fn links_images_and_breaks() {
        let out = md(r#"<p><a href="https://e.com/a b">site</a><br/>next<img src="https://e.com/i.png" alt="pic"/></p>"#);
        assert_eq!(out, "[site](<https://e.com/a b>)\\\nnext![pic](https://e.com/i.png)\n");
    }

    #[test]
    fn markdown_specials_are_escaped() {
        assert_eq!(md("<p>2*3 [x] a_b _c</p>"), "2\\*3 \\[x\\] a_b \\_c\n");
        assert_eq!(md("<p># not heading</p><p>1. not list</p>"), "\\# not heading\n\n1\\. not list\n");
    }

    #[test]
    fn entities_decode() {
        assert_eq!(md("<p>a&nbsp;b &amp; c &copy;</p>"), "a\u{a0}b & c ©\n");
    }

    #[test]
    fn known_image_media_becomes_resource_image() {
        let hash = ContentDigest::of(b"img");
        let known = Attachment::existing(hash, "image/png", Some("shot.png".into()));
        let out = enml_to_markdown(
            &wrap_enml(&format!(r#"<p><en-media hash="{hash}" type="image/png"/></p>"#)),
            &[known],
        );
        assert_eq!(out, format!("![shot.png](resource:{hash})\n"));
    }

    #[test]
    fn known_file_media_becomes_resource_link() {
        let hash = ContentDigest::of(b"pdf");
        let known = Attachment::existing(hash, "application/pdf", Some("report.pdf".into()));
        let out = enml_to_markdown(
            &wrap_enml(&format!(r#"<en-media hash="{hash}" type="application/pdf"/>"#)),
            &[known],
        );
        assert_eq!(out, format!("[report.pdf](resource:{hash})\n"));
    }

    #[test]
    fn unknown_media_still_produces_a_reference() {
        let hash = ContentDigest::of(b"lost");
        let out = md(&format!(r#"<en-media hash="{hash}" type="image/jpeg"/>"#));
        assert_eq!(out, format!("![image/jpeg](resource:{hash})\n"));

        let out = md(&format!(r#"<en-media hash="{hash}" type="audio/wav" title="memo"/>"#));
        assert_eq!(out, format!("[memo](resource:{hash})\n"));
    }

    #[test]
    fn uppercase_media_hash_is_normalized() {
        let hash = ContentDigest::of(b"img");
        let upper = hash.to_hex().to_uppercase();
        let out = md(&format!(r#"<en-media hash="{upper}" type="image/gif" alt="g"/>"#));
        assert_eq!(out, format!("![g](resource:{hash})\n"));
    }

    #[test]
    fn unknown_elements_are_unwrapped() {
        assert_eq!(md("<section><p>kept <span>inside</span></p></section>"), "kept inside\n");
    }
}
