//! Allow-list sanitizer producing ENML-safe markup.
//!
//! The input is the HTML a markdown renderer emits, including any raw HTML
//! the author wrote inline. The output contains only elements and
//! attributes named by a [`Policy`] and is always well-formed XML:
//!
//! - disallowed elements are unwrapped (their children survive), except the
//!   ones in [`DROP_WITH_CONTENT`], which vanish together with everything
//!   inside them;
//! - disallowed attributes are removed, never escaped into text;
//! - void elements are self-closed, unclosed elements are closed at the end,
//!   and end tags with no matching open element are discarded;
//! - comments, doctypes, CDATA and processing instructions are removed.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Elements removed together with their content.
pub const DROP_WITH_CONTENT: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "head", "title", "noscript", "template",
    "textarea", "select",
];

/// Elements that never have content.
const VOID_ELEMENTS: &[&str] = &["br", "hr", "img", "en-media", "en-todo", "col", "area"];

/// `href` schemes that are always stripped.
const FORBIDDEN_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:"];

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<!--.*?-->|<!\[CDATA\[.*?\]\]>|<![^>]*>|<\?.*?\?>|</\s*([a-z][a-z0-9:-]*)\s*>|<([a-z][a-z0-9:-]*)((?:\s+[^\s"'>/=]+(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'=<>`]+))?)*)\s*(/?)>"#,
    )
    .expect("token pattern is valid")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("attribute pattern is valid")
});

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^&(?:#[0-9]{1,7}|#x[0-9a-fA-F]{1,6}|[a-zA-Z][a-zA-Z0-9]{1,31});")
        .expect("entity pattern is valid")
});

static ENML_POLICY: LazyLock<Policy> = LazyLock::new(Policy::enml);

/// Element and per-element attribute allow-list.
#[derive(Debug, Clone)]
pub struct Policy {
    elements: HashMap<&'static str, &'static [&'static str]>,
}

impl Policy {
    /// The ENML 2 allow-list.
    pub fn enml() -> Self {
        const PLAIN: &[&str] = &[
            "abbr", "acronym", "address", "b", "bdo", "big", "blockquote", "br", "caption",
            "center", "cite", "dd", "del", "dfn", "div", "dl", "dt", "em", "h1", "h2", "h3", "h4",
            "h5", "h6", "hr", "i", "ins", "kbd", "li", "p", "q", "s", "samp", "small", "span",
            "strike", "strong", "sub", "sup", "table", "tbody", "tfoot", "thead", "tr", "tt", "u",
            "ul", "var",
        ];
        let mut elements: HashMap<&'static str, &'static [&'static str]> =
            PLAIN.iter().map(|&name| (name, &[][..])).collect();

        elements.insert("a", &["href", "title"]);
        elements.insert("img", &["src", "alt", "title", "width", "height"]);
        elements.insert("en-media", &["hash", "type", "alt", "title", "align", "width", "height"]);
        elements.insert("en-todo", &["checked"]);
        elements.insert("td", &["colspan", "rowspan", "align"]);
        elements.insert("th", &["colspan", "rowspan", "align"]);
        elements.insert("ol", &["start"]);
        elements.insert("code", &["lang"]);
        elements.insert("pre", &["lang"]);
        elements.insert("font", &["color", "face", "size"]);
        elements.insert("col", &["span"]);
        elements.insert("colgroup", &["span"]);

        Self { elements }
    }

    pub fn allows_element(&self, name: &str) -> bool {
        self.elements.contains_key(name)
    }

    pub fn allows_attribute(&self, element: &str, attribute: &str) -> bool {
        self.elements
            .get(element)
            .is_some_and(|attrs| attrs.contains(&attribute))
    }

    /// Filter `html` through this policy.
    pub fn sanitize(&self, html: &str) -> String {
        let mut out = String::with_capacity(html.len());
        let mut open: Vec<String> = Vec::new();
        // Element whose content is being dropped, with its nesting depth.
        let mut dropping: Option<(String, usize)> = None;
        let mut last = 0;

        for caps in TOKEN_RE.captures_iter(html) {
            let Some(whole) = caps.get(0) else { continue };
            if dropping.is_none() {
                push_text(&mut out, &html[last..whole.start()]);
            }
            last = whole.end();

            if let Some(name) = caps.get(1) {
                let name = name.as_str().to_ascii_lowercase();
                if let Some((dropped, depth)) = dropping.as_mut() {
                    if *dropped == name {
                        *depth -= 1;
                        if *depth == 0 {
                            dropping = None;
                        }
                    }
                    continue;
                }
                self.close_element(&name, &mut open, &mut out);
            } else if let Some(name) = caps.get(2) {
                let name = name.as_str().to_ascii_lowercase();
                let self_closing = caps.get(4).is_some_and(|m| !m.as_str().is_empty());
                if let Some((dropped, depth)) = dropping.as_mut() {
                    if *dropped == name && !self_closing {
                        *depth += 1;
                    }
                    continue;
                }
                if DROP_WITH_CONTENT.contains(&name.as_str()) {
                    if !self_closing {
                        tracing::debug!(element = %name, "dropping element with content");
                        dropping = Some((name, 1));
                    }
                    continue;
                }
                if !self.allows_element(&name) {
                    continue;
                }

                let attrs = self.filter_attributes(&name, &caps);
                out.push('<');
                out.push_str(&name);
                for (key, value) in &attrs {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    push_attr_value(&mut out, value);
                    out.push('"');
                }
                if self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    open.push(name);
                }
            }
        }

        if dropping.is_none() {
            push_text(&mut out, &html[last..]);
        }
        while let Some(name) = open.pop() {
            push_end_tag(&mut out, &name);
        }
        out
    }

    fn close_element(&self, name: &str, open: &mut Vec<String>, out: &mut String) {
        if VOID_ELEMENTS.contains(&name) || !self.allows_element(name) {
            return;
        }
        let Some(pos) = open.iter().rposition(|n| n == name) else {
            return;
        };
        while open.len() > pos {
            if let Some(inner) = open.pop() {
                push_end_tag(out, &inner);
            }
        }
    }

    fn filter_attributes(&self, element: &str, caps: &Captures<'_>) -> Vec<(String, String)> {
        let Some(raw) = caps.get(3) else {
            return Vec::new();
        };
        let mut attrs: Vec<(String, String)> = Vec::new();
        for attr in ATTR_RE.captures_iter(raw.as_str()) {
            let Some(key) = attr.get(1) else { continue };
            let key = key.as_str().to_ascii_lowercase();
            if !self.allows_attribute(element, &key) || attrs.iter().any(|(k, _)| *k == key) {
                continue;
            }
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();

            let value = match (element, key.as_str()) {
                (_, "href") | (_, "src") if has_forbidden_scheme(&value) => continue,
                ("en-todo", "checked") => {
                    let checked = matches!(value.trim(), "" | "true" | "checked");
                    checked.to_string()
                }
                _ => value,
            };
            attrs.push((key, value));
        }
        attrs
    }
}

/// Filter `html` through the ENML allow-list.
pub fn sanitize_enml(html: &str) -> String {
    ENML_POLICY.sanitize(html)
}

fn has_forbidden_scheme(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    FORBIDDEN_SCHEMES.iter().any(|s| compact.starts_with(s))
}

fn push_end_tag(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

/// Append text, keeping existing entity references and escaping bare `&`, `<`, `>`.
fn push_text(out: &mut String, text: &str) {
    for (i, c) in text.char_indices() {
        match c {
            '&' if ENTITY_RE.is_match(&text[i..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn push_attr_value(out: &mut String, value: &str) {
    for (i, c) in value.char_indices() {
        match c {
            '&' if ENTITY_RE.is_match(&value[i..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_allowed_structure() {
        let html = "<h1>Title</h1><p>Some <strong>bold</strong> and <em>em</em></p>";
        assert_eq!(sanitize_enml(html), html);
    }

    #[test]
    fn drops_scripts_with_content() {
        let out = sanitize_enml("<p>a<script>alert('x')</script>b</p><style>p{}</style>");
        assert_eq!(out, "<p>ab</p>");
    }

    #[test]
    fn nested_dropped_elements_are_tracked() {
        let out = sanitize_enml("<object><object>x</object>y</object><p>z</p>");
        assert_eq!(out, "<p>z</p>");
    }

    #[test]
    fn unwraps_disallowed_elements() {
        let out = sanitize_enml("<section><article><p>kept</p></article></section>");
        assert_eq!(out, "<p>kept</p>");
    }

    #[test]
    fn strips_disallowed_attributes() {
        let out = sanitize_enml(
            r#"<p class="x" id="y" onclick="evil()">t</p><a href="https://e.com" target="_blank" style="c">l</a>"#,
        );
        assert_eq!(out, r#"<p>t</p><a href="https://e.com">l</a>"#);
    }

    #[test]
    fn strips_javascript_hrefs() {
        let out = sanitize_enml(r#"<a href=" javascript:alert(1)">x</a>"#);
        assert_eq!(out, "<a>x</a>");
    }

    #[test]
    fn self_closes_void_elements() {
        let out = sanitize_enml("line<br>next<hr><en-media hash=\"abc\" type=\"image/png\">");
        assert_eq!(
            out,
            r#"line<br/>next<hr/><en-media hash="abc" type="image/png"/>"#
        );
    }

    #[test]
    fn balances_unclosed_and_stray_tags() {
        assert_eq!(sanitize_enml("<p><b>x</p>"), "<p><b>x</b></p>");
        assert_eq!(sanitize_enml("a</div>b<ul><li>c"), "ab<ul><li>c</li></ul>");
    }

    #[test]
    fn removes_comments_and_declarations() {
        let out = sanitize_enml("<!DOCTYPE html><!-- hidden --><p>v</p><?php x ?>");
        assert_eq!(out, "<p>v</p>");
    }

    #[test]
    fn escapes_bare_ampersands_but_keeps_entities() {
        let out = sanitize_enml("<p>AT&T &amp; 1 < 2 &nbsp;</p>");
        assert_eq!(out, "<p>AT&amp;T &amp; 1 &lt; 2 &nbsp;</p>");
    }

    #[test]
    fn normalizes_todo_checked_values() {
        assert_eq!(
            sanitize_enml(r#"<en-todo checked="checked"/><en-todo checked="false"/>"#),
            r#"<en-todo checked="true"/><en-todo checked="false"/>"#
        );
    }

    #[test]
    fn code_language_attribute_survives() {
        let out = sanitize_enml(r#"<pre><code lang="rust">fn main() {}</code></pre>"#);
        assert_eq!(out, r#"<pre><code lang="rust">fn main() {}</code></pre>"#);
    }
}
