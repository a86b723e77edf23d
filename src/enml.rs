//! Forward conversion: markdown → ENML.
//!
//! The pipeline has three passes:
//!
//! 1. **Render.** pulldown-cmark parses the text; its event stream is
//!    rewritten so every image (and every link with a local or
//!    `resource:` target) goes through the [`Resolver`] and becomes an
//!    `<en-media>` element. Targets that fail to resolve stay plain links.
//!    Task list markers become `<en-todo>` directly, so checkbox syntax
//!    inside code blocks is never touched.
//! 2. **Schema rewrites.** Checkbox inputs written as raw HTML become
//!    `<en-todo>`; fenced code languages move from `class` to `lang`;
//!    table alignment moves from `style` to `align`.
//! 3. **Sanitize.** The HTML is filtered through the ENML allow-list and
//!    wrapped in the `<en-note>` envelope.

use pulldown_cmark::{html, CowStr, Event, LinkType, Options, Parser, Tag, TagEnd};
use regex::Regex;
use std::sync::LazyLock;

use crate::attachments::AttachmentRegistry;
use crate::models::{Attachment, ConversionOptions, ConversionResult};
use crate::resolve::{FsFiles, LocalFiles, ResolveError, Resolver};
use crate::sanitize::sanitize_enml;

pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
pub const ENML_DOCTYPE: &str =
    r#"<!DOCTYPE en-note SYSTEM "http://xml.evernote.com/pub/enml2.dtd">"#;

static CHECKBOX_INPUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<input\b[^>]*\btype\s*=\s*["']?checkbox["']?[^>]*>\s?"#)
        .expect("checkbox pattern is valid")
});

static CHECKED_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bchecked\b").expect("checked pattern is valid"));

static CODE_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<code class="language-([^"\s]+)[^"]*">"#).expect("code class pattern is valid")
});

static CELL_ALIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(th|td) style="text-align: (left|center|right)">"#)
        .expect("cell alignment pattern is valid")
});

/// Convert markdown into an ENML document, reading local attachments from disk.
///
/// `existing` lists attachments the note already has; references to them
/// (`resource:<hex>`) are kept without re-uploading.
pub fn markdown_to_enml(
    markdown: &str,
    existing: &[Attachment],
    options: &ConversionOptions,
) -> ConversionResult {
    markdown_to_enml_with_files(markdown, existing, options, &FsFiles)
}

/// [`markdown_to_enml`] with an explicit filesystem collaborator.
pub fn markdown_to_enml_with_files(
    markdown: &str,
    existing: &[Attachment],
    options: &ConversionOptions,
    files: &dyn LocalFiles,
) -> ConversionResult {
    let mut registry = AttachmentRegistry::with_existing(existing);
    let resolver = Resolver::new(files, options);

    let rendered = render_html(markdown, &resolver, &mut registry);
    let normalized = rewrite_schema_elements(&rendered);
    let content = sanitize_enml(&normalized);

    let attachments = registry.into_list();
    tracing::debug!(
        attachments = attachments.len(),
        new = attachments.iter().filter(|a| a.is_new).count(),
        "converted markdown to ENML"
    );

    ConversionResult {
        body: wrap_enml(content.trim()),
        attachments,
    }
}

/// Wrap body content in the XML declaration, doctype and `<en-note>` root.
pub fn wrap_enml(content: &str) -> String {
    format!("{XML_DECLARATION}\n{ENML_DOCTYPE}\n<en-note>{content}</en-note>")
}

fn markdown_options() -> Options {
    Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS
}

/// A link or image whose events are buffered until its end tag.
struct Frame<'a> {
    is_image: bool,
    link_type: LinkType,
    dest_url: CowStr<'a>,
    title: CowStr<'a>,
    id: CowStr<'a>,
    inner: Vec<Event<'a>>,
}

impl<'a> Frame<'a> {
    fn start_link(&self) -> Event<'a> {
        Event::Start(Tag::Link {
            link_type: self.link_type,
            dest_url: self.dest_url.clone(),
            title: self.title.clone(),
            id: self.id.clone(),
        })
    }

    fn plain_text(&self) -> String {
        let mut text = String::new();
        for event in &self.inner {
            match event {
                Event::Text(t) | Event::Code(t) => text.push_str(t),
                Event::SoftBreak | Event::HardBreak => text.push(' '),
                _ => {}
            }
        }
        text
    }
}

/// Render markdown to HTML, routing image and link targets through the resolver.
fn render_html(markdown: &str, resolver: &Resolver<'_>, registry: &mut AttachmentRegistry) -> String {
    let mut output: Vec<Event<'_>> = Vec::new();
    let mut frames: Vec<Frame<'_>> = Vec::new();

    for event in Parser::new_ext(markdown, markdown_options()) {
        match event {
            Event::Start(Tag::Image {
                link_type,
                dest_url,
                title,
                id,
            }) => frames.push(Frame {
                is_image: true,
                link_type,
                dest_url,
                title,
                id,
                inner: Vec::new(),
            }),
            Event::Start(Tag::Link {
                link_type,
                dest_url,
                title,
                id,
            }) => frames.push(Frame {
                is_image: false,
                link_type,
                dest_url,
                title,
                id,
                inner: Vec::new(),
            }),
            Event::TaskListMarker(checked) => {
                output.push(Event::InlineHtml(CowStr::from(todo_tag(checked))))
            }
            Event::End(TagEnd::Image) | Event::End(TagEnd::Link) => {
                let Some(frame) = frames.pop() else { continue };
                let replaced = finish_frame(frame, resolver, registry);
                match frames.last_mut() {
                    Some(parent) => parent.inner.extend(replaced),
                    None => output.extend(replaced),
                }
            }
            other => match frames.last_mut() {
                Some(frame) => frame.inner.push(other),
                None => output.push(other),
            },
        }
    }

    let mut html_out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut html_out, output.into_iter());
    html_out
}

fn finish_frame<'a>(
    frame: Frame<'a>,
    resolver: &Resolver<'_>,
    registry: &mut AttachmentRegistry,
) -> Vec<Event<'a>> {
    let label = frame.plain_text();

    if !frame.is_image && !resolver.classify(&frame.dest_url).is_attachable() {
        return relink(frame);
    }

    match resolver.resolve(&frame.dest_url, registry) {
        Ok(attachment) => {
            let alt = if label.trim().is_empty() {
                frame.title.to_string()
            } else {
                label
            };
            vec![Event::InlineHtml(CowStr::from(media_tag(&attachment, &alt)))]
        }
        Err(err) => {
            log_unresolved(&frame.dest_url, frame.is_image, &err);
            if frame.is_image {
                let text = if label.trim().is_empty() {
                    frame.dest_url.to_string()
                } else {
                    label
                };
                vec![
                    frame.start_link(),
                    Event::Text(CowStr::from(text)),
                    Event::End(TagEnd::Link),
                ]
            } else {
                relink(frame)
            }
        }
    }
}

fn relink(frame: Frame<'_>) -> Vec<Event<'_>> {
    let mut events = Vec::with_capacity(frame.inner.len() + 2);
    events.push(frame.start_link());
    events.extend(frame.inner);
    events.push(Event::End(TagEnd::Link));
    events
}

fn log_unresolved(target: &str, is_image: bool, err: &ResolveError) {
    match err {
        ResolveError::NotLocal(_) => {
            tracing::debug!(target = %target, "remote reference kept as link")
        }
        // Missing link targets are usually references to other notes.
        ResolveError::Read { .. } if !is_image => {
            tracing::debug!(target = %target, error = %err, "link target not attached")
        }
        _ => tracing::warn!(target = %target, error = %err, "attachment not resolved, keeping link"),
    }
}

/// The `<en-media>` element for a resolved attachment.
fn media_tag(attachment: &Attachment, alt: &str) -> String {
    let mut tag = format!(
        r#"<en-media hash="{}" type="{}""#,
        attachment.hash,
        escape_attr(&attachment.mime)
    );
    if !alt.trim().is_empty() {
        tag.push_str(&format!(r#" alt="{}""#, escape_attr(alt.trim())));
    }
    tag.push_str("/>");
    tag
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Targeted rewrites for elements the markdown renderer does not model.
fn rewrite_schema_elements(html: &str) -> String {
    let html = CHECKBOX_INPUT_RE.replace_all(html, |caps: &regex::Captures<'_>| {
        todo_tag(CHECKED_ATTR_RE.is_match(&caps[0]))
    });
    let html = CODE_CLASS_RE.replace_all(&html, r#"<code lang="$1">"#);
    CELL_ALIGN_RE
        .replace_all(&html, r#"<$1 align="$2">"#)
        .into_owned()
}

fn todo_tag(checked: bool) -> String {
    format!(r#"<en-todo checked="{checked}"/>"#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ContentDigest;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    struct MemoryFiles(BTreeMap<PathBuf, Vec<u8>>);

    impl LocalFiles for MemoryFiles {
        fn read(&self, path: &Path, _limit: u64) -> std::io::Result<Vec<u8>> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
        }
    }

    fn convert(markdown: &str) -> ConversionResult {
        markdown_to_enml_with_files(
            markdown,
            &[],
            &ConversionOptions::default(),
            &MemoryFiles(BTreeMap::new()),
        )
    }

    fn content(result: &ConversionResult) -> &str {
        let start = result.body.find("<en-note>").unwrap() + "<en-note>".len();
        let end = result.body.rfind("</en-note>").unwrap();
        &result.body[start..end]
    }

    #[test]
    fn wraps_output_in_enml_envelope() {
        let result = convert("hello");
        assert!(result.body.starts_with(XML_DECLARATION));
        assert!(result.body.contains(ENML_DOCTYPE));
        assert!(result.body.ends_with("</en-note>"));
        assert_eq!(content(&result), "<p>hello</p>");
    }

    #[test]
    fn task_items_become_en_todo() {
        let result = convert("- [ ] open\n- [x] done\n");
        let body = content(&result);
        assert!(body.contains(r#"<li><en-todo checked="false"/>open</li>"#), "{body}");
        assert!(body.contains(r#"<li><en-todo checked="true"/>done</li>"#), "{body}");
        assert!(!body.contains("input"));
    }

    #[test]
    fn task_syntax_inside_code_fence_is_untouched() {
        let result = convert("```\n- [ ] not a task\n```\n");
        let body = content(&result);
        assert!(body.contains("- [ ] not a task"), "{body}");
        assert!(!body.contains("en-todo"));
    }

    #[test]
    fn task_syntax_inside_indented_code_is_untouched() {
        let result = convert("Example:\n\n    - [ ] literal\n    - [x] also literal\n");
        let body = content(&result);
        assert!(body.contains("<pre><code>- [ ] literal\n- [x] also literal"), "{body}");
        assert!(!body.contains("en-todo"), "{body}");
    }

    #[test]
    fn ordered_quoted_and_empty_task_items() {
        let result = convert("1. [x] first\n2. [ ] \n3. [ ] third\n");
        let body = content(&result);
        assert!(body.contains(r#"<li><en-todo checked="true"/>first</li>"#), "{body}");
        assert!(body.contains(r#"<li><en-todo checked="false"/></li>"#), "{body}");
        assert!(body.contains(r#"<li><en-todo checked="false"/>third</li>"#), "{body}");

        let result = convert("> - [ ] quoted\n");
        let body = content(&result);
        assert!(body.starts_with("<blockquote>"), "{body}");
        assert!(body.contains(r#"<li><en-todo checked="false"/>quoted</li>"#), "{body}");
    }

    #[test]
    fn raw_checkbox_input_becomes_en_todo() {
        let result = convert(r#"Ship it <input type="checkbox" checked> today"#);
        assert_eq!(
            content(&result),
            r#"<p>Ship it <en-todo checked="true"/>today</p>"#
        );
    }

    #[test]
    fn inline_en_todo_passes_through() {
        let result = convert(r#"Buy <en-todo checked="true"/> milk"#);
        assert_eq!(
            content(&result),
            r#"<p>Buy <en-todo checked="true"/> milk</p>"#
        );
    }

    #[test]
    fn fenced_code_language_moves_to_lang() {
        let result = convert("```rust\nfn main() {}\n```\n");
        assert!(content(&result).contains(r#"<pre><code lang="rust">fn main() {}"#));
    }

    #[test]
    fn tables_and_emphasis_survive() {
        let result = convert("| a | b |\n|---|---|\n| *c* | **d** |\n\n~~gone~~\n");
        let body = content(&result);
        assert!(body.contains("<table>"));
        assert!(body.contains("<th>a</th>"));
        assert!(body.contains("<em>c</em>"));
        assert!(body.contains("<strong>d</strong>"));
        assert!(body.contains("<del>gone</del>"));
    }

    #[test]
    fn column_alignment_becomes_align_attribute() {
        let result = convert("| l | r |\n|:--|--:|\n| 1 | 2 |\n");
        let body = content(&result);
        assert!(body.contains(r#"<th align="left">l</th>"#), "{body}");
        assert!(body.contains(r#"<td align="right">2</td>"#), "{body}");
        assert!(!body.contains("style"));
    }

    #[test]
    fn raw_html_is_sanitized() {
        let result = convert("<div onclick=\"x()\">hi</div>\n\n<script>alert(1)</script>\n");
        let body = content(&result);
        assert!(body.contains("<div>hi</div>"));
        assert!(!body.contains("script"));
        assert!(!body.contains("onclick"));
    }

    #[test]
    fn remote_image_becomes_link() {
        let result = convert("![cat](https://example.com/cat.png)");
        assert_eq!(
            content(&result),
            r#"<p><a href="https://example.com/cat.png">cat</a></p>"#
        );
        assert!(result.attachments.is_empty());
    }

    #[test]
    fn missing_local_image_degrades_to_link() {
        let result = convert("![shot](missing.png)");
        assert!(content(&result).contains(r#"<a href="missing.png">shot</a>"#));
        assert!(result.attachments.is_empty());
    }

    #[test]
    fn local_image_becomes_en_media_once() {
        let mut files = BTreeMap::new();
        files.insert(PathBuf::from("/n/a.png"), b"pixels".to_vec());
        let options = ConversionOptions {
            base_dir: Some(PathBuf::from("/n")),
            ..Default::default()
        };
        let result = markdown_to_enml_with_files(
            "![one](a.png) and ![two](/n/a.png)",
            &[],
            &options,
            &MemoryFiles(files),
        );

        let hash = ContentDigest::of(b"pixels");
        assert_eq!(result.attachments.len(), 1);
        assert!(result.attachments[0].is_new);
        assert_eq!(result.attachments[0].mime, "image/png");
        let body = content(&result);
        assert_eq!(body.matches(&format!(r#"hash="{hash}""#)).count(), 2);
        assert!(body.contains(r#"type="image/png" alt="one"/>"#));
    }

    #[test]
    fn existing_resource_reference_is_not_reuploaded() {
        let hash = ContentDigest::of(b"stored pdf");
        let existing = Attachment::existing(hash, "application/pdf", Some("doc.pdf".into()));
        let result = markdown_to_enml_with_files(
            &format!("[doc.pdf]({})", hash.to_resource_url()),
            &[existing],
            &ConversionOptions::default(),
            &MemoryFiles(BTreeMap::new()),
        );

        assert_eq!(result.attachments.len(), 1);
        assert!(!result.attachments[0].is_new);
        assert!(result.new_attachments().next().is_none());
        assert!(content(&result).contains(&format!(
            r#"<en-media hash="{hash}" type="application/pdf" alt="doc.pdf"/>"#
        )));
    }

    #[test]
    fn unknown_resource_reference_stays_a_link() {
        let hash = ContentDigest::of(b"who knows");
        let result = convert(&format!("![x]({})", hash.to_resource_url()));
        assert!(content(&result).contains(&format!(r#"<a href="resource:{hash}">x</a>"#)));
        assert!(result.attachments.is_empty());
    }

    #[test]
    fn linked_image_keeps_outer_link() {
        let result = convert("[![logo](https://e.com/l.png)](https://e.com)");
        let body = content(&result);
        assert!(body.contains(r#"<a href="https://e.com">"#), "{body}");
        assert!(body.contains(r#"<a href="https://e.com/l.png">logo</a>"#), "{body}");
    }
}
