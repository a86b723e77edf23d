//! Tool trait and registry for the conversion tools.
//!
//! Every operation the HTTP server exposes is a [`Tool`]: it names itself,
//! describes its parameters as a JSON Schema, and executes against a
//! [`ToolContext`]. The three built-ins wrap the converters and the patch
//! engine; embedders can register their own tools next to them.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              ToolRegistry                │
//! │  ┌──────────────┐ ┌───────────────────┐  │
//! │  │ Built-in     │ │  Custom (Rust)    │  │
//! │  │ to note      │ │  Tools            │  │
//! │  │ to markdown  │ │                   │  │
//! │  │ patch        │ │                   │  │
//! │  └──────────────┘ └───────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!          run_server() → HTTP API
//! ```
//!
//! # Usage
//!
//! ```rust
//! use note_harness::traits::ToolRegistry;
//!
//! let mut tools = ToolRegistry::with_builtins();
//! assert!(tools.find("patch_note").is_some());
//! // tools.register(Box::new(MyTool::new()));
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::Config;
use crate::enml::markdown_to_enml;
use crate::markdown::enml_to_markdown;
use crate::models::{Attachment, ConversionOptions, Replacement};
use crate::patch::patch_note;

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A tool that clients can discover and call over HTTP.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use serde_json::{json, Value};
/// use note_harness::traits::{Tool, ToolContext};
///
/// pub struct WordCountTool;
///
/// #[async_trait]
/// impl Tool for WordCountTool {
///     fn name(&self) -> &str { "word_count" }
///     fn description(&self) -> &str { "Count words in a markdown string" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({
///             "type": "object",
///             "properties": { "markdown": { "type": "string" } },
///             "required": ["markdown"]
///         })
///     }
///
///     async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<Value> {
///         let words = params["markdown"].as_str().unwrap_or("").split_whitespace().count();
///         Ok(json!({ "words": words }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Route name (`POST /tools/{name}`). Lowercase with underscores.
    fn name(&self) -> &str;

    /// One-line description for discovery.
    fn description(&self) -> &str;

    /// Built-in tools are marked `"builtin": true` in `GET /tools/list`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema for the parameters: `type: "object"`, `properties`, and
    /// optionally `required`.
    fn parameters_schema(&self) -> Value;

    /// Execute with parameters already checked by [`validate_params`].
    ///
    /// The returned value is wrapped in `{ "result": ... }` by the server.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Per-call context handed to [`Tool::execute`].
pub struct ToolContext {
    config: Arc<Config>,
}

impl ToolContext {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        self.config.conversion_options()
    }
}

/// Serializable tool info for the `/tools/list` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub parameters: Value,
}

impl ToolInfo {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            builtin: tool.is_builtin(),
            parameters: tool.parameters_schema(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tool Implementations
// ═══════════════════════════════════════════════════════════════════════

fn attachments_schema() -> Value {
    serde_json::json!({
        "type": "array",
        "description": "Attachments the note already has: [{hash, mime, filename}]",
        "items": {
            "type": "object",
            "properties": {
                "hash": { "type": "string", "description": "Lowercase hex MD5 of the attachment bytes" },
                "mime": { "type": "string" },
                "filename": { "type": "string" }
            },
            "required": ["hash", "mime"]
        }
    })
}

fn attachments_param(params: &Value) -> Result<Vec<Attachment>> {
    match params.get("attachments") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).context("invalid attachments"),
    }
}

fn string_param<'a>(params: &'a Value, name: &str) -> &'a str {
    params[name].as_str().unwrap_or("")
}

/// Conversion work reads local files, so it runs off the async executor.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("conversion task panicked")?
}

/// Built-in forward conversion tool.
pub struct MarkdownToNoteTool;

#[async_trait]
impl Tool for MarkdownToNoteTool {
    fn name(&self) -> &str {
        "markdown_to_note"
    }

    fn description(&self) -> &str {
        "Convert markdown into an ENML note body plus its attachments"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "markdown": { "type": "string", "description": "GitHub-flavored markdown" },
                "attachments": attachments_schema()
            },
            "required": ["markdown"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let markdown = string_param(&params, "markdown").to_string();
        let known = attachments_param(&params)?;
        let options = ctx.conversion_options();

        let result = run_blocking(move || Ok(markdown_to_enml(&markdown, &known, &options))).await?;
        Ok(serde_json::to_value(&result)?)
    }
}

/// Built-in reverse conversion tool.
pub struct NoteToMarkdownTool;

#[async_trait]
impl Tool for NoteToMarkdownTool {
    fn name(&self) -> &str {
        "note_to_markdown"
    }

    fn description(&self) -> &str {
        "Convert an ENML note body into markdown"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "body": { "type": "string", "description": "ENML document or body fragment" },
                "attachments": attachments_schema()
            },
            "required": ["body"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<Value> {
        let body = string_param(&params, "body");
        if body.trim().is_empty() {
            bail!("body must not be empty");
        }
        let known = attachments_param(&params)?;
        let markdown = enml_to_markdown(body, &known);
        Ok(serde_json::json!({ "markdown": markdown }))
    }
}

/// Built-in find/replace patch tool.
pub struct PatchNoteTool;

#[async_trait]
impl Tool for PatchNoteTool {
    fn name(&self) -> &str {
        "patch_note"
    }

    fn description(&self) -> &str {
        "Apply find/replace edits to a note through its markdown form"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "body": { "type": "string", "description": "Current ENML body" },
                "replacements": {
                    "type": "array",
                    "description": "Applied in order: [{find, replace, replace_all}]",
                    "items": {
                        "type": "object",
                        "properties": {
                            "find": { "type": "string" },
                            "replace": { "type": "string" },
                            "replace_all": { "type": "boolean", "default": false }
                        },
                        "required": ["find", "replace"]
                    }
                },
                "attachments": attachments_schema()
            },
            "required": ["body", "replacements"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let body = string_param(&params, "body").to_string();
        if body.trim().is_empty() {
            bail!("body must not be empty");
        }
        let replacements: Vec<Replacement> =
            serde_json::from_value(params["replacements"].clone()).context("invalid replacements")?;
        if replacements.is_empty() {
            bail!("replacements must not be empty");
        }
        let known = attachments_param(&params)?;
        let options = ctx.conversion_options();

        let outcome =
            run_blocking(move || Ok(patch_note(&body, &known, &replacements, &options))).await?;
        Ok(serde_json::to_value(&outcome)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry for tools (built-in and custom Rust).
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Create a registry with the three conversion tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(MarkdownToNoteTool));
        registry.register(Box::new(NoteToMarkdownTool));
        registry.register(Box::new(PatchNoteTool));
        registry
    }

    /// Register a tool. On a name clash [`find`](Self::find) returns the
    /// earlier registration.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| ToolInfo::of(t.as_ref())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Parameter validation
// ═══════════════════════════════════════════════════════════════════════

/// Check `params` against a tool's JSON Schema and fill in top-level defaults.
///
/// Walks `type`, `required`, `properties` and array `items`, so a malformed
/// entry inside a list parameter is reported with its path
/// (`replacements[1].find`) before the tool runs.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let Some(given) = params.as_object() else {
        bail!("parameters must be a JSON object, got {}", kind_of(params));
    };
    check_object(schema, given, "")?;

    let mut filled = given.clone();
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, property) in properties {
            if let Some(default) = property.get("default") {
                filled
                    .entry(name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }
    Ok(Value::Object(filled))
}

fn check_object(schema: &Value, object: &Map<String, Value>, path: &str) -> Result<()> {
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for name in required {
        if !object.contains_key(name) {
            bail!("missing required parameter: {}", join_path(path, name));
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (name, property) in properties {
        if let Some(value) = object.get(name) {
            check_value(property, value, &join_path(path, name))?;
        }
    }
    Ok(())
}

fn check_value(schema: &Value, value: &Value, path: &str) -> Result<()> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let matches = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !matches {
            bail!(
                "parameter '{}' must be of type '{}', got {}",
                path,
                expected,
                kind_of(value)
            );
        }
    }

    match value {
        Value::Object(object) => check_object(schema, object, path),
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, item)| check_value(item_schema, item, &format!("{path}[{i}]"))),
            None => Ok(()),
        },
        _ => Ok(()),
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
