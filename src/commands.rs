//! Implementations behind the `nh` subcommands.
//!
//! Each `run_*` function reads its inputs from disk, calls into the library
//! and writes the result to stdout (or `--out`). Diagnostics go to stderr so
//! the primary output can be piped.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::enml::markdown_to_enml;
use crate::markdown::enml_to_markdown;
use crate::models::{Attachment, ConversionOptions, Replacement};
use crate::patch::{patch_note, PatchOutcome};
use crate::traits::ToolRegistry;

/// Read a whole input file; `-` means stdin.
pub fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Load attachment metadata (`[{hash, mime, filename?}]`) from a JSON file.
pub fn load_attachment_metadata(path: Option<&Path>) -> Result<Vec<Attachment>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read attachment metadata: {}", path.display()))?;
    let attachments: Vec<Attachment> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid attachment metadata in {}", path.display()))?;
    Ok(attachments)
}

fn write_output(out: Option<&Path>, content: &str) -> Result<()> {
    match out {
        Some(path) => std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            print!("{content}");
            if !content.ends_with('\n') {
                println!();
            }
            Ok(())
        }
    }
}

/// Conversion options for a CLI input: relative attachment paths resolve
/// against the input file's directory unless `[conversion].base_dir` is set.
fn options_for_input(config: &Config, input: &Path) -> ConversionOptions {
    let mut options = config.conversion_options();
    if options.base_dir.is_none() && input != Path::new("-") {
        options.base_dir = input.parent().map(Path::to_path_buf);
    }
    options
}

pub fn run_to_enml(
    config: &Config,
    input: &Path,
    attachments: Option<&Path>,
    out: Option<&Path>,
    json: bool,
) -> Result<()> {
    let markdown = read_input(input)?;
    let known = load_attachment_metadata(attachments)?;

    let options = options_for_input(config, input);
    let result = markdown_to_enml(&markdown, &known, &options);

    if json {
        write_output(out, &serde_json::to_string_pretty(&result)?)?;
    } else {
        write_output(out, &result.body)?;
    }

    for attachment in &result.attachments {
        eprintln!(
            "  {} {} {} ({})",
            attachment.hash,
            attachment.mime,
            attachment.filename.as_deref().unwrap_or("-"),
            if attachment.is_new { "new" } else { "existing" }
        );
    }
    Ok(())
}

pub fn run_to_markdown(input: &Path, attachments: Option<&Path>, out: Option<&Path>) -> Result<()> {
    let body = read_input(input)?;
    let known = load_attachment_metadata(attachments)?;
    write_output(out, &enml_to_markdown(&body, &known))
}

/// Arguments for `nh patch`.
pub struct PatchArgs {
    pub input: PathBuf,
    pub find: Vec<String>,
    pub replace: Vec<String>,
    pub all: bool,
    pub attachments: Option<PathBuf>,
    pub out: Option<PathBuf>,
    pub json: bool,
}

/// Returns `Ok(false)` when the patch aborted.
pub fn run_patch(config: &Config, args: PatchArgs) -> Result<bool> {
    if args.find.len() != args.replace.len() {
        bail!(
            "each --find needs a matching --replace ({} finds, {} replaces)",
            args.find.len(),
            args.replace.len()
        );
    }
    let body = read_input(&args.input)?;
    let known = load_attachment_metadata(args.attachments.as_deref())?;
    let replacements: Vec<Replacement> = args
        .find
        .into_iter()
        .zip(args.replace)
        .map(|(find, replace)| Replacement {
            find,
            replace,
            replace_all: args.all,
        })
        .collect();

    let options = options_for_input(config, &args.input);
    let outcome = patch_note(&body, &known, &replacements, &options);

    for entry in outcome.report() {
        eprintln!(
            "  {:?}: {} occurrence(s), {} replaced",
            entry.find, entry.occurrences, entry.replaced
        );
    }

    if args.json {
        write_output(args.out.as_deref(), &serde_json::to_string_pretty(&outcome)?)?;
        return Ok(outcome.is_committed());
    }

    match outcome {
        PatchOutcome::Committed { result, .. } => {
            write_output(args.out.as_deref(), &result.body)?;
            Ok(true)
        }
        PatchOutcome::Aborted { reason, .. } => {
            eprintln!("Patch aborted: {reason}");
            Ok(false)
        }
    }
}

pub fn run_list_tools() -> Result<()> {
    let registry = ToolRegistry::with_builtins();
    for info in registry.infos() {
        let required = info
            .parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| {
                r.iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        println!("{:<18} {}", info.name, info.description);
        println!("{:<18} required: {}", "", required);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_metadata_round_trips_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(
            &path,
            r#"[{"hash":"5eb63bbbe01eeed093cb22bb8f5acdc3","mime":"image/png","filename":"hello.png"}]"#,
        )
        .unwrap();

        let attachments = load_attachment_metadata(Some(&path)).unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename.as_deref(), Some("hello.png"));
        assert!(load_attachment_metadata(None).unwrap().is_empty());
    }

    #[test]
    fn input_directory_is_the_default_base_dir() {
        let config = Config::minimal();
        let options = options_for_input(&config, Path::new("/notes/today.md"));
        assert_eq!(options.base_dir.as_deref(), Some(Path::new("/notes")));
        assert!(options_for_input(&config, Path::new("-")).base_dir.is_none());

        let mut configured = Config::minimal();
        configured.conversion.base_dir = Some(PathBuf::from("/assets"));
        let options = options_for_input(&configured, Path::new("/notes/today.md"));
        assert_eq!(options.base_dir.as_deref(), Some(Path::new("/assets")));
    }

    #[test]
    fn mismatched_find_and_replace_counts_fail() {
        let args = PatchArgs {
            input: PathBuf::from("unused.enml"),
            find: vec!["a".into(), "b".into()],
            replace: vec!["c".into()],
            all: false,
            attachments: None,
            out: None,
            json: false,
        };
        let err = run_patch(&Config::minimal(), args).unwrap_err();
        assert!(err.to_string().contains("matching --replace"));
    }
}
