//! Find/replace editing of an existing note through its markdown projection.
//!
//! A patch moves through `Fetched → Converted → Edited` and ends either
//! `Committed` (a new ENML body) or `Aborted`. An aborted patch produces no
//! body at all, so callers cannot accidentally persist a partial edit.

use serde::Serialize;
use std::fmt;

use crate::enml::markdown_to_enml_with_files;
use crate::markdown::enml_to_markdown;
use crate::models::{Attachment, ConversionOptions, ConversionResult, Replacement, ReplacementReport};
use crate::resolve::{FsFiles, LocalFiles};

/// Lifecycle of a single patch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStage {
    Fetched,
    Converted,
    Edited,
    Aborted,
    Committed,
}

/// Why a patch was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// No replacement matched anything.
    NoMatches,
    /// The edited markdown was empty or whitespace only.
    EmptyResult,
}

impl AbortReason {
    pub fn message(self) -> &'static str {
        match self {
            AbortReason::NoMatches => "no matches",
            AbortReason::EmptyResult => "would produce empty content",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PatchOutcome {
    Committed {
        /// The edited markdown that was re-serialized.
        markdown: String,
        #[serde(flatten)]
        result: ConversionResult,
        report: Vec<ReplacementReport>,
    },
    Aborted {
        reason: AbortReason,
        report: Vec<ReplacementReport>,
    },
}

impl PatchOutcome {
    pub fn stage(&self) -> PatchStage {
        match self {
            PatchOutcome::Committed { .. } => PatchStage::Committed,
            PatchOutcome::Aborted { .. } => PatchStage::Aborted,
        }
    }

    pub fn report(&self) -> &[ReplacementReport] {
        match self {
            PatchOutcome::Committed { report, .. } | PatchOutcome::Aborted { report, .. } => report,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, PatchOutcome::Committed { .. })
    }
}

/// Apply `replacements` to the markdown form of `body`, reading any newly
/// referenced local files from disk.
pub fn patch_note(
    body: &str,
    attachments: &[Attachment],
    replacements: &[Replacement],
    options: &ConversionOptions,
) -> PatchOutcome {
    patch_note_with_files(body, attachments, replacements, options, &FsFiles)
}

pub fn patch_note_with_files(
    body: &str,
    attachments: &[Attachment],
    replacements: &[Replacement],
    options: &ConversionOptions,
    files: &dyn LocalFiles,
) -> PatchOutcome {
    tracing::debug!(stage = ?PatchStage::Fetched, bytes = body.len(), "patching note");

    let markdown = enml_to_markdown(body, attachments);
    tracing::debug!(stage = ?PatchStage::Converted, chars = markdown.len());

    let (edited, report) = apply_replacements(&markdown, replacements);
    tracing::debug!(stage = ?PatchStage::Edited, rules = report.len());

    let replaced: usize = report.iter().map(|r| r.replaced).sum();
    if replaced == 0 {
        tracing::info!(reason = %AbortReason::NoMatches, "patch aborted");
        return PatchOutcome::Aborted {
            reason: AbortReason::NoMatches,
            report,
        };
    }
    if edited.trim().is_empty() {
        tracing::warn!(reason = %AbortReason::EmptyResult, "patch aborted");
        return PatchOutcome::Aborted {
            reason: AbortReason::EmptyResult,
            report,
        };
    }

    let result = markdown_to_enml_with_files(&edited, attachments, options, files);
    tracing::info!(
        replaced,
        attachments = result.attachments.len(),
        "patch committed"
    );
    PatchOutcome::Committed {
        markdown: edited,
        result,
        report,
    }
}

/// Apply replacements in order, each one seeing the output of the last.
pub fn apply_replacements(
    markdown: &str,
    replacements: &[Replacement],
) -> (String, Vec<ReplacementReport>) {
    let mut current = markdown.to_string();
    let mut report = Vec::with_capacity(replacements.len());

    for rule in replacements {
        let occurrences = if rule.find.is_empty() {
            0
        } else {
            current.matches(rule.find.as_str()).count()
        };
        let replaced = match (occurrences, rule.replace_all) {
            (0, _) => 0,
            (n, true) => {
                current = current.replace(rule.find.as_str(), &rule.replace);
                n
            }
            (_, false) => {
                current = current.replacen(rule.find.as_str(), &rule.replace, 1);
                1
            }
        };
        report.push(ReplacementReport {
            find: rule.find.clone(),
            occurrences,
            replaced,
        });
    }

    (current, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enml::wrap_enml;

    #[test]
    fn first_only_replaces_one_occurrence() {
        let (out, report) = apply_replacements("TODO: a\nTODO: b\n", &[Replacement::first("TODO:", "DONE:")]);
        assert_eq!(out, "DONE: a\nTODO: b\n");
        assert_eq!(report[0].occurrences, 2);
        assert_eq!(report[0].replaced, 1);
    }

    #[test]
    fn replace_all_counts_every_occurrence() {
        let (out, report) = apply_replacements("x x x", &[Replacement::all("x", "y")]);
        assert_eq!(out, "y y y");
        assert_eq!((report[0].occurrences, report[0].replaced), (3, 3));
    }

    #[test]
    fn replacements_apply_sequentially() {
        let (out, report) = apply_replacements(
            "alpha",
            &[Replacement::first("alpha", "beta"), Replacement::first("beta", "gamma")],
        );
        assert_eq!(out, "gamma");
        assert_eq!(report[1].occurrences, 1);
    }

    #[test]
    fn empty_find_matches_nothing() {
        let (out, report) = apply_replacements("abc", &[Replacement::all("", "z")]);
        assert_eq!(out, "abc");
        assert_eq!(report[0].occurrences, 0);
    }

    #[test]
    fn no_match_aborts() {
        let outcome = patch_note(
            &wrap_enml("<p>hello</p>"),
            &[],
            &[Replacement::first("absent", "x")],
            &ConversionOptions::default(),
        );
        assert_eq!(outcome.stage(), PatchStage::Aborted);
        assert!(matches!(
            outcome,
            PatchOutcome::Aborted {
                reason: AbortReason::NoMatches,
                ..
            }
        ));
    }

    #[test]
    fn erasing_everything_aborts() {
        let outcome = patch_note(
            &wrap_enml("<p>only text</p>"),
            &[],
            &[Replacement::all("only text", "  ")],
            &ConversionOptions::default(),
        );
        match outcome {
            PatchOutcome::Aborted { reason, report } => {
                assert_eq!(reason, AbortReason::EmptyResult);
                assert_eq!(report[0].replaced, 1);
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn commit_reserializes_and_keeps_originals() {
        let hash = crate::digest::ContentDigest::of(b"pic");
        let image = Attachment::existing(hash, "image/png", Some("pic.png".into()));
        let body = wrap_enml(&format!(
            r#"<p>Status: Pending</p><p><en-media hash="{hash}" type="image/png"/></p>"#
        ));

        let outcome = patch_note(
            &body,
            std::slice::from_ref(&image),
            &[Replacement::first("Status: Pending", "Status: Complete")],
            &ConversionOptions::default(),
        );

        let PatchOutcome::Committed { result, report, markdown } = outcome else {
            panic!("expected commit");
        };
        assert_eq!((report[0].occurrences, report[0].replaced), (1, 1));
        assert!(markdown.contains("Status: Complete"));
        assert!(!result.body.contains("Pending"));
        assert!(result.body.contains(&format!(r#"hash="{hash}""#)));
        assert_eq!(result.attachments.len(), 1);
        assert!(!result.attachments[0].is_new);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = PatchOutcome::Aborted {
            reason: AbortReason::NoMatches,
            report: vec![],
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "aborted");
        assert_eq!(json["reason"], "no_matches");
    }
}
