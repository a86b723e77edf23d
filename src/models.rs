//! Core data models used throughout Note Harness.
//!
//! These types cross the boundary between the converters and their callers:
//! attachments flowing in from the note store, conversion results flowing
//! back out, and the find/replace rules fed to the patch engine.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;

use crate::digest::ContentDigest;

/// Default upper bound on a single local attachment (25 MiB).
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

/// A binary resource embedded in or attached to a note.
///
/// `hash` is the identity: two attachments with equal digests are the same
/// attachment regardless of filename or source. `is_new` marks attachments
/// discovered during a conversion, which carry their bytes and must be
/// uploaded; existing attachments are referenced by digest only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub hash: ContentDigest,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(
        default,
        rename = "data",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub is_new: bool,
}

impl Attachment {
    /// An attachment already known to the note store (metadata only).
    pub fn existing(hash: ContentDigest, mime: impl Into<String>, filename: Option<String>) -> Self {
        Self {
            hash,
            mime: mime.into(),
            filename,
            source: None,
            bytes: None,
            is_new: false,
        }
    }

    /// A newly discovered attachment; the digest is computed from `bytes`.
    pub fn new_from_bytes(
        bytes: Vec<u8>,
        mime: impl Into<String>,
        filename: Option<String>,
        source: Option<String>,
    ) -> Self {
        Self {
            hash: ContentDigest::of(&bytes),
            mime: mime.into(),
            filename,
            source,
            bytes: Some(bytes),
            is_new: true,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

fn serialize_base64<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(b) => s.serialize_some(&base64::engine::general_purpose::STANDARD.encode(b)),
        None => s.serialize_none(),
    }
}

fn deserialize_base64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    let encoded: Option<String> = Option::deserialize(d)?;
    encoded
        .map(|e| {
            base64::engine::general_purpose::STANDARD
                .decode(e.as_bytes())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
}

/// Output of a forward conversion: an ENML document plus the attachments
/// it references, in first-reference order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl ConversionResult {
    /// Attachments that must be uploaded alongside the body.
    pub fn new_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_new)
    }
}

/// A single find/replace rule for the patch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub find: String,
    pub replace: String,
    #[serde(default)]
    pub replace_all: bool,
}

impl Replacement {
    pub fn first(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
            replace_all: false,
        }
    }

    pub fn all(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
            replace_all: true,
        }
    }
}

/// Per-rule outcome of a patch: how often `find` occurred, how many were replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementReport {
    pub find: String,
    pub occurrences: usize,
    pub replaced: usize,
}

/// Knobs for a single conversion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOptions {
    /// Directory that relative attachment paths resolve against.
    /// `None` means the process working directory.
    pub base_dir: Option<PathBuf>,
    /// Local files larger than this are not attached.
    pub max_attachment_bytes: u64,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            base_dir: None,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}
