//! Attachment resolution for image and link targets.
//!
//! The forward converter hands every image/link target it meets to a
//! [`Resolver`], which classifies it:
//!
//! | Target | Outcome |
//! |--------|---------|
//! | `resource:<hex>` already in the registry | existing attachment, no bytes |
//! | local path, `~/…`, or `file:` URL | read, hashed, registered as new |
//! | `data:<mime>;base64,…` | decoded, hashed, registered as new |
//! | anything else (http, mailto, fragments) | [`ResolveError::NotLocal`] |
//!
//! Remote URLs are never fetched. Every failure is returned as a
//! [`ResolveError`]; the converter logs it and keeps a plain link instead.

use base64::Engine;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::attachments::AttachmentRegistry;
use crate::digest::{ContentDigest, RESOURCE_SCHEME};
use crate::models::{Attachment, ConversionOptions};

/// Why a target could not be turned into an attachment.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not a local reference: {0}")]
    NotLocal(String),
    #[error("unknown resource digest: {0}")]
    UnknownResource(ContentDigest),
    #[error("malformed resource reference: {0}")]
    BadResource(String),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} exceeds the attachment size limit ({limit} bytes)", path.display())]
    TooLarge { path: PathBuf, limit: u64 },
    #[error("invalid data URI: {0}")]
    BadDataUri(String),
}

/// Read-only access to local files.
///
/// Implementations return at most `limit + 1` bytes so callers can detect
/// oversized files without loading them whole.
pub trait LocalFiles: Send + Sync {
    fn read(&self, path: &Path, limit: u64) -> std::io::Result<Vec<u8>>;
}

/// [`LocalFiles`] backed by the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsFiles;

impl LocalFiles for FsFiles {
    fn read(&self, path: &Path, limit: u64) -> std::io::Result<Vec<u8>> {
        let file = std::fs::File::open(path)?;
        let mut out = Vec::new();
        file.take(limit.saturating_add(1)).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Classification of a raw image/link target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Resource(ContentDigest),
    Local(PathBuf),
    Data(String),
    Remote,
}

impl Target {
    /// Whether resolution should be attempted for a hyperlink with this target.
    pub fn is_attachable(&self) -> bool {
        !matches!(self, Target::Remote)
    }
}

/// Classify `target`, resolving relative paths against `base_dir`.
pub fn classify(target: &str, base_dir: Option<&Path>) -> Target {
    let target = target.trim();
    if target.is_empty() || target.starts_with('#') {
        return Target::Remote;
    }
    if let Some(rest) = target.strip_prefix(RESOURCE_SCHEME) {
        return match rest.parse() {
            Ok(digest) => Target::Resource(digest),
            Err(_) => Target::Remote,
        };
    }
    if target.starts_with("data:") {
        return Target::Data(target.to_string());
    }
    if target.starts_with("file:") {
        return match url::Url::parse(target).ok().and_then(|u| u.to_file_path().ok()) {
            Some(path) => Target::Local(path),
            None => Target::Remote,
        };
    }
    if has_url_scheme(target) {
        return Target::Remote;
    }

    let expanded = shellexpand::tilde(target);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        Target::Local(path)
    } else {
        match base_dir {
            Some(base) => Target::Local(base.join(path)),
            None => Target::Local(path),
        }
    }
}

/// `scheme:` prefix per RFC 3986. Single letters are treated as Windows drive letters.
fn has_url_scheme(target: &str) -> bool {
    match target.find(':') {
        Some(pos) if pos > 1 => {
            let scheme = &target[..pos];
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

/// Resolves targets into registry entries for one conversion.
pub struct Resolver<'a> {
    files: &'a dyn LocalFiles,
    options: &'a ConversionOptions,
}

impl<'a> Resolver<'a> {
    pub fn new(files: &'a dyn LocalFiles, options: &'a ConversionOptions) -> Self {
        Self { files, options }
    }

    pub fn classify(&self, target: &str) -> Target {
        classify(target, self.options.base_dir.as_deref())
    }

    /// Resolve `target` and register the result, returning the stored entry.
    pub fn resolve(
        &self,
        target: &str,
        registry: &mut AttachmentRegistry,
    ) -> Result<Attachment, ResolveError> {
        match self.classify(target) {
            Target::Resource(digest) => registry
                .get(&digest)
                .cloned()
                .ok_or(ResolveError::UnknownResource(digest)),
            Target::Local(path) => {
                let attachment = self.read_local(&path, target)?;
                Ok(registry.register(attachment).clone())
            }
            Target::Data(uri) => {
                let attachment = decode_data_uri(&uri)?;
                Ok(registry.register(attachment).clone())
            }
            Target::Remote if target.trim().starts_with(RESOURCE_SCHEME) => {
                Err(ResolveError::BadResource(target.to_string()))
            }
            Target::Remote => Err(ResolveError::NotLocal(target.to_string())),
        }
    }

    fn read_local(&self, path: &Path, source: &str) -> Result<Attachment, ResolveError> {
        let limit = self.options.max_attachment_bytes;
        let bytes = self
            .files
            .read(path, limit)
            .map_err(|source| ResolveError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if bytes.len() as u64 > limit {
            return Err(ResolveError::TooLarge {
                path: path.to_path_buf(),
                limit,
            });
        }

        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());

        Ok(Attachment::new_from_bytes(
            bytes,
            mime,
            filename,
            Some(source.to_string()),
        ))
    }
}

/// Decode a base64 `data:` URI into a new attachment.
fn decode_data_uri(uri: &str) -> Result<Attachment, ResolveError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| ResolveError::BadDataUri("missing data: prefix".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| ResolveError::BadDataUri("missing ',' separator".to_string()))?;

    let mut parts = header.split(';');
    let mime = match parts.next().map(str::trim) {
        Some(m) if !m.is_empty() => m.to_ascii_lowercase(),
        _ => "text/plain".to_string(),
    };
    if !parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(ResolveError::BadDataUri(
            "only base64 data URIs are supported".to_string(),
        ));
    }

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ResolveError::BadDataUri(e.to_string()))?;

    Ok(Attachment::new_from_bytes(bytes, mime, None, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MemoryFiles(BTreeMap<PathBuf, Vec<u8>>);

    impl LocalFiles for MemoryFiles {
        fn read(&self, path: &Path, limit: u64) -> std::io::Result<Vec<u8>> {
            match self.0.get(path) {
                Some(b) => Ok(b.iter().take(limit as usize + 1).copied().collect()),
                None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing")),
            }
        }
    }

    fn files(entries: &[(&str, &[u8])]) -> MemoryFiles {
        MemoryFiles(
            entries
                .iter()
                .map(|(p, b)| (PathBuf::from(p), b.to_vec()))
                .collect(),
        )
    }

    #[test]
    fn classify_targets() {
        let base = Path::new("/notes");
        let d = ContentDigest::of(b"x");
        assert_eq!(classify(&d.to_resource_url(), Some(base)), Target::Resource(d));
        assert_eq!(classify("https://example.com/a.png", Some(base)), Target::Remote);
        assert_eq!(classify("mailto:a@b.c", Some(base)), Target::Remote);
        assert_eq!(classify("#section", Some(base)), Target::Remote);
        assert_eq!(
            classify("img/a.png", Some(base)),
            Target::Local(PathBuf::from("/notes/img/a.png"))
        );
        assert_eq!(
            classify("/abs/a.png", Some(base)),
            Target::Local(PathBuf::from("/abs/a.png"))
        );
        assert_eq!(
            classify("file:///tmp/a.png", None),
            Target::Local(PathBuf::from("/tmp/a.png"))
        );
        assert!(matches!(classify("data:image/png;base64,AA==", None), Target::Data(_)));
    }

    #[test]
    fn tilde_expands_to_an_absolute_path() {
        match classify("~/pics/a.png", None) {
            Target::Local(p) => assert!(p.ends_with("pics/a.png")),
            other => panic!("expected local target, got {:?}", other),
        }
    }

    #[test]
    fn local_file_becomes_new_attachment_with_guessed_mime() {
        let fs = files(&[("/notes/a.png", &b"png-bytes"[..])]);
        let options = ConversionOptions {
            base_dir: Some(PathBuf::from("/notes")),
            ..Default::default()
        };
        let resolver = Resolver::new(&fs, &options);
        let mut registry = AttachmentRegistry::new();

        let a = resolver.resolve("a.png", &mut registry).unwrap();
        assert!(a.is_new);
        assert_eq!(a.mime, "image/png");
        assert_eq!(a.filename.as_deref(), Some("a.png"));
        assert_eq!(a.hash, ContentDigest::of(b"png-bytes"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let fs = files(&[]);
        let options = ConversionOptions::default();
        let resolver = Resolver::new(&fs, &options);
        let mut registry = AttachmentRegistry::new();

        let err = resolver.resolve("nope.png", &mut registry).unwrap_err();
        assert!(matches!(err, ResolveError::Read { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn oversized_file_is_rejected() {
        let fs = files(&[("/big.bin", &[0u8; 16][..])]);
        let options = ConversionOptions {
            base_dir: None,
            max_attachment_bytes: 8,
        };
        let resolver = Resolver::new(&fs, &options);
        let err = resolver
            .resolve("/big.bin", &mut AttachmentRegistry::new())
            .unwrap_err();
        assert!(matches!(err, ResolveError::TooLarge { limit: 8, .. }));
    }

    #[test]
    fn unknown_resource_is_not_resolved() {
        let fs = files(&[]);
        let options = ConversionOptions::default();
        let resolver = Resolver::new(&fs, &options);
        let d = ContentDigest::of(b"never registered");
        let err = resolver
            .resolve(&d.to_resource_url(), &mut AttachmentRegistry::new())
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownResource(x) if x == d));
    }

    #[test]
    fn data_uri_decodes() {
        let fs = files(&[]);
        let options = ConversionOptions::default();
        let resolver = Resolver::new(&fs, &options);
        let mut registry = AttachmentRegistry::new();

        let a = resolver
            .resolve("data:image/gif;base64,R0lGODlh", &mut registry)
            .unwrap();
        assert_eq!(a.mime, "image/gif");
        assert_eq!(a.bytes.as_deref(), Some(&b"GIF89a"[..]));

        let err = resolver
            .resolve("data:text/plain,hello", &mut registry)
            .unwrap_err();
        assert!(matches!(err, ResolveError::BadDataUri(_)));
    }

    #[test]
    fn remote_urls_are_never_fetched() {
        let fs = files(&[]);
        let options = ConversionOptions::default();
        let resolver = Resolver::new(&fs, &options);
        let err = resolver
            .resolve("https://example.com/cat.png", &mut AttachmentRegistry::new())
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotLocal(_)));
    }
}
