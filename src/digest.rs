//! Content digests and the `resource:` pseudo-URL scheme.
//!
//! Every attachment is identified by the MD5 digest of its bytes. The note
//! store computes the same digest for resource bodies, so a digest produced
//! here can be compared directly against the `hash` attribute of an
//! `<en-media>` element or the body hash the store reports.
//!
//! Inside markdown an attachment is referenced as `resource:<hex>`, where
//! `<hex>` is the 32-character lowercase hex encoding of the digest.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scheme prefix for attachment references inside markdown.
pub const RESOURCE_SCHEME: &str = "resource:";

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 16;

/// Error returned when a string is not a valid hex digest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest must be {expected} hex characters, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("digest is not valid hex: {0}")]
    BadHex(String),
}

/// A 16-byte content digest identifying an attachment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl ContentDigest {
    /// Compute the digest of a byte buffer. Empty buffers hash like any other input.
    pub fn of(bytes: &[u8]) -> Self {
        Self(md5::compute(bytes).0)
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The `resource:<hex>` pseudo-URL for this digest.
    pub fn to_resource_url(&self) -> String {
        format!("{}{}", RESOURCE_SCHEME, self.to_hex())
    }

    /// Parse a `resource:<hex>` pseudo-URL. Returns `None` for any other target.
    pub fn from_resource_url(target: &str) -> Option<Self> {
        let rest = target.trim().strip_prefix(RESOURCE_SCHEME)?;
        rest.parse().ok()
    }
}

impl FromStr for ContentDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != DIGEST_LEN * 2 {
            return Err(DigestError::BadLength {
                expected: DIGEST_LEN * 2,
                actual: s.len(),
            });
        }
        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut out)
            .map_err(|e| DigestError::BadHex(e.to_string()))?;
        Ok(Self(out))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let a = ContentDigest::of(b"hello world");
        let b = ContentDigest::of(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn empty_buffer_has_known_digest() {
        assert_eq!(
            ContentDigest::of(b"").to_hex(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn parse_accepts_uppercase_and_normalizes() {
        let d: ContentDigest = "5EB63BBBE01EEED093CB22BB8F5ACDC3".parse().unwrap();
        assert_eq!(d.to_string(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn parse_rejects_wrong_length_and_bad_hex() {
        assert!(matches!(
            "abc".parse::<ContentDigest>(),
            Err(DigestError::BadLength { actual: 3, .. })
        ));
        assert!(matches!(
            "zz".repeat(16).parse::<ContentDigest>(),
            Err(DigestError::BadHex(_))
        ));
    }

    #[test]
    fn resource_url_round_trip() {
        let d = ContentDigest::of(b"png bytes");
        let url = d.to_resource_url();
        assert!(url.starts_with("resource:"));
        assert_eq!(ContentDigest::from_resource_url(&url), Some(d));
        assert_eq!(ContentDigest::from_resource_url("https://example.com"), None);
        assert_eq!(ContentDigest::from_resource_url("resource:nothex"), None);
    }
}
