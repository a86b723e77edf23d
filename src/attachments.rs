//! Per-conversion attachment registry keyed by content digest.
//!
//! A registry lives for exactly one conversion call. It deduplicates
//! attachments referenced several times (the same image under five relative
//! paths yields one entry) and keeps first-insertion order for the output
//! list. Attachments already stored with the note are pre-registered as
//! existing so that keeping an image in an edit never re-uploads it.

use std::collections::HashMap;

use crate::digest::ContentDigest;
use crate::models::Attachment;

/// Ordered, digest-unique collection of attachments.
#[derive(Debug, Default)]
pub struct AttachmentRegistry {
    entries: Vec<Attachment>,
    index: HashMap<ContentDigest, usize>,
}

impl AttachmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-loaded with attachments the note store already holds.
    ///
    /// Each is stored as existing: `is_new` is cleared and any bytes dropped,
    /// since they never need re-sending.
    pub fn with_existing<'a>(known: impl IntoIterator<Item = &'a Attachment>) -> Self {
        let mut registry = Self::new();
        for attachment in known {
            registry.register(Attachment {
                bytes: None,
                is_new: false,
                ..attachment.clone()
            });
        }
        registry
    }

    /// Insert `candidate` unless its digest is already present.
    ///
    /// Returns the stored entry. A second insert of the same digest returns
    /// the first entry unchanged; filename, source and mime on the candidate
    /// are ignored.
    pub fn register(&mut self, candidate: Attachment) -> &Attachment {
        let idx = match self.index.get(&candidate.hash) {
            Some(&idx) => idx,
            None => {
                let idx = self.entries.len();
                self.index.insert(candidate.hash, idx);
                self.entries.push(candidate);
                idx
            }
        };
        &self.entries[idx]
    }

    pub fn get(&self, digest: &ContentDigest) -> Option<&Attachment> {
        self.index.get(digest).map(|&idx| &self.entries[idx])
    }

    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.index.contains_key(digest)
    }

    /// Entries in insertion order.
    pub fn list(&self) -> &[Attachment] {
        &self.entries
    }

    pub fn into_list(self) -> Vec<Attachment> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
