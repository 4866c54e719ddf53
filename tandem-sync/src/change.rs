//! Changes: immutable edit sets submitted against a known base version.
//!
//! A [`Change`] carries an ordered list of [`TextEdit`]s. Edits apply
//! sequentially: each range is interpreted against the text produced by the
//! previous edit. Ranges are half-open and counted in chars.
//!
//! ```text
//! "hello world"  ── TextEdit { 0..5, "HELLO" } ──►  "HELLO world"
//!                ── TextEdit { 11..11, "!" }   ──►  "HELLO world!"
//! ```

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::SyncError;

/// Identifier of a synchronizable resource.
pub type DocumentUri = String;

/// Globally unique change identifier, used for de-duplication.
pub type ChangeId = Uuid;

/// One `(range, replacementText)` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    /// Range start (inclusive), in chars
    pub start: usize,
    /// Range end (exclusive), in chars
    pub end: usize,
    /// Replacement text for the range
    pub text: String,
}

impl TextEdit {
    pub fn new(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    /// Insert `text` at `at`.
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::new(at, at, text)
    }

    /// Delete the range `start..end`.
    pub fn delete(start: usize, end: usize) -> Self {
        Self::new(start, end, String::new())
    }
}

/// Limits enforced by structural validation.
#[derive(Debug, Clone, Copy)]
pub struct ChangeLimits {
    pub max_operations: usize,
    pub max_replacement_bytes: usize,
    pub max_uri_len: usize,
}

impl Default for ChangeLimits {
    fn default() -> Self {
        Self {
            max_operations: 1024,
            max_replacement_bytes: 1024 * 1024,
            max_uri_len: 1024,
        }
    }
}

/// An atomic edit submitted against `base_version` of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub change_id: ChangeId,
    pub document_uri: DocumentUri,
    /// Version of the document the author saw when editing
    pub base_version: u64,
    pub operations: Vec<TextEdit>,
    pub author_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Change {
    /// Create a change with a fresh id, stamped now.
    pub fn new(
        document_uri: impl Into<DocumentUri>,
        base_version: u64,
        operations: Vec<TextEdit>,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            document_uri: document_uri.into(),
            base_version,
            operations,
            author_id: author_id.into(),
            timestamp: now_millis(),
        }
    }

    /// Same change (same id and operations) claiming a different base.
    pub fn rebased(&self, base_version: u64) -> Self {
        Self {
            base_version,
            ..self.clone()
        }
    }

    /// Checks that do not depend on document state.
    ///
    /// Bounds against the document length are checked separately, at the
    /// version the change is applied to (see [`apply_edits`]).
    pub fn validate_structure(&self, limits: &ChangeLimits) -> Result<(), SyncError> {
        validate_uri(&self.document_uri, limits.max_uri_len)?;

        if self.author_id.is_empty() {
            return Err(SyncError::validation("change has no author"));
        }
        if self.operations.is_empty() {
            return Err(SyncError::validation("change has no operations"));
        }
        if self.operations.len() > limits.max_operations {
            return Err(SyncError::validation(format!(
                "change has {} operations, limit is {}",
                self.operations.len(),
                limits.max_operations
            )));
        }

        let mut replacement_bytes = 0usize;
        for (i, op) in self.operations.iter().enumerate() {
            if op.start > op.end {
                return Err(SyncError::validation(format!(
                    "operation {i}: range start {} is after end {}",
                    op.start, op.end
                )));
            }
            replacement_bytes = replacement_bytes.saturating_add(op.text.len());
        }
        if replacement_bytes > limits.max_replacement_bytes {
            return Err(SyncError::validation(format!(
                "change replaces {replacement_bytes} bytes, limit is {}",
                limits.max_replacement_bytes
            )));
        }

        Ok(())
    }
}

/// Validate a document URI.
///
/// NUL is reserved as the key separator of the RocksDB backend.
pub fn validate_uri(uri: &str, max_len: usize) -> Result<(), SyncError> {
    if uri.is_empty() {
        return Err(SyncError::validation("document URI is empty"));
    }
    if uri.len() > max_len {
        return Err(SyncError::validation(format!(
            "document URI is {} bytes, limit is {max_len}",
            uri.len()
        )));
    }
    if uri.contains('\0') {
        return Err(SyncError::validation("document URI contains NUL"));
    }
    Ok(())
}

/// Apply `edits` in order to `content`, returning the new text.
///
/// Fails with a validation error if any range exceeds the text length at
/// the point that edit is applied.
pub fn apply_edits(content: &str, edits: &[TextEdit]) -> Result<String, SyncError> {
    let mut text = content.to_string();
    for (i, edit) in edits.iter().enumerate() {
        match (byte_offset(&text, edit.start), byte_offset(&text, edit.end)) {
            (Some(start), Some(end)) if start <= end => {
                text.replace_range(start..end, &edit.text);
            }
            _ => {
                return Err(SyncError::validation(format!(
                    "operation {i}: range {}..{} is outside document of length {}",
                    edit.start,
                    edit.end,
                    text.chars().count()
                )));
            }
        }
    }
    Ok(text)
}

/// Clamp `edits` so that each fits the text it will be applied to.
///
/// Used when a resolution is forced onto a newer version than it was
/// written against.
pub fn clamp_edits(content: &str, edits: &[TextEdit]) -> Vec<TextEdit> {
    let mut len = content.chars().count();
    let mut clamped = Vec::with_capacity(edits.len());
    for edit in edits {
        let start = edit.start.min(len);
        let end = edit.end.clamp(start, len);
        len = len - (end - start) + edit.text.chars().count();
        clamped.push(TextEdit::new(start, end, edit.text.clone()));
    }
    clamped
}

/// Byte offset of the `char_index`-th char; `len()` for one past the end.
fn byte_offset(text: &str, char_index: usize) -> Option<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .nth(char_index)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
