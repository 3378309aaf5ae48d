//! Input documents and the chunks cut from them.

use serde::{Deserialize, Serialize};

/// One input text unit, already extracted to plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Caller-assigned identifier
    pub id: String,

    /// Raw text content
    pub text: String,
}

impl Document {
    /// Create a new document.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    /// Whether the document has no non-whitespace content.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A bounded, non-overlapping slice of one document's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Id of the parent document
    pub document_id: String,

    /// Position of this chunk within the document (0-based)
    pub index: usize,

    /// Total number of chunks cut from the document
    pub total: usize,

    /// Chunk text
    pub text: String,

    /// Estimated token cost of `text`
    pub estimated_tokens: u64,
}

impl Chunk {
    /// Stable identifier, `"{document_id}#{index}"`.
    pub fn id(&self) -> String {
        format!("{}#{}", self.document_id, self.index)
    }

    /// Whether this chunk carries the whole document.
    pub fn is_whole_document(&self) -> bool {
        self.total == 1
    }
}
