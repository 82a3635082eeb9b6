use serde::{Deserialize, Serialize};

/// A generated source file extracted from an agent response.
///
/// Paths are sanitized, relative, and traversal-proof before a value of this
/// type is constructed by the engine's parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    /// Relative path inside the generated project.
    pub path: String,
    /// File content.
    pub content: String,
    /// Detected language tag (e.g. "rust", "typescript").
    pub language: String,
    /// Content size in bytes.
    pub size: usize,
    /// Whether this file is new versus modifying an existing one.
    pub is_new: bool,
}

impl GeneratedFile {
    /// Create a file artifact, computing the size from the content.
    pub fn new(path: impl Into<String>, content: impl Into<String>, language: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            size: content.len(),
            content,
            language: language.into(),
            is_new: true,
        }
    }
}
