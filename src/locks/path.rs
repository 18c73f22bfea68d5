//! Lock path canonicalization.
//!
//! Lock keys are built from canonical paths only, so two spellings of one file can
//! never yield two locks. Traversal segments are rejected outright rather than resolved.

use crate::error::{CoordinationError, HiveResult};
use tracing::warn;

pub const DEFAULT_MAX_PATH_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathCanonicalizer {
    max_path_len: usize,
}

impl Default for PathCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

impl PathCanonicalizer {
    pub fn new() -> Self {
        Self {
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }

    pub fn with_max_length(max_path_len: usize) -> Self {
        Self { max_path_len }
    }

    /// Canonicalize a resource path.
    ///
    /// `src\\lib.rs`, `/src//lib.rs` and `./src/lib.rs/` all become `src/lib.rs`.
    ///
    /// # Errors
    /// - `PathTraversalRejected` for any `..` segment
    /// - `InvalidPathCharacters` for characters outside `[A-Za-z0-9._/-]` or an empty result
    /// - `InvalidInput` when the canonical path exceeds the length cap
    pub fn canonicalize(&self, path: &str) -> HiveResult<String> {
        let unified = path.replace('\\', "/");
        let mut segments: Vec<&str> = Vec::new();

        for segment in unified.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    warn!(path = %path, "Path traversal attempt detected");
                    return Err(CoordinationError::PathTraversalRejected(path.to_string()));
                }
                _ => {
                    if !segment.chars().all(allowed_char) {
                        return Err(CoordinationError::InvalidPathCharacters(path.to_string()));
                    }
                    segments.push(segment);
                }
            }
        }

        if segments.is_empty() {
            return Err(CoordinationError::InvalidPathCharacters(
                "empty path".to_string(),
            ));
        }

        let canonical = segments.join("/");
        if canonical.len() > self.max_path_len {
            return Err(CoordinationError::invalid(
                "path",
                format!("{} characters exceeds limit of {}", canonical.len(), self.max_path_len),
            ));
        }

        Ok(canonical)
    }
}
