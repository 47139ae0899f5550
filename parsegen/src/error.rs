//! Typed errors that abort a run before any attempt is made.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to resolve a target into its sample document and reference dataset.
#[derive(Debug, Error)]
pub enum TargetError {
    /// Identifier is not a plain slug.
    #[error("invalid target id {id:?}: {reason}")]
    InvalidTargetId { id: String, reason: &'static str },

    /// Target directory, sample document or reference dataset is missing.
    #[error("target {id:?} not found: {reason}")]
    TargetNotFound { id: String, reason: String },

    /// More than one file could be the sample document.
    #[error("target {id:?} is ambiguous: {} sample documents found: {candidates:?}", .candidates.len())]
    AmbiguousTarget {
        id: String,
        candidates: Vec<PathBuf>,
    },

    /// Filesystem error while inspecting the target directory.
    #[error("read target {id:?} at {}", .path.display())]
    Io {
        id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `target.toml` exists but cannot be parsed.
    #[error("parse target metadata {}", .path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
