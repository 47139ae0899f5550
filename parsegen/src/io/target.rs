//! Resolve a target id into its sample document and reference dataset.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/<target_id>/
//!   result.csv      reference dataset (name configurable)
//!   <sample>        exactly one sample document
//!   target.toml     optional: description, notes
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::TargetError;

/// Optional metadata file inside a target directory.
pub const TARGET_METADATA_FILE: &str = "target.toml";

/// A resolved target. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub sample_path: PathBuf,
    pub reference_path: PathBuf,
    pub description: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TargetMetadata {
    description: Option<String>,
    notes: Option<String>,
}

/// Filesystem lookup of targets.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    data_dir: PathBuf,
    reference_file: String,
    sample_extensions: Vec<String>,
}

impl TargetResolver {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        reference_file: impl Into<String>,
        sample_extensions: Vec<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            reference_file: reference_file.into(),
            sample_extensions: sample_extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Resolve `id`; fails rather than guesses when the sample is ambiguous.
    #[instrument(skip(self), fields(data_dir = %self.data_dir.display()))]
    pub fn resolve(&self, id: &str) -> Result<Target, TargetError> {
        validate_target_id(id)?;

        let dir = self.data_dir.join(id);
        if !dir.is_dir() {
            return Err(TargetError::TargetNotFound {
                id: id.to_string(),
                reason: format!("no directory at {}", dir.display()),
            });
        }

        let reference_path = dir.join(&self.reference_file);
        if !reference_path.is_file() {
            return Err(TargetError::TargetNotFound {
                id: id.to_string(),
                reason: format!("reference dataset {} is missing", reference_path.display()),
            });
        }

        let io_err = |path: &Path| {
            let id = id.to_string();
            let path = path.to_path_buf();
            move |source| TargetError::Io { id, path, source }
        };

        let mut candidates = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(io_err(&path))?;
            if !file_type.is_file() && !(file_type.is_symlink() && path.is_file()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.')
                || name == self.reference_file
                || name == TARGET_METADATA_FILE
            {
                continue;
            }
            if !self.extension_allowed(&path) {
                continue;
            }
            candidates.push(path);
        }
        candidates.sort();

        let sample_path = match candidates.len() {
            0 => {
                return Err(TargetError::TargetNotFound {
                    id: id.to_string(),
                    reason: format!("no sample document in {}", dir.display()),
                });
            }
            1 => candidates.remove(0),
            _ => {
                return Err(TargetError::AmbiguousTarget {
                    id: id.to_string(),
                    candidates,
                });
            }
        };

        let metadata = load_metadata(&dir.join(TARGET_METADATA_FILE), id)?;
        let sample_path = fs::canonicalize(&sample_path).map_err(io_err(&sample_path))?;
        let reference_path = fs::canonicalize(&reference_path).map_err(io_err(&reference_path))?;

        debug!(
            sample = %sample_path.display(),
            reference = %reference_path.display(),
            "resolved target"
        );
        Ok(Target {
            id: id.to_string(),
            sample_path,
            reference_path,
            description: metadata.description,
            notes: metadata.notes,
        })
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        if self.sample_extensions.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.sample_extensions.contains(&ext))
    }
}

fn load_metadata(path: &Path, id: &str) -> Result<TargetMetadata, TargetError> {
    if !path.is_file() {
        return Ok(TargetMetadata::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| TargetError::Io {
        id: id.to_string(),
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| TargetError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}

/// Target ids are slugs so they can name directories and artifact files.
pub fn validate_target_id(id: &str) -> Result<(), TargetError> {
    let invalid = |reason| TargetError::InvalidTargetId {
        id: id.to_string(),
        reason,
    };
    if id.trim().is_empty() {
        return Err(invalid("must be non-empty"));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(invalid("must not contain path separators"));
    }
    if id.contains("..") {
        return Err(invalid("must not contain '..'"));
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        return Err(invalid("must use [a-z0-9_-] only"));
    }
    Ok(())
}
