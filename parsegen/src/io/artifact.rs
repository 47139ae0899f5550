//! Persisting the passing parser.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::io::config::write_atomic;

/// Location of the generated parser for `target_id`.
pub fn parser_path(parsers_dir: &Path, target_id: &str, extension: &str) -> PathBuf {
    parsers_dir.join(format!("{target_id}_parser.{extension}"))
}

/// Write `source` as the parser for `target_id`, replacing any earlier one atomically.
pub fn persist_parser(
    parsers_dir: &Path,
    target_id: &str,
    extension: &str,
    source: &str,
) -> Result<PathBuf> {
    let path = parser_path(parsers_dir, target_id, extension);
    write_atomic(&path, source).with_context(|| format!("persist parser for {target_id}"))?;
    info!(path = %path.display(), "persisted parser");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn overwrites_previous_parser() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("custom_parsers");

        let first = persist_parser(&dir, "icici", "py", "v1").expect("persist");
        let second = persist_parser(&dir, "icici", "py", "v2").expect("persist");

        assert_eq!(first, second);
        assert!(second.ends_with("custom_parsers/icici_parser.py"));
        assert_eq!(fs::read_to_string(&second).expect("read"), "v2");
        let entries = fs::read_dir(&dir).expect("read dir").count();
        assert_eq!(entries, 1, "temp file left behind");
    }
}
