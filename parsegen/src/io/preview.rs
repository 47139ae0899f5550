//! Short textual preview of the sample document for the synthesis prompt.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::io::config::PreviewConfig;
use crate::io::process::{command_from_template, run_command_with_timeout};

/// Build a preview; failures are logged and yield `None`.
pub fn document_preview(document: &Path, config: &PreviewConfig) -> Option<String> {
    match build_preview(document, config) {
        Ok(preview) => {
            debug!(bytes = preview.len(), "built document preview");
            Some(preview)
        }
        Err(err) => {
            warn!(
                err = %format!("{err:#}"),
                document = %document.display(),
                "document preview failed"
            );
            None
        }
    }
}

fn build_preview(document: &Path, config: &PreviewConfig) -> Result<String> {
    if let Some(command) = &config.command {
        let cmd =
            command_from_template(command, &[("document", document.display().to_string())])?;
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(config.timeout_secs),
            config.limit_bytes,
            None,
        )?;
        if output.timed_out {
            return Err(anyhow!("preview command timed out"));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "preview command failed with status {:?}",
                output.status.code()
            ));
        }
        let mut text = output.stdout_lossy();
        if output.stdout_truncated > 0 {
            text.push_str("\n[truncated]");
        }
        return Ok(text);
    }

    let bytes = fs::read(document).with_context(|| format!("read {}", document.display()))?;
    let head = &bytes[..bytes.len().min(config.limit_bytes)];
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        // A cut through a multi-byte character at the limit is still text.
        Err(err) if err.error_len().is_none() => {
            std::str::from_utf8(&head[..err.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => {
            return Ok(format!(
                "binary document, {} bytes; no text preview available",
                bytes.len()
            ));
        }
    };
    let mut preview = text.to_string();
    if head.len() < bytes.len() {
        preview.push_str("\n[truncated]");
    }
    Ok(preview)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(limit_bytes: usize) -> PreviewConfig {
        PreviewConfig {
            command: None,
            limit_bytes,
            timeout_secs: 5,
        }
    }

    #[test]
    fn text_document_shows_leading_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("statement.txt");
        fs::write(&path, "Date Amount\n01-08-2024 100\n").expect("write");
        let preview = document_preview(&path, &config(11)).expect("preview");
        assert_eq!(preview, "Date Amount\n[truncated]");
    }

    #[test]
    fn binary_document_gets_size_note() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("statement.pdf");
        fs::write(&path, [0x25, 0x50, 0xff, 0xfe, 0x00]).expect("write");
        let preview = document_preview(&path, &config(100)).expect("preview");
        assert!(preview.contains("5 bytes"));
    }

    #[test]
    fn command_output_is_used() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("statement.pdf");
        fs::write(&path, "raw").expect("write");
        let cfg = PreviewConfig {
            command: Some(vec!["cat".to_string(), "{document}".to_string()]),
            limit_bytes: 100,
            timeout_secs: 5,
        };
        assert_eq!(document_preview(&path, &cfg).as_deref(), Some("raw"));
    }

    #[test]
    fn failing_command_is_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("statement.pdf");
        let cfg = PreviewConfig {
            command: Some(vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()]),
            limit_bytes: 100,
            timeout_secs: 5,
        };
        assert_eq!(document_preview(&path, &cfg), None);
    }
}
