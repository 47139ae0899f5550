//! Extract candidate source from a free-form generator response.

use std::sync::LazyLock;

use regex::Regex;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([A-Za-z0-9_+.-]*)[^\n]*\n(.*?)^[ \t]*```")
        .expect("fence regex should be valid")
});

/// Pull the module source out of `response`.
///
/// Preference order: the first fenced block tagged with `language`, then the
/// first untagged block, then the first block of any tag, then the whole
/// response. Returns `None` when nothing but whitespace remains.
pub fn extract_code(response: &str, language: &str) -> Option<String> {
    let blocks: Vec<(String, String)> = FENCE_RE
        .captures_iter(response)
        .map(|caps| {
            let tag = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
            let body = caps.get(2).map_or("", |m| m.as_str()).to_string();
            (tag, body)
        })
        .collect();

    let language = language.to_ascii_lowercase();
    let chosen = blocks
        .iter()
        .find(|(tag, _)| *tag == language)
        .or_else(|| blocks.iter().find(|(tag, _)| tag.is_empty()))
        .or_else(|| blocks.first())
        .map(|(_, body)| body.as_str())
        .unwrap_or(response);

    let code = chosen.trim_matches('\n').trim_end();
    if code.trim().is_empty() {
        return None;
    }
    let mut code = code.to_string();
    code.push('\n');
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_block_tagged_with_language() {
        let response = "Plan:\n```text\nnotes\n```\n\n```python\ndef parse(path):\n    return None\n```\n";
        let code = extract_code(response, "python").expect("code");
        assert_eq!(code, "def parse(path):\n    return None\n");
    }

    #[test]
    fn falls_back_to_untagged_block() {
        let response = "```\necho hi\n```";
        assert_eq!(extract_code(response, "python").as_deref(), Some("echo hi\n"));
    }

    #[test]
    fn uses_whole_response_without_fences() {
        let response = "\n\ndef parse(path):\n    pass\n\n";
        assert_eq!(
            extract_code(response, "python").as_deref(),
            Some("def parse(path):\n    pass\n")
        );
    }

    #[test]
    fn keeps_indentation_of_first_line() {
        let response = "```python\n    x = 1\n```";
        assert_eq!(extract_code(response, "python").as_deref(), Some("    x = 1\n"));
    }

    #[test]
    fn empty_response_yields_none() {
        assert_eq!(extract_code("   \n", "python"), None);
        assert_eq!(extract_code("```python\n\n```", "python"), None);
    }
}
