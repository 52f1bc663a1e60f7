//! Locate a single structured document in free-form generator output

use regex::Regex;
use std::sync::OnceLock;

use crate::ExtractError;

fn fence_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // Optional format hint after the opening fence, e.g. ```json
    RE.get_or_init(|| Regex::new(r"```[A-Za-z0-9_+\-]*[ \t]*\r?\n?([\s\S]*?)```").ok())
        .as_ref()
}

fn sibling_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\}\s*\{").ok()).as_ref()
}

/// Recover the candidate document text from raw generator output.
///
/// - exactly one fenced block: its inner text
/// - more than one fenced block: [`ExtractError::MultipleBlocks`]
/// - no fence: the slice from the first `{` to the last `}`
///
/// The candidate is then rejected with [`ExtractError::SiblingObjects`] if a
/// closing brace is directly followed by an opening brace. That test is
/// textual and can fire on a single object whose string values contain
/// `} {`; a false rejection only costs one regeneration.
pub fn extract_document(raw: &str) -> Result<String, ExtractError> {
    let blocks: Vec<&str> = fence_re()
        .map(|re| {
            re.captures_iter(raw)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
                .collect()
        })
        .unwrap_or_default();

    let candidate = match blocks.len() {
        0 => brace_slice(raw)?,
        1 => blocks[0].trim().to_string(),
        count => return Err(ExtractError::MultipleBlocks { count }),
    };

    if candidate.is_empty() {
        return Err(ExtractError::NoStructuredData);
    }
    if sibling_re().is_some_and(|re| re.is_match(&candidate)) {
        return Err(ExtractError::SiblingObjects);
    }
    Ok(candidate)
}

fn brace_slice(raw: &str) -> Result<String, ExtractError> {
    let start = raw.find('{').ok_or(ExtractError::NoStructuredData)?;
    let end = raw.rfind('}').ok_or(ExtractError::NoStructuredData)?;
    if end < start {
        return Err(ExtractError::NoStructuredData);
    }
    Ok(raw[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        assert!(fence_re().is_some());
        assert!(sibling_re().is_some());
    }

    #[test]
    fn test_single_tagged_fence() {
        let raw = "Here you go:\n```json\n{\"files\": []}\n```\nEnjoy!";
        assert_eq!(extract_document(raw).unwrap(), "{\"files\": []}");
    }

    #[test]
    fn test_single_untagged_fence() {
        let raw = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_document(raw).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_multiple_fences_rejected() {
        let raw = "```json\n{\"a\": 1}\n```\nand also\n```json\n{\"b\": 2}\n```";
        assert_eq!(
            extract_document(raw),
            Err(ExtractError::MultipleBlocks { count: 2 })
        );
    }

    #[test]
    fn test_brace_slice_tolerates_commentary() {
        let raw = "Sure! {\"files\": [{\"path\": \"a.py\", \"content\": \"x\"}]} Let me know.";
        assert_eq!(
            extract_document(raw).unwrap(),
            "{\"files\": [{\"path\": \"a.py\", \"content\": \"x\"}]}"
        );
    }

    #[test]
    fn test_unterminated_fence_falls_back_to_braces() {
        let raw = "```json\n{\"files\": []}";
        assert_eq!(extract_document(raw).unwrap(), "{\"files\": []}");
    }

    #[test]
    fn test_sibling_objects_rejected() {
        let raw = "{\"files\": [1]}\n\n{\"files\": [2]}";
        assert_eq!(extract_document(raw), Err(ExtractError::SiblingObjects));
    }

    #[test]
    fn test_nested_objects_are_not_siblings() {
        let raw = "{\"a\": {\"b\": 1}, \"c\": [{\"d\": 2}, {\"e\": 3}]}";
        assert!(extract_document(raw).is_ok());
    }

    #[test]
    fn test_no_structured_data() {
        assert_eq!(
            extract_document("I cannot help with that."),
            Err(ExtractError::NoStructuredData)
        );
        assert_eq!(extract_document("} backwards {"), Err(ExtractError::NoStructuredData));
        assert_eq!(extract_document("```\n```"), Err(ExtractError::NoStructuredData));
    }
}
