//! Reply parsing helpers shared by the built-in agents

/// Extract a JSON object from a reply that might wrap it in markdown.
///
/// Handles ```json blocks, plain ``` blocks and raw objects.
pub fn extract_json_object(text: &str) -> Option<String> {
    // Try to find JSON in ```json blocks
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim().to_string());
        }
    }

    // Try plain code blocks
    if let Some(start) = text.find("```") {
        let block_start = start + 3;
        let content_start = text[block_start..]
            .find('\n')
            .map(|i| block_start + i + 1)
            .unwrap_or(block_start);
        if let Some(end) = text[content_start..].find("```") {
            return Some(text[content_start..content_start + end].trim().to_string());
        }
    }

    // Try to find a raw JSON object
    if let Some(start) = text.find('{') {
        if let Some(end) = text.rfind('}') {
            if end > start {
                return Some(text[start..=end].to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_json_block() {
        let text = "Here's the analysis:\n```json\n{\"scope\": \"earthwork\"}\n```\nDone.";
        let json = extract_json_object(text).unwrap();
        assert_eq!(json, "{\"scope\": \"earthwork\"}");
    }

    #[test]
    fn test_extract_from_plain_block() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_object(text).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_raw_object() {
        let text = "Result: {\"name\": \"test\"} done";
        assert_eq!(extract_json_object(text).unwrap(), "{\"name\": \"test\"}");
    }

    #[test]
    fn test_no_json_is_none() {
        assert!(extract_json_object("nothing here").is_none());
    }
}
