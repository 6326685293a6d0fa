//! Shared helpers for collaborator responses and prompt building.

/// Extract the first balanced JSON object from text that may contain other content.
/// Braces inside JSON strings are ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Locate the JSON payload of a model response: a ```json fence, any fenced
/// block containing an object, or the first bare object.
pub fn extract_json(response: &str) -> Option<&str> {
    if let Some(start) = response.find("```json") {
        let after = &response[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim());
        }
    }
    if let Some(start) = response.find("```") {
        let after = &response[start + 3..];
        if let Some(end) = after.find("```")
            && let Some(found) = extract_json_object(&after[..end])
        {
            return Some(found);
        }
    }
    extract_json_object(response)
}

/// Truncate to at most `limit` characters, appending `marker` when cut.
pub fn truncate_chars(text: &str, limit: usize, marker: &str) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}{}", &text[..idx], marker),
        None => text.to_string(),
    }
}
