//! JSON recovery from free-form model output.

use serde_json::Value;

/// Find the JSON object in a model answer: fenced ```json blocks first, then
/// the first balanced `{...}` that parses, then the whole text.
pub fn extract_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for block in fenced_blocks(text) {
        if let Ok(v) = serde_json::from_str::<Value>(block) {
            return Some(v);
        }
    }

    let mut search_from = 0;
    while let Some((start, end)) = balanced_object(text, search_from) {
        if let Ok(v) = serde_json::from_str::<Value>(&text[start..end]) {
            return Some(v);
        }
        search_from = start + 1;
    }

    serde_json::from_str(text).ok()
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = after.find('\n').map_or(0, |n| n + 1);
        let Some(close) = after[body_start..].find("```") else {
            break;
        };
        blocks.push(after[body_start..body_start + close].trim());
        rest = &after[body_start + close + 3..];
    }
    blocks
}

/// Byte range of the first balanced object starting at or after `from`.
/// Braces inside string literals are ignored.
fn balanced_object(text: &str, from: usize) -> Option<(usize, usize)> {
    let start = from + text.get(from..)?.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
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
                    return Some((start, start + offset + 1));
                }
            }
            _ => {}
        }
    }
    None
}
