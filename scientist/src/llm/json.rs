use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn fence_re() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").ok())
        .as_ref()
}

/// Pull the first JSON object out of free-form model output.
///
/// Tries, in order: the whole text, each fenced code block, then the first
/// balanced `{...}` span. Returns `None` when nothing parses.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(re) = fence_re() {
        for caps in re.captures_iter(text) {
            let Some(block) = caps.get(1) else { continue };
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(block.as_str().trim())
            {
                return Some(value);
            }
        }
    }

    let span = first_balanced_object(text)?;
    serde_json::from_str::<Value>(span).ok()
}

/// Byte span of the first `{...}` whose braces balance, ignoring braces
/// inside string literals.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
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
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
