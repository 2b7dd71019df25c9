//! Bounded auto-repair of generator JSON.
//!
//! The generator is asked for a bare JSON array of idea objects but regularly
//! wraps it in prose or code fences, leaves trailing commas, or stops mid-way
//! through the array. [`parse_idea_array`] tries a strict parse first and then
//! exactly one repair pass, in this order:
//!
//! 1. Strip markdown code fences
//! 2. Extract the array span (or an `{"ideas": [...]}` wrapper)
//! 3. Remove trailing commas
//! 4. Balance brackets, closing an unterminated string
//! 5. Fall back to the complete top-level objects that do parse

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*\n?(.*?)(?:```|$)").expect("valid regex"));

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[\]}])").expect("valid regex"));

/// Parsed idea objects, still untyped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArray {
    pub values: Vec<Value>,
    /// Whether the repair pass was needed.
    pub repaired: bool,
}

/// Parse generator output as an array of idea objects.
///
/// Returns the parse error of the strict attempt when repair also fails, so
/// it can be quoted back to the generator.
pub fn parse_idea_array(text: &str) -> Result<ParsedArray, String> {
    let strict_error = match serde_json::from_str::<Value>(text.trim()) {
        Ok(value) => match into_idea_values(value) {
            Some(values) => {
                return Ok(ParsedArray {
                    values,
                    repaired: false,
                });
            }
            None => "expected a JSON array of idea objects".to_string(),
        },
        Err(e) => e.to_string(),
    };

    match repair(text) {
        Some(values) if !values.is_empty() => Ok(ParsedArray {
            values,
            repaired: true,
        }),
        _ => Err(strict_error),
    }
}

fn repair(text: &str) -> Option<Vec<Value>> {
    let unfenced = strip_fences(text);
    let span = extract_array_span(&unfenced);
    let cleaned = remove_trailing_commas(span);
    let balanced = balance_brackets(&cleaned);

    if let Some(values) = serde_json::from_str::<Value>(&balanced)
        .ok()
        .and_then(into_idea_values)
    {
        return Some(values);
    }

    let objects = complete_objects(&cleaned);
    (!objects.is_empty()).then_some(objects)
}

/// Accept a bare array, an `{"ideas": [...]}` wrapper, or a single idea object.
fn into_idea_values(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("ideas") {
            Some(Value::Array(items)) => Some(items),
            Some(_) => None,
            None if map.contains_key("title") => Some(vec![Value::Object(map)]),
            None => None,
        },
        _ => None,
    }
}

fn strip_fences(text: &str) -> String {
    match FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().to_string(),
        None => text.to_string(),
    }
}

/// Slice from the first `[` to its matching `]`, or to the end when the
/// array was cut off. Text with no `[` is returned whole.
fn extract_array_span(text: &str) -> &str {
    let Some(start) = text.find('[') else {
        return text.trim();
    };
    // An object before the first bracket is a wrapper like {"ideas": [...]}.
    let start = match text.find('{') {
        Some(brace) if brace < start => brace,
        _ => start,
    };
    let rest = &text[start..];
    match matching_close(rest) {
        Some(end) => &rest[..=end],
        None => rest,
    }
}

/// Byte offset of the bracket closing the one `text` starts with.
fn matching_close(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn remove_trailing_commas(text: &str) -> String {
    TRAILING_COMMA_RE.replace_all(text, "$1").into_owned()
}

/// Append the closers for every unclosed bracket, dropping stray closers.
fn balance_brackets(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '[' | '{' => {
                stack.push(c);
                out.push(c);
            }
            ']' | '}' => {
                let opener = if c == ']' { '[' } else { '{' };
                if stack.last() == Some(&opener) {
                    stack.pop();
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end_matches(|c: char| c.is_whitespace() || c == ',').len();
    out.truncate(trimmed_len);

    while let Some(open) = stack.pop() {
        out.push(if open == '[' { ']' } else { '}' });
    }
    out
}

/// Every complete object at array depth that parses on its own, in order.
fn complete_objects(text: &str) -> Vec<Value> {
    let mut values = Vec::new();
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut start: Option<(usize, usize)> = None;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if start.is_none() && stack.iter().all(|&o| o == '[') {
                    start = Some((i, stack.len()));
                }
                stack.push(c);
            }
            '[' => stack.push(c),
            '}' | ']' => {
                stack.pop();
                if c == '}'
                    && let Some((from, depth)) = start
                    && stack.len() == depth
                {
                    if let Ok(value @ Value::Object(_)) =
                        serde_json::from_str::<Value>(&text[from..=i])
                    {
                        values.push(value);
                    }
                    start = None;
                }
            }
            _ => {}
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn titles(parsed: &ParsedArray) -> Vec<&str> {
        parsed
            .values
            .iter()
            .map(|v| v["title"].as_str().unwrap_or_default())
            .collect()
    }

    #[test]
    fn strict_array_needs_no_repair() {
        let parsed = parse_idea_array(r#"[{"title": "A"}, {"title": "B"}]"#).unwrap();
        assert!(!parsed.repaired);
        assert_eq!(titles(&parsed), vec!["A", "B"]);
    }

    #[test]
    fn fenced_output_with_prose() {
        let text = "Here are the ideas:\n```json\n[{\"title\": \"A\"}]\n```\nLet me know!";
        let parsed = parse_idea_array(text).unwrap();
        assert!(parsed.repaired);
        assert_eq!(titles(&parsed), vec!["A"]);
    }

    #[test]
    fn trailing_commas_removed() {
        let text = r#"[{"title": "A", "risks": ["x", "y",],}, {"title": "B"},]"#;
        let parsed = parse_idea_array(text).unwrap();
        assert_eq!(titles(&parsed), vec!["A", "B"]);
        assert_eq!(parsed.values[0]["risks"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_closing_bracket_is_balanced() {
        let parsed = parse_idea_array(r#"[{"title": "A"}, {"title": "B"}"#).unwrap();
        assert_eq!(titles(&parsed), vec!["A", "B"]);
    }

    #[test]
    fn truncated_object_keeps_complete_prefix() {
        let text = r#"[{"title": "A", "risks": ["x"]}, {"title": "B"}, {"title": "C", "descr"#;
        let parsed = parse_idea_array(text).unwrap();
        assert_eq!(titles(&parsed), vec!["A", "B"]);
    }

    #[test]
    fn brackets_inside_strings_are_ignored() {
        let text = r#"[{"title": "Use [P1] and {P2}", "description": "a ] b"}"#;
        let parsed = parse_idea_array(text).unwrap();
        assert_eq!(titles(&parsed), vec!["Use [P1] and {P2}"]);
    }

    #[test]
    fn ideas_wrapper_is_unwrapped() {
        let parsed = parse_idea_array(r#"{"ideas": [{"title": "A"}]}"#).unwrap();
        assert!(!parsed.repaired);
        assert_eq!(titles(&parsed), vec!["A"]);

        let parsed = parse_idea_array("Sure! {\"ideas\": [{\"title\": \"A\"},]}").unwrap();
        assert!(parsed.repaired);
        assert_eq!(titles(&parsed), vec!["A"]);
    }

    #[test]
    fn unrecoverable_text_reports_strict_error() {
        let err = parse_idea_array("I could not come up with any ideas.").unwrap_err();
        assert!(!err.is_empty());
        assert!(parse_idea_array(r#""just a string""#).is_err());
        assert!(parse_idea_array("[]").map(|p| p.values.is_empty()).unwrap_or(false));
    }
}
