//! Best-effort normalization for the small set of encoding mistakes LLMs make
//! when asked for JSON: a literal newline or an unescaped quote landing inside
//! a string value. This is deliberately narrow — a general JSON repair utility
//! is out of scope here; three parse attempts over three normalization passes
//! is what the client contract asks for, not a full recovery parser.

use serde_json::Value;

/// Tries `raw`, then a newline-escaped variant, then a newline+quote-normalized
/// variant. Returns the first successful parse and how many attempts it took.
pub fn parse_with_repairs(raw: &str) -> Result<(Value, u32), serde_json::Error> {
    let mut last_err = match serde_json::from_str::<Value>(raw) {
        Ok(value) => return Ok((value, 1)),
        Err(err) => err,
    };

    let newline_escaped = escape_bare_newlines(raw);
    match serde_json::from_str::<Value>(&newline_escaped) {
        Ok(value) => return Ok((value, 2)),
        Err(err) => last_err = err,
    }

    let normalized = normalize_smart_quotes(&newline_escaped);
    match serde_json::from_str::<Value>(&normalized) {
        Ok(value) => Ok((value, 3)),
        Err(_) => Err(last_err),
    }
}

fn escape_bare_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                _ => out.push(ch),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

fn normalize_smart_quotes(text: &str) -> String {
    text.replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json_on_first_attempt() {
        let (_, attempts) = parse_with_repairs(r#"{"n":4}"#).unwrap();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn repairs_bare_newline_inside_string_value() {
        let raw = "{\"text\":\"line one\nline two\"}";
        let (value, attempts) = parse_with_repairs(raw).unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(value["text"], "line one\nline two");
    }

    #[test]
    fn fails_after_exhausting_repairs() {
        assert!(parse_with_repairs("not json at all").is_err());
    }
}
