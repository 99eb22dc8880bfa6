//! Healing of truncated JSON.
//!
//! While a model is still generating, the JSON it emits is usually cut in
//! the middle of a string, a key or a number. [`heal`] closes the open
//! structure with the smallest insertion that makes it parse, tagging the
//! insertion point with a random marker. The marker is then used twice: to
//! strip the synthetic parts from the value, and to cut the re-serialised
//! value back to the prefix the model really produced.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};

/// Sentinel appended to truncated raw argument values.
pub const PARTIAL_FLAG: &str = "XML_TOOL_CALL_PARTIAL_FLAG";

static PARTIAL_UNICODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\u[0-9a-fA-F]{0,4}$").expect("valid unicode escape regex"));

/// Where the model's own output stops inside a healed value.
#[derive(Debug, Clone, PartialEq)]
pub struct HealingMarker {
    /// The random marker inserted into the healed text
    pub marker: String,
    /// What precedes-and-includes the marker once the healed value is
    /// re-serialised; everything from here on is synthetic.
    pub json_dump_marker: String,
}

/// A JSON value read from the front of the input.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPrefix {
    /// Value with every healing artefact removed
    pub value: Value,
    /// Value exactly as healed, markers included
    pub raw: Value,
    /// Bytes of input consumed
    pub consumed: usize,
    /// Set when the value had to be healed
    pub healing: Option<HealingMarker>,
}

impl JsonPrefix {
    pub fn is_partial(&self) -> bool {
        self.healing.is_some()
    }
}

/// A random run of digits that does not occur in `input`.
pub fn healing_marker(input: &str) -> String {
    let mut rng = rand::rng();
    loop {
        let candidate = rng.random_range(1_000_000_000u64..u64::MAX).to_string();
        if !input.contains(&candidate) {
            return candidate;
        }
    }
}

/// Parse one JSON value from the start of `input`.
///
/// With `partial` set, a value truncated by the end of input is healed.
/// Returns `None` when nothing parsable is there.
pub fn parse_json_prefix(input: &str, partial: bool, marker: &str) -> Option<JsonPrefix> {
    let mut stream = serde_json::Deserializer::from_str(input).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Some(JsonPrefix {
            raw: value.clone(),
            value,
            consumed: stream.byte_offset(),
            healing: None,
        }),
        Some(Err(e)) if e.is_eof() && partial => {
            let (healed, json_dump_marker) = heal(input, marker)?;
            let raw: Value = serde_json::from_str(&healed).ok()?;
            Some(JsonPrefix {
                value: clean(&raw, marker),
                raw,
                consumed: input.len(),
                healing: Some(HealingMarker {
                    marker: marker.to_string(),
                    json_dump_marker,
                }),
            })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Frame {
    Object,
    Array,
    /// Inside an object, after a key
    Key,
}

fn can_parse(s: &str) -> bool {
    serde_json::from_str::<Value>(s).is_ok()
}

/// Structures still open at the end of `input`.
fn scan(input: &str) -> Vec<Frame> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    fn close_value(stack: &mut Vec<Frame>) {
        if stack.last() == Some(&Frame::Key) {
            stack.pop();
        }
    }

    for ch in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                match stack.last() {
                    Some(Frame::Object) => stack.push(Frame::Key),
                    Some(Frame::Key) => {
                        stack.pop();
                    }
                    _ => {}
                }
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push(Frame::Object),
            '[' => stack.push(Frame::Array),
            '}' | ']' => {
                close_value(&mut stack);
                stack.pop();
                close_value(&mut stack);
            }
            ',' => close_value(&mut stack),
            _ => {}
        }
    }
    stack
}

/// Close a truncated JSON document.
///
/// Returns the healed text and the dump marker, or `None` if the input is
/// not a truncated object or array.
pub fn heal(input: &str, marker: &str) -> Option<(String, String)> {
    let stack = scan(input);
    if stack.is_empty() {
        return None;
    }

    let mut s = input.to_string();
    // A dangling `\u12` cannot be completed into a valid code point cheaply.
    if let Some(m) = PARTIAL_UNICODE.find(&s) {
        let start = m.start();
        let backslashes = s[..start].chars().rev().take_while(|c| *c == '\\').count();
        if backslashes % 2 == 0 {
            s.truncate(start);
        }
    }

    let closing: String = stack
        .iter()
        .rev()
        .filter_map(|frame| match frame {
            Frame::Object => Some('}'),
            Frame::Array => Some(']'),
            Frame::Key => None,
        })
        .collect();
    let last_non_space = s.trim_end().chars().last();
    let ends_with_backslash = s.ends_with('\\');
    let maybe_number = s
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));

    let finish = |base: &str, dump: String, tail: &str| -> Option<(String, String)> {
        let healed = format!("{base}{dump}{tail}{closing}");
        can_parse(&healed).then_some((healed, dump))
    };

    match stack.last()? {
        Frame::Key => {
            if last_non_space == Some(':') && can_parse(&format!("{s}1{closing}")) {
                return finish(&s, format!("\"{marker}"), "\"");
            }
            if can_parse(&format!("{s}: 1{closing}")) {
                return finish(&s, format!(":\"{marker}"), "\"");
            }
            if last_non_space == Some('{') && can_parse(&format!("{s}{closing}")) {
                return finish(&s, format!("\"{marker}"), "\": 1");
            }
            if can_parse(&format!("{s}\"{closing}")) {
                return finish(&s, marker.to_string(), "\"");
            }
            if ends_with_backslash && can_parse(&format!("{s}\\\"{closing}")) {
                return finish(&s, format!("\\{marker}"), "\"");
            }
            let cut = s.rfind(':')?;
            finish(&s[..=cut], format!("\"{marker}"), "\"")
        }
        Frame::Array => {
            if matches!(last_non_space, Some(',') | Some('['))
                && can_parse(&format!("{s}1{closing}"))
            {
                return finish(&s, format!("\"{marker}"), "\"");
            }
            if can_parse(&format!("{s}\"{closing}")) {
                return finish(&s, marker.to_string(), "\"");
            }
            if ends_with_backslash && can_parse(&format!("{s}\\\"{closing}")) {
                return finish(&s, format!("\\{marker}"), "\"");
            }
            if !maybe_number && can_parse(&format!("{s}, 1{closing}")) {
                return finish(&s, format!(",\"{marker}"), "\"");
            }
            let cut = s.rfind(['[', ','])?;
            finish(&s[..=cut], format!("\"{marker}"), "\"")
        }
        Frame::Object => {
            if (last_non_space == Some('{') && can_parse(&format!("{s}{closing}")))
                || (last_non_space == Some(',') && can_parse(&format!("{s}\"\": 1{closing}")))
            {
                return finish(&s, format!("\"{marker}"), "\": 1");
            }
            if !maybe_number && can_parse(&format!("{s},\"\": 1{closing}")) {
                return finish(&s, format!(",\"{marker}"), "\": 1");
            }
            if can_parse(&format!("{s}\": 1{closing}")) {
                return finish(&s, marker.to_string(), "\": 1");
            }
            if ends_with_backslash && can_parse(&format!("{s}\\\": 1{closing}")) {
                return finish(&s, format!("\\{marker}"), "\": 1");
            }
            let cut = s.rfind(':')?;
            finish(&s[..=cut], format!("\"{marker}"), "\"")
        }
    }
}

/// Close an unterminated JSON string literal and decode it.
pub fn heal_string(input: &str) -> Option<String> {
    let mut s = input.to_string();
    if let Some(m) = PARTIAL_UNICODE.find(&s) {
        let start = m.start();
        let backslashes = s[..start].chars().rev().take_while(|c| *c == '\\').count();
        if backslashes % 2 == 0 {
            s.truncate(start);
        }
    }
    let trailing = s.chars().rev().take_while(|c| *c == '\\').count();
    if trailing % 2 == 1 {
        s.pop();
    }
    s.push('"');
    serde_json::from_str::<String>(&s).ok()
}

/// Strip healing artefacts: strings are cut at the marker, keys and array
/// items that only exist because of healing are dropped.
pub fn clean(value: &Value, marker: &str) -> Value {
    match value {
        Value::String(s) => match s.find(marker) {
            Some(idx) => Value::String(s[..idx].to_string()),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| item.as_str().is_none_or(|s| !s.starts_with(marker)))
                .map(|item| clean(item, marker))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !key.contains(marker))
                .map(|(key, item)| (key.clone(), clean(item, marker)))
                .collect::<Map<_, _>>(),
        ),
        _ => value.clone(),
    }
}

/// Serialise a healed value and cut it where the model's output ends.
pub fn dump_prefix(raw: &Value, healing: &HealingMarker) -> String {
    let dumped = raw.to_string();
    if let Some(idx) = dumped.rfind(&healing.json_dump_marker) {
        return dumped[..idx].to_string();
    }
    if let Some(idx) = dumped.find(&healing.marker) {
        return dumped[..idx].to_string();
    }
    dumped.strip_suffix('}').unwrap_or(&dumped).to_string()
}

/// Cut a serialised argument object at the [`PARTIAL_FLAG`] so that only
/// what the model produced remains (an unterminated JSON prefix).
///
/// Only closing punctuation may follow the flag; anything else means the
/// flag was not inserted by us and `None` is returned.
pub fn cut_at_partial_flag(json: &str) -> Option<String> {
    let idx = json.rfind(PARTIAL_FLAG)?;
    let rest = &json[idx + PARTIAL_FLAG.len()..];
    if !rest
        .chars()
        .all(|c| matches!(c, '\'' | '"' | '}' | ':' | ']') || c.is_whitespace())
    {
        return None;
    }
    let head = &json[..idx];
    Some(head.strip_suffix('"').unwrap_or(head).to_string())
}
