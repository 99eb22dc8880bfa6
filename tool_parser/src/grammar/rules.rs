//! Rule table shared by the schema converters and the final root assembly.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::GrammarOptions;

pub const SPACE_RULE: &str = r#"" "?"#;

pub const BOOLEAN_RULE: &str = r#"("true" | "false") space"#;
pub const NUMBER_RULE: &str =
    r#"("-"? ([0-9] | [1-9] [0-9]*)) ("." [0-9]+)? ([eE] [-+]? [0-9]+)? space"#;
pub const INTEGER_RULE: &str = r#"("-"? ([0-9] | [1-9] [0-9]*)) space"#;
pub const STRING_RULE: &str = r#""\"" (
			[^"\\] |
			"\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])
		  )* "\"" space"#;
// Anything but NUL; a stricter rule makes the grammar ambiguous around
// escaped quotes and decoders do measurably worse.
pub const FREESTRING_RULE: &str = r#"(
			[^\x00] |
			"\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])
		  )* space"#;
pub const NULL_RULE: &str = r#""null" space"#;

const ARRAY_NEW_LINES: &str = "arr  ::=\n  \"[\\n\"  (\n\t\trealvalue\n    (\",\\n\"  realvalue)*\n  )? \"]\"";
const ARRAY: &str = "arr  ::=\n  \"[\"  (\n\t\trealvalue\n    (\",\"  realvalue)*\n  )? \"]\"";

pub fn primitive_rule(name: &str) -> Option<&'static str> {
    match name {
        "boolean" => Some(BOOLEAN_RULE),
        "number" => Some(NUMBER_RULE),
        "integer" => Some(INTEGER_RULE),
        "string" => Some(STRING_RULE),
        "freestring" => Some(FREESTRING_RULE),
        "null" => Some(NULL_RULE),
        _ => None,
    }
}

static INVALID_RULE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9-]+").expect("valid rule-name regex"));

/// JSON-encode a literal and quote it as a grammar terminal.
pub fn format_literal(literal: &Value) -> String {
    let json = literal.to_string();
    let mut out = String::with_capacity(json.len() + 2);
    out.push('"');
    for ch in json.chars() {
        match ch {
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// JSON-encode a literal without the extra quoting: a JSON string literal is
/// already a valid grammar terminal.
pub fn format_literal_unquoted(literal: &Value) -> String {
    literal.to_string().replace('\r', "\\r").replace('\n', "\\n")
}

/// Escape newlines so a literal stays on one grammar line
pub fn escape_new_lines(s: &str) -> String {
    s.replace('\n', "\\n")
}

/// Named grammar rules, kept sorted so the rendered grammar is deterministic.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: BTreeMap<String, String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert("space".to_string(), SPACE_RULE.to_string());
        Self { rules }
    }
}

impl RuleSet {
    /// Insert a rule, disambiguating the name with a numeric suffix when a
    /// different rule already owns it. Returns the key actually used.
    pub fn add(&mut self, name: &str, rule: &str) -> String {
        let escaped = INVALID_RULE_CHARS.replace_all(name, "-").into_owned();
        let mut key = escaped.clone();
        if self.rules.get(&escaped).is_some_and(|existing| existing != rule) {
            let mut i = 0usize;
            loop {
                key = format!("{escaped}{i}");
                if !self.rules.contains_key(&key) {
                    break;
                }
                i += 1;
            }
        }
        self.rules.insert(key.clone(), rule.to_string());
        key
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.rules.get(name).map(String::as_str)
    }

    /// Render the grammar, rewriting `root` according to the options.
    pub fn render(&self, options: &GrammarOptions) -> String {
        let swap_root = options.maybe_array || options.maybe_string || !options.prefix.is_empty();

        let mut lines: Vec<String> = self
            .rules
            .iter()
            .map(|(name, rule)| {
                let name = if swap_root && name == "root" {
                    "realvalue"
                } else {
                    name.as_str()
                };
                format!("{name} ::= {rule}")
            })
            .collect();

        if !swap_root {
            return lines.join("\n");
        }

        let mut new_root = if options.maybe_array {
            "arr | realvalue".to_string()
        } else {
            "realvalue".to_string()
        };
        let free_rule = if options.no_mixed_free_string {
            "freestring"
        } else {
            "mixedstring"
        };

        if !options.prefix.is_empty() {
            let prefix = escape_new_lines(&options.prefix);
            if options.maybe_array && options.maybe_string {
                new_root = format!("({new_root})");
            }
            new_root = if options.maybe_string {
                format!("( \"{prefix}\" {new_root} | {free_rule} ) ")
            } else {
                format!("\"{prefix}\" {new_root}")
            };
        } else if options.maybe_string {
            new_root = format!("{free_rule} | {new_root}");
        }

        lines.push(format!("root ::= {new_root}"));
        lines.push(
            if options.disable_parallel_new_lines {
                ARRAY
            } else {
                ARRAY_NEW_LINES
            }
            .to_string(),
        );

        let mixed = match (options.maybe_array, options.expect_strings_after_json) {
            (true, true) => "mixedstring ::= freestring | freestring arr freestring | (freestring realvalue freestring)* | realvalue | arr",
            (true, false) => "mixedstring ::= freestring | freestring arr | freestring realvalue | realvalue | arr",
            (false, true) => "mixedstring ::= freestring | (freestring realvalue freestring)* | realvalue",
            (false, false) => "mixedstring ::= freestring | freestring realvalue | realvalue",
        };
        lines.push(mixed.to_string());

        lines.join("\n")
    }
}
