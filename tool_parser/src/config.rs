//! Per-model function calling configuration.
//!
//! These structs are deserialized from the `function:` section of a model
//! YAML file, so field names follow the YAML keys.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{ParserError, ParserResult},
    grammar::GrammarOptions,
};

pub const DEFAULT_FUNCTION_NAME_KEY: &str = "name";
pub const DEFAULT_FUNCTION_ARGUMENTS_KEY: &str = "arguments";
pub const DEFAULT_NO_ACTION_NAME: &str = "answer";
pub const DEFAULT_NO_ACTION_DESCRIPTION: &str =
    "use this action to answer without performing any action";

/// An ordered regex substitution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaceResult {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// A word that switches a lazy grammar on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrammarTrigger {
    pub word: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrammarConfig {
    /// Root may also match a JSON array of calls
    pub parallel_calls: bool,
    /// Separate array items with `,` instead of `,\n`
    pub disable_parallel_new_lines: bool,
    /// Root may be free text before the JSON payload
    pub mixed_mode: bool,
    /// Use `freestring` instead of `mixedstring` in mixed mode
    pub no_mixed_free_string: bool,
    /// Do not constrain output at all; tool calls are then found by regex
    #[serde(rename = "disable")]
    pub no_grammar: bool,
    /// Literal the model must emit before the JSON payload
    pub prefix: String,
    pub expect_strings_after_json: bool,
    /// Comma separated property order, e.g. `name,arguments`
    pub properties_order: String,
    /// `json` (default) or `llama3.1`
    pub schema_type: String,
    pub triggers: Vec<GrammarTrigger>,
}

/// Descriptor of an XML-ish tool call dialect.
///
/// A call is recognised as
/// `scope_start? (tool_start NAME tool_sep (key_start KEY key_val_sep VALUE val_end)* tool_end)* scope_end?`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmlToolCallFormat {
    pub scope_start: String,
    pub tool_start: String,
    pub tool_sep: String,
    pub key_start: String,
    pub key_val_sep: String,
    pub key_val_sep2: Option<String>,
    pub val_end: String,
    pub tool_end: String,
    pub scope_end: String,
    pub last_val_end: Option<String>,
    pub last_tool_end: Option<String>,
    /// `Some(true)`: values are raw text. `Some(false)`: values are JSON.
    /// `None`: JSON first, raw text on failure.
    pub raw_argval: Option<bool>,
    pub trim_raw_argval: bool,
    pub allow_toolcall_in_think: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    /// Do not add the synthetic "answer" function to the grammar
    pub disable_no_action: bool,
    pub grammar: GrammarConfig,
    pub no_action_function_name: String,
    pub no_action_description_name: String,
    /// Named-group regexes capturing the function name and arguments
    pub response_regex: Vec<String>,
    /// Regexes whose first group is a JSON blob to parse
    pub json_regex_match: Vec<String>,
    /// Named-group regexes turning `key=value` style arguments into JSON
    pub argument_regex: Vec<String>,
    #[serde(rename = "argument_regex_key_name")]
    pub argument_regex_key: String,
    #[serde(rename = "argument_regex_value_name")]
    pub argument_regex_value: String,
    /// Applied to raw output before tool call extraction
    pub replace_function_results: Vec<ReplaceResult>,
    /// Applied to the residual text content
    pub replace_llm_results: Vec<ReplaceResult>,
    /// Regexes whose first group is kept as the text content
    pub capture_llm_results: Vec<String>,
    pub function_name_key: String,
    pub function_arguments_key: String,
    pub xml_format_preset: String,
    pub xml_format: Option<XmlToolCallFormat>,
}

impl FunctionsConfig {
    pub fn name_key(&self) -> &str {
        if self.function_name_key.is_empty() {
            DEFAULT_FUNCTION_NAME_KEY
        } else {
            &self.function_name_key
        }
    }

    pub fn arguments_key(&self) -> &str {
        if self.function_arguments_key.is_empty() {
            DEFAULT_FUNCTION_ARGUMENTS_KEY
        } else {
            &self.function_arguments_key
        }
    }

    pub fn no_action_name(&self) -> &str {
        if self.no_action_function_name.is_empty() {
            DEFAULT_NO_ACTION_NAME
        } else {
            &self.no_action_function_name
        }
    }

    pub fn no_action_description(&self) -> &str {
        if self.no_action_description_name.is_empty() {
            DEFAULT_NO_ACTION_DESCRIPTION
        } else {
            &self.no_action_description_name
        }
    }

    /// The XML dialect to parse with. `None` means auto-detect across presets.
    pub fn xml_format(&self) -> Option<XmlToolCallFormat> {
        if let Some(format) = &self.xml_format {
            return Some(format.clone());
        }
        if self.xml_format_preset.is_empty() {
            return None;
        }
        let preset = xml_format_preset(&self.xml_format_preset);
        if preset.is_none() {
            tracing::debug!(
                preset = %self.xml_format_preset,
                "Unknown XML format preset, falling back to auto-detection"
            );
        }
        preset
    }

    pub fn grammar_options(&self) -> GrammarOptions {
        GrammarOptions {
            maybe_array: self.grammar.parallel_calls,
            maybe_string: self.grammar.mixed_mode,
            disable_parallel_new_lines: self.grammar.disable_parallel_new_lines,
            prefix: self.grammar.prefix.clone(),
            no_mixed_free_string: self.grammar.no_mixed_free_string,
            expect_strings_after_json: self.grammar.expect_strings_after_json,
            schema_type: self.grammar.schema_type.clone(),
            function_name_key: self.function_name_key.clone(),
            prop_order: self.grammar.properties_order.clone(),
        }
    }

    /// Compile every configured regex once so that bad patterns are reported
    /// at load time instead of silently skipped per request.
    pub fn validate_regexes(&self) -> ParserResult<()> {
        let patterns = self
            .response_regex
            .iter()
            .chain(&self.json_regex_match)
            .chain(&self.argument_regex)
            .chain(&self.capture_llm_results)
            .chain(self.replace_function_results.iter().map(|r| &r.key))
            .chain(self.replace_llm_results.iter().map(|r| &r.key));
        for pattern in patterns {
            Regex::new(pattern).map_err(|e| ParserError::InvalidRegex {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Compile a config-supplied regex, logging and skipping invalid ones.
pub(crate) fn compile_regex(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Skipping invalid regex");
            None
        }
    }
}

static XML_PRESETS: Lazy<Vec<(&'static str, XmlToolCallFormat)>> = Lazy::new(|| {
    let json_only = Some(false);
    let empty = Some(String::new());
    let qwen = XmlToolCallFormat {
        scope_start: "<tool_call>".into(),
        tool_start: "<function=".into(),
        tool_sep: ">".into(),
        key_start: "<parameter=".into(),
        key_val_sep: ">".into(),
        val_end: "</parameter>".into(),
        tool_end: "</function>".into(),
        scope_end: "</tool_call>".into(),
        trim_raw_argval: true,
        ..Default::default()
    };
    vec![
        (
            "functionary",
            XmlToolCallFormat {
                tool_start: "<function=".into(),
                tool_sep: ">".into(),
                tool_end: "</function>".into(),
                raw_argval: json_only,
                ..Default::default()
            },
        ),
        ("qwen3-coder", qwen.clone()),
        ("qwen3.5", qwen),
        (
            "glm-4.5",
            XmlToolCallFormat {
                tool_start: "<tool_call>".into(),
                key_start: "<arg_key>".into(),
                key_val_sep: "</arg_key>".into(),
                key_val_sep2: Some("<arg_value>".into()),
                val_end: "</arg_value>".into(),
                tool_end: "</tool_call>".into(),
                ..Default::default()
            },
        ),
        (
            "minimax-m2",
            XmlToolCallFormat {
                scope_start: "<minimax:tool_call>".into(),
                tool_start: "<invoke name=\"".into(),
                tool_sep: "\">".into(),
                key_start: "<parameter name=\"".into(),
                key_val_sep: "\">".into(),
                val_end: "</parameter>".into(),
                tool_end: "</invoke>".into(),
                scope_end: "</minimax:tool_call>".into(),
                ..Default::default()
            },
        ),
        (
            "kimi-k2",
            XmlToolCallFormat {
                scope_start: "<|tool_calls_section_begin|>".into(),
                tool_start: "<|tool_call_begin|>".into(),
                tool_sep: "<|tool_call_argument_begin|>{".into(),
                key_start: "\"".into(),
                key_val_sep: "\":".into(),
                val_end: ",".into(),
                tool_end: "}<|tool_call_end|>".into(),
                scope_end: "<|tool_calls_section_end|>".into(),
                last_val_end: empty.clone(),
                raw_argval: json_only,
                allow_toolcall_in_think: true,
                ..Default::default()
            },
        ),
        (
            "apriel-1.5",
            XmlToolCallFormat {
                scope_start: "<tool_calls>[".into(),
                tool_start: "{\"name\": \"".into(),
                tool_sep: "\", \"arguments\": {".into(),
                key_start: "\"".into(),
                key_val_sep: "\": ".into(),
                val_end: ", ".into(),
                tool_end: "}, ".into(),
                scope_end: "]</tool_calls>".into(),
                last_val_end: empty.clone(),
                last_tool_end: Some("}".into()),
                raw_argval: json_only,
                ..Default::default()
            },
        ),
        (
            "xiaomi-mimo",
            XmlToolCallFormat {
                tool_start: "<tool_call>\n{\"name\": \"".into(),
                tool_sep: "\", \"arguments\": {".into(),
                key_start: "\"".into(),
                key_val_sep: "\": ".into(),
                val_end: ", ".into(),
                tool_end: "}\n</tool_call>".into(),
                last_val_end: empty,
                raw_argval: json_only,
                ..Default::default()
            },
        ),
    ]
});

/// Look up a named XML dialect
pub fn xml_format_preset(name: &str) -> Option<XmlToolCallFormat> {
    XML_PRESETS
        .iter()
        .find(|(preset, _)| *preset == name)
        .map(|(_, format)| format.clone())
}

/// All XML dialects in auto-detection order
pub fn xml_format_presets() -> &'static [(&'static str, XmlToolCallFormat)] {
    &XML_PRESETS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_yaml_style_keys() {
        let config: FunctionsConfig = serde_json::from_value(serde_json::json!({
            "grammar": {"parallel_calls": true, "disable": true, "prefix": "<tool_call>"},
            "argument_regex_key_name": "k",
            "replace_function_results": [{"key": "'", "value": "\""}],
            "xml_format_preset": "qwen3-coder"
        }))
        .unwrap();
        assert!(config.grammar.parallel_calls);
        assert!(config.grammar.no_grammar);
        assert_eq!(config.argument_regex_key, "k");
        assert_eq!(config.replace_function_results[0].value, "\"");
        assert_eq!(config.xml_format().unwrap().tool_start, "<function=");
    }

    #[test]
    fn key_defaults() {
        let config = FunctionsConfig::default();
        assert_eq!(config.name_key(), "name");
        assert_eq!(config.arguments_key(), "arguments");
        assert_eq!(config.no_action_name(), "answer");
        assert!(config.xml_format().is_none());
    }

    #[test]
    fn unknown_preset_auto_detects() {
        let config = FunctionsConfig {
            xml_format_preset: "nope".into(),
            ..Default::default()
        };
        assert!(config.xml_format().is_none());
    }

    #[test]
    fn invalid_regex_is_reported() {
        let config = FunctionsConfig {
            response_regex: vec!["(unclosed".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate_regexes(),
            Err(ParserError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn presets_are_ordered() {
        let names: Vec<_> = xml_format_presets().iter().map(|(n, _)| *n).collect();
        assert_eq!(names.first(), Some(&"functionary"));
        assert_eq!(names.len(), 8);
    }
}
