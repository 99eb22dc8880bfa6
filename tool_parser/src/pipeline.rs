//! Extraction of function calls from a finished model output.
//!
//! Order of attempts: configured regexes, JSON objects found anywhere in the
//! text, then the XML dialects.

use serde_json::{Map, Value};

use crate::{
    chat_parser::ChatMsgParser,
    config::{compile_regex, xml_format_presets, FunctionsConfig, ReplaceResult},
    types::FunctionCall,
    xml::{parse_xml, strip_reasoning_blocks, try_parse_xml_from_scope_start},
};

const DEFAULT_ARGUMENT_KEY_GROUP: &str = "key";
const DEFAULT_ARGUMENT_VALUE_GROUP: &str = "value";

fn apply_replacements(text: &str, replacements: &[ReplaceResult]) -> String {
    let mut text = text.to_string();
    for replacement in replacements {
        if let Some(re) = compile_regex(&replacement.key) {
            text = re.replace_all(&text, replacement.value.as_str()).into_owned();
        }
    }
    text
}

/// Apply `replace_llm_results` to the text content.
pub fn cleanup_llm_result(output: &str, config: &FunctionsConfig) -> String {
    apply_replacements(output, &config.replace_llm_results)
}

/// Trimmed first group of the first `capture_llm_results` regex that
/// matches, or an empty string.
pub fn parse_text_content(output: &str, config: &FunctionsConfig) -> String {
    config
        .capture_llm_results
        .iter()
        .filter_map(|pattern| compile_regex(pattern))
        .find_map(|re| {
            re.captures(output)
                .map(|caps| caps.get(1).map_or("", |m| m.as_str()).trim().to_string())
        })
        .unwrap_or_default()
}

/// Turn `key=value` style arguments into a JSON object using the named
/// groups of `argument_regex`. Without argument regexes the input is
/// returned untouched.
pub fn parse_function_call_args(arguments: &str, config: &FunctionsConfig) -> String {
    if config.argument_regex.is_empty() {
        return arguments.to_string();
    }
    let key_group = if config.argument_regex_key.is_empty() {
        DEFAULT_ARGUMENT_KEY_GROUP
    } else {
        &config.argument_regex_key
    };
    let value_group = if config.argument_regex_value.is_empty() {
        DEFAULT_ARGUMENT_VALUE_GROUP
    } else {
        &config.argument_regex_value
    };

    let mut args = Map::new();
    for re in config.argument_regex.iter().filter_map(|p| compile_regex(p)) {
        for caps in re.captures_iter(arguments) {
            if let (Some(key), Some(value)) = (caps.name(key_group), caps.name(value_group)) {
                args.insert(key.as_str().to_string(), Value::String(value.as_str().to_string()));
            }
        }
    }
    Value::Object(args).to_string()
}

/// Escape raw newlines that appear inside JSON string literals. Models
/// often emit them and they make otherwise valid JSON unparsable.
pub(crate) fn escape_newlines_in_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in s.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                '\n' => {
                    out.push_str("\\n");
                    continue;
                }
                _ => {}
            }
        } else if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }
    out
}

/// Every JSON object in `s`. Arrays contribute the objects they contain.
pub fn parse_json_objects(s: &str) -> Vec<Map<String, Value>> {
    let mut parser = ChatMsgParser::new(s, false);
    let mut objects = Vec::new();
    parser.consume_spaces();
    while !parser.at_end() {
        let Some(json) = parser.try_consume_json() else {
            break;
        };
        collect_objects(json.value, &mut objects);
        parser.consume_spaces();
    }
    if objects.is_empty() {
        objects = parse_json_objects_lenient(s);
    }
    objects
}

/// Scan for values starting at any brace or bracket, skipping garbage in
/// between.
fn parse_json_objects_lenient(s: &str) -> Vec<Map<String, Value>> {
    let mut objects = Vec::new();
    let mut offset = 0;
    while let Some(idx) = s[offset..].find(['{', '[']) {
        let start = offset + idx;
        let mut stream = serde_json::Deserializer::from_str(&s[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                offset = start + stream.byte_offset();
                collect_objects(value, &mut objects);
            }
            _ => offset = start + 1,
        }
    }
    objects
}

fn collect_objects(value: Value, objects: &mut Vec<Map<String, Value>>) {
    match value {
        Value::Object(map) => objects.push(map),
        Value::Array(items) => objects.extend(items.into_iter().filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })),
        _ => {}
    }
}

fn extract_json(sources: &[&str], config: &FunctionsConfig) -> Vec<FunctionCall> {
    let name_key = config.name_key();
    let arguments_key = config.arguments_key();
    let mut calls = Vec::new();
    for source in sources {
        let escaped = escape_newlines_in_strings(source);
        for object in parse_json_objects(&escaped) {
            let Some(Value::String(name)) = object.get(name_key) else {
                continue;
            };
            let arguments = match object.get(arguments_key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => continue,
            };
            calls.push(FunctionCall::new(name.as_str(), arguments));
        }
    }
    calls
}

/// Calls from the XML dialects: split on the dialect's opening literal
/// first, then fall back to whole-text parsing. Reasoning blocks are
/// ignored unless the dialect allows calls inside them.
fn extract_xml(output: &str, config: &FunctionsConfig) -> Vec<FunctionCall> {
    let format = config.xml_format();
    let output = match &format {
        Some(format) if format.allow_toolcall_in_think => output.to_string(),
        _ => strip_reasoning_blocks(output),
    };
    let from_start = match &format {
        Some(format) => try_parse_xml_from_scope_start(&output, format, false),
        None => xml_format_presets()
            .iter()
            .find_map(|(_, preset)| try_parse_xml_from_scope_start(&output, preset, false)),
    };
    match from_start {
        Some(calls) if !calls.is_empty() => calls,
        _ => parse_xml(&output, format.as_ref()),
    }
}

/// Extract every function call from a complete model output.
pub fn parse_function_call(output: &str, config: &FunctionsConfig) -> Vec<FunctionCall> {
    let output = apply_replacements(output, &config.replace_function_results);
    tracing::debug!(result = %output, "Parsing function calls");

    let mut captured: Vec<&str> = Vec::new();
    for re in config.json_regex_match.iter().filter_map(|p| compile_regex(p)) {
        captured = re
            .captures_iter(&output)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();
        if !captured.is_empty() {
            break;
        }
    }

    let mut calls = Vec::new();
    if !config.response_regex.is_empty() {
        let name_key = config.name_key();
        let arguments_key = config.arguments_key();
        for re in config.response_regex.iter().filter_map(|p| compile_regex(p)) {
            for caps in re.captures_iter(&output) {
                let name = caps.name(name_key).map_or("", |m| m.as_str());
                if name.is_empty() {
                    return calls;
                }
                let arguments = caps.name(arguments_key).map_or("", |m| m.as_str());
                calls.push(FunctionCall::new(
                    name,
                    parse_function_call_args(arguments, config),
                ));
            }
        }
    } else {
        let sources = if captured.is_empty() {
            vec![output.as_str()]
        } else {
            captured
        };
        calls = extract_json(&sources, config);
    }

    let regex_configured = !config.json_regex_match.is_empty() || !config.response_regex.is_empty();
    if regex_configured && !calls.is_empty() {
        return calls;
    }

    let xml_calls = extract_xml(&output, config);
    if calls.is_empty() {
        return xml_calls;
    }
    // JSON wrapped in tags was already picked up above.
    for call in xml_calls {
        if extract_json(&[call.name.as_str()], config).is_empty() {
            tracing::debug!(name = %call.name, "Found XML tool call alongside JSON");
            calls.push(call);
        }
    }
    calls
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(call: &FunctionCall) -> Value {
        serde_json::from_str(&call.arguments).unwrap()
    }

    #[test]
    fn plain_json_call() {
        let output = r#"{"name":"get_weather","arguments":{"location":"San Francisco"}}"#;
        let calls = parse_function_call(output, &FunctionsConfig::default());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, r#"{"location":"San Francisco"}"#);
    }

    #[test]
    fn json_with_garbage_and_arrays() {
        let output = r#"Sure! [{"name":"a","arguments":{}}, {"name":"b","arguments":"{\"x\":1}"}] done {"name":"c","arguments":{"k":"v"}}"#;
        let calls = parse_function_call(output, &FunctionsConfig::default());
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(calls[1].arguments, r#"{"x":1}"#);
    }

    #[test]
    fn raw_newlines_inside_strings() {
        let output = "{\"name\":\"note\",\"arguments\":{\"text\":\"line one\nline two\"}}";
        let calls = parse_function_call(output, &FunctionsConfig::default());
        assert_eq!(args(&calls[0]), json!({"text": "line one\nline two"}));
    }

    #[test]
    fn custom_keys_and_missing_arguments() {
        let config = FunctionsConfig {
            function_name_key: "function".into(),
            ..Default::default()
        };
        let output = r#"{"function":"f","arguments":{"a":1}} {"function":"g"}"#;
        let calls = parse_function_call(output, &config);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "f");
    }

    #[test]
    fn replacements_run_first() {
        let config = FunctionsConfig {
            replace_function_results: vec![ReplaceResult {
                key: "'".into(),
                value: "\"".into(),
            }],
            ..Default::default()
        };
        let calls = parse_function_call("{'name': 'f', 'arguments': {'a': 'b'}}", &config);
        assert_eq!(args(&calls[0]), json!({"a": "b"}));
    }

    #[test]
    fn json_regex_match_selects_payload() {
        let config = FunctionsConfig {
            json_regex_match: vec![r"(?s)<tool_call>(.*?)</tool_call>".into()],
            ..Default::default()
        };
        let output = r#"{"name":"ignored","arguments":{}} <tool_call>{"name":"kept","arguments":{}}</tool_call>"#;
        let calls = parse_function_call(output, &config);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "kept");
    }

    #[test]
    fn response_regex_with_argument_regex() {
        let config = FunctionsConfig {
            response_regex: vec![r"(?P<name>\w+)\((?P<arguments>[^)]*)\)".into()],
            argument_regex: vec![r#"(?P<key>\w+)="(?P<value>[^"]*)""#.into()],
            ..Default::default()
        };
        let calls = parse_function_call(r#"search(query="rust", lang="en")"#, &config);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(args(&calls[0]), json!({"query": "rust", "lang": "en"}));
    }

    #[test]
    fn xml_when_no_json() {
        let output = "<think>hmm</think>\n<tool_call>\n<function=get_time>\n<parameter=tz>\nUTC\n</parameter>\n</function>\n</tool_call>";
        let calls = parse_function_call(output, &FunctionsConfig::default());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_time");
        assert_eq!(args(&calls[0]), json!({"tz": "UTC"}));
    }

    #[test]
    fn xml_inside_reasoning_is_ignored() {
        let output = "<think>\n<tool_call>\n<function=a>\n</function>\n</tool_call>\n</think>done";
        assert!(parse_function_call(output, &FunctionsConfig::default()).is_empty());
    }

    #[test]
    fn text_content_helpers() {
        let config = FunctionsConfig {
            capture_llm_results: vec![r"(?s)<answer>(.*?)</answer>".into()],
            replace_llm_results: vec![ReplaceResult {
                key: r"<\|eot\|>".into(),
                value: String::new(),
            }],
            ..Default::default()
        };
        assert_eq!(parse_text_content("x <answer> hi </answer>", &config), "hi");
        assert_eq!(parse_text_content("nothing", &config), "");
        assert_eq!(cleanup_llm_result("done<|eot|>", &config), "done");
    }

    #[test]
    fn argument_regex_absent_keeps_input() {
        assert_eq!(
            parse_function_call_args("a=b", &FunctionsConfig::default()),
            "a=b"
        );
    }
}
