//! Tool parser driven by a model's [`FunctionsConfig`].
//!
//! Complete output goes through [`parse_function_call`]. While streaming,
//! text is passed through until something that opens a tool call shows up:
//! the start literal of an XML dialect, the grammar prefix, or a JSON object
//! or array. From then on the region is re-parsed in partial mode on every
//! chunk and only the growth of each call's arguments is emitted.

use async_trait::async_trait;
use openai_protocol::common::Tool;
use serde_json::Value;

use crate::{
    chat_parser::ChatMsgParser,
    config::{xml_format_presets, FunctionsConfig, XmlToolCallFormat},
    errors::ParserResult,
    parsers::helpers,
    partial_json::{dump_prefix, HealingMarker},
    pipeline::{cleanup_llm_result, escape_newlines_in_strings, parse_function_call, parse_text_content},
    traits::ToolParser,
    types::{FunctionCall, StreamingParseResult, ToolCall, ToolCallItem},
    xml::parse_xml_iterative,
};

/// What the buffered region after a start literal turned out to be.
#[derive(Debug)]
enum Region {
    Calls(Vec<FunctionCall>),
    /// Could still become a call
    Pending,
    NotACall,
}

pub struct ConfiguredParser {
    config: FunctionsConfig,
    xml_format: Option<XmlToolCallFormat>,
    /// Literals that open a tool call region
    start_literals: Vec<String>,

    buffer: String,
    /// Start of the tool call region in `buffer`
    region_start: Option<usize>,
    /// Bytes of `buffer` already returned as normal text
    text_emitted: usize,

    /// Latest parse of every call seen so far
    prev_tool_call_arr: Vec<FunctionCall>,
    /// Argument text sent to the client for each call
    streamed_args_for_tool: Vec<String>,
}

impl ConfiguredParser {
    pub fn new(config: FunctionsConfig) -> Self {
        let xml_format = config.xml_format();
        let mut start_literals: Vec<String> = match &xml_format {
            Some(format) => vec![format.scope_or_tool_start().to_string()],
            None => xml_format_presets()
                .iter()
                .map(|(_, preset)| preset.scope_or_tool_start().to_string())
                .collect(),
        };
        if !config.grammar.prefix.is_empty() {
            start_literals.push(config.grammar.prefix.clone());
        }
        start_literals.retain(|l| !l.is_empty());
        start_literals.sort();
        start_literals.dedup();

        Self {
            config,
            xml_format,
            start_literals,
            buffer: String::new(),
            region_start: None,
            text_emitted: 0,
            prev_tool_call_arr: Vec::new(),
            streamed_args_for_tool: Vec::new(),
        }
    }

    pub fn config(&self) -> &FunctionsConfig {
        &self.config
    }

    /// Earliest position at or after `from` where a tool call may begin.
    fn find_region_start(&self, from: usize) -> Option<usize> {
        let text = &self.buffer[from..];
        let literal = self
            .start_literals
            .iter()
            .filter_map(|literal| text.find(literal.as_str()))
            .min();
        let json = text.find(['{', '[']);
        match (literal, json) {
            (Some(a), Some(b)) => Some(from + a.min(b)),
            (a, b) => a.or(b).map(|idx| from + idx),
        }
    }

    /// Bytes at the end of the buffer that may be the beginning of a start
    /// literal and must not be emitted yet.
    fn held_back(&self) -> usize {
        let text = &self.buffer[self.text_emitted..];
        self.start_literals
            .iter()
            .filter_map(|literal| helpers::ends_with_partial_token(text, literal))
            .max()
            .unwrap_or(0)
    }

    fn classify(&self, region: &str) -> Region {
        if !region.starts_with(['{', '[']) {
            let calls = parse_xml_iterative(region, self.xml_format.as_ref(), true)
                .unwrap_or_default();
            if !calls.is_empty() {
                return Region::Calls(calls);
            }
            // JSON wrapped in tags, e.g. `<tool_call>{"name": ...}`
            if let Some(idx) = region.find(['{', '[']) {
                if let Some(calls) = partial_json_calls(&region[idx..], &self.config) {
                    if !calls.is_empty() {
                        return Region::Calls(calls);
                    }
                }
            }
            return Region::Pending;
        }
        match partial_json_calls(region, &self.config) {
            Some(calls) if calls.is_empty() => Region::Pending,
            Some(calls) => Region::Calls(calls),
            None if self.prev_tool_call_arr.is_empty() => Region::NotACall,
            None => Region::Pending,
        }
    }

    fn emit_diffs(&mut self, calls: Vec<FunctionCall>, tools: &[Tool], result: &mut StreamingParseResult) {
        let tool_indices = helpers::get_tool_indices(tools);
        for (tool_index, call) in calls.into_iter().enumerate() {
            if tool_index >= self.prev_tool_call_arr.len() {
                if !tools.is_empty()
                    && !tool_indices.contains_key(&call.name)
                    && call.name != self.config.no_action_name()
                {
                    tracing::debug!(name = %call.name, "Model called a tool that was not offered");
                }
                result.calls.push(ToolCallItem {
                    tool_index,
                    name: Some(call.name.clone()),
                    parameters: String::new(),
                });
                self.prev_tool_call_arr.push(call.clone());
                self.streamed_args_for_tool.push(String::new());
            }

            let streamed = &mut self.streamed_args_for_tool[tool_index];
            if call.arguments.len() > streamed.len() && call.arguments.starts_with(streamed.as_str()) {
                result.calls.push(ToolCallItem {
                    tool_index,
                    name: None,
                    parameters: call.arguments[streamed.len()..].to_string(),
                });
                *streamed = call.arguments.clone();
            }
            self.prev_tool_call_arr[tool_index] = call;
        }
    }
}

/// Calls in a JSON region that may be cut short. `None` when the region is
/// not JSON, or is complete JSON without any call in it.
fn partial_json_calls(region: &str, config: &FunctionsConfig) -> Option<Vec<FunctionCall>> {
    let escaped = escape_newlines_in_strings(region);
    let mut parser = ChatMsgParser::new(&escaped, true);
    let mut calls = Vec::new();
    let mut truncated = false;

    parser.consume_spaces();
    while !parser.at_end() {
        let Some(json) = parser.try_consume_json() else {
            break;
        };
        let healing = json.healing.as_ref();
        match &json.raw {
            Value::Array(items) => {
                calls.extend(items.iter().filter_map(|item| partial_call(item, healing, config)))
            }
            raw => calls.extend(partial_call(raw, healing, config)),
        }
        if json.is_partial() {
            truncated = true;
            break;
        }
        parser.consume_spaces();
    }

    (truncated || !calls.is_empty()).then_some(calls)
}

/// A call from a raw (possibly healed) JSON object. The name must be
/// complete; the arguments are cut where the model's output ends.
fn partial_call(raw: &Value, healing: Option<&HealingMarker>, config: &FunctionsConfig) -> Option<FunctionCall> {
    let object = raw.as_object()?;
    let name = object.get(config.name_key())?.as_str()?;
    let healed = |text: &str| healing.is_some_and(|h| text.contains(&h.marker));
    if healed(name) {
        return None;
    }
    let arguments = match object.get(config.arguments_key()) {
        None => String::new(),
        // String-encoded arguments are only usable once complete.
        Some(Value::String(s)) if healed(s.as_str()) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(args) => {
            let dumped = args.to_string();
            match healing {
                Some(h) if healed(dumped.as_str()) => dump_prefix(args, h),
                _ => dumped,
            }
        }
    };
    Some(FunctionCall::new(name, arguments))
}

#[async_trait]
impl ToolParser for ConfiguredParser {
    async fn parse_complete(&self, output: &str) -> ParserResult<(String, Vec<ToolCall>)> {
        let calls = parse_function_call(output, &self.config);
        let normal_text = if calls.is_empty() {
            cleanup_llm_result(output, &self.config)
        } else {
            parse_text_content(output, &self.config)
        };
        Ok((normal_text, calls.into_iter().map(ToolCall::from).collect()))
    }

    async fn parse_incremental(
        &mut self,
        chunk: &str,
        tools: &[Tool],
    ) -> ParserResult<StreamingParseResult> {
        self.buffer.push_str(chunk);
        let mut result = StreamingParseResult::default();

        loop {
            let Some(start) = self.region_start else {
                if let Some(start) = self.find_region_start(self.text_emitted) {
                    result.normal_text.push_str(&self.buffer[self.text_emitted..start]);
                    self.text_emitted = start;
                    self.region_start = Some(start);
                    continue;
                }
                let end = self.buffer.len() - self.held_back();
                result.normal_text.push_str(&self.buffer[self.text_emitted..end]);
                self.text_emitted = end;
                return Ok(result);
            };

            match self.classify(&self.buffer[start..]) {
                Region::Calls(calls) => {
                    self.emit_diffs(calls, tools, &mut result);
                    return Ok(result);
                }
                Region::Pending => return Ok(result),
                Region::NotACall => {
                    // Release the opening character and look further on.
                    let next = self.buffer[start..]
                        .chars()
                        .next()
                        .map_or(self.buffer.len(), |c| start + c.len_utf8());
                    result.normal_text.push_str(&self.buffer[start..next]);
                    self.text_emitted = next;
                    self.region_start = None;
                }
            }
        }
    }

    fn has_tool_markers(&self, text: &str) -> bool {
        self.start_literals.iter().any(|literal| text.contains(literal.as_str()))
            || text.trim_start().starts_with(['{', '['])
    }

    fn get_unstreamed_tool_args(&self) -> Option<Vec<ToolCallItem>> {
        let start = self.region_start?;
        let calls = parse_function_call(&self.buffer[start..], &self.config);
        helpers::get_unstreamed_args(&calls, &self.streamed_args_for_tool)
    }

    fn reset(&mut self) {
        helpers::reset_parser_state(
            &mut self.buffer,
            &mut self.prev_tool_call_arr,
            &mut self.streamed_args_for_tool,
        );
        self.region_start = None;
        self.text_emitted = 0;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::GrammarConfig;

    async fn stream(parser: &mut ConfiguredParser, chunks: &[&str]) -> (String, Vec<ToolCallItem>) {
        let mut text = String::new();
        let mut items = Vec::new();
        for chunk in chunks {
            let result = parser.parse_incremental(chunk, &[]).await.unwrap();
            text.push_str(&result.normal_text);
            items.extend(result.calls);
        }
        items.extend(parser.get_unstreamed_tool_args().unwrap_or_default());
        (text, items)
    }

    fn arguments(items: &[ToolCallItem], index: usize) -> String {
        items
            .iter()
            .filter(|i| i.tool_index == index)
            .map(|i| i.parameters.as_str())
            .collect()
    }

    #[tokio::test]
    async fn complete_json_call() {
        let parser = ConfiguredParser::new(FunctionsConfig::default());
        let (text, calls) = parser
            .parse_complete(r#"{"name":"get_weather","arguments":{"location":"San Francisco"}}"#)
            .await
            .unwrap();
        assert_eq!(text, "");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, r#"{"location":"San Francisco"}"#);
    }

    #[tokio::test]
    async fn streams_json_arguments() {
        let mut parser = ConfiguredParser::new(FunctionsConfig::default());
        let (text, items) = stream(
            &mut parser,
            &["Sure. ", r#"{"name": "get_"#, r#"weather", "argu"#, r#"ments": {"loc"#, r#"ation": "Par"#, r#"is"}}"#],
        )
        .await;
        assert_eq!(text, "Sure. ");
        assert_eq!(items[0].name.as_deref(), Some("get_weather"));
        assert_eq!(arguments(&items, 0), r#"{"location":"Paris"}"#);
    }

    #[tokio::test]
    async fn streams_xml_arguments() {
        let config = FunctionsConfig {
            xml_format_preset: "qwen3-coder".into(),
            ..Default::default()
        };
        let mut parser = ConfiguredParser::new(config);
        let (text, items) = stream(
            &mut parser,
            &[
                "Checking.\n<tool",
                "_call>\n<function=get_weather>\n<parameter=location>\nSan",
                " Francisco\n</param",
                "eter>\n</function>\n</tool_call>",
            ],
        )
        .await;
        assert_eq!(text, "Checking.\n");
        assert_eq!(items.iter().filter(|i| i.name.is_some()).count(), 1);
        let args: Value = serde_json::from_str(&arguments(&items, 0)).unwrap();
        assert_eq!(args, json!({"location": "San Francisco"}));
    }

    #[tokio::test]
    async fn brackets_in_prose_are_released() {
        let mut parser = ConfiguredParser::new(FunctionsConfig::default());
        let (text, items) = stream(&mut parser, &["See [1", "] and {not json} ok"]).await;
        assert!(items.is_empty());
        assert_eq!(text, "See [1] and {not json} ok");
    }

    #[tokio::test]
    async fn grammar_prefix_starts_region() {
        let config = FunctionsConfig {
            grammar: GrammarConfig {
                prefix: "<call>".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut parser = ConfiguredParser::new(config);
        let (text, items) = stream(&mut parser, &["ok <ca", r#"ll>{"name":"f","arguments":{}}"#]).await;
        assert_eq!(text, "ok ");
        assert_eq!(items[0].name.as_deref(), Some("f"));
        assert_eq!(arguments(&items, 0), "{}");
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let mut parser = ConfiguredParser::new(FunctionsConfig::default());
        parser.parse_incremental(r#"{"name":"f","#, &[]).await.unwrap();
        parser.reset();
        let result = parser.parse_incremental("hello", &[]).await.unwrap();
        assert_eq!(result.normal_text, "hello");
        assert!(parser.get_unstreamed_tool_args().is_none());
    }
}
