//! XML-ish tool call dialects.
//!
//! The iterative parser walks the input with a [`ChatMsgParser`] and can
//! report calls whose arguments are still being generated. The regex
//! parsers are a fallback for complete output the iterative parser rejects.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::{
    chat_parser::{all_space, ChatMsgParser, LiteralMatch},
    config::{xml_format_presets, XmlToolCallFormat},
    errors::{ParserError, ParserResult},
    partial_json::{cut_at_partial_flag, dump_prefix, PARTIAL_FLAG},
    types::FunctionCall,
};

static FUNCTIONARY_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<function=([^>]+)>(.*?)</function>").expect("valid functionary regex")
});
static JSON_LIKE_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)\{\s*"name"\s*:\s*"([^"]+)"\s*,\s*"arguments"\s*:\s*(\{.*?\})\s*\}"#)
        .expect("valid JSON-like call regex")
});
static JSON_LIKE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""name"\s*:\s*"([^"]+)""#).expect("valid name regex"));
static JSON_LIKE_ARGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)"arguments"\s*:\s*(\{.*\})"#).expect("valid arguments regex"));
static GLM_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<tool_call>\s*([^\n<]+)\s*(.*?)\s*</tool_call>").expect("valid GLM regex")
});
static GLM_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<arg_key>(.*?)</arg_key>\s*<arg_value>(.*?)</arg_value>")
        .expect("valid GLM parameter regex")
});

const THINK_TAGS: [(&str, &str); 2] = [("<think>", "</think>"), ("<thinking>", "</thinking>")];

impl XmlToolCallFormat {
    /// Functionary style: a JSON object between `<function=NAME>` tags
    fn is_functionary(&self) -> bool {
        self.key_start.is_empty() && self.tool_start == "<function="
    }

    /// Dialects whose calls are JSON objects wrapped in tags
    fn is_json_like(&self) -> bool {
        self.tool_start.contains("{\"name\"")
    }

    fn is_glm(&self) -> bool {
        self.tool_start == "<tool_call>" && self.tool_sep.is_empty() && self.key_start == "<arg_key>"
    }

    /// Where a block of calls begins
    pub fn scope_or_tool_start(&self) -> &str {
        if self.scope_start.is_empty() {
            &self.tool_start
        } else {
            &self.scope_start
        }
    }

    /// Every literal of the dialect, for trimming half-emitted markers
    pub fn literals(&self) -> Vec<&str> {
        let mut literals = vec![
            self.scope_start.as_str(),
            self.tool_start.as_str(),
            self.tool_sep.as_str(),
            self.key_start.as_str(),
            self.key_val_sep.as_str(),
        ];
        literals.extend(self.key_val_sep2.as_deref());
        literals.push(&self.val_end);
        literals.extend(self.last_val_end.as_deref());
        literals.push(&self.tool_end);
        literals.extend(self.last_tool_end.as_deref());
        literals.push(&self.scope_end);
        literals.retain(|l| !l.is_empty());
        literals
    }
}

/// Kimi K2 names calls `functions.NAME:IDX`.
fn normalize_function_name(name: &str) -> String {
    let name = name.trim();
    let Some(stripped) = name.strip_prefix("functions.") else {
        return name.to_string();
    };
    match stripped.rsplit_once(':') {
        Some((base, idx)) if !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()) => {
            base.to_string()
        }
        _ => stripped.to_string(),
    }
}

/// Interpret a raw argument value according to the dialect.
pub fn parse_parameter_value(raw: &str, format: &XmlToolCallFormat) -> Value {
    let raw = if format.trim_raw_argval { raw.trim() } else { raw };
    match format.raw_argval {
        Some(true) => Value::String(raw.to_string()),
        _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

fn to_json(args: &Map<String, Value>) -> String {
    Value::Object(args.clone()).to_string()
}

/// Serialised arguments with the closing brace removed.
fn open_args(args: &Map<String, Value>) -> String {
    let json = to_json(args);
    json.strip_suffix('}').map(str::to_string).unwrap_or(json)
}

/// Serialised arguments cut at the partial flag.
fn flagged_args(args: &Map<String, Value>) -> String {
    let json = to_json(args);
    cut_at_partial_flag(&json).unwrap_or(json)
}

fn partial(msg: impl Into<String>) -> ParserError {
    ParserError::PartialParse(msg.into())
}

impl ChatMsgParser<'_> {
    /// `val_end`, or `last_val_end` followed by a tool end, whichever comes
    /// first. Returns the expected literal length with the match.
    fn try_find_val_end(&mut self, format: &XmlToolCallFormat) -> (usize, Option<LiteralMatch>) {
        let saved = self.pos();
        let mut found = self.try_find_literal(&format.val_end);
        let mut size = format.val_end.len();
        if let Some(last_val_end) = &format.last_val_end {
            self.move_to(saved);
            let mut alt = self.try_find_2_literals_split_by_spaces(last_val_end, &format.tool_end);
            if let Some(last_tool_end) = &format.last_tool_end {
                self.move_to(saved);
                let alt2 = self.try_find_2_literals_split_by_spaces(last_val_end, last_tool_end);
                if let Some(a2) = alt2 {
                    if alt.as_ref().is_none_or(|a| a.prelude.len() > a2.prelude.len()) {
                        alt = Some(a2);
                    }
                }
            }
            match alt {
                Some(mut a)
                    if found.as_ref().is_none_or(|f| f.prelude.len() > a.prelude.len()) =>
                {
                    a.matched.end = (a.matched.start + last_val_end.len()).min(self.input().len());
                    self.move_to(a.matched.end);
                    size = last_val_end.len();
                    found = Some(a);
                }
                _ => match &found {
                    Some(f) => self.move_to(f.matched.end),
                    None => self.move_to(saved),
                },
            }
        }
        (size, found)
    }

    /// `tool_end`, or `last_tool_end` followed by the scope end.
    fn try_find_tool_end(&mut self, format: &XmlToolCallFormat) -> (usize, Option<LiteralMatch>) {
        let saved = self.pos();
        let mut found = self.try_find_literal(&format.tool_end);
        let mut size = format.tool_end.len();
        if let Some(last_tool_end) = &format.last_tool_end {
            self.move_to(saved);
            let alt = self.try_find_2_literals_split_by_spaces(last_tool_end, &format.scope_end);
            match alt {
                Some(mut a)
                    if found.as_ref().is_none_or(|f| f.prelude.len() > a.prelude.len()) =>
                {
                    a.matched.end = (a.matched.start + last_tool_end.len()).min(self.input().len());
                    self.move_to(a.matched.end);
                    size = last_tool_end.len();
                    found = Some(a);
                }
                _ => match &found {
                    Some(f) => self.move_to(f.matched.end),
                    None => self.move_to(saved),
                },
            }
        }
        (size, found)
    }

    /// Consume consecutive tool calls in `format` starting at the cursor.
    ///
    /// Returns `Ok(false)` (cursor restored) when the input is not a call
    /// block, and [`ParserError::PartialParse`] when the input ends inside a
    /// call; in partial mode that call is recorded with its arguments so far.
    pub fn try_consume_xml_tool_calls(&mut self, format: &XmlToolCallFormat) -> ParserResult<bool> {
        if format.is_functionary() {
            let calls = parse_functionary(self.rest());
            return Ok(self.take_regex_calls(calls));
        }
        if format.is_json_like() {
            let calls = parse_json_like(self.rest(), format);
            return Ok(self.take_regex_calls(calls));
        }
        if format.tool_start.is_empty()
            || format.key_start.is_empty()
            || format.key_val_sep.is_empty()
            || format.val_end.is_empty()
            || format.tool_end.is_empty()
        {
            return Err(ParserError::ParsingFailed(
                "XML format is missing required literals".to_string(),
            ));
        }

        let start = self.pos();
        let mut recovery = true;
        let has_scope = !all_space(&format.scope_start);

        loop {
            if has_scope {
                let Some(scope) = self.try_find_literal(&format.scope_start) else {
                    break;
                };
                if !all_space(self.str(scope.prelude.clone())) {
                    self.move_to(scope.prelude.start);
                    break;
                }
                if scope.matched_len() != format.scope_start.len() {
                    return Err(partial(format!("partial literal {}", format.scope_start)));
                }
            }

            while let Some(tool) = self.try_find_literal(&format.tool_start) {
                if !all_space(self.str(tool.prelude.clone())) {
                    self.move_to(tool.prelude.start);
                    break;
                }
                if tool.matched_len() != format.tool_start.len() {
                    return Err(partial(format!("partial literal {}", format.tool_start)));
                }

                let name_sep = if all_space(&format.tool_sep) {
                    &format.key_start
                } else {
                    &format.tool_sep
                };
                let name_match = self.try_find_literal(name_sep);

                let name_has_tool_end = name_match.as_ref().is_some_and(|m| {
                    let prelude = self.str(m.prelude.clone());
                    prelude.contains(&format.tool_end)
                        || format
                            .last_tool_end
                            .as_deref()
                            .is_some_and(|end| !end.is_empty() && prelude.contains(end))
                });
                if name_match.is_none() || name_has_tool_end {
                    // A call without arguments: NAME directly followed by tool_end.
                    self.move_to(tool.matched.end);
                    let (_, tool_end) = self.try_find_tool_end(format);
                    let Some(tool_end) = tool_end else {
                        return Err(partial("incomplete tool call"));
                    };
                    let mut name = self.str(tool.matched.end..tool_end.matched.start).trim();
                    if !all_space(&format.tool_sep) {
                        name = name.strip_suffix(format.tool_sep.as_str()).unwrap_or(name).trim();
                    }
                    self.add_tool_call(&normalize_function_name(name), "{}".to_string());
                    recovery = false;
                    continue;
                }
                let Some(name_match) = name_match else {
                    return Err(partial("incomplete tool call"));
                };
                if name_match.matched_len() != name_sep.len() {
                    return Err(partial("partial tool name"));
                }
                if all_space(&format.tool_sep) {
                    self.move_to(name_match.matched.start);
                }
                let name = normalize_function_name(self.str(name_match.prelude.clone()));

                let mut args = Map::new();
                self.consume_xml_arguments(format, &name, &mut args, &mut recovery)?;

                let (tool_end_size, tool_end) = self.try_find_tool_end(format);
                let Some(tool_end) = tool_end else {
                    self.add_partial_tool_call(&name, open_args(&args));
                    return Err(partial("incomplete tool call"));
                };
                if !all_space(self.str(tool_end.prelude.clone())) {
                    if recovery {
                        tracing::debug!(pos = self.pos(), "Non-whitespace before tool end");
                        self.move_to(start);
                        return Ok(false);
                    }
                    return Err(ParserError::ParsingFailed(
                        "non-whitespace before tool end".to_string(),
                    ));
                }
                if tool_end.matched_len() != tool_end_size {
                    self.add_partial_tool_call(&name, open_args(&args));
                    return Err(partial("incomplete tool call"));
                }
                if !self.add_tool_call(&name, to_json(&args)) {
                    return Err(partial("tool call without a name"));
                }
                recovery = false;
            }

            if format.scope_end.is_empty() {
                break;
            }
            match self.try_find_literal(&format.scope_end) {
                None => {
                    if !self.is_partial() && self.tool_calls().is_empty() {
                        if recovery {
                            self.move_to(start);
                            return Ok(false);
                        }
                        return Err(ParserError::ParsingFailed(format!(
                            "expected {}",
                            format.scope_end
                        )));
                    }
                    break;
                }
                Some(scope_end) if !all_space(self.str(scope_end.prelude.clone())) => {
                    let prelude_start = scope_end.prelude.start;
                    if has_scope
                        && self
                            .str(prelude_start..self.input().len())
                            .trim_start()
                            .starts_with(&format.scope_start)
                    {
                        self.move_to(prelude_start);
                        continue;
                    }
                    if recovery {
                        self.move_to(start);
                        return Ok(false);
                    }
                    return Err(ParserError::ParsingFailed(
                        "non-whitespace before scope end".to_string(),
                    ));
                }
                Some(_) => {}
            }
            if !has_scope {
                break;
            }
        }

        Ok(!self.tool_calls().is_empty())
    }

    fn consume_xml_arguments(
        &mut self,
        format: &XmlToolCallFormat,
        name: &str,
        args: &mut Map<String, Value>,
        recovery: &mut bool,
    ) -> ParserResult<()> {
        while let Some(key_start) = self.try_find_literal(&format.key_start) {
            if !all_space(self.str(key_start.prelude.clone())) {
                self.move_to(key_start.prelude.start);
                break;
            }
            if key_start.matched_len() != format.key_start.len() {
                self.add_partial_tool_call(name, open_args(args));
                return Err(partial(format!("partial literal {}", format.key_start)));
            }

            let Some(sep) = self.try_find_literal(&format.key_val_sep) else {
                let rest = self.consume_rest();
                args.insert(format!("{rest}{PARTIAL_FLAG}"), Value::String(String::new()));
                self.add_partial_tool_call(name, flagged_args(args));
                return Err(partial(format!("expected {}", format.key_val_sep)));
            };
            if sep.matched_len() != format.key_val_sep.len() {
                let rest = self.str(sep.prelude.clone());
                args.insert(format!("{rest}{PARTIAL_FLAG}"), Value::String(String::new()));
                self.add_partial_tool_call(name, flagged_args(args));
                return Err(partial(format!("partial literal {}", format.key_val_sep)));
            }
            let key = self.str(sep.prelude.clone()).trim().to_string();
            *recovery = false;

            if let Some(sep2) = &format.key_val_sep2 {
                self.consume_spaces();
                self.try_consume_literal(sep2);
            }

            let value_start = self.pos();
            if format.raw_argval != Some(true) && self.consume_json_argument(format, name, &key, args)? {
                continue;
            }
            self.move_to(value_start);

            let (val_end_size, val_end) = self.try_find_val_end(format);
            let Some(val_end) = val_end else {
                let mut rest = self.consume_rest();
                if format.trim_raw_argval {
                    rest = rest.trim();
                }
                args.insert(key, Value::String(format!("{rest}{PARTIAL_FLAG}")));
                self.add_partial_tool_call(name, flagged_args(args));
                return Err(partial(format!("expected {}", format.val_end)));
            };
            if val_end.matched_len() != val_end_size {
                let mut rest = self.str(val_end.prelude.clone());
                if format.trim_raw_argval {
                    rest = rest.trim();
                }
                args.insert(key, Value::String(format!("{rest}{PARTIAL_FLAG}")));
                self.add_partial_tool_call(name, flagged_args(args));
                return Err(partial(format!("partial literal {}", format.val_end)));
            }
            let raw = self.str(val_end.prelude.clone()).trim();
            args.insert(key, parse_parameter_value(raw, format));
        }
        Ok(())
    }

    /// Try the value as JSON. `Ok(true)` when it was consumed together with
    /// its `val_end`; `Ok(false)` to fall back to raw text.
    fn consume_json_argument(
        &mut self,
        format: &XmlToolCallFormat,
        name: &str,
        key: &str,
        args: &mut Map<String, Value>,
    ) -> ParserResult<bool> {
        let (value, raw, healing) = if let Some((s, complete)) = self.try_consume_json_string() {
            if !complete {
                args.insert(key.to_string(), Value::String(format!("{s}{PARTIAL_FLAG}")));
                self.add_partial_tool_call(name, flagged_args(args));
                return Err(partial("JSON string argument is still being generated"));
            }
            (Value::String(s.clone()), Value::String(s), None)
        } else if let Some(json) = self.try_consume_json() {
            (json.value, json.raw, json.healing)
        } else if let Some(primitive) = self.try_consume_json_primitive() {
            (primitive.clone(), primitive, None)
        } else {
            return Ok(false);
        };

        let json_end = self.pos();
        self.consume_spaces();
        if self.at_end() {
            if format.raw_argval == Some(false)
                && (raw.is_object() || raw.is_array() || raw.is_string())
            {
                let mut with_raw = args.clone();
                with_raw.insert(key.to_string(), raw);
                let arguments = match &healing {
                    Some(healing) => dump_prefix(&Value::Object(with_raw), healing),
                    None => open_args(&with_raw),
                };
                args.insert(key.to_string(), value);
                self.add_partial_tool_call(name, arguments);
                return Err(partial("JSON argument value is still being generated"));
            }
            args.insert(key.to_string(), Value::String(PARTIAL_FLAG.to_string()));
            self.add_partial_tool_call(name, flagged_args(args));
            return Err(partial("JSON argument value is still being generated"));
        }

        self.move_to(json_end);
        let (val_end_size, val_end) = self.try_find_val_end(format);
        match val_end {
            Some(val_end) if all_space(self.str(val_end.prelude.clone())) && healing.is_none() => {
                if val_end.matched_len() == val_end_size {
                    args.insert(key.to_string(), value);
                    Ok(true)
                } else {
                    args.insert(key.to_string(), Value::String(PARTIAL_FLAG.to_string()));
                    self.add_partial_tool_call(name, flagged_args(args));
                    Err(partial(format!("partial literal {}", format.val_end)))
                }
            }
            _ => Ok(false),
        }
    }

    fn take_regex_calls(&mut self, calls: Vec<FunctionCall>) -> bool {
        let found = !calls.is_empty();
        for call in calls {
            self.add_tool_call(&call.name, call.arguments);
        }
        found
    }
}

/// Parse calls from the first occurrence of the dialect's opening literal,
/// ignoring whatever text precedes it.
pub fn try_parse_xml_from_scope_start(
    input: &str,
    format: &XmlToolCallFormat,
    partial: bool,
) -> Option<Vec<FunctionCall>> {
    let start = format.scope_or_tool_start();
    if start.is_empty() {
        return None;
    }
    let idx = input.find(start)?;
    let mut parser = ChatMsgParser::new(&input[idx..], partial);
    match parser.try_consume_xml_tool_calls(format) {
        Ok(true) => Some(parser.into_tool_calls()),
        Err(e) if e.is_partial() && partial && !parser.tool_calls().is_empty() => {
            Some(parser.into_tool_calls())
        }
        _ => None,
    }
}

/// Iterative XML parsing with a given dialect, or every preset when `None`.
pub fn parse_xml_iterative(
    input: &str,
    format: Option<&XmlToolCallFormat>,
    partial: bool,
) -> ParserResult<Vec<FunctionCall>> {
    match format {
        Some(format) => {
            if let Some(calls) = try_parse_xml_from_scope_start(input, format, partial) {
                return Ok(calls);
            }
        }
        None => {
            for (_, preset) in xml_format_presets() {
                if let Some(calls) = try_parse_xml_from_scope_start(input, preset, partial) {
                    return Ok(calls);
                }
            }
        }
    }

    let mut parser = ChatMsgParser::new(input, partial);
    match format {
        Some(format) => match parser.try_consume_xml_tool_calls(format) {
            Ok(true) => Ok(parser.into_tool_calls()),
            Ok(false) => Ok(Vec::new()),
            Err(e) if e.is_partial() => Ok(parser.into_tool_calls()),
            Err(e) => Err(e),
        },
        None => {
            for (name, preset) in xml_format_presets() {
                parser.move_to(0);
                parser.clear_tools();
                match parser.try_consume_xml_tool_calls(preset) {
                    Ok(true) => {
                        tracing::debug!(format = name, "Detected XML tool call format");
                        return Ok(parser.into_tool_calls());
                    }
                    Err(e) if e.is_partial() => return Ok(parser.into_tool_calls()),
                    _ => {}
                }
            }
            Ok(Vec::new())
        }
    }
}

/// Parse complete output: iterative parser first, regex parsers after.
pub fn parse_xml(input: &str, format: Option<&XmlToolCallFormat>) -> Vec<FunctionCall> {
    match parse_xml_iterative(input, format, false) {
        Ok(calls) if !calls.is_empty() => return calls,
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "Iterative XML parsing failed, trying regex"),
    }
    match format {
        Some(format) => parse_xml_with_format(input, format),
        None => xml_format_presets()
            .iter()
            .find_map(|(name, preset)| {
                let calls = parse_xml_with_format(input, preset);
                (!calls.is_empty()).then(|| {
                    tracing::debug!(format = name, "Detected XML tool call format");
                    calls
                })
            })
            .unwrap_or_default(),
    }
}

/// Remove reasoning blocks, including an unterminated trailing one.
pub fn strip_reasoning_blocks(input: &str) -> String {
    let mut out = input.to_string();
    for (open, close) in THINK_TAGS {
        while let Some(start) = out.find(open) {
            match out[start + open.len()..].find(close) {
                Some(end) => {
                    let end = start + open.len() + end + close.len();
                    out.replace_range(start..end, "");
                }
                None => {
                    out.truncate(start);
                    break;
                }
            }
        }
    }
    out
}

fn parse_functionary(input: &str) -> Vec<FunctionCall> {
    FUNCTIONARY_CALL
        .captures_iter(input)
        .filter_map(|caps| {
            let name = caps[1].trim();
            let body = caps[2].trim();
            match serde_json::from_str::<Map<String, Value>>(body) {
                Ok(args) => Some(FunctionCall::new(name, to_json(&args))),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping functionary call with invalid JSON");
                    None
                }
            }
        })
        .collect()
}

fn parse_json_like(input: &str, format: &XmlToolCallFormat) -> Vec<FunctionCall> {
    let esc = regex::escape;
    let (open, close) = if format.scope_start.is_empty() {
        (esc(&format.tool_start), esc(&format.tool_end))
    } else {
        (esc(&format.scope_start), esc(&format.scope_end))
    };
    let Ok(outer) = Regex::new(&format!("(?s){open}(.*?){close}")) else {
        return Vec::new();
    };

    let mut calls = Vec::new();
    for caps in outer.captures_iter(input) {
        if !format.scope_start.is_empty() {
            for call in JSON_LIKE_CALL.captures_iter(&caps[1]) {
                calls.push(FunctionCall::new(call[1].trim(), call[2].to_string()));
            }
            continue;
        }
        // The literals cut the call object apart; put it back together.
        let body = format!("{}{}{}", format.tool_start, &caps[1], format.tool_end);
        if let Some(call) = json_call_object(&body) {
            calls.push(call);
        } else if let Some(name) = JSON_LIKE_NAME.captures(&body) {
            let arguments = JSON_LIKE_ARGS
                .captures(&body)
                .map_or_else(|| "{}".to_string(), |a| a[1].to_string());
            calls.push(FunctionCall::new(name[1].trim(), arguments));
        }
    }
    calls
}

/// `{"name": ..., "arguments": {...}}` starting at the first brace of `body`.
fn json_call_object(body: &str) -> Option<FunctionCall> {
    let start = body.find('{')?;
    let value = serde_json::Deserializer::from_str(&body[start..])
        .into_iter::<Value>()
        .next()?
        .ok()?;
    let name = value.get("name")?.as_str()?;
    let arguments = match value.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(args) => args.to_string(),
        None => "{}".to_string(),
    };
    Some(FunctionCall::new(name, arguments))
}

fn parse_glm(input: &str, format: &XmlToolCallFormat) -> Vec<FunctionCall> {
    GLM_CALL
        .captures_iter(input)
        .map(|caps| {
            let name = normalize_function_name(&caps[1]);
            let mut args = Map::new();
            for param in GLM_PARAM.captures_iter(&caps[2]) {
                args.insert(
                    param[1].trim().to_string(),
                    parse_parameter_value(param[2].trim(), format),
                );
            }
            FunctionCall::new(name, to_json(&args))
        })
        .collect()
}

/// Regex based parsing of complete output in one dialect.
pub fn parse_xml_with_format(input: &str, format: &XmlToolCallFormat) -> Vec<FunctionCall> {
    if format.is_functionary() {
        return parse_functionary(input);
    }
    if format.is_json_like() {
        return parse_json_like(input, format);
    }
    if format.is_glm() {
        return parse_glm(input, format);
    }
    if format.tool_start.is_empty() || format.tool_end.is_empty() {
        return Vec::new();
    }

    let esc = regex::escape;
    let tool_pattern = |tool_end: &str| {
        let mut pattern = format!("(?s){}", esc(&format.tool_start));
        if !format.tool_sep.is_empty() {
            pattern.push_str(&format!("(.*?){}(.*?){}", esc(&format.tool_sep), esc(tool_end)));
        } else if !format.key_start.is_empty() {
            pattern.push_str(&format!(
                r"\s*([^\n]+?)\s*({}.*?){}",
                esc(&format.key_start),
                esc(tool_end)
            ));
        } else {
            pattern.push_str(&format!(r"\s*([^\n]+)\s*(.*?){}", esc(tool_end)));
        }
        Regex::new(&pattern).ok()
    };
    let mut tool_patterns: Vec<Regex> = tool_pattern(&format.tool_end).into_iter().collect();
    if let Some(last) = format.last_tool_end.as_deref().filter(|l| !l.is_empty()) {
        tool_patterns.extend(tool_pattern(last));
    }

    let mut scopes: Vec<&str> = Vec::new();
    if !format.scope_start.is_empty() {
        let scope_pattern = format!(
            r"(?s)(\s*){}\s*(.*?)\s*{}",
            esc(&format.scope_start),
            esc(&format.scope_end)
        );
        if let Ok(scope) = Regex::new(&scope_pattern) {
            for caps in scope.captures_iter(input) {
                if let (Some(_), Some(body)) = (caps.get(1), caps.get(2)) {
                    scopes.push(body.as_str());
                }
            }
        }
    }
    if scopes.is_empty() {
        scopes.push(input);
    }

    let mut calls = Vec::new();
    for scope in scopes {
        for pattern in &tool_patterns {
            for caps in pattern.captures_iter(scope) {
                let name = normalize_function_name(&caps[1]);
                let body = &caps[2];
                if let Some(idx) = name.find(&format.tool_end) {
                    calls.push(FunctionCall::new(name[..idx].trim(), "{}".to_string()));
                    continue;
                }
                if body.trim().is_empty() {
                    calls.push(FunctionCall::new(name, "{}".to_string()));
                    continue;
                }
                let args = parse_standard_parameters(body, format);
                calls.push(FunctionCall::new(name, to_json(&args)));
            }
        }
    }
    calls
}

fn parse_standard_parameters(body: &str, format: &XmlToolCallFormat) -> Map<String, Value> {
    if format.key_start == "\"" && format.key_val_sep == "\":" && format.raw_argval != Some(true) {
        let trimmed = body.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            if let Ok(args) = serde_json::from_str::<Map<String, Value>>(trimmed) {
                return args;
            }
        }
    }
    if format.key_start.is_empty() {
        return Map::new();
    }

    let esc = regex::escape;
    let key_pattern = if format.key_start.contains('=') {
        "([^>]+)".to_string()
    } else if format.key_start.contains("name=\"") {
        "([^\"]+)\"".to_string()
    } else {
        format!("([^{}]+)", esc(&format.key_val_sep))
    };
    let sep2 = format.key_val_sep2.as_deref().map(esc).unwrap_or_default();
    let mut ends = vec![format.val_end.as_str()];
    if let Some(last) = format.last_val_end.as_deref().filter(|l| !l.is_empty()) {
        ends.push(last);
    }

    let mut args = Map::new();
    for end in ends {
        let pattern = format!(
            "(?s){}{}{}{}(.*?){}",
            esc(&format.key_start),
            key_pattern,
            esc(&format.key_val_sep),
            sep2,
            esc(end)
        );
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        for caps in re.captures_iter(body) {
            let key = caps[1].trim().to_string();
            if !args.contains_key(&key) {
                args.insert(key, parse_parameter_value(caps[2].trim(), format));
            }
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::xml_format_preset;

    fn preset(name: &str) -> XmlToolCallFormat {
        xml_format_preset(name).unwrap()
    }

    fn args(call: &FunctionCall) -> Value {
        serde_json::from_str(&call.arguments).unwrap()
    }

    const QWEN: &str = "<tool_call>\n<function=get_weather>\n<parameter=location>\nSan Francisco\n</parameter>\n<parameter=days>\n3\n</parameter>\n</function>\n</tool_call>";

    #[test]
    fn qwen3_coder_complete() {
        let calls = parse_xml(QWEN, Some(&preset("qwen3-coder")));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(args(&calls[0]), json!({"location": "San Francisco", "days": 3}));
    }

    #[test]
    fn auto_detects_with_leading_text() {
        let input = format!("Let me check.\n{QWEN}");
        let calls = parse_xml(&input, None);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
    }

    #[test]
    fn qwen3_coder_partial_value() {
        let input = "<tool_call>\n<function=get_weather>\n<parameter=location>\nSan Fr";
        let calls = parse_xml_iterative(input, Some(&preset("qwen3-coder")), true).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, r#"{"location":"San Fr"#);

        let calls = parse_xml_iterative(input, Some(&preset("qwen3-coder")), false).unwrap();
        assert!(calls.is_empty());
    }

    #[test]
    fn qwen3_coder_partial_closing_tag() {
        let input = "<tool_call>\n<function=f>\n<parameter=a>\n1\n</param";
        let calls = parse_xml_iterative(input, Some(&preset("qwen3-coder")), true).unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].arguments.starts_with(r#"{"a":"#));
    }

    #[test]
    fn glm_format() {
        let input = "<tool_call>get_weather\n<arg_key>location</arg_key>\n<arg_value>Paris</arg_value>\n<arg_key>days</arg_key>\n<arg_value>2</arg_value>\n</tool_call>";
        let calls = parse_xml(input, Some(&preset("glm-4.5")));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(args(&calls[0]), json!({"location": "Paris", "days": 2}));
    }

    #[test]
    fn minimax_format() {
        let input = "<minimax:tool_call>\n<invoke name=\"search\">\n<parameter name=\"query\">rust</parameter>\n</invoke>\n</minimax:tool_call>";
        let calls = parse_xml(input, Some(&preset("minimax-m2")));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(args(&calls[0]), json!({"query": "rust"}));
    }

    #[test]
    fn kimi_format_strips_name_decoration() {
        let input = "<|tool_calls_section_begin|><|tool_call_begin|>functions.get_weather:0<|tool_call_argument_begin|>{\"city\": \"Paris\", \"days\": 2}<|tool_call_end|><|tool_calls_section_end|>";
        let calls = parse_xml(input, Some(&preset("kimi-k2")));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(args(&calls[0]), json!({"city": "Paris", "days": 2}));
    }

    #[test]
    fn functionary_format() {
        let input = "<function=get_weather>{\"location\": \"Rome\"}</function>";
        let calls = parse_xml(input, Some(&preset("functionary")));
        assert_eq!(calls.len(), 1);
        assert_eq!(args(&calls[0]), json!({"location": "Rome"}));
    }

    #[test]
    fn apriel_and_mimo_json_like() {
        let input = "<tool_calls>[{\"name\": \"a\", \"arguments\": {\"x\": 1}}, {\"name\": \"b\", \"arguments\": {}}]</tool_calls>";
        let calls = parse_xml(input, Some(&preset("apriel-1.5")));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[0].arguments, "{\"x\": 1}");

        let input = "<tool_call>\n{\"name\": \"lookup\", \"arguments\": {\"id\": 7}}\n</tool_call>";
        let calls = parse_xml(input, Some(&preset("xiaomi-mimo")));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "lookup");
        assert_eq!(args(&calls[0]), json!({"id": 7}));
    }

    #[test]
    fn raw_values_respect_flags() {
        let mut format = preset("qwen3-coder");
        assert_eq!(parse_parameter_value(" 42 ", &format), json!(42));
        format.raw_argval = Some(true);
        assert_eq!(parse_parameter_value(" 42 ", &format), json!("42"));
        format.trim_raw_argval = false;
        format.raw_argval = None;
        assert_eq!(parse_parameter_value("abc", &format), json!("abc"));
    }

    #[test]
    fn multiple_scopes() {
        let input = format!("{QWEN}\n{}", QWEN.replace("get_weather", "get_time"));
        let calls = parse_xml(&input, Some(&preset("qwen3-coder")));
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["get_weather", "get_time"]);
    }

    #[test]
    fn strips_reasoning() {
        assert_eq!(
            strip_reasoning_blocks("<think>plan <tool_call></think>answer<thinking>tail"),
            "answer"
        );
    }
}
