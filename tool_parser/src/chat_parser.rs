//! Cursor over model output used by the iterative tool call parsers.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::{
    partial_json::{heal_string, healing_marker, parse_json_prefix, JsonPrefix},
    types::FunctionCall,
};

static JSON_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-?[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]*)?").expect("valid number regex")
});

/// A literal located by [`ChatMsgParser::try_find_literal`].
#[derive(Debug, Clone, PartialEq)]
pub struct LiteralMatch {
    /// Text between the search start and the match
    pub prelude: Range<usize>,
    /// The match itself; shorter than the literal when only a prefix of it
    /// was found at the end of partial input
    pub matched: Range<usize>,
}

impl LiteralMatch {
    pub fn matched_len(&self) -> usize {
        self.matched.end - self.matched.start
    }
}

pub(crate) fn all_space(s: &str) -> bool {
    s.trim().is_empty()
}

/// Start of the longest suffix of `haystack` that is a proper prefix of
/// `needle`.
pub(crate) fn find_partial_stop(haystack: &str, needle: &str) -> Option<usize> {
    if haystack.is_empty() || needle.is_empty() {
        return None;
    }
    (1..=needle.len().min(haystack.len()))
        .rev()
        .filter(|&i| needle.is_char_boundary(i))
        .find(|&i| haystack.ends_with(&needle[..i]))
        .map(|i| haystack.len() - i)
}

#[derive(Debug)]
pub struct ChatMsgParser<'a> {
    input: &'a str,
    partial: bool,
    pos: usize,
    marker: String,
    tool_calls: Vec<FunctionCall>,
}

impl<'a> ChatMsgParser<'a> {
    pub fn new(input: &'a str, partial: bool) -> Self {
        Self {
            input,
            partial,
            pos: 0,
            marker: healing_marker(input),
            tool_calls: Vec::new(),
        }
    }

    pub fn input(&self) -> &'a str {
        self.input
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub fn move_to(&mut self, pos: usize) {
        self.pos = pos.min(self.input.len());
    }

    pub fn str(&self, range: Range<usize>) -> &'a str {
        self.input.get(range).unwrap_or_default()
    }

    pub fn rest(&self) -> &'a str {
        self.input.get(self.pos..).unwrap_or_default()
    }

    pub fn consume_rest(&mut self) -> &'a str {
        let rest = self.rest();
        self.pos = self.input.len();
        rest
    }

    pub fn tool_calls(&self) -> &[FunctionCall] {
        &self.tool_calls
    }

    pub fn into_tool_calls(self) -> Vec<FunctionCall> {
        self.tool_calls
    }

    pub fn clear_tools(&mut self) {
        self.tool_calls.clear();
    }

    /// Record a call; calls without a name are refused.
    pub fn add_tool_call(&mut self, name: &str, arguments: String) -> bool {
        if name.is_empty() {
            return false;
        }
        self.tool_calls.push(FunctionCall::new(name, arguments));
        true
    }

    /// Record a call whose arguments are still being generated. Only kept
    /// when parsing partial input.
    pub fn add_partial_tool_call(&mut self, name: &str, arguments: String) {
        if self.partial {
            self.add_tool_call(name, arguments);
        }
    }

    pub fn consume_spaces(&mut self) -> bool {
        let start = self.pos;
        let skipped = self.rest().len() - self.rest().trim_start().len();
        self.pos += skipped;
        self.pos > start
    }

    pub fn try_consume_literal(&mut self, literal: &str) -> bool {
        if self.rest().starts_with(literal) {
            self.pos += literal.len();
            true
        } else {
            false
        }
    }

    /// Find `literal` at or after the cursor and move past it.
    ///
    /// On partial input a trailing prefix of the literal also counts; the
    /// cursor then moves to the end of input. An empty literal matches
    /// immediately.
    pub fn try_find_literal(&mut self, literal: &str) -> Option<LiteralMatch> {
        let rest = self.rest();
        if let Some(idx) = rest.find(literal) {
            let start = self.pos + idx;
            let found = LiteralMatch {
                prelude: self.pos..start,
                matched: start..start + literal.len(),
            };
            self.pos = start + literal.len();
            return Some(found);
        }
        if self.partial {
            if let Some(idx) = find_partial_stop(rest, literal) {
                let start = self.pos + idx;
                let found = LiteralMatch {
                    prelude: self.pos..start,
                    matched: start..self.input.len(),
                };
                self.pos = self.input.len();
                return Some(found);
            }
        }
        None
    }

    /// Find `first`, then `second` separated from it only by whitespace.
    /// The returned match spans both literals.
    pub fn try_find_2_literals_split_by_spaces(
        &mut self,
        first: &str,
        second: &str,
    ) -> Option<LiteralMatch> {
        if first.is_empty() {
            return self.try_find_literal(second);
        }
        let saved = self.pos;
        while let Some(found) = self.try_find_literal(first) {
            self.consume_spaces();
            let rest = self.rest();
            let len = second.len().min(rest.len());
            let complete_or_partial = len == second.len() || self.partial;
            if complete_or_partial
                && rest.is_char_boundary(len)
                && second.as_bytes().starts_with(&rest.as_bytes()[..len])
            {
                self.pos += len;
                return Some(LiteralMatch {
                    prelude: saved..found.matched.start,
                    matched: found.matched.start..self.pos,
                });
            }
            let next = self.input[found.matched.start..]
                .chars()
                .next()
                .map_or(self.input.len(), |c| found.matched.start + c.len_utf8());
            self.move_to(next);
        }
        self.move_to(saved);
        None
    }

    /// Consume a JSON object or array at the cursor, healing it if the
    /// input ends inside it.
    pub fn try_consume_json(&mut self) -> Option<JsonPrefix> {
        self.consume_spaces();
        let rest = self.rest();
        if !(rest.starts_with('{') || rest.starts_with('[')) {
            return None;
        }
        let parsed = parse_json_prefix(rest, self.partial, &self.marker)?;
        self.pos += parsed.consumed;
        Some(parsed)
    }

    /// Consume a JSON string literal. The flag is false when the string was
    /// cut by the end of partial input and had to be closed.
    pub fn try_consume_json_string(&mut self) -> Option<(String, bool)> {
        self.consume_spaces();
        let rest = self.rest();
        if !rest.starts_with('"') {
            return None;
        }
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<String>();
        match stream.next() {
            Some(Ok(s)) => {
                self.pos += stream.byte_offset();
                Some((s, true))
            }
            Some(Err(e)) if e.is_eof() && self.partial => {
                let s = heal_string(rest)?;
                self.pos = self.input.len();
                Some((s, false))
            }
            _ => None,
        }
    }

    /// Consume `null`, `true`, `false` or a number followed by a terminator.
    pub fn try_consume_json_primitive(&mut self) -> Option<Value> {
        self.consume_spaces();
        let rest = self.rest();
        let terminated = |len: usize| {
            rest.as_bytes()
                .get(len)
                .is_none_or(|b| b" \t\n\r,}]:<".contains(b))
        };
        for (word, value) in [
            ("null", Value::Null),
            ("true", Value::Bool(true)),
            ("false", Value::Bool(false)),
        ] {
            if rest.starts_with(word) && terminated(word.len()) {
                self.pos += word.len();
                return Some(value);
            }
        }
        let number = JSON_NUMBER.find(rest)?.as_str();
        let value: Value = serde_json::from_str(number.trim_end_matches(['.', 'e', 'E', '+', '-'])).ok()?;
        if !terminated(number.len()) {
            return None;
        }
        self.pos += number.len();
        Some(value)
    }
}
