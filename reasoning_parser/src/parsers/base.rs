//! Tag-driven reasoning parser shared by every configured model.

use tracing::{debug, warn};

use crate::{
    extract::extract_reasoning_with_tags,
    traits::{ParseError, ParserConfig, ParserResult, ReasoningParser},
};

/// Length of the longest suffix of `buffer` that is a proper prefix of
/// `tag`.
fn partial_suffix_len(buffer: &str, tag: &str) -> usize {
    (1..tag.len().min(buffer.len() + 1))
        .rev()
        .filter(|&i| tag.is_char_boundary(i))
        .find(|&i| buffer.ends_with(&tag[..i]))
        .unwrap_or(0)
}

/// Streaming state machine over a set of reasoning tag pairs.
///
/// Text that could still turn out to be the beginning of a tag is held back
/// until the next chunk decides it.
#[derive(Debug, Clone)]
pub struct BaseReasoningParser {
    config: ParserConfig,
    model_type: String,
    buffer: String,
    in_reasoning: bool,
    /// Index of the pair whose closing tag ends the current block; `None`
    /// while in a forced-open block, which any closing tag ends.
    open_pair: Option<usize>,
    /// Reasoning withheld until its block closes when not streaming it
    pending_reasoning: String,
    /// Strip whitespace right after an opening tag
    at_block_start: bool,
}

impl BaseReasoningParser {
    pub fn new(config: ParserConfig) -> Self {
        let in_reasoning = config.initial_in_reasoning;
        Self {
            config,
            model_type: "base".to_string(),
            buffer: String::new(),
            in_reasoning,
            open_pair: None,
            pending_reasoning: String::new(),
            at_block_start: in_reasoning,
        }
    }

    pub fn with_model_type(mut self, model_type: String) -> Self {
        self.model_type = model_type;
        self
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    fn find_open(&self) -> Option<(usize, usize)> {
        self.config
            .tags
            .iter()
            .enumerate()
            .filter_map(|(i, pair)| self.buffer.find(&pair.start).map(|idx| (idx, i)))
            .min()
    }

    fn find_close(&self) -> Option<(usize, usize)> {
        let candidates = self.config.tags.iter().enumerate().filter(|(i, _)| {
            self.open_pair.is_none_or(|open| open == *i)
        });
        candidates
            .filter_map(|(_, pair)| self.buffer.find(&pair.end).map(|idx| (idx, pair.end.len())))
            .min()
    }

    fn held_back(&self) -> usize {
        let tags = self.config.tags.iter().enumerate();
        if self.in_reasoning {
            tags.filter(|(i, _)| self.open_pair.is_none_or(|open| open == *i))
                .map(|(_, pair)| partial_suffix_len(&self.buffer, &pair.end))
                .max()
                .unwrap_or(0)
        } else {
            tags.map(|(_, pair)| partial_suffix_len(&self.buffer, &pair.start))
                .max()
                .unwrap_or(0)
        }
    }

    fn push_reasoning(&mut self, result: &mut ParserResult, text: &str) {
        let text = if self.at_block_start {
            text.trim_start()
        } else {
            text
        };
        if text.is_empty() {
            return;
        }
        self.at_block_start = false;
        if self.config.stream_reasoning {
            result.reasoning_text.push_str(text);
        } else {
            self.pending_reasoning.push_str(text);
        }
    }

    fn close_block(&mut self, result: &mut ParserResult) {
        if !self.config.stream_reasoning {
            let block = std::mem::take(&mut self.pending_reasoning);
            result.reasoning_text.push_str(block.trim_end());
        }
        self.in_reasoning = false;
        self.open_pair = None;
        self.at_block_start = false;
    }
}

impl ReasoningParser for BaseReasoningParser {
    fn detect_and_parse_reasoning(&mut self, text: &str) -> Result<ParserResult, ParseError> {
        let (reasoning, normal) =
            extract_reasoning_with_tags(text, &self.config.tags, self.config.initial_in_reasoning);
        Ok(ParserResult::new(normal, reasoning))
    }

    fn parse_reasoning_streaming_incremental(
        &mut self,
        text: &str,
    ) -> Result<ParserResult, ParseError> {
        self.buffer.push_str(text);
        if self.buffer.len() > self.config.max_buffer_size {
            warn!(
                model_type = %self.model_type,
                buffered = self.buffer.len(),
                "Reasoning buffer overflow"
            );
            return Err(ParseError::BufferOverflow(self.config.max_buffer_size));
        }

        let mut result = ParserResult::default();
        loop {
            if self.in_reasoning {
                if let Some((idx, len)) = self.find_close() {
                    let before = self.buffer[..idx].to_string();
                    self.buffer.drain(..idx + len);
                    self.push_reasoning(&mut result, &before);
                    self.close_block(&mut result);
                    continue;
                }
            } else if let Some((idx, pair)) = self.find_open() {
                let len = self.config.tags[pair].start.len();
                let before = self.buffer[..idx].to_string();
                self.buffer.drain(..idx + len);
                result.normal_text.push_str(&before);
                self.in_reasoning = true;
                self.open_pair = Some(pair);
                self.at_block_start = true;
                continue;
            }

            let release = self.buffer.len() - self.held_back();
            let released: String = self.buffer.drain(..release).collect();
            if self.in_reasoning {
                self.push_reasoning(&mut result, &released);
            } else {
                result.normal_text.push_str(&released);
            }
            return Ok(result);
        }
    }

    fn flush(&mut self) -> ParserResult {
        let mut result = ParserResult::default();
        let rest = std::mem::take(&mut self.buffer);
        if self.in_reasoning {
            debug!(model_type = %self.model_type, "Stream ended inside a reasoning block");
            self.push_reasoning(&mut result, &rest);
            if !self.config.stream_reasoning {
                let block = std::mem::take(&mut self.pending_reasoning);
                result.reasoning_text.push_str(block.trim_end());
            }
        } else {
            result.normal_text.push_str(&rest);
        }
        result
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.pending_reasoning.clear();
        self.in_reasoning = self.config.initial_in_reasoning;
        self.open_pair = None;
        self.at_block_start = self.in_reasoning;
    }

    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn is_in_reasoning(&self) -> bool {
        self.in_reasoning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(parser: &mut BaseReasoningParser, chunks: &[&str]) -> (String, String) {
        let mut normal = String::new();
        let mut reasoning = String::new();
        for chunk in chunks {
            let r = parser.parse_reasoning_streaming_incremental(chunk).unwrap();
            normal.push_str(&r.normal_text);
            reasoning.push_str(&r.reasoning_text);
        }
        let r = parser.flush();
        normal.push_str(&r.normal_text);
        reasoning.push_str(&r.reasoning_text);
        (reasoning, normal)
    }

    #[test]
    fn no_reasoning() {
        let mut parser = BaseReasoningParser::new(ParserConfig::default());
        let result = parser
            .detect_and_parse_reasoning("This is a normal response.")
            .unwrap();
        assert_eq!(result.normal_text, "This is a normal response.");
        assert_eq!(result.reasoning_text, "");
    }

    #[test]
    fn streaming_splits_tags_across_chunks() {
        let mut parser = BaseReasoningParser::new(ParserConfig::default());
        let (reasoning, normal) = stream(
            &mut parser,
            &["Hi <th", "ink>\nStep 1", ". Step 2</th", "ink>", "Answer"],
        );
        assert_eq!(reasoning, "Step 1. Step 2");
        assert_eq!(normal, "Hi Answer");
        assert!(!parser.is_in_reasoning());
    }

    #[test]
    fn streaming_releases_reasoning_early() {
        let mut parser = BaseReasoningParser::new(ParserConfig::default());
        let r = parser
            .parse_reasoning_streaming_incremental("<thinking>weighing options <")
            .unwrap();
        assert_eq!(r.reasoning_text, "weighing options ");
        assert!(parser.is_in_reasoning());
        let r = parser.parse_reasoning_streaming_incremental("/thinking>ok").unwrap();
        assert_eq!(r.normal_text, "ok");
    }

    #[test]
    fn forced_open_stream() {
        let config = ParserConfig {
            initial_in_reasoning: true,
            ..Default::default()
        };
        let mut parser = BaseReasoningParser::new(config).with_model_type("forced".into());
        let (reasoning, normal) = stream(&mut parser, &["\nplanning", "</think>", "done"]);
        assert_eq!(reasoning, "planning");
        assert_eq!(normal, "done");
        assert_eq!(parser.model_type(), "forced");

        parser.reset();
        assert!(parser.is_in_reasoning());
    }

    #[test]
    fn withheld_reasoning_arrives_on_close() {
        let config = ParserConfig {
            stream_reasoning: false,
            ..Default::default()
        };
        let mut parser = BaseReasoningParser::new(config);
        let r = parser
            .parse_reasoning_streaming_incremental("<think>part one ")
            .unwrap();
        assert!(r.is_empty());
        let r = parser
            .parse_reasoning_streaming_incremental("part two</think>x")
            .unwrap();
        assert_eq!(r.reasoning_text, "part one part two");
        assert_eq!(r.normal_text, "x");
    }

    #[test]
    fn truncated_block_flushes_as_reasoning() {
        let mut parser = BaseReasoningParser::new(ParserConfig::default());
        let (reasoning, normal) = stream(&mut parser, &["<think>Analyzing the problem</thi"]);
        assert_eq!(reasoning, "Analyzing the problem</thi");
        assert_eq!(normal, "");
    }

    #[test]
    fn buffer_limit() {
        let config = ParserConfig {
            max_buffer_size: 8,
            ..Default::default()
        };
        let mut parser = BaseReasoningParser::new(config);
        assert_eq!(
            parser.parse_reasoning_streaming_incremental("0123456789"),
            Err(ParseError::BufferOverflow(8))
        );
    }
}
