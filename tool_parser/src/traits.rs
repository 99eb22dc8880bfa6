use async_trait::async_trait;
use openai_protocol::common::Tool;

use crate::{
    errors::ParserResult,
    types::{StreamingParseResult, ToolCall, ToolCallItem},
};

/// Core trait for all tool parsers
#[async_trait]
pub trait ToolParser: Send + Sync {
    /// Parse complete tool calls from final output.
    /// Returns (remaining_normal_text, tool_calls).
    async fn parse_complete(&self, output: &str) -> ParserResult<(String, Vec<ToolCall>)>;

    /// Parse tool calls from model output (streaming).
    /// Parsers keep their own buffer and state between calls.
    async fn parse_incremental(
        &mut self,
        chunk: &str,
        tools: &[Tool],
    ) -> ParserResult<StreamingParseResult>;

    /// Check if text contains tool calls in this parser's format
    fn has_tool_markers(&self, text: &str) -> bool;

    /// Argument text that was parsed but never emitted as a fragment.
    /// Called once after the stream ends.
    fn get_unstreamed_tool_args(&self) -> Option<Vec<ToolCallItem>> {
        None
    }

    /// Reset the parser state for reuse across requests
    fn reset(&mut self) {}
}
