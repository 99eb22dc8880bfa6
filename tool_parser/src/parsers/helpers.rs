use std::collections::HashMap;

use openai_protocol::common::Tool;

use crate::{
    chat_parser::find_partial_stop,
    types::{FunctionCall, ToolCallItem},
};

/// Length of the longest suffix of `buffer` that is a proper prefix of
/// `token`, i.e. how much of the buffer must be held back in case the
/// token is still arriving.
pub fn ends_with_partial_token(buffer: &str, token: &str) -> Option<usize> {
    find_partial_stop(buffer, token).map(|idx| buffer.len() - idx)
}

/// Map of tool name to its position in the request.
pub fn get_tool_indices(tools: &[Tool]) -> HashMap<String, usize> {
    tools
        .iter()
        .enumerate()
        .map(|(i, tool)| (tool.function.name.clone(), i))
        .collect()
}

/// Argument text of `calls` that was never streamed.
///
/// Only calls whose streamed text is a prefix of the final arguments can be
/// completed; anything else is logged and skipped.
pub fn get_unstreamed_args(
    calls: &[FunctionCall],
    streamed_args_for_tool: &[String],
) -> Option<Vec<ToolCallItem>> {
    let items: Vec<ToolCallItem> = calls
        .iter()
        .zip(streamed_args_for_tool)
        .enumerate()
        .filter_map(|(tool_index, (call, streamed))| {
            let Some(rest) = call.arguments.strip_prefix(streamed.as_str()) else {
                tracing::warn!(
                    tool_index,
                    name = %call.name,
                    "Streamed arguments diverged from the final arguments"
                );
                return None;
            };
            (!rest.is_empty()).then(|| ToolCallItem {
                tool_index,
                name: None,
                parameters: rest.to_string(),
            })
        })
        .collect();
    (!items.is_empty()).then_some(items)
}

/// Clear everything a streaming parser accumulates.
pub fn reset_parser_state(
    buffer: &mut String,
    prev_tool_call_arr: &mut Vec<FunctionCall>,
    streamed_args_for_tool: &mut Vec<String>,
) {
    buffer.clear();
    prev_tool_call_arr.clear();
    streamed_args_for_tool.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_token_suffix() {
        assert_eq!(ends_with_partial_token("text <tool", "<tool_call>"), Some(5));
        assert_eq!(ends_with_partial_token("text", "<tool_call>"), None);
    }

    #[test]
    fn unstreamed_remainder() {
        let calls = vec![
            FunctionCall::new("a", r#"{"x":1}"#),
            FunctionCall::new("b", r#"{"y":2}"#),
        ];
        let streamed = vec![r#"{"x":1}"#.to_string(), r#"{"y":"#.to_string()];
        let items = get_unstreamed_args(&calls, &streamed).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tool_index, 1);
        assert_eq!(items[0].parameters, "2}");

        assert!(get_unstreamed_args(&calls[..1], &streamed[..1]).is_none());
    }
}
