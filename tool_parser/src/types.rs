use serde::{Deserialize, Serialize};

/// A function invocation extracted from model output.
///
/// `arguments` is a JSON document encoded as a string, matching the OpenAI
/// wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// A parsed tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

impl From<FunctionCall> for ToolCall {
    fn from(function: FunctionCall) -> Self {
        Self { function }
    }
}

/// Result of feeding one chunk to a streaming parser
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingParseResult {
    /// Text that is definitely not part of a tool call
    pub normal_text: String,
    /// Tool call fragments detected in this chunk
    pub calls: Vec<ToolCallItem>,
}

/// A streaming tool call fragment.
///
/// The first fragment of a call carries `name`; later fragments carry
/// argument text to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallItem {
    pub tool_index: usize,
    pub name: Option<String>,
    pub parameters: String,
}
