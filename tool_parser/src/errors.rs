use thiserror::Error;

/// Result type for tool parser operations
pub type ParserResult<T> = Result<T, ParserError>;

/// Errors that can occur while extracting tool calls from model output
#[derive(Debug, Error)]
pub enum ParserError {
    /// The input ended in the middle of a tool call. Streaming callers treat
    /// this as "wait for more tokens", never as a failure.
    #[error("Partial parse: {0}")]
    PartialParse(String),

    #[error("No tool call matched: {0}")]
    NoMatch(String),

    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("Parsing failed: {0}")]
    ParsingFailed(String),
}

impl ParserError {
    pub fn is_partial(&self) -> bool {
        matches!(self, ParserError::PartialParse(_))
    }
}

impl From<serde_json::Error> for ParserError {
    fn from(err: serde_json::Error) -> Self {
        ParserError::MalformedJson(err.to_string())
    }
}

/// Result type for grammar construction
pub type GrammarResult<T> = Result<T, GrammarError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrammarError {
    #[error("unrecognized schema type {0:?}")]
    UnknownPrimitive(String),

    #[error("unresolved reference {0:?}")]
    UnresolvedRef(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}
