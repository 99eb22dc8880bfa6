use thiserror::Error;

/// Output of one parsing step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserResult {
    /// Text outside any reasoning block
    pub normal_text: String,
    /// Text inside reasoning blocks
    pub reasoning_text: String,
}

impl ParserResult {
    pub fn new(normal_text: String, reasoning_text: String) -> Self {
        Self {
            normal_text,
            reasoning_text,
        }
    }

    pub fn normal(text: impl Into<String>) -> Self {
        Self {
            normal_text: text.into(),
            reasoning_text: String::new(),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            normal_text: String::new(),
            reasoning_text: text.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normal_text.is_empty() && self.reasoning_text.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("reasoning buffer exceeded {0} bytes")]
    BufferOverflow(usize),

    #[error("invalid parser configuration: {0}")]
    ConfigError(String),
}

/// An opening tag and the closing tag that ends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPair {
    pub start: String,
    pub end: String,
}

impl TagPair {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Tag pairs recognised, in priority order
    pub tags: Vec<TagPair>,
    /// Emit reasoning as it arrives rather than once the block closes
    pub stream_reasoning: bool,
    /// Upper bound on text held back while waiting for a tag to complete
    pub max_buffer_size: usize,
    /// Treat the output as starting inside a reasoning block
    pub initial_in_reasoning: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            tags: vec![
                TagPair::new("<thinking>", "</thinking>"),
                TagPair::new("<think>", "</think>"),
            ],
            stream_reasoning: true,
            max_buffer_size: 65536,
            initial_in_reasoning: false,
        }
    }
}

pub trait ReasoningParser: Send + Sync {
    /// Split a complete output into reasoning and normal text.
    fn detect_and_parse_reasoning(&mut self, text: &str) -> Result<ParserResult, ParseError>;

    /// Feed the next chunk of a stream and return what can be released.
    fn parse_reasoning_streaming_incremental(
        &mut self,
        text: &str,
    ) -> Result<ParserResult, ParseError>;

    /// Release anything still held back at the end of a stream.
    fn flush(&mut self) -> ParserResult;

    fn reset(&mut self);

    fn model_type(&self) -> &str;

    fn is_in_reasoning(&self) -> bool;
}
