//! Reasoning extraction for model output.
//!
//! Models that think out loud wrap their chain of thought in tags such as
//! `<think>…</think>`. This crate splits such output into a reasoning
//! channel and the visible content, either in one shot or incrementally
//! while tokens stream in.

pub mod extract;
pub mod parsers;
pub mod traits;

pub use extract::{
    detect_thinking_forced_open, extract_reasoning, extract_reasoning_with_tags,
    ReasoningOptions, THINKING_OPEN_TAGS,
};
pub use parsers::BaseReasoningParser;
pub use traits::{ParseError, ParserConfig, ParserResult, ReasoningParser, TagPair};
