//! Function calling support for LLM outputs.
//!
//! Two halves: [`grammar`] turns tool definitions into a GBNF grammar that
//! constrains what the model may emit, and the parsers recover function
//! calls from what it did emit, either JSON objects or one of several
//! XML-ish dialects, from complete output or token by token.

pub mod chat_parser;
pub mod config;
pub mod errors;
pub mod grammar;
pub mod parsers;
pub mod partial_json;
pub mod pipeline;
pub mod traits;
pub mod types;
pub mod xml;

pub use config::{
    xml_format_preset, xml_format_presets, FunctionsConfig, GrammarConfig, GrammarTrigger,
    ReplaceResult, XmlToolCallFormat,
};
pub use errors::{GrammarError, GrammarResult, ParserError, ParserResult};
pub use grammar::{schema_to_grammar, FunctionDef, Functions, GrammarOptions, NO_ACTION_MESSAGE_PARAM};
pub use parsers::ConfiguredParser;
pub use pipeline::{cleanup_llm_result, parse_function_call, parse_function_call_args, parse_text_content};
pub use traits::ToolParser;
pub use types::{FunctionCall, StreamingParseResult, ToolCall, ToolCallItem};
pub use xml::{parse_xml, strip_reasoning_blocks};
