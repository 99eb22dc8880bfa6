//! Grammar construction for constrained decoding.
//!
//! Tool definitions (or a user supplied JSON schema) are converted into a
//! GBNF style grammar. Two converters exist: the generic JSON one and a
//! Llama 3.1 flavour that emits `<function=NAME>{...}</function>`.

mod functions;
mod json_schema;
mod llama31;
mod rules;

pub use functions::{FunctionDef, Functions, JsonFunctionStructure, NO_ACTION_MESSAGE_PARAM};
pub use json_schema::JsonSchemaConverter;
pub use llama31::Llama31SchemaConverter;
pub use rules::{format_literal, RuleSet};

use serde_json::Value;

use crate::errors::GrammarResult;

pub const SCHEMA_TYPE_LLAMA31: &str = "llama3.1";

/// Post-processing toggles applied to the root rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrammarOptions {
    /// Root also accepts a JSON array of values (parallel calls)
    pub maybe_array: bool,
    /// Root may be free text instead of, or before, the JSON value
    pub maybe_string: bool,
    pub disable_parallel_new_lines: bool,
    /// Literal required before the JSON value
    pub prefix: String,
    pub no_mixed_free_string: bool,
    pub expect_strings_after_json: bool,
    /// `json` or `llama3.1`; empty means `json`
    pub schema_type: String,
    /// Property holding the function name for the Llama 3.1 converter
    pub function_name_key: String,
    /// Comma separated property order hint
    pub prop_order: String,
}

impl GrammarOptions {
    pub fn is_llama31(&self) -> bool {
        self.schema_type == SCHEMA_TYPE_LLAMA31
    }
}

/// Build a grammar for an arbitrary schema with the converter named by
/// `options.schema_type`.
pub fn schema_to_grammar(schema: &Value, options: &GrammarOptions) -> GrammarResult<String> {
    if options.is_llama31() {
        Llama31SchemaConverter::new(&options.prop_order, &options.function_name_key)
            .grammar(schema, options)
    } else {
        JsonSchemaConverter::new(&options.prop_order).grammar(schema, options)
    }
}

/// Split a `a,b,c` order hint into a 1-based position map.
pub(crate) fn parse_prop_order(order: &str) -> std::collections::HashMap<String, usize> {
    order
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .enumerate()
        .map(|(i, name)| (name.to_string(), i + 1))
        .collect()
}
