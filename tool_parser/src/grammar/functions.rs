use openai_protocol::common::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{schema_to_grammar, GrammarOptions};
use crate::{
    config::{FunctionsConfig, DEFAULT_FUNCTION_ARGUMENTS_KEY, DEFAULT_FUNCTION_NAME_KEY},
    errors::GrammarResult,
};

/// Parameter of the synthetic no-action function
pub const NO_ACTION_MESSAGE_PARAM: &str = "message";

/// A callable function as offered to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub parameters: Value,
}

impl From<&Tool> for FunctionDef {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.function.name.clone(),
            description: tool.function.description.clone().unwrap_or_default(),
            strict: tool.function.strict.unwrap_or(false),
            parameters: tool.function.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Functions(pub Vec<FunctionDef>);

/// `oneOf` schema over every function, ready for a converter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonFunctionStructure {
    #[serde(rename = "oneOf", default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<Value>,
    #[serde(rename = "$defs", default, skip_serializing_if = "Map::is_empty")]
    pub defs: Map<String, Value>,
}

impl JsonFunctionStructure {
    pub fn grammar(&self, options: &GrammarOptions) -> GrammarResult<String> {
        let schema = serde_json::to_value(self).unwrap_or(Value::Null);
        schema_to_grammar(&schema, options)
    }
}

impl Functions {
    pub fn from_tools(tools: &[Tool]) -> Self {
        Self(tools.iter().map(FunctionDef::from).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionDef> {
        self.0.iter()
    }

    /// Only the function called `name`, or nothing.
    pub fn select(&self, name: &str) -> Self {
        Self(self.0.iter().filter(|f| f.name == name).take(1).cloned().collect())
    }

    /// Replace `null` anywhere in the parameter schemas with `{}`.
    pub fn sanitize(mut self) -> Self {
        for function in &mut self.0 {
            sanitize_value(&mut function.parameters, &function.name);
        }
        self
    }

    /// Append the synthetic function used to answer without calling a tool.
    pub fn with_no_action(mut self, name: &str, description: &str) -> Self {
        self.0.push(FunctionDef {
            name: name.to_string(),
            description: description.to_string(),
            strict: false,
            parameters: json!({
                "type": "object",
                "properties": {
                    NO_ACTION_MESSAGE_PARAM: {
                        "type": "string",
                        "description": "The message to reply the user with"
                    }
                }
            }),
        });
        self
    }

    pub fn to_json_structure(&self, name_key: &str, args_key: &str) -> JsonFunctionStructure {
        let name_key = if name_key.is_empty() {
            DEFAULT_FUNCTION_NAME_KEY
        } else {
            name_key
        };
        let args_key = if args_key.is_empty() {
            DEFAULT_FUNCTION_ARGUMENTS_KEY
        } else {
            args_key
        };

        let mut structure = JsonFunctionStructure::default();
        for (i, function) in self.0.iter().enumerate() {
            if i == 0 {
                if let Some(Value::Object(defs)) = function.parameters.get("$defs") {
                    structure.defs = defs.clone();
                }
            }
            let properties = match function.parameters.get("properties") {
                Some(Value::Object(props)) => Value::Object(props.clone()),
                _ => Value::Object(Map::new()),
            };
            structure.one_of.push(json!({
                "type": "object",
                "properties": {
                    name_key: {"const": function.name},
                    args_key: {"type": "object", "properties": properties}
                }
            }));
        }
        structure
    }

    /// Grammar constraining the model to one call of these functions, plus
    /// the no-action function unless the config disables it.
    pub fn grammar(&self, config: &FunctionsConfig) -> GrammarResult<String> {
        let mut functions = self.clone().sanitize();
        if !config.disable_no_action {
            functions = functions.with_no_action(config.no_action_name(), config.no_action_description());
        }
        functions
            .to_json_structure(&config.function_name_key, &config.function_arguments_key)
            .grammar(&config.grammar_options())
    }
}

fn sanitize_value(value: &mut Value, path: &str) {
    match value {
        Value::Null => {
            tracing::debug!(path, "Replacing null schema value with an empty object");
            *value = Value::Object(Map::new());
        }
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                sanitize_value(inner, &format!("{path}.{key}"));
            }
        }
        Value::Array(items) => {
            for (i, inner) in items.iter_mut().enumerate() {
                sanitize_value(inner, &format!("{path}[{i}]"));
            }
        }
        _ => {}
    }
}
