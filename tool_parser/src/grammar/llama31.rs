use serde_json::{Map, Value};

use super::{json_schema::JsonSchemaConverter, GrammarOptions};
use crate::{
    config::DEFAULT_FUNCTION_NAME_KEY,
    errors::{GrammarError, GrammarResult},
};

/// Converter emitting `<function=NAME>{"arg": ...}</function>` for each
/// function alternative, as Llama 3.1 expects.
#[derive(Debug, Clone)]
pub struct Llama31SchemaConverter {
    inner: JsonSchemaConverter,
}

impl Llama31SchemaConverter {
    pub fn new(prop_order: &str, function_name_key: &str) -> Self {
        let mut inner = JsonSchemaConverter::new(prop_order);
        let key = if function_name_key.is_empty() {
            DEFAULT_FUNCTION_NAME_KEY
        } else {
            function_name_key
        };
        inner.llama31_name_key = Some(key.to_string());
        Self { inner }
    }

    pub fn grammar(self, schema: &Value, options: &GrammarOptions) -> GrammarResult<String> {
        self.inner.grammar(schema, options)
    }
}

/// Function alternatives sit one level below the root (`root-0`, `root-1`).
pub(super) fn is_function_node(name: &str) -> bool {
    name.split('-').count() == 2
}

impl JsonSchemaConverter {
    pub(super) fn llama31_function_rule(
        &mut self,
        props: &Map<String, Value>,
        rule_name: &str,
        root: &Value,
    ) -> GrammarResult<String> {
        let name_key = self
            .llama31_name_key
            .clone()
            .unwrap_or_else(|| DEFAULT_FUNCTION_NAME_KEY.to_string());
        let name_schema = props.get(&name_key).ok_or_else(|| {
            GrammarError::InvalidSchema(format!(
                "no function name found in {rule_name} (expected property {name_key})"
            ))
        })?;
        let name_rule = self.visit(name_schema, &format!("{rule_name}-{name_key}"), root)?;

        let mut rule = format!(r#""<function=" {name_rule} ">{{""#);
        for (prop, schema) in self.sorted_props(props) {
            if prop == name_key {
                continue;
            }
            let prop_name = format!("{rule_name}-{prop}");
            match schema.get("properties").and_then(Value::as_object) {
                // The call's own braces replace the argument object's.
                Some(inner) if schema.get("type").and_then(Value::as_str) == Some("object") => {
                    let members = self.object_members(inner, &prop_name, root)?;
                    rule.push_str(&members);
                }
                _ => {
                    let prop_rule = self.visit(schema, &prop_name, root)?;
                    rule.push(' ');
                    rule.push_str(&prop_rule);
                }
            }
        }
        rule.push_str(r#" "}</function>""#);
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn functions_schema() -> Value {
        json!({
            "oneOf": [
                {
                    "type": "object",
                    "properties": {
                        "name": {"const": "search"},
                        "arguments": {
                            "type": "object",
                            "properties": {"query": {"type": "string"}}
                        }
                    }
                },
                {
                    "type": "object",
                    "properties": {
                        "name": {"const": "create_event"},
                        "arguments": {
                            "type": "object",
                            "properties": {
                                "title": {"type": "string"},
                                "when": {"enum": ["today", "tomorrow"]}
                            }
                        }
                    }
                }
            ]
        })
    }

    #[test]
    fn emits_function_tags() {
        let grammar = Llama31SchemaConverter::new("", "")
            .grammar(&functions_schema(), &GrammarOptions::default())
            .unwrap();
        assert!(grammar.contains(
            r#"root-0 ::= "<function=" root-0-name ">{" "\"query\"" space ":" space string "}</function>""#
        ));
        assert!(grammar.contains(r#"root-0-name ::= "search""#));
        assert!(grammar.contains(r#"root-1-name ::= "create_event""#));
        assert!(grammar.contains(r#"root-1-arguments-when ::= "\"today\"" | "\"tomorrow\"""#));
        assert!(grammar.contains("root ::= root-0 | root-1"));
    }

    #[test]
    fn custom_name_key() {
        let schema = json!({
            "oneOf": [{
                "type": "object",
                "properties": {
                    "function": {"const": "f"},
                    "arguments": {"type": "object", "properties": {"a": {"type": "integer"}}}
                }
            }]
        });
        let grammar = Llama31SchemaConverter::new("", "function")
            .grammar(&schema, &GrammarOptions::default())
            .unwrap();
        assert!(grammar.contains(r#""<function=" root-0-function ">{""#));
    }

    #[test]
    fn missing_name_is_invalid() {
        let schema = json!({
            "oneOf": [{
                "type": "object",
                "properties": {"arguments": {"type": "object", "properties": {}}}
            }]
        });
        let err = Llama31SchemaConverter::new("", "")
            .grammar(&schema, &GrammarOptions::default())
            .unwrap_err();
        assert!(matches!(err, GrammarError::InvalidSchema(_)));
    }
}
