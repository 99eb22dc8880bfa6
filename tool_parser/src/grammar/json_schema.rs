use std::collections::HashMap;

use serde_json::{Map, Value};

use super::{
    parse_prop_order,
    llama31::is_function_node,
    rules::{format_literal, format_literal_unquoted, primitive_rule, RuleSet, FREESTRING_RULE},
    GrammarOptions,
};
use crate::errors::{GrammarError, GrammarResult};

const DEFS_PREFIX: &str = "#/$defs/";

const OBJECT_RULE: &str = r#""{" space ( string ":" space value ("," space string ":" space value)* )? "}" space"#;
const GENERIC_ARRAY_RULE: &str = r#""[" space ( value ("," space value)* )? "]" space"#;
const VALUE_RULE: &str = "object | array | string | number | boolean | null";

/// Converts a JSON schema into grammar rules.
#[derive(Debug, Clone)]
pub struct JsonSchemaConverter {
    prop_order: HashMap<String, usize>,
    pub(super) rules: RuleSet,
    refs: HashMap<String, String>,
    /// Function name property when emitting the Llama 3.1 surface
    pub(super) llama31_name_key: Option<String>,
}

impl JsonSchemaConverter {
    pub fn new(prop_order: &str) -> Self {
        Self {
            prop_order: parse_prop_order(prop_order),
            rules: RuleSet::default(),
            refs: HashMap::new(),
            llama31_name_key: None,
        }
    }

    /// Convert `schema` and render the final grammar.
    pub fn grammar(mut self, schema: &Value, options: &GrammarOptions) -> GrammarResult<String> {
        self.rules.add("freestring", FREESTRING_RULE);
        self.visit(schema, "", schema)?;
        Ok(self.rules.render(options))
    }

    /// Emit rules for `schema` under `name` and return the rule to reference.
    pub fn visit(&mut self, schema: &Value, name: &str, root: &Value) -> GrammarResult<String> {
        let rule_name = if name.is_empty() { "root" } else { name };

        let Some(obj) = schema.as_object() else {
            return match schema {
                Value::Bool(true) => Ok(self.add_generic_value()),
                _ => Err(GrammarError::InvalidSchema(format!(
                    "schema for {rule_name} is not an object"
                ))),
            };
        };

        if let Some(alts) = obj.get("oneOf").or_else(|| obj.get("anyOf")) {
            let alts = alts.as_array().ok_or_else(|| {
                GrammarError::InvalidSchema(format!("oneOf/anyOf of {rule_name} must be a list"))
            })?;
            let mut names = Vec::with_capacity(alts.len());
            for (i, alt) in alts.iter().enumerate() {
                names.push(self.visit(alt, &format!("{rule_name}-{i}"), root)?);
            }
            return Ok(self.rules.add(rule_name, &names.join(" | ")));
        }

        if let Some(reference) = obj.get("$ref") {
            return self.visit_ref(reference, root);
        }

        if let Some(constant) = obj.get("const") {
            let literal = if self.llama31_name_key.is_some() {
                format_literal_unquoted(constant)
            } else {
                format_literal(constant)
            };
            return Ok(self.rules.add(rule_name, &literal));
        }

        if let Some(values) = obj.get("enum") {
            let values = values.as_array().ok_or_else(|| {
                GrammarError::InvalidSchema(format!("enum of {rule_name} must be a list"))
            })?;
            let rule = values
                .iter()
                .map(format_literal)
                .collect::<Vec<_>>()
                .join(" | ");
            return Ok(self.rules.add(rule_name, &rule));
        }

        match obj.get("type") {
            Some(Value::String(t)) if t == "object" => match obj.get("properties") {
                Some(Value::Object(props))
                    if self.llama31_name_key.is_some() && is_function_node(name) =>
                {
                    let rule = self.llama31_function_rule(props, rule_name, root)?;
                    Ok(self.rules.add(rule_name, &rule))
                }
                Some(Value::Object(props)) if !props.is_empty() => {
                    let rule = self.object_rule(props, rule_name, root)?;
                    Ok(self.rules.add(rule_name, &rule))
                }
                _ => Ok(self.add_generic_object()),
            },
            Some(Value::String(t)) if t == "array" => match obj.get("items") {
                Some(items) => {
                    let item = self.visit(items, &format!("{rule_name}-item"), root)?;
                    let rule =
                        format!(r#""[" space ({item} ("," space {item})*)? "]" space"#);
                    Ok(self.rules.add(rule_name, &rule))
                }
                None => {
                    self.add_generic_value();
                    Ok("array".to_string())
                }
            },
            Some(Value::String(t)) => self.primitive(t, rule_name),
            Some(Value::Array(types)) => {
                let mut names = Vec::with_capacity(types.len());
                for (i, t) in types.iter().enumerate() {
                    let mut alt = obj.clone();
                    alt.insert("type".to_string(), t.clone());
                    names.push(self.visit(&Value::Object(alt), &format!("{rule_name}-{i}"), root)?);
                }
                Ok(self.rules.add(rule_name, &names.join(" | ")))
            }
            Some(other) => Err(GrammarError::InvalidSchema(format!(
                "type of {rule_name} must be a string, got {other}"
            ))),
            None if obj.contains_key("properties") => {
                let mut typed = obj.clone();
                typed.insert("type".to_string(), Value::String("object".to_string()));
                self.visit(&Value::Object(typed), name, root)
            }
            None => Ok(self.add_generic_value()),
        }
    }

    /// Object rule with keys in hinted order first, then by name.
    pub(super) fn object_rule(
        &mut self,
        props: &Map<String, Value>,
        rule_name: &str,
        root: &Value,
    ) -> GrammarResult<String> {
        let members = self.object_members(props, rule_name, root)?;
        Ok(format!(r#""{{" space{members} "}}" space"#))
    }

    /// `KEY space ":" space RULE` pairs joined by commas, without braces.
    pub(super) fn object_members(
        &mut self,
        props: &Map<String, Value>,
        rule_name: &str,
        root: &Value,
    ) -> GrammarResult<String> {
        let mut members = String::new();
        for (i, (prop, schema)) in self.sorted_props(props).into_iter().enumerate() {
            let prop_rule = self.visit(schema, &format!("{rule_name}-{prop}"), root)?;
            if i > 0 {
                members.push_str(r#" "," space"#);
            }
            let key = format_literal(&Value::String(prop.to_string()));
            members.push_str(&format!(r#" {key} space ":" space {prop_rule}"#));
        }
        Ok(members)
    }

    pub(super) fn sorted_props<'a>(
        &self,
        props: &'a Map<String, Value>,
    ) -> Vec<(&'a str, &'a Value)> {
        let mut sorted: Vec<_> = props.iter().map(|(k, v)| (k.as_str(), v)).collect();
        sorted.sort_by(|(a, _), (b, _)| {
            let rank = |name: &str| self.prop_order.get(name).copied().unwrap_or(usize::MAX);
            rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
        });
        sorted
    }

    pub(super) fn visit_ref(&mut self, reference: &Value, root: &Value) -> GrammarResult<String> {
        let reference = reference
            .as_str()
            .ok_or_else(|| GrammarError::InvalidSchema("$ref must be a string".to_string()))?;
        let def_name = reference
            .strip_prefix(DEFS_PREFIX)
            .ok_or_else(|| GrammarError::UnresolvedRef(reference.to_string()))?;
        if let Some(rule) = self.refs.get(def_name) {
            return Ok(rule.clone());
        }
        let def = root
            .get("$defs")
            .and_then(|defs| defs.get(def_name))
            .ok_or_else(|| GrammarError::UnresolvedRef(reference.to_string()))?;
        // Recursive definitions resolve to the rule name being built.
        self.refs.insert(def_name.to_string(), def_name.to_string());
        let rule = self.visit(def, def_name, root)?;
        self.refs.insert(def_name.to_string(), rule.clone());
        Ok(rule)
    }

    fn primitive(&mut self, type_name: &str, rule_name: &str) -> GrammarResult<String> {
        let rule = primitive_rule(type_name)
            .ok_or_else(|| GrammarError::UnknownPrimitive(type_name.to_string()))?;
        let name = if rule_name == "root" { "root" } else { type_name };
        Ok(self.rules.add(name, rule))
    }

    /// Rules accepting any JSON value; returns `value`.
    fn add_generic_value(&mut self) -> String {
        for primitive in ["string", "number", "boolean", "null"] {
            if let Some(rule) = primitive_rule(primitive) {
                self.rules.add(primitive, rule);
            }
        }
        self.rules.add("object", OBJECT_RULE);
        self.rules.add("array", GENERIC_ARRAY_RULE);
        self.rules.add("value", VALUE_RULE)
    }

    fn add_generic_object(&mut self) -> String {
        self.add_generic_value();
        "object".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn grammar(schema: Value) -> String {
        JsonSchemaConverter::new("")
            .grammar(&schema, &GrammarOptions::default())
            .unwrap()
    }

    #[test]
    fn one_of_functions() {
        let schema = json!({
            "oneOf": [
                {
                    "type": "object",
                    "properties": {
                        "function": {"const": "create_event"},
                        "arguments": {
                            "type": "object",
                            "properties": {
                                "title": {"type": "string"},
                                "date": {"type": "string"},
                                "time": {"type": "string"}
                            }
                        }
                    }
                },
                {
                    "type": "object",
                    "properties": {
                        "function": {"const": "search"},
                        "arguments": {
                            "type": "object",
                            "properties": {"query": {"type": "string"}}
                        }
                    }
                }
            ]
        });
        let grammar = grammar(schema);
        assert!(grammar.contains(r#"root-0-function ::= "\"create_event\"""#));
        assert!(grammar.contains(
            r#"root-0 ::= "{" space "\"arguments\"" space ":" space root-0-arguments "," space "\"function\"" space ":" space root-0-function "}" space"#
        ));
        assert!(grammar.contains(
            r#"root-0-arguments ::= "{" space "\"date\"" space ":" space string "," space "\"time\"" space ":" space string "," space "\"title\"" space ":" space string "}" space"#
        ));
        assert!(grammar.contains("root ::= root-0 | root-1"));
        assert!(grammar.contains("freestring ::= "));
        assert!(grammar.contains(r#"space ::= " "?"#));
    }

    #[test]
    fn prop_order_wins_over_name() {
        let schema = json!({
            "type": "object",
            "properties": {"arguments": {"type": "integer"}, "name": {"const": "f"}}
        });
        let grammar = JsonSchemaConverter::new("name,arguments")
            .grammar(&schema, &GrammarOptions::default())
            .unwrap();
        assert!(grammar.contains(
            r#"root ::= "{" space "\"name\"" space ":" space root-name "," space "\"arguments\"" space ":" space integer "}" space"#
        ));
    }

    #[test]
    fn arrays_and_enums() {
        let schema = json!({
            "type": "array",
            "items": {"enum": ["a", "b"]}
        });
        let grammar = grammar(schema);
        assert!(grammar.contains(r#"root-item ::= "\"a\"" | "\"b\"""#));
        assert!(grammar
            .contains(r#"root ::= "[" space (root-item ("," space root-item)*)? "]" space"#));
    }

    #[test]
    fn defs_are_resolved() {
        let schema = json!({
            "$defs": {"Loc": {"type": "string"}},
            "type": "object",
            "properties": {"where": {"$ref": "#/$defs/Loc"}}
        });
        let grammar = grammar(schema);
        assert!(grammar.contains(r#""\"where\"" space ":" space Loc"#));
        assert!(grammar.contains("Loc ::= "));
    }

    #[test]
    fn schema_errors() {
        let converter = || JsonSchemaConverter::new("");
        let opts = GrammarOptions::default();
        assert_eq!(
            converter().grammar(&json!({"type": "decimal"}), &opts),
            Err(GrammarError::UnknownPrimitive("decimal".to_string()))
        );
        assert_eq!(
            converter().grammar(&json!({"$ref": "#/definitions/x"}), &opts),
            Err(GrammarError::UnresolvedRef("#/definitions/x".to_string()))
        );
        assert_eq!(
            converter().grammar(&json!({"$ref": "#/$defs/missing"}), &opts),
            Err(GrammarError::UnresolvedRef("#/$defs/missing".to_string()))
        );
        assert!(matches!(
            converter().grammar(&json!({"oneOf": "x"}), &opts),
            Err(GrammarError::InvalidSchema(_))
        ));
    }

    #[test]
    fn empty_object_accepts_any_object() {
        let grammar = grammar(json!({
            "type": "object",
            "properties": {"arguments": {"type": "object", "properties": {}}}
        }));
        assert!(grammar.contains(r#""\"arguments\"" space ":" space object"#));
        assert!(grammar.contains("value ::= object | array | string | number | boolean | null"));
    }
}
