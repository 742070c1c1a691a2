//! JSON schema → BNF grammar conversion.
//!
//! Supports `type` (object, array, string, boolean, integer, number, null),
//! `properties`, `items`, `const`, `enum`, `oneOf`/`anyOf` and `$ref` into
//! `#/$defs/NAME`. Rules live in a `BTreeMap`, so the same schema always
//! renders the same grammar.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::error::WorkerError;

pub const SPACE_RULE: &str = r#"" "?"#;

const STRING_RULE: &str = r#""\"" (
    [^"\\] |
    "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])
  )* "\"" space"#;

const FREESTRING_RULE: &str = r#"(
    [^\x00] |
    "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])
  )* space"#;

const ARRAY_RULE: &str = r#"arr  ::=
  "["  (
    realvalue
    (","  realvalue)*
  )? "]""#;

const ARRAY_NEWLINES_RULE: &str = r#"arr  ::=
  "[\n"  (
    realvalue
    (",\n"  realvalue)*
  )? "]""#;

/// Rule body for a primitive JSON type.
pub fn primitive_rule(kind: &str) -> Option<&'static str> {
    match kind {
        "boolean" => Some(r#"("true" | "false") space"#),
        "number" => Some(r#"("-"? ([0-9] | [1-9] [0-9]*)) ("." [0-9]+)? ([eE] [-+]? [0-9]+)? space"#),
        "integer" => Some(r#"("-"? ([0-9] | [1-9] [0-9]*)) space"#),
        "string" => Some(STRING_RULE),
        "null" => Some(r#""null" space"#),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GrammarError {
    #[error("unrecognized schema: {0}")]
    UnrecognizedSchema(String),

    #[error("invalid reference format: {0}")]
    InvalidReference(String),

    #[error("no definitions found in the schema")]
    MissingDefinitions,

    #[error("definition not found: {0}")]
    DefinitionNotFound(String),
}

impl From<GrammarError> for WorkerError {
    fn from(e: GrammarError) -> Self {
        WorkerError::invalid(e.to_string())
    }
}

/// How the top-level rule is wrapped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrammarOptions {
    /// Comma-separated property names, printed in this order.
    #[serde(rename = "properties_order")]
    pub prop_order: String,
    /// Allow a JSON array of calls as well as a single one.
    #[serde(rename = "parallel_calls")]
    pub maybe_array: bool,
    /// Allow free text instead of (or around) the JSON.
    #[serde(rename = "mixed_mode")]
    pub maybe_string: bool,
    pub no_mixed_free_string: bool,
    pub disable_parallel_new_lines: bool,
    /// Literal emitted before the JSON value.
    pub prefix: String,
    pub expect_strings_after_json: bool,
}

impl GrammarOptions {
    fn swaps_root(&self) -> bool {
        self.maybe_array || self.maybe_string || !self.prefix.is_empty()
    }
}

/// Replaces every character outside `[A-Za-z0-9-]` with `-`.
pub fn sanitize_rule_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Quotes a JSON value as a grammar literal.
pub fn format_literal(value: &Value) -> String {
    let json = value.to_string();
    let mut escaped = String::with_capacity(json.len() + 2);
    escaped.push('"');
    for c in json.chars() {
        match c {
            '\r' => escaped.push_str("\\r"),
            '\n' => escaped.push_str("\\n"),
            '"' => escaped.push_str("\\\""),
            other => escaped.push(other),
        }
    }
    escaped.push('"');
    escaped
}

fn escape_newlines(s: &str) -> String {
    s.replace('\n', "\\n")
}

pub struct JsonSchemaConverter {
    prop_order: HashMap<String, usize>,
    rules: BTreeMap<String, String>,
}

impl JsonSchemaConverter {
    pub fn new(prop_order: &str) -> Self {
        let prop_order = prop_order
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .enumerate()
            .map(|(idx, name)| (name.to_string(), idx))
            .collect();

        let mut rules = BTreeMap::new();
        rules.insert("space".to_string(), SPACE_RULE.to_string());
        Self { prop_order, rules }
    }

    /// Registers `rule` under a sanitised `name`, suffixing an integer when a
    /// different rule already owns it.
    fn add_rule(&mut self, name: &str, rule: String) -> String {
        let esc_name = sanitize_rule_name(name);
        let mut key = esc_name.clone();
        if let Some(existing) = self.rules.get(&esc_name) {
            if *existing != rule {
                let mut i = 0;
                loop {
                    key = format!("{}{}", esc_name, i);
                    if !self.rules.contains_key(&key) {
                        break;
                    }
                    i += 1;
                }
            }
        }
        self.rules.insert(key.clone(), rule);
        key
    }

    /// Mentioned properties first in their listed order, then the rest by name.
    fn ordered_properties<'a>(&self, properties: &'a Map<String, Value>) -> Vec<(&'a String, &'a Value)> {
        let mut pairs: Vec<_> = properties.iter().collect();
        pairs.sort_by(|(a, _), (b, _)| {
            match (self.prop_order.get(*a), self.prop_order.get(*b)) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.cmp(b),
            }
        });
        pairs
    }

    fn resolve_reference<'a>(reference: &str, root: &'a Value) -> Result<&'a Value, GrammarError> {
        let key = reference
            .strip_prefix("#/$defs/")
            .ok_or_else(|| GrammarError::InvalidReference(reference.to_string()))?;
        let defs = root
            .get("$defs")
            .and_then(Value::as_object)
            .ok_or(GrammarError::MissingDefinitions)?;
        defs.get(key)
            .filter(|d| d.is_object())
            .ok_or_else(|| GrammarError::DefinitionNotFound(key.to_string()))
    }

    fn visit(&mut self, schema: &Value, name: &str, root: &Value) -> Result<String, GrammarError> {
        let obj = schema
            .as_object()
            .ok_or_else(|| GrammarError::UnrecognizedSchema(schema.to_string()))?;
        let schema_type = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        let rule_name = if name.is_empty() { "root" } else { name };

        let alternatives = obj.get("oneOf").or_else(|| obj.get("anyOf"));
        if let Some(alternatives) = alternatives {
            let alternatives = alternatives
                .as_array()
                .ok_or_else(|| GrammarError::UnrecognizedSchema(schema.to_string()))?;
            let mut rules = Vec::with_capacity(alternatives.len());
            for (i, alt) in alternatives.iter().enumerate() {
                rules.push(self.visit(alt, &format!("{}-{}", rule_name, i), root)?);
            }
            return Ok(self.add_rule(rule_name, rules.join(" | ")));
        }

        if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
            let target = Self::resolve_reference(reference, root)?;
            return self.visit(target, name, root);
        }

        if let Some(value) = obj.get("const") {
            return Ok(self.add_rule(rule_name, format_literal(value)));
        }

        if let Some(values) = obj.get("enum").and_then(Value::as_array) {
            let rule = values.iter().map(format_literal).collect::<Vec<_>>().join(" | ");
            return Ok(self.add_rule(rule_name, rule));
        }

        if schema_type == "object" {
            if let Some(properties) = obj.get("properties").and_then(Value::as_object) {
                let mut rule = String::from(r#""{" space"#);
                for (i, (prop_name, prop_schema)) in self.ordered_properties(properties).into_iter().enumerate() {
                    let prop_rule = self.visit(prop_schema, &format!("{}-{}", rule_name, prop_name), root)?;
                    if i > 0 {
                        rule.push_str(r#" "," space"#);
                    }
                    rule.push_str(&format!(
                        r#" {} space ":" space {}"#,
                        format_literal(&Value::String(prop_name.clone())),
                        prop_rule
                    ));
                }
                rule.push_str(r#" "}" space"#);
                return Ok(self.add_rule(rule_name, rule));
            }
        }

        if schema_type == "array" {
            if let Some(items) = obj.get("items").filter(|i| i.is_object()) {
                let item_rule = self.visit(items, &format!("{}-item", rule_name), root)?;
                let rule = format!(r#""[" space ({} ("," space {})*)? "]" space"#, item_rule, item_rule);
                return Ok(self.add_rule(rule_name, rule));
            }
        }

        let primitive = primitive_rule(schema_type)
            .ok_or_else(|| GrammarError::UnrecognizedSchema(schema.to_string()))?;
        let key = if rule_name == "root" { "root" } else { schema_type };
        Ok(self.add_rule(key, primitive.to_string()))
    }

    fn finalize(self, opts: &GrammarOptions) -> String {
        let swap_root = opts.swaps_root();
        let mut lines: Vec<String> = self
            .rules
            .into_iter()
            .map(|(name, rule)| {
                let name = if swap_root && name == "root" { "realvalue".to_string() } else { name };
                format!("{} ::= {}", name, rule)
            })
            .collect();

        if !swap_root {
            return lines.join("\n");
        }

        let mut new_root = if opts.maybe_array { "arr | realvalue".to_string() } else { "realvalue".to_string() };
        let free = if opts.no_mixed_free_string { "freestring" } else { "mixedstring" };

        if !opts.prefix.is_empty() {
            let prefix = escape_newlines(&opts.prefix);
            if opts.maybe_array && opts.maybe_string {
                new_root = format!("({})", new_root);
            }
            new_root = if opts.maybe_string {
                format!("( \"{}\" {} | {} ) ", prefix, new_root, free)
            } else {
                format!("\"{}\" {}", prefix, new_root)
            };
        } else if opts.maybe_string {
            new_root = format!("{} | {}", free, new_root);
        }

        lines.push(format!("root ::= {}", new_root));
        lines.push(
            if opts.disable_parallel_new_lines { ARRAY_RULE } else { ARRAY_NEWLINES_RULE }.to_string(),
        );
        lines.push(format!("freestring ::= {}", FREESTRING_RULE));

        let mixed = match (opts.maybe_array, opts.expect_strings_after_json) {
            (true, true) => "mixedstring ::= freestring | freestring arr freestring | (freestring realvalue freestring)* | realvalue | arr",
            (true, false) => "mixedstring ::= freestring | freestring arr | freestring realvalue | realvalue | arr",
            (false, true) => "mixedstring ::= freestring | (freestring realvalue freestring)* | realvalue",
            (false, false) => "mixedstring ::= freestring | freestring realvalue | realvalue",
        };
        lines.push(mixed.to_string());
        lines.join("\n")
    }

    /// Converts `schema` into a grammar whose start rule is `root`.
    pub fn grammar(mut self, schema: &Value, opts: &GrammarOptions) -> Result<String, GrammarError> {
        self.visit(schema, "", schema)?;
        Ok(self.finalize(opts))
    }
}

/// Convenience wrapper: converts `schema` with `opts.prop_order`.
pub fn schema_to_grammar(schema: &Value, opts: &GrammarOptions) -> Result<String, GrammarError> {
    JsonSchemaConverter::new(&opts.prop_order).grammar(schema, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules_of(grammar: &str) -> BTreeMap<String, String> {
        grammar
            .lines()
            .filter_map(|l| l.split_once(" ::= "))
            .map(|(n, r)| (n.to_string(), r.to_string()))
            .collect()
    }

    #[test]
    fn test_object_with_primitive_properties() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"}
            }
        });
        let grammar = schema_to_grammar(&schema, &GrammarOptions::default()).unwrap();
        let rules = rules_of(&grammar);

        assert_eq!(rules["space"], SPACE_RULE);
        assert_eq!(rules["integer"], primitive_rule("integer").unwrap());
        assert_eq!(
            rules["root"],
            r#""{" space "\"age\"" space ":" space integer "," space "\"name\"" space ":" space string "}" space"#
        );
        assert!(grammar.contains("string ::= \"\\\"\" ("));
    }

    #[test]
    fn test_property_order_is_respected() {
        let schema = json!({
            "type": "object",
            "properties": {
                "b": {"type": "string"},
                "a": {"type": "string"},
                "c": {"type": "string"},
                "z": {"type": "string"}
            }
        });
        let opts = GrammarOptions { prop_order: "z,b".into(), ..Default::default() };
        let grammar = schema_to_grammar(&schema, &opts).unwrap();
        let root = &rules_of(&grammar)["root"];
        let pos = |p: &str| root.find(&format!("\"\\\"{}\\\"\"", p)).unwrap();
        assert!(pos("z") < pos("b"));
        assert!(pos("b") < pos("a"));
        assert!(pos("a") < pos("c"));
    }

    #[test]
    fn test_one_of_const_and_enum() {
        let schema = json!({
            "oneOf": [
                {"type": "object", "properties": {"function": {"const": "create_event"}}},
                {"type": "object", "properties": {"function": {"enum": ["a", "b"]}}}
            ]
        });
        let grammar = schema_to_grammar(&schema, &GrammarOptions::default()).unwrap();
        let rules = rules_of(&grammar);
        assert_eq!(rules["root"], "root-0 | root-1");
        assert_eq!(rules["root-0-function"], r#""\"create_event\"""#);
        assert_eq!(rules["root-1-function"], r#""\"a\"" | "\"b\"""#);
    }

    #[test]
    fn test_array_and_ref() {
        let schema = json!({
            "type": "object",
            "properties": {"tags": {"type": "array", "items": {"$ref": "#/$defs/tag"}}},
            "$defs": {"tag": {"type": "string"}}
        });
        let grammar = schema_to_grammar(&schema, &GrammarOptions::default()).unwrap();
        let rules = rules_of(&grammar);
        assert_eq!(rules["root-tags"], r#""[" space (string ("," space string)*)? "]" space"#);
    }

    #[test]
    fn test_bad_reference() {
        let schema = json!({"$ref": "#/definitions/x"});
        assert_eq!(
            schema_to_grammar(&schema, &GrammarOptions::default()).unwrap_err(),
            GrammarError::InvalidReference("#/definitions/x".into())
        );
        let schema = json!({"$ref": "#/$defs/x", "$defs": {}});
        assert_eq!(
            schema_to_grammar(&schema, &GrammarOptions::default()).unwrap_err(),
            GrammarError::DefinitionNotFound("x".into())
        );
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let err = schema_to_grammar(&json!({"type": "date"}), &GrammarOptions::default()).unwrap_err();
        assert!(matches!(err, GrammarError::UnrecognizedSchema(_)));
    }

    #[test]
    fn test_rule_names_are_sanitised_per_character() {
        assert_eq!(sanitize_rule_name("root-my prop.x"), "root-my-prop-x");
        assert_eq!(sanitize_rule_name("a__b"), "a--b");
    }

    #[test]
    fn test_colliding_rules_get_suffix() {
        let mut conv = JsonSchemaConverter::new("");
        assert_eq!(conv.add_rule("x", "\"1\"".into()), "x");
        assert_eq!(conv.add_rule("x", "\"1\"".into()), "x");
        assert_eq!(conv.add_rule("x", "\"2\"".into()), "x0");
        assert_eq!(conv.add_rule("x", "\"3\"".into()), "x1");
    }

    #[test]
    fn test_format_literal_escapes_quotes_and_newlines() {
        assert_eq!(format_literal(&json!("hi")), r#""\"hi\"""#);
        assert_eq!(format_literal(&json!(3)), r#""3""#);
    }

    #[test]
    fn test_parallel_and_mixed_options_swap_root() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        let opts = GrammarOptions {
            maybe_array: true,
            maybe_string: true,
            ..Default::default()
        };
        let grammar = schema_to_grammar(&schema, &opts).unwrap();
        let rules = rules_of(&grammar);
        assert_eq!(rules["root"], "mixedstring | arr | realvalue");
        assert!(rules.contains_key("realvalue"));
        assert!(grammar.contains("arr  ::="));
        assert!(rules["mixedstring"].contains("freestring arr"));
        assert!(rules.contains_key("freestring"));
    }

    #[test]
    fn test_prefix_option() {
        let schema = json!({"type": "string"});
        let opts = GrammarOptions { prefix: "<tool>\n".into(), ..Default::default() };
        let grammar = schema_to_grammar(&schema, &opts).unwrap();
        assert!(grammar.contains(r#"root ::= "<tool>\n" realvalue"#));
    }
}
