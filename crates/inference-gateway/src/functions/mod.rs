//! Function calling.
//!
//! Turns OpenAI-style function declarations into a grammar that forces the
//! model to answer with `{"function": <name>, "arguments": {...}}`, and
//! parses that answer back into calls.

pub mod grammar;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

pub use grammar::{schema_to_grammar, GrammarError, GrammarOptions, JsonSchemaConverter};

pub const DEFAULT_FUNCTION_NAME_KEY: &str = "function";
pub const DEFAULT_FUNCTION_ARGUMENTS_KEY: &str = "arguments";
pub const DEFAULT_NO_ACTION_NAME: &str = "answer";
pub const DEFAULT_NO_ACTION_DESCRIPTION: &str = "use this action to answer without performing any action";

/// Grammar for "any JSON object", used by `response_format: json_object`.
pub const JSON_BNF: &str = r#"root   ::= object
value  ::= object | array | string | number | ("true" | "false" | "null") ws

object ::=
  "{" ws (
            string ":" ws value
    ("," ws string ":" ws value)*
  )? "}" ws

array  ::=
  "[" ws (
            value
    ("," ws value)*
  )? "]" ws

string ::=
  "\"" (
    [^"\\] |
    "\\" (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]) # escapes
  )* "\"" ws

number ::= ("-"? ([0-9] | [1-9] [0-9]*)) ("." [0-9]+)? ([eE] [-+]? [0-9]+)? ws

ws ::= ([ \t\n] ws)?"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// `{"type": "function", "function": {...}}` as sent in `tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: Function,
}

fn default_tool_type() -> String {
    "function".to_string()
}

/// Per-model function calling settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    pub disable_no_action: bool,
    pub no_action_function_name: String,
    pub no_action_description_name: String,
    pub function_name_key: String,
    pub function_arguments_key: String,
    /// Parse calls from the raw output without constraining generation.
    pub disable_grammar: bool,
    pub grammar: GrammarOptions,
}

impl FunctionsConfig {
    pub fn no_action_name(&self) -> &str {
        non_empty_or(&self.no_action_function_name, DEFAULT_NO_ACTION_NAME)
    }

    pub fn no_action_description(&self) -> &str {
        non_empty_or(&self.no_action_description_name, DEFAULT_NO_ACTION_DESCRIPTION)
    }

    pub fn name_key(&self) -> &str {
        non_empty_or(&self.function_name_key, DEFAULT_FUNCTION_NAME_KEY)
    }

    pub fn arguments_key(&self) -> &str {
        non_empty_or(&self.function_arguments_key, DEFAULT_FUNCTION_ARGUMENTS_KEY)
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

/// The synthetic function that lets the model reply without a real call.
pub fn no_action_function(name: &str, description: &str) -> Function {
    let mut parameters = Map::new();
    parameters.insert(
        "properties".to_string(),
        json!({
            "message": {
                "type": "string",
                "description": "The message to reply the user with"
            }
        }),
    );
    Function {
        name: name.to_string(),
        description: description.to_string(),
        strict: false,
        parameters,
    }
}

/// Keeps only the function called `name`. Unknown names yield an empty list.
pub fn select(functions: &[Function], name: &str) -> Vec<Function> {
    functions.iter().find(|f| f.name == name).cloned().into_iter().collect()
}

/// Appends the no-action function unless disabled, then narrows to the
/// forced function if any.
pub fn prepare(functions: &[Function], config: &FunctionsConfig, force: Option<&str>) -> Vec<Function> {
    let mut funcs = functions.to_vec();
    if !config.disable_no_action {
        funcs.push(no_action_function(config.no_action_name(), config.no_action_description()));
    }
    match force {
        Some(name) if !name.is_empty() => select(&funcs, name),
        _ => funcs,
    }
}

/// A `oneOf` schema with one `{name_key: {const}, args_key: {object}}`
/// alternative per function.
pub fn to_json_structure(functions: &[Function], name_key: &str, args_key: &str) -> Value {
    let mut one_of = Vec::with_capacity(functions.len());
    let mut defs: Option<Value> = None;

    for function in functions {
        let properties = match function.parameters.get("properties") {
            Some(Value::Object(p)) => Value::Object(p.clone()),
            _ => json!({}),
        };
        if defs.is_none() {
            defs = function.parameters.get("$defs").filter(|d| d.is_object()).cloned();
        }

        let mut item_props = Map::new();
        item_props.insert(name_key.to_string(), json!({ "const": function.name }));
        item_props.insert(
            args_key.to_string(),
            json!({ "type": "object", "properties": properties }),
        );
        one_of.push(json!({ "type": "object", "properties": item_props }));
    }

    let mut structure = json!({ "oneOf": one_of });
    if let (Some(defs), Some(obj)) = (defs, structure.as_object_mut()) {
        obj.insert("$defs".to_string(), defs);
    }
    structure
}

/// Builds the grammar that constrains a function-calling completion.
pub fn functions_grammar(functions: &[Function], config: &FunctionsConfig) -> Result<String, GrammarError> {
    let structure = to_json_structure(functions, config.name_key(), config.arguments_key());
    schema_to_grammar(&structure, &config.grammar)
}

/// One call parsed out of a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncCallResult {
    pub name: String,
    /// Stringified JSON.
    pub arguments: String,
}

/// Escapes raw newlines that appear inside JSON string literals.
pub fn escape_newlines_in_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            match c {
                '\n' => {
                    out.push_str("\\n");
                    continue;
                }
                '\r' => {
                    out.push_str("\\r");
                    continue;
                }
                '\\' if !escaped => {
                    escaped = true;
                    out.push(c);
                    continue;
                }
                '"' if !escaped => in_string = false,
                _ => {}
            }
            escaped = false;
        } else if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

/// Accepts a single object or an array of objects, optionally surrounded by text.
fn parse_json_objects(s: &str) -> Vec<Map<String, Value>> {
    let trimmed = s.trim();
    let parsed = serde_json::from_str::<Value>(trimmed).ok().or_else(|| {
        let start = trimmed.find(['{', '['])?;
        let end = trimmed.rfind(['}', ']'])?;
        (end > start)
            .then(|| serde_json::from_str::<Value>(&trimmed[start..=end]).ok())
            .flatten()
    });

    match parsed {
        Some(Value::Object(obj)) => vec![obj],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(o) => Some(o),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Extracts function calls from a model reply.
pub fn parse_function_call(llm_result: &str, config: &FunctionsConfig) -> Vec<FuncCallResult> {
    let escaped = escape_newlines_in_strings(llm_result);
    let objects = parse_json_objects(&escaped);
    if objects.is_empty() {
        debug!("No function call JSON in model output");
    }

    objects
        .into_iter()
        .filter_map(|obj| {
            let name = obj.get(config.name_key())?.as_str()?.to_string();
            let arguments = match obj.get(config.arguments_key())? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(FuncCallResult { name, arguments })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn search() -> Function {
        serde_json::from_value(json!({
            "name": "search",
            "parameters": {"properties": {"query": {"type": "string"}}}
        }))
        .unwrap()
    }

    #[test]
    fn test_structure_shape() {
        let structure = to_json_structure(&[search()], "function", "arguments");
        assert_eq!(
            structure,
            json!({"oneOf": [{
                "type": "object",
                "properties": {
                    "function": {"const": "search"},
                    "arguments": {"type": "object", "properties": {"query": {"type": "string"}}}
                }
            }]})
        );
    }

    #[test]
    fn test_prepare_appends_no_action() {
        let funcs = prepare(&[search()], &FunctionsConfig::default(), None);
        assert_eq!(funcs.len(), 2);
        assert_eq!(funcs[1].name, "answer");
        assert_eq!(funcs[1].description, DEFAULT_NO_ACTION_DESCRIPTION);

        let disabled = FunctionsConfig { disable_no_action: true, ..Default::default() };
        assert_eq!(prepare(&[search()], &disabled, None).len(), 1);
    }

    #[test]
    fn test_prepare_forces_function() {
        let funcs = prepare(&[search()], &FunctionsConfig::default(), Some("search"));
        assert_eq!(funcs, vec![search()]);
        assert!(prepare(&[search()], &FunctionsConfig::default(), Some("missing")).is_empty());
    }

    #[test]
    fn test_grammar_constrains_function_names() {
        let funcs = prepare(&[search()], &FunctionsConfig::default(), None);
        let grammar = functions_grammar(&funcs, &FunctionsConfig::default()).unwrap();
        assert!(grammar.contains(r#"root-0-function ::= "\"search\"""#));
        assert!(grammar.contains(r#"root-1-function ::= "\"answer\"""#));
        assert!(grammar.contains("root ::= root-0 | root-1"));
    }

    #[test]
    fn test_parse_function_call() {
        let calls = parse_function_call(
            r#"{"function":"search","arguments":{"query":"cats"}}"#,
            &FunctionsConfig::default(),
        );
        assert_eq!(
            calls,
            vec![FuncCallResult { name: "search".into(), arguments: r#"{"query":"cats"}"#.into() }]
        );
    }

    #[test]
    fn test_parse_escapes_newlines_in_strings() {
        let raw = "{\"function\": \"answer\",\n \"arguments\": {\"message\": \"line1\nline2\"}}";
        let calls = parse_function_call(raw, &FunctionsConfig::default());
        assert_eq!(calls.len(), 1);
        let args: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(args["message"], "line1\nline2");
    }

    #[test]
    fn test_parse_array_and_custom_keys() {
        let config = FunctionsConfig { function_name_key: "name".into(), ..Default::default() };
        let calls = parse_function_call(
            r#"Sure: [{"name":"a","arguments":"{}"},{"name":"b","arguments":{"x":1}}]"#,
            &config,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, "{}");
        assert_eq!(calls[1].arguments, r#"{"x":1}"#);
    }

    #[test]
    fn test_parse_garbage_yields_nothing() {
        assert!(parse_function_call("I don't know", &FunctionsConfig::default()).is_empty());
    }

    fn arb_function() -> impl Strategy<Value = Function> {
        (
            "[a-z_]{1,8}",
            prop::collection::btree_map("[a-z ]{1,6}", prop::sample::select(vec!["string", "integer", "number", "boolean"]), 0..4),
        )
            .prop_map(|(name, props)| {
                let properties: Map<String, Value> = props
                    .into_iter()
                    .map(|(k, t)| (k, json!({ "type": t })))
                    .collect();
                let mut parameters = Map::new();
                parameters.insert("properties".into(), Value::Object(properties));
                Function { name, description: String::new(), strict: false, parameters }
            })
    }

    proptest! {
        #[test]
        fn prop_grammar_is_deterministic(
            funcs in prop::collection::vec(arb_function(), 1..4),
            order in "[a-z,]{0,12}",
        ) {
            let config = FunctionsConfig {
                grammar: GrammarOptions { prop_order: order, ..Default::default() },
                ..Default::default()
            };
            let prepared = prepare(&funcs, &config, None);
            let first = functions_grammar(&prepared, &config).unwrap();
            let second = functions_grammar(&prepared, &config).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
