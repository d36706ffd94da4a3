// src/core/functions.rs

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lazy_static::lazy_static;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Failures raised by the helper-function dispatcher. Every variant carries
/// the function name so the (external) diagnostic renderer can point at the
/// offending call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FunctionError {
    #[error("Could not find helper function '{name}'. Available functions: {available}.")]
    Unknown { name: String, available: String },
    #[error("Missing required argument '{argument}' for helper function '{function}'.")]
    MissingArgument { function: String, argument: String },
    #[error(
        "Invalid argument '{argument}' for helper function '{function}': expected {expected}, got {actual}."
    )]
    InvalidArgument {
        function: String,
        argument: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Helper function '{function}' expects at most {max} arguments, got {actual}.")]
    TooManyArguments {
        function: String,
        max: usize,
        actual: usize,
    },
    #[error("Error from helper function '{function}' in '{text}': {message}")]
    Failed {
        function: String,
        text: String,
        message: String,
    },
}

type FunctionResult = Result<Value, FunctionError>;

/// Primitive/compound kinds a helper argument or output may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ArgKind {
    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One declared argument of a helper function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
}

/// One entry of the helper-function table. Functions are pure and stateless:
/// no I/O, no access to context state.
pub struct HelperFunction {
    pub name: &'static str,
    pub description: &'static str,
    pub args: &'static [ArgumentSpec],
    pub output: ArgKind,
    pub examples: &'static [&'static str],
    func: fn(&[Value]) -> Result<Value, String>,
}

impl std::fmt::Debug for HelperFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperFunction")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl HelperFunction {
    /// A usage string for documentation: `split(string: string, separator: string) -> array`.
    pub fn usage(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                if a.required {
                    format!("{}: {}", a.name, a.kind.name())
                } else {
                    format!("[{}: {}]", a.name, a.kind.name())
                }
            })
            .collect();
        format!("{}({}) -> {}", self.name, args.join(", "), self.output.name())
    }
}

macro_rules! arg {
    ($name:literal, $kind:ident) => {
        ArgumentSpec {
            name: $name,
            kind: ArgKind::$kind,
            required: true,
        }
    };
    ($name:literal, $kind:ident, optional) => {
        ArgumentSpec {
            name: $name,
            kind: ArgKind::$kind,
            required: false,
        }
    };
}

lazy_static! {
    /// The fixed, process-lifetime helper function table. Initialized once,
    /// never torn down.
    static ref REGISTRY: HashMap<&'static str, HelperFunction> = {
        let mut table = HashMap::new();
        for function in build_functions() {
            table.insert(function.name, function);
        }
        table
    };
}

/// Enumerates all helper functions, sorted by name, for documentation
/// generation and CLI introspection.
pub fn helper_functions() -> Vec<&'static HelperFunction> {
    let mut functions: Vec<&'static HelperFunction> = REGISTRY.values().collect();
    functions.sort_by_key(|f| f.name);
    functions
}

/// Looks up a helper function by name.
pub fn helper_function(name: &str) -> Option<&'static HelperFunction> {
    REGISTRY.get(name)
}

/// Dispatches a helper function call with already-evaluated arguments.
///
/// `text` is the surrounding template text of the call, used only for error
/// messages. Argument evaluation happens upstream; an argument that is
/// itself an error short-circuits the call before any validation.
pub fn call_helper_function(
    name: &str,
    args: &[Result<Value, String>],
    text: &str,
) -> FunctionResult {
    for arg in args {
        if let Err(message) = arg {
            return Err(FunctionError::Failed {
                function: name.to_string(),
                text: text.to_string(),
                message: message.clone(),
            });
        }
    }

    let function = helper_function(name).ok_or_else(|| FunctionError::Unknown {
        name: name.to_string(),
        available: helper_functions()
            .iter()
            .map(|f| f.name)
            .collect::<Vec<_>>()
            .join(", "),
    })?;

    let values: Vec<Value> = args
        .iter()
        .filter_map(|a| a.as_ref().ok().cloned())
        .collect();

    if values.len() > function.args.len() {
        return Err(FunctionError::TooManyArguments {
            function: name.to_string(),
            max: function.args.len(),
            actual: values.len(),
        });
    }

    for (index, spec) in function.args.iter().enumerate() {
        match values.get(index) {
            None | Some(Value::Null) if spec.required => {
                return Err(FunctionError::MissingArgument {
                    function: name.to_string(),
                    argument: spec.name.to_string(),
                });
            }
            Some(value) if !value.is_null() && !spec.kind.matches(value) => {
                return Err(FunctionError::InvalidArgument {
                    function: name.to_string(),
                    argument: spec.name.to_string(),
                    expected: spec.kind.name(),
                    actual: kind_of(value),
                });
            }
            _ => {}
        }
    }

    log::trace!("Dispatching helper function '{name}'.");
    (function.func)(&values).map_err(|message| FunctionError::Failed {
        function: name.to_string(),
        text: text.to_string(),
        message,
    })
}

// --- IMPLEMENTATIONS ---

fn as_str(value: &Value) -> Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected a string, got {}", kind_of(value)))
}

fn build_functions() -> Vec<HelperFunction> {
    vec![
        HelperFunction {
            name: "base64Encode",
            description: "Encodes the given string as base64.",
            args: &[arg!("string", String)],
            output: ArgKind::String,
            examples: &["${base64Encode(\"my value\")} -> \"bXkgdmFsdWU=\""],
            func: |args| {
                let input = as_str(&args[0])?;
                Ok(Value::String(BASE64.encode(input)))
            },
        },
        HelperFunction {
            name: "base64Decode",
            description: "Decodes the given base64-encoded string.",
            args: &[arg!("string", String)],
            output: ArgKind::String,
            examples: &["${base64Decode(\"bXkgdmFsdWU=\")} -> \"my value\""],
            func: |args| {
                let input = as_str(&args[0])?;
                let bytes = BASE64
                    .decode(input)
                    .map_err(|e| format!("invalid base64: {e}"))?;
                String::from_utf8(bytes)
                    .map(Value::String)
                    .map_err(|e| format!("decoded value is not valid UTF-8: {e}"))
            },
        },
        HelperFunction {
            name: "camelCase",
            description: "Converts the given string to a valid camelCase identifier.",
            args: &[arg!("string", String)],
            output: ArgKind::String,
            examples: &["${camelCase(\"Foo Bar\")} -> \"fooBar\""],
            func: |args| Ok(Value::String(camel_case(as_str(&args[0])?))),
        },
        HelperFunction {
            name: "kebabCase",
            description: "Converts the given string to a valid kebab-case identifier.",
            args: &[arg!("string", String)],
            output: ArgKind::String,
            examples: &["${kebabCase(\"fooBar\")} -> \"foo-bar\""],
            func: |args| Ok(Value::String(kebab_case(as_str(&args[0])?))),
        },
        HelperFunction {
            name: "indent",
            description: "Prepends the given prefix to every line of the string.",
            args: &[arg!("string", String), arg!("prefix", String)],
            output: ArgKind::String,
            examples: &["${indent(\"a\\nb\", \"  \")} -> \"  a\\n  b\""],
            func: |args| {
                let input = as_str(&args[0])?;
                let prefix = as_str(&args[1])?;
                let indented: Vec<String> = input
                    .split('\n')
                    .map(|line| format!("{prefix}{line}"))
                    .collect();
                Ok(Value::String(indented.join("\n")))
            },
        },
        HelperFunction {
            name: "isEmpty",
            description: "Returns true if the value is an empty string, array, or object, or null.",
            args: &[arg!("value", Any, optional)],
            output: ArgKind::Boolean,
            examples: &["${isEmpty(\"\")} -> true", "${isEmpty([1])} -> false"],
            func: |args| {
                let empty = match args.first().unwrap_or(&Value::Null) {
                    Value::Null => true,
                    Value::String(s) => s.is_empty(),
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    _ => false,
                };
                Ok(Value::Bool(empty))
            },
        },
        HelperFunction {
            name: "join",
            description: "Joins an array of primitives into a string with the given separator.",
            args: &[arg!("input", Array), arg!("separator", String)],
            output: ArgKind::String,
            examples: &["${join([\"a\", \"b\"], \",\")} -> \"a,b\""],
            func: |args| {
                let Value::Array(items) = &args[0] else {
                    return Err("expected an array".to_string());
                };
                let separator = as_str(&args[1])?;
                let parts: Result<Vec<String>, String> =
                    items.iter().map(stringify_primitive).collect();
                Ok(Value::String(parts?.join(separator)))
            },
        },
        HelperFunction {
            name: "jsonDecode",
            description: "Decodes the given JSON-encoded string.",
            args: &[arg!("string", String)],
            output: ArgKind::Any,
            examples: &["${jsonDecode(\"[1, 2]\")} -> [1, 2]"],
            func: |args| {
                serde_json::from_str(as_str(&args[0])?).map_err(|e| format!("invalid JSON: {e}"))
            },
        },
        HelperFunction {
            name: "jsonEncode",
            description: "Encodes the given value as a JSON string.",
            args: &[arg!("value", Any)],
            output: ArgKind::String,
            examples: &["${jsonEncode([1, 2])} -> \"[1,2]\""],
            func: |args| {
                serde_json::to_string(&args[0])
                    .map(Value::String)
                    .map_err(|e| format!("could not encode as JSON: {e}"))
            },
        },
        HelperFunction {
            name: "lower",
            description: "Converts the given string to all lowercase.",
            args: &[arg!("string", String)],
            output: ArgKind::String,
            examples: &["${lower(\"Some String\")} -> \"some string\""],
            func: |args| Ok(Value::String(as_str(&args[0])?.to_lowercase())),
        },
        HelperFunction {
            name: "replace",
            description: "Replaces all occurrences of a substring in the given string.",
            args: &[
                arg!("string", String),
                arg!("substring", String),
                arg!("replacement", String),
            ],
            output: ArgKind::String,
            examples: &["${replace(\"a/b/c\", \"/\", \"-\")} -> \"a-b-c\""],
            func: |args| {
                let input = as_str(&args[0])?;
                let substring = as_str(&args[1])?;
                let replacement = as_str(&args[2])?;
                Ok(Value::String(input.replace(substring, replacement)))
            },
        },
        HelperFunction {
            name: "sha256",
            description: "Returns the hex-encoded SHA-256 hash of the given string.",
            args: &[arg!("string", String)],
            output: ArgKind::String,
            examples: &["${sha256(\"some-string\")}"],
            func: |args| {
                let digest = Sha256::digest(as_str(&args[0])?.as_bytes());
                Ok(Value::String(hex::encode(digest)))
            },
        },
        HelperFunction {
            name: "slice",
            description: "Slices a string or array to the given start (inclusive) and end (exclusive) indices.",
            args: &[
                arg!("input", Any),
                arg!("start", Number),
                arg!("end", Number, optional),
            ],
            output: ArgKind::Any,
            examples: &["${slice(\"ThisIsALongStringThatINeedAPartOf\", 11, 17)} -> \"String\""],
            func: |args| {
                let start = index_arg(&args[1])?;
                let end = args.get(2).filter(|v| !v.is_null()).map(index_arg).transpose()?;
                match &args[0] {
                    Value::String(s) => {
                        let chars: Vec<char> = s.chars().collect();
                        let end = end.unwrap_or(chars.len()).min(chars.len());
                        let start = start.min(end);
                        Ok(Value::String(chars[start..end].iter().collect()))
                    }
                    Value::Array(items) => {
                        let end = end.unwrap_or(items.len()).min(items.len());
                        let start = start.min(end);
                        Ok(Value::Array(items[start..end].to_vec()))
                    }
                    other => Err(format!(
                        "expected a string or array, got {}",
                        kind_of(other)
                    )),
                }
            },
        },
        HelperFunction {
            name: "split",
            description: "Splits the given string by the given separator.",
            args: &[arg!("string", String), arg!("separator", String)],
            output: ArgKind::Array,
            examples: &["${split(\"a,b,c\", \",\")} -> [\"a\", \"b\", \"c\"]"],
            func: |args| {
                let input = as_str(&args[0])?;
                let separator = as_str(&args[1])?;
                let parts: Vec<Value> = input
                    .split(separator)
                    .map(|p| Value::String(p.to_string()))
                    .collect();
                Ok(Value::Array(parts))
            },
        },
        HelperFunction {
            name: "string",
            description: "Converts the given value to a string.",
            args: &[arg!("value", Any)],
            output: ArgKind::String,
            examples: &["${string(1)} -> \"1\""],
            func: |args| stringify_primitive(&args[0]).map(Value::String),
        },
        HelperFunction {
            name: "trim",
            description: "Trims whitespace from both ends of the given string.",
            args: &[arg!("string", String)],
            output: ArgKind::String,
            examples: &["${trim(\"  some string  \")} -> \"some string\""],
            func: |args| Ok(Value::String(as_str(&args[0])?.trim().to_string())),
        },
        HelperFunction {
            name: "upper",
            description: "Converts the given string to all uppercase.",
            args: &[arg!("string", String)],
            output: ArgKind::String,
            examples: &["${upper(\"Some String\")} -> \"SOME STRING\""],
            func: |args| Ok(Value::String(as_str(&args[0])?.to_uppercase())),
        },
        HelperFunction {
            name: "uuidv4",
            description: "Generates a random v4 UUID.",
            args: &[],
            output: ArgKind::String,
            examples: &["${uuidv4()} -> \"1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed\""],
            func: |_| Ok(Value::String(Uuid::new_v4().to_string())),
        },
        HelperFunction {
            name: "yamlDecode",
            description: "Decodes the given YAML-encoded string.",
            args: &[arg!("string", String)],
            output: ArgKind::Any,
            examples: &["${yamlDecode(\"a: 1\")} -> {\"a\": 1}"],
            func: |args| {
                serde_yaml::from_str(as_str(&args[0])?).map_err(|e| format!("invalid YAML: {e}"))
            },
        },
        HelperFunction {
            name: "yamlEncode",
            description: "Encodes the given value as YAML.",
            args: &[arg!("value", Any)],
            output: ArgKind::String,
            examples: &["${yamlEncode({\"a\": 1})} -> \"a: 1\\n\""],
            func: |args| {
                serde_yaml::to_string(&args[0])
                    .map(Value::String)
                    .map_err(|e| format!("could not encode as YAML: {e}"))
            },
        },
    ]
}

/// Splits an identifier into words at separators and lower-to-upper case
/// boundaries.
fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in input.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
        } else if c.is_uppercase() && prev_lower {
            words.push(std::mem::take(&mut current));
            current.push(c);
            prev_lower = false;
        } else {
            prev_lower = c.is_lowercase() || c.is_numeric();
            current.push(c);
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn camel_case(input: &str) -> String {
    let mut out = String::new();
    for (i, word) in split_words(input).iter().enumerate() {
        let lower = word.to_lowercase();
        if i == 0 {
            out.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

fn kebab_case(input: &str) -> String {
    split_words(input)
        .iter()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

/// Renders a primitive value the way it appears inside an interpolated
/// string. Arrays and objects are rejected; `join`/`jsonEncode` cover those.
fn stringify_primitive(value: &Value) -> Result<String, String> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        other => Err(format!(
            "expected a primitive value, got {}",
            kind_of(other)
        )),
    }
}

fn index_arg(value: &Value) -> Result<usize, String> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| format!("expected a non-negative integer, got {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn call(name: &str, args: &[Value]) -> FunctionResult {
        let wrapped: Vec<Result<Value, String>> = args.iter().cloned().map(Ok).collect();
        call_helper_function(name, &wrapped, "${test()}")
    }

    #[test]
    fn test_split_with_separator() {
        let out = call("split", &[json!("a,b,c"), json!(",")]).unwrap();
        assert_eq!(out, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_split_missing_separator_names_argument() {
        let err = call("split", &[json!("a,b,c")]).unwrap_err();
        assert_eq!(
            err,
            FunctionError::MissingArgument {
                function: "split".to_string(),
                argument: "separator".to_string(),
            }
        );
        assert!(err.to_string().contains("separator"));
    }

    #[test]
    fn test_wrong_argument_kind() {
        let err = call("split", &[json!(42), json!(",")]).unwrap_err();
        assert!(matches!(
            err,
            FunctionError::InvalidArgument { expected: "string", actual: "number", .. }
        ));
    }

    #[test]
    fn test_unknown_function_lists_available() {
        let err = call("nope", &[]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Could not find helper function 'nope'"));
        assert!(message.contains("split"));
    }

    #[test]
    fn test_error_argument_short_circuits() {
        let args = vec![
            Err("upstream lookup failed".to_string()),
            Ok(json!(",")),
        ];
        let err = call_helper_function("split", &args, "${split(...)}").unwrap_err();
        assert!(matches!(err, FunctionError::Failed { .. }));
        assert!(err.to_string().contains("upstream lookup failed"));
    }

    #[test]
    fn test_too_many_arguments() {
        let err = call("trim", &[json!("a"), json!("b")]).unwrap_err();
        assert!(matches!(err, FunctionError::TooManyArguments { max: 1, actual: 2, .. }));
    }

    #[test]
    fn test_base64_round_trip() {
        let encoded = call("base64Encode", &[json!("my value")]).unwrap();
        assert_eq!(encoded, json!("bXkgdmFsdWU="));
        let decoded = call("base64Decode", &[encoded]).unwrap();
        assert_eq!(decoded, json!("my value"));
    }

    #[test]
    fn test_case_conversions() {
        assert_eq!(call("camelCase", &[json!("Foo Bar")]).unwrap(), json!("fooBar"));
        assert_eq!(call("camelCase", &[json!("foo-bar")]).unwrap(), json!("fooBar"));
        assert_eq!(call("kebabCase", &[json!("fooBar")]).unwrap(), json!("foo-bar"));
        assert_eq!(call("kebabCase", &[json!("Foo Bar")]).unwrap(), json!("foo-bar"));
        assert_eq!(call("upper", &[json!("Some String")]).unwrap(), json!("SOME STRING"));
        assert_eq!(call("lower", &[json!("Some String")]).unwrap(), json!("some string"));
    }

    #[test]
    fn test_join_and_string() {
        assert_eq!(
            call("join", &[json!(["a", 1, true]), json!("-")]).unwrap(),
            json!("a-1-true")
        );
        assert_eq!(call("string", &[json!(7)]).unwrap(), json!("7"));
        assert!(call("join", &[json!([{"a": 1}]), json!("-")]).is_err());
    }

    #[test]
    fn test_json_and_yaml_round_trips() {
        let value = json!({"a": [1, 2], "b": "x"});
        let encoded = call("jsonEncode", &[value.clone()]).unwrap();
        assert_eq!(call("jsonDecode", &[encoded]).unwrap(), value);

        let encoded = call("yamlEncode", &[value.clone()]).unwrap();
        assert_eq!(call("yamlDecode", &[encoded]).unwrap(), value);
    }

    #[test]
    fn test_sha256_known_vector() {
        let out = call("sha256", &[json!("abc")]).unwrap();
        assert_eq!(
            out,
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_slice_string_and_array() {
        assert_eq!(
            call("slice", &[json!("ThisIsALongStringThatINeedAPartOf"), json!(11), json!(17)])
                .unwrap(),
            json!("String")
        );
        assert_eq!(
            call("slice", &[json!([1, 2, 3, 4]), json!(1)]).unwrap(),
            json!([2, 3, 4])
        );
    }

    #[test]
    fn test_uuidv4_shape() {
        let out = call("uuidv4", &[]).unwrap();
        let text = out.as_str().unwrap();
        assert_eq!(text.len(), 36);
        assert_eq!(text.matches('-').count(), 4);
    }

    #[test]
    fn test_is_empty() {
        assert_eq!(call("isEmpty", &[json!("")]).unwrap(), json!(true));
        assert_eq!(call("isEmpty", &[json!(null)]).unwrap(), json!(true));
        assert_eq!(call("isEmpty", &[json!([1])]).unwrap(), json!(false));
        assert_eq!(call("isEmpty", &[json!(0)]).unwrap(), json!(false));
    }

    #[test]
    fn test_enumeration_is_sorted_and_documented() {
        let functions = helper_functions();
        let names: Vec<&str> = functions.iter().map(|f| f.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);

        for function in functions {
            assert!(!function.description.is_empty(), "{} lacks a description", function.name);
            assert!(!function.examples.is_empty(), "{} lacks examples", function.name);
        }
    }

    #[test]
    fn test_usage_string() {
        let function = helper_function("slice").unwrap();
        assert_eq!(
            function.usage(),
            "slice(input: any, start: number, [end: number]) -> any"
        );
    }
}
