//! Bridges typed tool arguments into a worker and a JSON result back out.
//!
//! The tool source is injected into a generated program that decodes the
//! validated arguments, calls the function, and prints the JSON-serialized
//! result after a sentinel line. A distinct exit code separates "the result
//! does not serialize" from "the tool raised".

use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::parser::CustomTool;

/// Line printed immediately before the JSON result.
pub const RESULT_SENTINEL: &str = "<<<CRUCIBLE_TOOL_RESULT>>>";

/// Exit code for a return value `json.dumps` refuses.
pub const UNSERIALIZABLE_EXIT: i64 = 65;

/// Interpretation of a finished tool run.
#[derive(Debug, PartialEq, Eq)]
pub enum ToolRunOutcome {
    /// The JSON-encoded return value.
    Output(String),
    /// The tool returned something that does not serialize.
    Unserializable,
    /// The tool raised; carries stderr.
    Raised(String),
}

/// Validate `input_json` against the tool's extracted schema, returning the
/// parsed argument object.
///
/// Checks exactly what the extractor emits: required keys, no unknown keys,
/// per-key type or enum membership.
pub fn validate_input(tool: &CustomTool, input_json: &str) -> Result<Map<String, Value>, ToolError> {
    let value: Value = serde_json::from_str(input_json)
        .map_err(|e| ToolError::InvalidInput(format!("tool input is not valid JSON: {e}")))?;
    let Value::Object(args) = value else {
        return Err(ToolError::InvalidInput(
            "tool input must be a JSON object".to_owned(),
        ));
    };

    let schema = &tool.input_schema;
    let properties = schema["properties"]
        .as_object()
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema["required"].as_array() {
        for key in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(key) {
                return Err(ToolError::InvalidInput(format!(
                    "missing required argument {key:?}"
                )));
            }
        }
    }

    for (key, value) in &args {
        let Some(fragment) = properties.get(key) else {
            return Err(ToolError::InvalidInput(format!(
                "unexpected argument {key:?}"
            )));
        };
        check_fragment(key, fragment, value)?;
    }
    Ok(args)
}

fn check_fragment(key: &str, fragment: &Value, value: &Value) -> Result<(), ToolError> {
    if let Some(variants) = fragment["enum"].as_array() {
        if !variants.contains(value) {
            return Err(ToolError::InvalidInput(format!(
                "argument {key:?} must be one of {variants:?}"
            )));
        }
        return Ok(());
    }
    let expected = fragment["type"].as_str().unwrap_or("any");
    let ok = match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    };
    if !ok {
        return Err(ToolError::InvalidInput(format!(
            "argument {key:?} must be of type {expected}"
        )));
    }
    if expected == "array" {
        if let (Some(items), Some(elements)) = (fragment.get("items"), value.as_array()) {
            for element in elements {
                check_fragment(key, items, element)?;
            }
        }
    }
    Ok(())
}

/// Build the program that runs the tool with `args` inside a worker.
#[must_use]
pub fn invocation_program(tool_source: &str, tool_name: &str, args: &Map<String, Value>) -> String {
    let args_json = Value::Object(args.clone()).to_string();
    format!(
        r#"{tool_source}

import json as _crucible_json
import sys as _crucible_sys

_crucible_args = _crucible_json.loads({args_literal})
_crucible_result = {tool_name}(**_crucible_args)
try:
    _crucible_out = _crucible_json.dumps(_crucible_result)
except (TypeError, ValueError):
    print("tool returned an unserializable value", file=_crucible_sys.stderr)
    _crucible_sys.exit({unserializable})
print({sentinel})
print(_crucible_out)
"#,
        args_literal = py_string_literal(&args_json),
        unserializable = UNSERIALIZABLE_EXIT,
        sentinel = py_string_literal(RESULT_SENTINEL),
    )
}

/// Interpret the exec result of an invocation program.
pub fn parse_run_output(stdout: &[u8], stderr: &[u8], exit_code: i64) -> ToolRunOutcome {
    if exit_code == UNSERIALIZABLE_EXIT {
        return ToolRunOutcome::Unserializable;
    }
    if exit_code != 0 {
        return ToolRunOutcome::Raised(String::from_utf8_lossy(stderr).into_owned());
    }
    let text = String::from_utf8_lossy(stdout);
    match text.split_once(&format!("{RESULT_SENTINEL}\n")) {
        Some((_, rest)) => ToolRunOutcome::Output(rest.trim_end_matches('\n').to_owned()),
        None => ToolRunOutcome::Raised("tool produced no result".to_owned()),
    }
}

/// Encode a string as a Python double-quoted literal. JSON and Python agree
/// on every escape used here.
fn py_string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
